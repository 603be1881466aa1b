//! Structural checks on model artifact directories.
//!
//! A model artifact is a directory containing one or more numeric version
//! subdirectories, e.g. `half_plus_three/00000123/saved_model.pb`. Nothing
//! here inspects file contents.

use std::path::{Path, PathBuf};

use vassago_core::{Error, Result};
use walkdir::WalkDir;

/// File marking a servable version directory.
pub const SAVED_MODEL_FILE: &str = "saved_model.pb";

const MAX_NAME_LEN: usize = 255;

/// A model found under the base path at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModel {
    /// Directory basename.
    pub name: String,
    /// Model directory (parent of the version directories).
    pub path: PathBuf,
}

fn is_version_dir(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

/// Checks that `path` is a directory with at least one numeric version
/// subdirectory anywhere beneath it.
///
/// # Errors
///
/// Returns [`Error::InvalidArtifact`] otherwise.
pub fn validate_artifact(model: &str, path: &Path) -> Result<()> {
    let invalid = || Error::InvalidArtifact {
        model: model.to_string(),
        path: path.to_path_buf(),
    };
    if !path.is_dir() {
        return Err(invalid());
    }

    let found = WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .any(|e| e.file_type().is_dir() && e.file_name().to_str().is_some_and(is_version_dir));

    if found {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// Finds every model directory under `base` that holds a versioned
/// `saved_model.pb`. Results are sorted by path.
#[must_use]
pub fn discover_models(base: &Path) -> Vec<DiscoveredModel> {
    let mut models: Vec<DiscoveredModel> = Vec::new();
    for entry in WalkDir::new(base).into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() || entry.file_name() != SAVED_MODEL_FILE {
            continue;
        }
        let Some(version_dir) = entry.path().parent() else {
            continue;
        };
        let numeric = version_dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_version_dir);
        if !numeric {
            continue;
        }
        let Some(model_dir) = version_dir.parent() else {
            continue;
        };
        let Some(name) = model_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if models.iter().any(|m| m.path == model_dir) {
            continue;
        }
        tracing::debug!(model = name, path = %model_dir.display(), "Discovered model");
        models.push(DiscoveredModel {
            name: name.to_string(),
            path: model_dir.to_path_buf(),
        });
    }
    models.sort_by(|a, b| a.path.cmp(&b.path));
    models
}

/// Rejects names that cannot safely become a directory name.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] describing the problem.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_NAME_LEN {
        Some("must be at most 255 bytes")
    } else if name == "." || name.contains("..") {
        Some("must not contain '..'")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("must not contain whitespace or control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::invalid_request(format!(
            "model name {name:?} {reason}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn make_model(root: &Path, name: &str, versions: &[&str]) -> PathBuf {
        let dir = root.join(name);
        for v in versions {
            fs::create_dir_all(dir.join(v)).unwrap();
            fs::write(dir.join(v).join(SAVED_MODEL_FILE), b"").unwrap();
        }
        dir
    }

    #[test]
    fn test_validate_artifact() {
        let root = tempfile::tempdir().unwrap();
        let good = make_model(root.path(), "half_plus_three", &["00000123", "00000124"]);
        assert!(validate_artifact("half_plus_three", &good).is_ok());

        let nested = root.path().join("nested/model/export/7");
        fs::create_dir_all(&nested).unwrap();
        assert!(validate_artifact("nested", &root.path().join("nested")).is_ok());

        let bad = root.path().join("no_versions/variables");
        fs::create_dir_all(&bad).unwrap();
        let err = validate_artifact("no_versions", &root.path().join("no_versions")).unwrap_err();
        assert_eq!(err.kind(), vassago_core::ErrorKind::InvalidArtifact);

        assert!(validate_artifact("missing", &root.path().join("missing")).is_err());
    }

    #[test]
    fn test_discover_models() {
        let root = tempfile::tempdir().unwrap();
        make_model(root.path(), "cifar", &["1", "2"]);
        make_model(root.path(), "half_plus_three", &["00000123"]);
        // Not a numeric version directory.
        make_model(root.path(), "unversioned", &["latest"]);

        let found = discover_models(root.path());
        let names: Vec<_> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["cifar", "half_plus_three"]);
        assert_eq!(found[0].path, root.path().join("cifar"));
    }

    #[test]
    fn test_discover_missing_base_is_empty() {
        assert!(discover_models(Path::new("/definitely/not/here")).is_empty());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("half_plus_three").is_ok());
        assert!(validate_name("model-v2.1").is_ok());
        for bad in ["", "..", "a/b", "a\\b", "has space", "tab\there", "x..y"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_name(&"x".repeat(256)).is_err());
    }
}
