//! Model configuration records and their text format.
//!
//! The backend consumes a list of blocks of the form:
//!
//! ```text
//! model_config_list: {
//!   config: {
//!     name: "half_plus_three",
//!     base_path: "/opt/ml/models/half_plus_three",
//!     model_platform: "tensorflow"
//!   },
//! }
//! ```
//!
//! Everything here is pure: parsing, rendering and edits never touch the
//! filesystem, so the store can wrap them in whatever locking it needs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vassago_core::{Error, Result, DEFAULT_PLATFORM};

/// One model block of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name.
    pub name: String,
    /// Artifact path on disk.
    pub base_path: PathBuf,
    /// Model platform.
    pub platform: String,
}

impl ModelConfig {
    /// Creates a block with the default platform.
    #[must_use]
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            platform: DEFAULT_PLATFORM.to_string(),
        }
    }
}

/// An in-memory change to a configuration list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEdit {
    /// Append a block. Fails if the name is already present.
    Add(ModelConfig),
    /// Drop the block with this name, if any.
    Remove(String),
}

impl ConfigEdit {
    /// Applies the edit to `configs`, returning the new list.
    ///
    /// `Remove` of an absent name yields the list unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if `Add` names a model that is already listed.
    pub fn apply(&self, configs: &[ModelConfig]) -> Result<Vec<ModelConfig>> {
        match self {
            Self::Add(config) => {
                if configs.iter().any(|c| c.name == config.name) {
                    return Err(Error::already_loaded(&config.name));
                }
                let mut next = configs.to_vec();
                next.push(config.clone());
                Ok(next)
            }
            Self::Remove(name) => Ok(configs
                .iter()
                .filter(|c| &c.name != name)
                .cloned()
                .collect()),
        }
    }

    /// Name of the model the edit targets.
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::Add(config) => &config.name,
            Self::Remove(name) => name,
        }
    }
}

/// Renders `configs` in the backend's text format.
#[must_use]
pub fn render(configs: &[ModelConfig]) -> String {
    let mut out = String::from("model_config_list: {\n");
    for config in configs {
        let _ = write!(
            out,
            "  config: {{\n    name: {},\n    base_path: {},\n    model_platform: {}\n  }},\n",
            quote(&config.name),
            quote(&config.base_path.to_string_lossy()),
            quote(&config.platform),
        );
    }
    out.push_str("}\n");
    out
}

/// Parses the backend's text format.
///
/// `path` is only used for error messages.
///
/// # Errors
///
/// Returns [`Error::CorruptConfig`] when a `name` line is not followed by a
/// `base_path` line, a value is not quoted, or a name appears twice.
pub fn parse(text: &str, path: &Path) -> Result<Vec<ModelConfig>> {
    let corrupt = |line: usize, message: String| Error::CorruptConfig {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut configs: Vec<ModelConfig> = Vec::new();
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
        .peekable();

    while let Some((lineno, line)) = lines.next() {
        let Some((key, raw)) = split_field(line) else {
            continue;
        };
        match key {
            "name" => {
                let name = unquote(raw).ok_or_else(|| corrupt(lineno, "unquoted name".into()))?;
                let (path_line, base_path) = match lines.next() {
                    Some((n, l)) => match split_field(l) {
                        Some(("base_path", v)) => (
                            n,
                            unquote(v).ok_or_else(|| corrupt(n, "unquoted base_path".into()))?,
                        ),
                        _ => {
                            return Err(corrupt(
                                n,
                                format!("expected base_path after name {name:?}"),
                            ))
                        }
                    },
                    None => {
                        return Err(corrupt(
                            lineno,
                            format!("name {name:?} has no base_path"),
                        ))
                    }
                };

                let mut platform = DEFAULT_PLATFORM.to_string();
                if let Some(&(n, l)) = lines.peek() {
                    if let Some(("model_platform", v)) = split_field(l) {
                        platform = unquote(v)
                            .ok_or_else(|| corrupt(n, "unquoted model_platform".into()))?;
                        lines.next();
                    }
                }

                if configs.iter().any(|c| c.name == name) {
                    return Err(corrupt(lineno, format!("duplicate model {name:?}")));
                }
                tracing::trace!(model = %name, line = path_line, "Parsed model config block");
                configs.push(ModelConfig {
                    name,
                    base_path: PathBuf::from(base_path),
                    platform,
                });
            }
            "base_path" => {
                return Err(corrupt(lineno, "base_path without a preceding name".into()));
            }
            _ => {}
        }
    }

    Ok(configs)
}

/// Splits `key: value` lines. Block openers (`config: {`) are not fields.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let value = value.trim().trim_end_matches(',').trim_end();
    if value.starts_with('{') {
        return None;
    }
    Some((key.trim(), value))
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn unquote(value: &str) -> Option<String> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}
