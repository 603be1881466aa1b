//! Backend model-server command construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vassago_core::{Error, PortPair, Result, ServingMode};

use crate::supervisor::LaunchSpec;

/// Default backend executable.
pub const DEFAULT_PROGRAM: &str = "tensorflow_model_server";

/// Name of the batching parameters file inside the state directory.
pub const BATCHING_FILE_NAME: &str = "batching-config.cfg";

/// How to launch a backend model server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    program: String,
    args: Vec<String>,
    batching_file: Option<PathBuf>,
}

impl BackendCommand {
    /// Creates a command running `program` with leading `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            batching_file: None,
        }
    }

    /// Enables server-side batching with parameters read from `file`.
    #[must_use]
    pub fn with_batching(mut self, file: impl Into<PathBuf>) -> Self {
        self.batching_file = Some(file.into());
        self
    }

    /// The executable.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Builds the launch spec for a backend bound to `ports` serving the
    /// configuration at `config_path`.
    ///
    /// Dedicated backends get `--max_num_load_retries=0` so a broken artifact
    /// fails fast instead of being retried in the background.
    #[must_use]
    pub fn launch_spec(
        &self,
        name: &str,
        ports: PortPair,
        config_path: &Path,
        mode: ServingMode,
    ) -> LaunchSpec {
        let mut args = self.args.clone();
        args.push(format!("--port={}", ports.grpc));
        args.push(format!("--rest_api_port={}", ports.rest));
        args.push(format!("--model_config_file={}", config_path.display()));
        if mode == ServingMode::Dedicated {
            args.push("--max_num_load_retries=0".to_string());
        }
        if let Some(file) = &self.batching_file {
            args.push("--enable_batching=true".to_string());
            args.push(format!("--batching_parameters_file={}", file.display()));
        }
        LaunchSpec::new(name, self.program.clone(), args)
    }

    /// Runs `<program> --version` and logs the result. Failures only warn.
    pub async fn log_version(&self) {
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            tokio::process::Command::new(&self.program)
                .arg("--version")
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(out)) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout);
                tracing::info!(program = %self.program, version = %version.trim(), "Backend version");
            }
            Ok(Ok(out)) => {
                tracing::warn!(
                    program = %self.program,
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "Backend version check exited with an error"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, error = %e, "Failed to run backend version check");
            }
            Err(_) => {
                tracing::warn!(program = %self.program, "Backend version check timed out");
            }
        }
    }
}

impl Default for BackendCommand {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, Vec::new())
    }
}

/// Server-side batching parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Whether batching is enabled.
    pub enabled: bool,
    /// Largest batch the backend will form.
    pub max_batch_size: Option<u64>,
    /// How long to wait for a batch to fill.
    pub batch_timeout_micros: Option<u64>,
    /// Queue depth before requests are rejected.
    pub max_enqueued_batches: Option<u64>,
    /// Worker threads; defaults to available parallelism.
    pub num_batch_threads: Option<u64>,
}

impl BatchingConfig {
    /// Checks that every required parameter is present when enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming every missing parameter.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let missing: Vec<&str> = [
            ("max_batch_size", self.max_batch_size),
            ("batch_timeout_micros", self.batch_timeout_micros),
            ("max_enqueued_batches", self.max_enqueued_batches),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_config(format!(
                "batching is enabled but {} must be set",
                missing.join(", ")
            )))
        }
    }

    /// Renders the batching parameters file.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`BatchingConfig::validate`].
    pub fn render(&self) -> Result<String> {
        self.validate()?;
        let threads = self.num_batch_threads.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
            tracing::info!(num_batch_threads = cpus, "Defaulting num_batch_threads to available CPUs");
            cpus as u64
        });
        let field = |name: &str, value: Option<u64>| {
            format!("{name} {{ value: {} }}\n", value.unwrap_or_default())
        };
        Ok([
            field("max_batch_size", self.max_batch_size),
            field("batch_timeout_micros", self.batch_timeout_micros),
            field("max_enqueued_batches", self.max_enqueued_batches),
            field("num_batch_threads", Some(threads)),
        ]
        .concat())
    }

    /// Writes the parameters file into `state_dir` and returns its path, or
    /// `None` when batching is disabled.
    ///
    /// # Errors
    ///
    /// Returns validation or I/O errors.
    pub async fn write(&self, state_dir: &Path) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        let text = self.render()?;
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join(BATCHING_FILE_NAME);
        tokio::fs::write(&path, text).await?;
        tracing::info!(path = %path.display(), "Wrote batching config");
        Ok(Some(path))
    }
}
