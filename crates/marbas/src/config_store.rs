//! Durable model configuration storage.
//!
//! Shared mode keeps one configuration file for the single backend and mutates
//! it under an exclusive cross-process lock. Dedicated mode gives each model a
//! directory of its own; creating that directory is the "already loaded" check.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vassago_core::{Error, Result};

use crate::model_config::{self, ConfigEdit, ModelConfig};
use crate::reload::ConfigReloader;

/// Name of the configuration file inside a store directory.
pub const CONFIG_FILE_NAME: &str = "model-config.cfg";

/// Name of the shared-mode lock file.
pub const LOCK_FILE_NAME: &str = "lock-file.lock";

/// Directory holding per-model configurations in dedicated mode.
pub const DEDICATED_DIR_NAME: &str = "tfs-config";

/// Exclusive `flock` held on a lock file until dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks (on a blocking thread) until the exclusive lock is acquired.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock file cannot be opened or locked.
    pub async fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| Error::internal(format!("lock task failed: {e}")))?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        tracing::trace!(path = %path.display(), "Acquired config lock");
        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: see `acquire_blocking`.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        tracing::trace!(path = %self.path.display(), "Released config lock");
    }
}

/// The single configuration file consumed by the shared backend.
#[derive(Debug)]
pub struct SharedConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    settle_delay: Duration,
    /// `flock` is per open file description, so writers inside this process
    /// queue here before touching the lock file.
    writer: tokio::sync::Mutex<()>,
}

impl SharedConfigStore {
    /// Creates a store rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Path, settle_delay: Duration) -> Self {
        Self {
            path: state_dir.join(CONFIG_FILE_NAME),
            lock_path: state_dir.join(LOCK_FILE_NAME),
            settle_delay,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the configuration file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the startup configuration, replacing whatever was there.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the state directory or file cannot be written.
    pub async fn initialize(&self, configs: &[ModelConfig]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _guard = self.writer.lock().await;
        let _lock = FileLock::acquire(&self.lock_path).await?;
        write_atomic(&self.path, &model_config::render(configs)).await?;
        tracing::info!(
            path = %self.path.display(),
            models = configs.len(),
            "Initialized shared model config"
        );
        Ok(())
    }

    /// Reads the current configuration. A missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptConfig`] if the file cannot be parsed.
    pub async fn read(&self) -> Result<Vec<ModelConfig>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => model_config::parse(&text, &self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `edit` under the lock and pushes the result to the backend.
    ///
    /// The sequence is: lock, read, transform, push the full list, rewrite the
    /// file, unlock, then wait for the settle delay. A push failure leaves the
    /// file untouched. A write failure after a successful push pushes the
    /// previous list back before returning the error.
    ///
    /// Returns the list now in effect.
    ///
    /// # Errors
    ///
    /// Propagates parse, transform, reload and I/O errors.
    pub async fn apply(
        &self,
        edit: &ConfigEdit,
        reloader: &dyn ConfigReloader,
    ) -> Result<Vec<ModelConfig>> {
        let next = {
            let _guard = self.writer.lock().await;
            let _lock = FileLock::acquire(&self.lock_path).await?;

            let current = self.read().await?;
            let next = edit.apply(&current)?;
            if next == current {
                return Ok(next);
            }

            reloader.push(&next).await?;

            if let Err(e) = write_atomic(&self.path, &model_config::render(&next)).await {
                tracing::error!(
                    model = edit.model(),
                    error = %e,
                    "Failed to persist model config, restoring previous backend config"
                );
                if let Err(restore) = reloader.push(&current).await {
                    tracing::error!(error = %restore, "Failed to restore backend config");
                }
                return Err(e);
            }
            next
        };

        tokio::time::sleep(self.settle_delay).await;
        Ok(next)
    }
}

/// Per-model configuration directories for dedicated backends.
#[derive(Debug, Clone)]
pub struct DedicatedConfigStore {
    root: PathBuf,
}

impl DedicatedConfigStore {
    /// Creates a store under `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join(DEDICATED_DIR_NAME),
        }
    }

    /// Configuration file path for `name`.
    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(CONFIG_FILE_NAME)
    }

    /// Creates the model's directory and configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the directory already exists, or an I/O
    /// error otherwise.
    pub async fn create(&self, config: &ModelConfig) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let dir = self.root.join(&config.name);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::already_loaded(&config.name));
            }
            Err(e) => return Err(e.into()),
        }

        let path = dir.join(CONFIG_FILE_NAME);
        let text = model_config::render(std::slice::from_ref(config));
        if let Err(e) = write_atomic(&path, &text).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        tracing::debug!(model = %config.name, path = %path.display(), "Wrote dedicated model config");
        Ok(path)
    }

    /// Wipes every model directory left over from a previous run.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for failures other than absence.
    pub async fn reset(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                tracing::info!(path = %self.root.display(), "Cleared stale dedicated model configs");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the model's directory. Removing an absent model is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for failures other than absence.
    pub async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.root.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
