//! Model registry: the source of truth mapping model names to backends.
//!
//! Reads go through an [`ArcSwap`] snapshot and never take a lock. Writers
//! serialize on a short mutex that only guards the copy-and-swap of the map;
//! no I/O happens while it is held.
//!
//! A load first claims the name with a `Loading` slot, so a concurrent load of
//! the same name fails fast with a conflict, and `resolve` never observes a
//! half-loaded model.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use vassago_core::{
    Endpoint, Error, ModelEntry, ModelState, ModelSummary, PortPair, ProcessId, Result,
    ServingMode,
};

use crate::artifact;
use crate::backend::BackendCommand;
use crate::config_store::{DedicatedConfigStore, SharedConfigStore};
use crate::model_config::{ConfigEdit, ModelConfig};
use crate::ports::PortAllocator;
use crate::reload::ConfigReloader;
use crate::supervisor::{RestartPolicy, Supervisor};

/// Default wait after launching a dedicated backend before it is used.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum Slot {
    Loading,
    Ready(Arc<ModelEntry>),
    Unloading(Arc<ModelEntry>),
    /// Backend died. Its ports are already back in the pool.
    Failed {
        entry: Arc<ModelEntry>,
        reason: String,
    },
    /// Leftover configuration of an unknown model is being removed.
    Clearing,
}

enum UnloadClaim {
    Entry(Arc<ModelEntry>, Slot),
    Stray,
    Idle,
}

type SlotMap = HashMap<String, Slot>;

/// The single backend serving every model in shared mode.
pub struct SharedBackend {
    store: SharedConfigStore,
    reloader: Arc<dyn ConfigReloader>,
    endpoint: Endpoint,
}

impl SharedBackend {
    /// Creates a shared deployment reachable at `endpoint`.
    #[must_use]
    pub fn new(
        store: SharedConfigStore,
        reloader: Arc<dyn ConfigReloader>,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            store,
            reloader,
            endpoint,
        }
    }
}

/// One backend process per model.
pub struct DedicatedBackend {
    ports: Arc<PortAllocator>,
    store: DedicatedConfigStore,
    command: BackendCommand,
    supervisor: Supervisor,
    startup_delay: Duration,
    host: String,
}

impl DedicatedBackend {
    /// Creates a dedicated deployment.
    #[must_use]
    pub fn new(
        ports: Arc<PortAllocator>,
        store: DedicatedConfigStore,
        command: BackendCommand,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            ports,
            store,
            command,
            supervisor,
            startup_delay: DEFAULT_STARTUP_DELAY,
            host: "127.0.0.1".to_string(),
        }
    }

    /// Sets the post-launch delay.
    #[must_use]
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Sets the host backends are reached on.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// How models are deployed onto backends.
pub enum Deployment {
    /// One backend, reconfigured in place.
    Shared(SharedBackend),
    /// A backend per model.
    Dedicated(DedicatedBackend),
}

/// Result of an unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The model was loaded and has been removed.
    Unloaded,
    /// The model was not loaded; nothing changed.
    NotRunning,
}

/// Registry of loaded models.
pub struct ModelRegistry {
    slots: ArcSwap<SlotMap>,
    write_lock: Mutex<()>,
    deployment: Deployment,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("mode", &self.mode())
            .field("models", &self.slots.load().len())
            .finish()
    }
}

impl ModelRegistry {
    /// Creates an empty registry over `deployment`.
    #[must_use]
    pub fn new(deployment: Deployment) -> Self {
        Self {
            slots: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            deployment,
        }
    }

    /// The serving mode of this registry.
    #[must_use]
    pub fn mode(&self) -> ServingMode {
        match self.deployment {
            Deployment::Shared(_) => ServingMode::Shared,
            Deployment::Dedicated(_) => ServingMode::Dedicated,
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut SlotMap) -> R) -> R {
        let _guard = self.write_lock.lock();
        let mut next: SlotMap = (**self.slots.load()).clone();
        let result = f(&mut next);
        self.slots.store(Arc::new(next));
        result
    }

    /// Registers models the shared backend already serves at startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] in dedicated mode, where nothing
    /// survives a restart.
    pub fn adopt(&self, configs: &[ModelConfig]) -> Result<()> {
        let Deployment::Shared(backend) = &self.deployment else {
            return Err(Error::invalid_config(
                "only a shared deployment can adopt existing models",
            ));
        };
        self.update(|slots| {
            for config in configs {
                let mut entry = ModelEntry::new(
                    &config.name,
                    &config.base_path,
                    backend.endpoint.clone(),
                    None,
                );
                entry.platform.clone_from(&config.platform);
                slots.insert(config.name.clone(), Slot::Ready(Arc::new(entry)));
            }
        });
        tracing::info!(models = configs.len(), "Adopted models from shared config");
        Ok(())
    }

    /// Loads `name` from the artifact at `path`.
    ///
    /// Succeeds only once the configuration is persisted, the backend is
    /// serving, and the entry is recorded. Any failure rolls back ports,
    /// configuration and the registry slot.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a malformed name
    /// - [`Error::Conflict`] if `name` is already loaded or loading
    /// - [`Error::InvalidArtifact`] if `path` has no version directory
    /// - [`Error::CapacityExhausted`] if no port pair is free
    /// - reload, process and I/O errors from the backend
    pub async fn load(&self, name: &str, path: &Path) -> Result<Arc<ModelEntry>> {
        artifact::validate_name(name)?;
        self.update(|slots| {
            if slots.contains_key(name) {
                return Err(Error::already_loaded(name));
            }
            slots.insert(name.to_string(), Slot::Loading);
            Ok(())
        })?;

        let result = match &self.deployment {
            Deployment::Shared(backend) => Self::load_shared(backend, name, path).await,
            Deployment::Dedicated(backend) => Self::load_dedicated(backend, name, path).await,
        };

        match result {
            Ok(entry) => {
                let entry = Arc::new(entry);
                self.update(|slots| {
                    slots.insert(name.to_string(), Slot::Ready(Arc::clone(&entry)));
                });
                tracing::info!(
                    model = name,
                    path = %path.display(),
                    rest_port = entry.endpoint.rest_port,
                    grpc_port = entry.endpoint.grpc_port,
                    "Model loaded"
                );
                // The backend may have died between the readiness check and
                // the slot becoming Ready, in which case the exit watcher saw
                // no Ready slot to fail.
                if let (Deployment::Dedicated(backend), Some(id)) = (&self.deployment, entry.process) {
                    if !backend.supervisor.is_alive(id) {
                        self.mark_failed(id, "backend exited right after startup".to_string());
                    }
                }
                Ok(entry)
            }
            Err(e) => {
                self.update(|slots| slots.remove(name));
                tracing::warn!(model = name, error = %e, "Model load failed");
                Err(e)
            }
        }
    }

    async fn validate(name: &str, path: &Path) -> Result<()> {
        let (name, path) = (name.to_string(), path.to_path_buf());
        tokio::task::spawn_blocking(move || artifact::validate_artifact(&name, &path))
            .await
            .map_err(|e| Error::internal(format!("artifact validation task failed: {e}")))?
    }

    async fn load_shared(backend: &SharedBackend, name: &str, path: &Path) -> Result<ModelEntry> {
        Self::validate(name, path).await?;
        let config = ModelConfig::new(name, path);
        backend
            .store
            .apply(&ConfigEdit::Add(config), backend.reloader.as_ref())
            .await?;
        Ok(ModelEntry::new(name, path, backend.endpoint.clone(), None))
    }

    async fn load_dedicated(
        backend: &DedicatedBackend,
        name: &str,
        path: &Path,
    ) -> Result<ModelEntry> {
        Self::validate(name, path).await?;
        let ports = backend.ports.reserve()?;

        let started = Self::start_dedicated(backend, name, path, ports).await;
        if started.is_err() {
            backend.ports.release(ports);
        }
        started
    }

    async fn start_dedicated(
        backend: &DedicatedBackend,
        name: &str,
        path: &Path,
        ports: PortPair,
    ) -> Result<ModelEntry> {
        let config = ModelConfig::new(name, path);
        let config_path = backend.store.create(&config).await?;
        let spec = backend
            .command
            .launch_spec(name, ports, &config_path, ServingMode::Dedicated);

        let id = match backend.supervisor.spawn(spec, RestartPolicy::Never).await {
            Ok(id) => id,
            Err(e) => {
                Self::remove_dedicated_config(backend, name).await;
                return Err(e);
            }
        };

        tokio::time::sleep(backend.startup_delay).await;
        if !backend.supervisor.is_alive(id) {
            let state = backend.supervisor.state(id);
            backend.supervisor.stop(id).await;
            Self::remove_dedicated_config(backend, name).await;
            return Err(Error::process(
                name,
                format!("backend exited during startup ({state:?})"),
            ));
        }

        Ok(ModelEntry::new(
            name,
            path,
            Endpoint::new(backend.host.clone(), ports),
            Some(id),
        ))
    }

    async fn remove_dedicated_config(backend: &DedicatedBackend, name: &str) {
        if let Err(e) = backend.store.remove(name).await {
            tracing::warn!(model = name, error = %e, "Failed to remove model config");
        }
    }

    /// Unloads `name`.
    ///
    /// Unloading a model that is not loaded reports [`UnloadOutcome::NotRunning`].
    /// In dedicated mode it also removes any configuration left behind for
    /// that name, so the registry and the config store agree again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] while the model is still loading, or the
    /// reload error if the shared backend refused the new configuration (the
    /// model then stays loaded).
    pub async fn unload(&self, name: &str) -> Result<UnloadOutcome> {
        let dedicated = matches!(self.deployment, Deployment::Dedicated(_));
        let claim = self.update(|slots| {
            let Some(previous) = slots.get(name).cloned() else {
                if dedicated {
                    slots.insert(name.to_string(), Slot::Clearing);
                    return Ok(UnloadClaim::Stray);
                }
                return Ok(UnloadClaim::Idle);
            };
            let entry = match &previous {
                Slot::Loading => {
                    return Err(Error::conflict(format!("Model {name} is still loading")));
                }
                Slot::Unloading(_) | Slot::Clearing => return Ok(UnloadClaim::Idle),
                Slot::Ready(entry) | Slot::Failed { entry, .. } => Arc::clone(entry),
            };
            slots.insert(name.to_string(), Slot::Unloading(Arc::clone(&entry)));
            Ok(UnloadClaim::Entry(entry, previous))
        })?;

        let (entry, previous) = match claim {
            UnloadClaim::Entry(entry, previous) => (entry, previous),
            UnloadClaim::Stray => {
                if let Deployment::Dedicated(backend) = &self.deployment {
                    Self::remove_dedicated_config(backend, name).await;
                }
                self.update(|slots| slots.remove(name));
                tracing::debug!(model = name, "Unload of a model that is not running");
                return Ok(UnloadOutcome::NotRunning);
            }
            UnloadClaim::Idle => {
                tracing::debug!(model = name, "Unload of a model that is not running");
                return Ok(UnloadOutcome::NotRunning);
            }
        };

        match &self.deployment {
            Deployment::Shared(backend) => {
                let edit = ConfigEdit::Remove(name.to_string());
                if let Err(e) = backend.store.apply(&edit, backend.reloader.as_ref()).await {
                    self.update(|slots| slots.insert(name.to_string(), previous));
                    tracing::warn!(model = name, error = %e, "Model unload failed");
                    return Err(e);
                }
            }
            Deployment::Dedicated(backend) => {
                if let Some(id) = entry.process {
                    backend.supervisor.stop(id).await;
                }
                Self::remove_dedicated_config(backend, name).await;
                if !matches!(previous, Slot::Failed { .. }) {
                    backend.ports.release(entry.endpoint.ports());
                }
            }
        }

        self.update(|slots| slots.remove(name));
        tracing::info!(model = name, "Model unloaded");
        Ok(UnloadOutcome::Unloaded)
    }

    /// Returns the endpoint serving `name`. Lock-free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the model is not ready, or
    /// [`Error::ProcessFailure`] if its dedicated backend has died.
    pub fn resolve(&self, name: &str) -> Result<Endpoint> {
        match self.slots.load().get(name) {
            Some(Slot::Ready(entry)) => Ok(entry.endpoint.clone()),
            Some(Slot::Failed { reason, .. }) => Err(Error::process(name, reason.clone())),
            _ => Err(Error::not_found(name)),
        }
    }

    /// Returns the entry for `name`, if it is visible.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ModelSummary> {
        self.slots.load().get(name).and_then(summarize)
    }

    /// Snapshot of every visible model, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ModelSummary> {
        let mut all: Vec<_> = self.slots.load().values().filter_map(summarize).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of models ready to serve.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.slots
            .load()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Turns the Ready entry backed by `id` into a tombstone and returns its
    /// port pair to the pool.
    fn mark_failed(&self, id: ProcessId, reason: String) -> Option<String> {
        self.update(|slots| {
            let entry = slots.values().find_map(|slot| match slot {
                Slot::Ready(entry) if entry.process == Some(id) => Some(Arc::clone(entry)),
                _ => None,
            })?;
            // Released before the tombstone is published.
            if let Deployment::Dedicated(backend) = &self.deployment {
                backend.ports.release(entry.endpoint.ports());
            }
            let name = entry.name.clone();
            slots.insert(name.clone(), Slot::Failed { entry, reason });
            Some(name)
        })
    }

    /// Marks dedicated entries failed when their backend exits on its own.
    ///
    /// Returns `None` in shared mode, where the backend is restarted by the
    /// supervisor instead.
    #[must_use]
    pub fn watch_exits(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let Deployment::Dedicated(backend) = &self.deployment else {
            return None;
        };
        let mut events = backend.supervisor.subscribe();
        let registry = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if !event.restarting => {
                        let reason = match event.code {
                            Some(code) => format!("backend exited with code {code}"),
                            None => "backend was killed by a signal".to_string(),
                        };
                        if let Some(model) = registry.mark_failed(event.id, reason) {
                            tracing::error!(
                                model = %model,
                                process = %event.id,
                                code = ?event.code,
                                "Dedicated backend exited unexpectedly, model is unreachable"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Exit watcher lagged behind supervisor events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

fn summarize(slot: &Slot) -> Option<ModelSummary> {
    let (entry, state) = match slot {
        Slot::Loading | Slot::Clearing => return None,
        Slot::Ready(entry) => (entry, ModelState::Ready),
        Slot::Unloading(entry) => (entry, ModelState::Unloading),
        Slot::Failed { entry, .. } => (entry, ModelState::Failed),
    };
    Some(ModelSummary {
        name: entry.name.clone(),
        artifact_path: entry.artifact_path.clone(),
        endpoint: entry.endpoint.clone(),
        state,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use vassago_core::{ErrorKind, PortPair};

    use super::*;

    #[derive(Default)]
    struct FakeReloader {
        fail_with: Mutex<Option<Error>>,
        pushes: Mutex<usize>,
    }

    #[async_trait]
    impl ConfigReloader for FakeReloader {
        async fn push(&self, _models: &[ModelConfig]) -> Result<()> {
            if let Some(err) = self.fail_with.lock().take() {
                return Err(err);
            }
            *self.pushes.lock() += 1;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        models: PathBuf,
        reloader: Arc<FakeReloader>,
        registry: ModelRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        for (name, versions) in [("half_plus_three", ["00000123", "00000124"]), ("cifar", ["1", "2"])] {
            for v in versions {
                fs::create_dir_all(models.join(name).join(v)).unwrap();
            }
        }
        fs::create_dir_all(models.join("broken/variables")).unwrap();

        let reloader = Arc::new(FakeReloader::default());
        let backend = SharedBackend::new(
            SharedConfigStore::new(&dir.path().join("state"), Duration::ZERO),
            Arc::clone(&reloader) as Arc<dyn ConfigReloader>,
            Endpoint::localhost(PortPair::new(9000, 9500)),
        );
        Fixture {
            _dir: dir,
            models,
            reloader,
            registry: ModelRegistry::new(Deployment::Shared(backend)),
        }
    }

    #[tokio::test]
    async fn test_load_resolve_unload() {
        let f = fixture();
        let path = f.models.join("half_plus_three");

        let entry = f.registry.load("half_plus_three", &path).await.unwrap();
        assert_eq!(entry.endpoint.rest_port, 9000);
        assert_eq!(f.registry.resolve("half_plus_three").unwrap(), entry.endpoint);
        assert_eq!(f.registry.ready_count(), 1);

        assert_eq!(
            f.registry.unload("half_plus_three").await.unwrap(),
            UnloadOutcome::Unloaded
        );
        assert_eq!(
            f.registry.resolve("half_plus_three").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(*f.reloader.pushes.lock(), 2);
    }

    #[tokio::test]
    async fn test_second_load_conflicts() {
        let f = fixture();
        let path = f.models.join("cifar");
        f.registry.load("cifar", &path).await.unwrap();
        let err = f.registry.load("cifar", &path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(f.registry.resolve("cifar").is_ok());
    }

    #[tokio::test]
    async fn test_unload_unknown_is_noop() {
        let f = fixture();
        assert_eq!(
            f.registry.unload("never_loaded").await.unwrap(),
            UnloadOutcome::NotRunning
        );
        assert_eq!(
            f.registry.unload("never_loaded").await.unwrap(),
            UnloadOutcome::NotRunning
        );
        assert_eq!(*f.reloader.pushes.lock(), 0);
    }

    #[tokio::test]
    async fn test_invalid_artifact_leaves_no_trace() {
        let f = fixture();
        let err = f
            .registry
            .load("broken", &f.models.join("broken"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArtifact);
        assert!(f.registry.get("broken").is_none());
        assert_eq!(*f.reloader.pushes.lock(), 0);

        // The name is free again.
        f.registry
            .load("broken", &f.models.join("cifar"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_failure_rolls_back() {
        let f = fixture();
        *f.reloader.fail_with.lock() = Some(Error::deadline("reload config", Duration::from_secs(5)));
        let err = f
            .registry
            .load("cifar", &f.models.join("cifar"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert!(f.registry.list().is_empty());

        f.registry.load("cifar", &f.models.join("cifar")).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_unload_keeps_model() {
        let f = fixture();
        f.registry.load("cifar", &f.models.join("cifar")).await.unwrap();
        *f.reloader.fail_with.lock() = Some(Error::upstream("INTERNAL", "nope"));

        let err = f.registry.unload("cifar").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(f.registry.resolve("cifar").is_ok());
    }

    #[tokio::test]
    async fn test_bad_name_rejected() {
        let f = fixture();
        let err = f
            .registry
            .load("../etc", &f.models.join("cifar"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_adopt_and_list() {
        let f = fixture();
        f.registry
            .adopt(&[ModelConfig::new("existing", "/opt/ml/models/existing")])
            .unwrap();
        f.registry.load("cifar", &f.models.join("cifar")).await.unwrap();

        let names: Vec<_> = f.registry.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["cifar".to_string(), "existing".to_string()]);
        assert_eq!(f.registry.get("existing").unwrap().state, ModelState::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_loads_of_same_name() {
        let f = fixture();
        let registry = Arc::new(f.registry);
        let path = f.models.join("cifar");

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let path = path.clone();
                tokio::spawn(async move { registry.load("cifar", &path).await })
            })
            .collect();

        let mut ok = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
            }
        }
        assert_eq!(ok, 1);
    }
}
