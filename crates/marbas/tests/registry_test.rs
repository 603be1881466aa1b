//! Dedicated-mode lifecycle tests with `sh` standing in for the backend.

#![cfg(unix)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marbas::{
    BackendCommand, DedicatedBackend, DedicatedConfigStore, Deployment, ModelRegistry,
    PortAllocator, PortRange, Supervisor, SupervisorConfig, UnloadOutcome,
};
use vassago_core::{ErrorKind, ModelState};

struct Harness {
    _dir: tempfile::TempDir,
    state: PathBuf,
    models: PathBuf,
    ports: Arc<PortAllocator>,
    supervisor: Supervisor,
    registry: Arc<ModelRegistry>,
}

fn make_artifact(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("00000123")).unwrap();
    fs::write(dir.join("00000123").join("saved_model.pb"), b"").unwrap();
    dir
}

/// A dedicated registry over `state`.
///
/// The port flags are appended after the script, where `sh -c` treats them as
/// ignored positional parameters.
fn dedicated(state: &Path, script: &str, range: PortRange) -> (Arc<PortAllocator>, Supervisor, Arc<ModelRegistry>) {
    let ports = Arc::new(PortAllocator::new(range));
    let supervisor = Supervisor::start(SupervisorConfig {
        reap_interval: Duration::from_millis(20),
        restart_backoff: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
    });
    let command = BackendCommand::new(
        "sh",
        vec!["-c".to_string(), script.to_string(), "stub".to_string()],
    );
    let backend = DedicatedBackend::new(
        Arc::clone(&ports),
        DedicatedConfigStore::new(state),
        command,
        supervisor.clone(),
    )
    .with_startup_delay(Duration::from_millis(100));

    let registry = Arc::new(ModelRegistry::new(Deployment::Dedicated(backend)));
    let _watcher = registry.watch_exits();
    (ports, supervisor, registry)
}

fn harness(script: &str, range: PortRange) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    let models = dir.path().join("models");
    for name in ["a", "b", "c", "d", "half_plus_three"] {
        make_artifact(&models, name);
    }
    let (ports, supervisor, registry) = dedicated(&state, script, range);

    Harness {
        _dir: dir,
        state,
        models,
        ports,
        supervisor,
        registry,
    }
}

fn range() -> PortRange {
    PortRange::new(30000, 30099).unwrap()
}

#[tokio::test]
async fn test_load_resolve_unload_cycle() {
    let h = harness("sleep 30", range());
    let path = h.models.join("half_plus_three");

    let entry = h.registry.load("half_plus_three", &path).await.unwrap();
    let endpoint = h.registry.resolve("half_plus_three").unwrap();
    assert_eq!(endpoint, entry.endpoint);
    assert!(range().contains(endpoint.rest_port));
    assert!(range().contains(endpoint.grpc_port));
    assert!(h.ports.is_held(endpoint.ports()));

    let process = entry.process.unwrap();
    assert!(h.supervisor.is_alive(process));
    assert!(h
        .state
        .join("tfs-config/half_plus_three/model-config.cfg")
        .exists());

    assert_eq!(
        h.registry.unload("half_plus_three").await.unwrap(),
        UnloadOutcome::Unloaded
    );
    assert_eq!(
        h.registry.resolve("half_plus_three").unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(!h.supervisor.is_alive(process));
    assert!(!h.ports.is_held(endpoint.ports()));
    assert!(!h.state.join("tfs-config/half_plus_three").exists());

    // Idempotent.
    assert_eq!(
        h.registry.unload("half_plus_three").await.unwrap(),
        UnloadOutcome::NotRunning
    );

    // Ports are reusable by the next load.
    let again = h.registry.load("a", &h.models.join("a")).await.unwrap();
    assert_eq!(again.endpoint.ports(), endpoint.ports());

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_load_conflicts() {
    let h = harness("sleep 30", range());
    let path = h.models.join("a");
    h.registry.load("a", &path).await.unwrap();

    let err = h.registry.load("a", &path).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.ports.held(), 1);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_capacity_exhaustion_and_reuse() {
    // 30000-30004 splits into two REST ports and three gRPC ports.
    let h = harness("sleep 30", PortRange::new(30000, 30004).unwrap());
    h.registry.load("a", &h.models.join("a")).await.unwrap();
    h.registry.load("b", &h.models.join("b")).await.unwrap();

    let err = h.registry.load("c", &h.models.join("c")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
    assert!(h.registry.get("c").is_none());
    assert!(!h.state.join("tfs-config/c").exists());

    h.registry.unload("a").await.unwrap();
    h.registry.load("c", &h.models.join("c")).await.unwrap();

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_loads_get_disjoint_ports() {
    let h = harness("sleep 30", range());

    let tasks: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| {
            let registry = Arc::clone(&h.registry);
            let path = h.models.join(name);
            tokio::spawn(async move { registry.load(name, &path).await })
        })
        .collect();

    let mut ports = HashSet::new();
    for task in tasks {
        let entry = task.await.unwrap().unwrap();
        assert!(ports.insert(entry.endpoint.rest_port));
        assert!(ports.insert(entry.endpoint.grpc_port));
    }
    assert_eq!(h.registry.list().len(), 4);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_artifact_burns_no_port() {
    let h = harness("sleep 30", range());
    let empty = h.models.join("empty");
    fs::create_dir_all(&empty).unwrap();

    let err = h.registry.load("empty", &empty).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArtifact);
    assert_eq!(h.ports.held(), 0);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_backend_dying_at_startup_rolls_back() {
    let h = harness("exit 1", range());

    let err = h.registry.load("a", &h.models.join("a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessFailure);
    assert_eq!(h.ports.held(), 0);
    assert!(h.registry.list().is_empty());
    assert!(!h.state.join("tfs-config/a").exists());

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crashed_backend_fails_fast_and_unloads() {
    // Backends crash until the marker exists, then stay up.
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("healthy");
    let script = format!(
        "if [ -e '{}' ]; then exec sleep 30; fi; sleep 0.5; exit 2",
        marker.display()
    );
    let h = harness(&script, range());
    let entry = h.registry.load("a", &h.models.join("a")).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match h.registry.resolve("a") {
            Err(e) if e.kind() == ErrorKind::ProcessFailure => break,
            _ => {
                assert!(Instant::now() < deadline, "crash was never observed");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    assert_eq!(h.registry.get("a").unwrap().state, ModelState::Failed);
    assert!(!h.ports.is_held(entry.endpoint.ports()));

    // The crashed model's pair goes to the next load and survives its unload.
    fs::write(&marker, b"").unwrap();
    let next = h.registry.load("b", &h.models.join("b")).await.unwrap();
    assert_eq!(next.endpoint.ports(), entry.endpoint.ports());

    assert_eq!(h.registry.unload("a").await.unwrap(), UnloadOutcome::Unloaded);
    assert!(h.registry.get("a").is_none());
    assert!(h.ports.is_held(next.endpoint.ports()));

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stale_config_is_cleared_by_unload() {
    let h = harness("sleep 30", range());
    h.registry.load("a", &h.models.join("a")).await.unwrap();
    h.supervisor.shutdown().await;

    // A new registry over the same state directory knows nothing of "a".
    let (_ports, supervisor, registry) = dedicated(&h.state, "sleep 30", range());
    let err = registry.load("a", &h.models.join("a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(registry.unload("a").await.unwrap(), UnloadOutcome::NotRunning);
    assert!(!h.state.join("tfs-config/a").exists());
    registry.load("a", &h.models.join("a")).await.unwrap();
    assert!(registry.resolve("a").is_ok());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_reset_store_accepts_loads_after_restart() {
    let h = harness("sleep 30", range());
    h.registry.load("a", &h.models.join("a")).await.unwrap();
    h.registry.load("b", &h.models.join("b")).await.unwrap();
    h.supervisor.shutdown().await;

    DedicatedConfigStore::new(&h.state).reset().await.unwrap();
    let (_ports, supervisor, registry) = dedicated(&h.state, "sleep 30", range());
    registry.load("a", &h.models.join("a")).await.unwrap();
    registry.load("b", &h.models.join("b")).await.unwrap();
    assert_eq!(registry.list().len(), 2);

    supervisor.shutdown().await;
}
