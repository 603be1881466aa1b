//! HTTP API tests against a dedicated-mode registry with `sh` backends.

#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use marbas::{
    BackendCommand, DedicatedBackend, DedicatedConfigStore, Deployment, ModelRegistry,
    PortAllocator, PortRange, Supervisor, SupervisorConfig,
};
use vassago_server::{AppState, BackendClient, Server, ServerConfig};

struct Harness {
    _dir: tempfile::TempDir,
    models: PathBuf,
    supervisor: Supervisor,
    server: Server,
}

impl Harness {
    /// The port flags land after the script as ignored positional parameters.
    fn new(script: &str, range: PortRange) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        for name in ["a", "b"] {
            fs::create_dir_all(models.join(name).join("1")).unwrap();
        }

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
            Arc::new(PortAllocator::new(range)),
            DedicatedConfigStore::new(&dir.path().join("state")),
            command,
            supervisor.clone(),
        )
        .with_startup_delay(Duration::from_millis(100));

        let registry = Arc::new(ModelRegistry::new(Deployment::Dedicated(backend)));
        let _watcher = registry.watch_exits();
        let client = BackendClient::new(Duration::from_secs(2)).unwrap();
        let state = AppState::new(ServerConfig::default(), registry, client);

        Self {
            _dir: dir,
            models,
            supervisor,
            server: Server::new(state),
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let resp = ServiceExt::<Request<Body>>::oneshot(self.server.router(), request)
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn load(&self, name: &str) -> (StatusCode, Value) {
        let body = json!({
            "model_name": name,
            "url": self.models.join(name).display().to_string(),
        });
        self.send(post_json("/models", &body)).await
    }
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_crashed_backend_answers_server_error() {
    let h = Harness::new("sleep 0.5; exit 2", PortRange::new(31000, 31099).unwrap());
    let (status, _) = h.load("a").await;
    assert_eq!(status, StatusCode::OK);

    let deadline = Instant::now() + Duration::from_secs(10);
    let json = loop {
        let (status, json) = h
            .send(post_json("/models/a/invoke", &json!({ "instances": [1.0] })))
            .await;
        if json["error"]["type"] == "process_failure" {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            break json;
        }
        assert!(Instant::now() < deadline, "crash was never observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Process a failed"));

    let (status, json) = h.send(get("/models/a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "failed");

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_ports_answer_insufficient_storage() {
    // 31100-31102 holds exactly one pair.
    let h = Harness::new("sleep 30", PortRange::new(31100, 31102).unwrap());
    let (status, json) = h.load("a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rest_port"], 31100);

    let (status, json) = h.load("b").await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(json["error"]["type"], "capacity_exhausted");

    let (status, _) = h
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/models/a")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h.load("b").await;
    assert_eq!(status, StatusCode::OK);

    h.supervisor.shutdown().await;
}
