//! Common types used across the Vassago control plane.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default model platform written into backend configurations.
pub const DEFAULT_PLATFORM: &str = "tensorflow";

/// A (REST, gRPC) port pair reserved for one backend instance.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortPair {
    /// Port the backend serves REST traffic on.
    pub rest: u16,
    /// Port the backend serves gRPC and management traffic on.
    pub grpc: u16,
}

impl PortPair {
    /// Creates a new port pair.
    #[must_use]
    pub fn new(rest: u16, grpc: u16) -> Self {
        Self { rest, grpc }
    }
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rest={} grpc={}", self.rest, self.grpc)
    }
}

/// Network location of a backend serving one or more models.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host the backend listens on.
    pub host: String,
    /// REST port.
    pub rest_port: u16,
    /// gRPC port.
    pub grpc_port: u16,
}

impl Endpoint {
    /// Creates an endpoint on `host` for the given port pair.
    #[must_use]
    pub fn new(host: impl Into<String>, ports: PortPair) -> Self {
        Self {
            host: host.into(),
            rest_port: ports.rest,
            grpc_port: ports.grpc,
        }
    }

    /// Creates an endpoint on the loopback interface.
    #[must_use]
    pub fn localhost(ports: PortPair) -> Self {
        Self::new("127.0.0.1", ports)
    }

    /// Returns the port pair of this endpoint.
    #[must_use]
    pub fn ports(&self) -> PortPair {
        PortPair::new(self.rest_port, self.grpc_port)
    }

    /// Base URL for REST traffic, without a trailing slash.
    #[must_use]
    pub fn rest_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.rest_port)
    }

    /// URI for gRPC traffic.
    #[must_use]
    pub fn grpc_uri(&self) -> String {
        format!("http://{}:{}", self.host, self.grpc_port)
    }
}

/// Identifier assigned by the supervisor to a tracked process.
///
/// This is not an OS pid: it stays stable across restarts of the same
/// logical process.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// How backends are deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingMode {
    /// One backend serves every model through one mutable configuration.
    #[default]
    Shared,
    /// Every model gets its own backend process and port pair.
    Dedicated,
}

impl std::fmt::Display for ServingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Dedicated => write!(f, "dedicated"),
        }
    }
}

/// Observable state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    /// Serving traffic.
    Ready,
    /// Unload in progress.
    Unloading,
    /// The dedicated backend exited unexpectedly.
    Failed,
}

/// A loaded model and the backend that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Unique model name.
    pub name: String,
    /// Filesystem location of the versioned model tree.
    pub artifact_path: PathBuf,
    /// Where the model is served.
    pub endpoint: Endpoint,
    /// Supervisor handle of the dedicated backend, if any.
    pub process: Option<ProcessId>,
    /// Model platform passed to the backend.
    pub platform: String,
    /// When the load committed.
    pub loaded_at: DateTime<Utc>,
}

impl ModelEntry {
    /// Creates an entry for a model that was just loaded.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        artifact_path: impl Into<PathBuf>,
        endpoint: Endpoint,
        process: Option<ProcessId>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_path: artifact_path.into(),
            endpoint,
            process,
            platform: DEFAULT_PLATFORM.to_string(),
            loaded_at: Utc::now(),
        }
    }
}

/// Snapshot row returned by registry listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Model name.
    pub name: String,
    /// Artifact path.
    pub artifact_path: PathBuf,
    /// Where the model is served.
    pub endpoint: Endpoint,
    /// Current state.
    pub state: ModelState,
}
