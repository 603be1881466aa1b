//! # Dantalion
//!
//! *"The Duke reveals all secrets"*
//!
//! Dantalion provides observability for the Vassago control plane: structured
//! logging setup and lock-free counters for lifecycle and invocation traffic.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;
pub mod metrics;

use serde::{Deserialize, Serialize};

pub use logging::{init_logging, LoggingError};
pub use metrics::{ControlPlaneMetrics, MetricsSnapshot, OperationTimer};

/// Configuration for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,
    /// Default filter directive, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Emit JSON instead of human-readable lines.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new("vassago")
    }
}

impl TelemetryConfig {
    /// Creates a new telemetry configuration.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Sets the log level.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enables JSON logging.
    #[must_use]
    pub fn with_json_logs(mut self) -> Self {
        self.json_logs = true;
        self
    }
}
