//! Error types for the Vassago control plane.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type shared by the lifecycle manager and the HTTP layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A resource with the same identity already exists.
    #[error("{message}")]
    Conflict {
        /// Human-readable description of the collision.
        message: String,
    },

    /// A model or configuration entry does not exist.
    #[error("Model {model} is not loaded")]
    NotFound {
        /// The requested model name.
        model: String,
    },

    /// No port pair is left in the configured range.
    #[error("Memory exhausted: no available ports to load the model (range {low}-{high})")]
    CapacityExhausted {
        /// Lower bound of the configured range.
        low: u16,
        /// Upper bound of the configured range.
        high: u16,
    },

    /// The artifact path failed structural validation.
    #[error("Could not find valid base path {} for servable {model}", path.display())]
    InvalidArtifact {
        /// Model the artifact was submitted for.
        model: String,
        /// The rejected artifact path.
        path: PathBuf,
    },

    /// Persisted configuration could not be parsed.
    #[error("Corrupt model configuration {}:{line}: {message}", path.display())]
    CorruptConfig {
        /// The configuration file.
        path: PathBuf,
        /// 1-based line number of the offending line.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// A backend call did not complete before its deadline.
    #[error("{operation} timed out after {duration:?}")]
    DeadlineExceeded {
        /// The operation that timed out.
        operation: String,
        /// The deadline that elapsed.
        duration: Duration,
    },

    /// The backend reported an error not covered by another kind.
    #[error("Backend error: {code}; message: {message}")]
    Upstream {
        /// Backend status code (gRPC code name or HTTP status).
        code: String,
        /// Backend-supplied message.
        message: String,
    },

    /// A child process could not be spawned or exited unexpectedly.
    #[error("Process {process} failed: {message}")]
    ProcessFailure {
        /// Logical process name.
        process: String,
        /// Failure description.
        message: String,
    },

    /// The request itself is malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    /// Startup configuration is invalid.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

/// Flat classification of [`Error`], used for status mapping and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Conflict`].
    Conflict,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::CapacityExhausted`].
    CapacityExhausted,
    /// See [`Error::InvalidArtifact`].
    InvalidArtifact,
    /// See [`Error::CorruptConfig`].
    CorruptConfig,
    /// See [`Error::DeadlineExceeded`].
    DeadlineExceeded,
    /// See [`Error::Upstream`].
    Upstream,
    /// See [`Error::ProcessFailure`].
    ProcessFailure,
    /// See [`Error::InvalidRequest`].
    InvalidRequest,
    /// Configuration, I/O, serialization and internal failures.
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name, used as the `type` field of error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::CapacityExhausted => "capacity_exhausted",
            Self::InvalidArtifact => "invalid_artifact",
            Self::CorruptConfig => "corrupt_config",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Upstream => "upstream_error",
            Self::ProcessFailure => "process_failure",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal_error",
        }
    }
}

impl Error {
    /// Returns the flat kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Self::InvalidArtifact { .. } => ErrorKind::InvalidArtifact,
            Self::CorruptConfig { .. } => ErrorKind::CorruptConfig,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::InvalidConfig { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns `true` if the caller may retry the same request later.
    ///
    /// Reload deadlines are deliberately excluded: a retry after a partially
    /// applied reload could append the same entry twice.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a conflict error for a model that is already loaded.
    #[must_use]
    pub fn already_loaded(model: &str) -> Self {
        Self::conflict(format!("Model {model} is already loaded."))
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(model: impl Into<String>) -> Self {
        Self::NotFound {
            model: model.into(),
        }
    }

    /// Creates an upstream error.
    #[must_use]
    pub fn upstream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a process failure.
    #[must_use]
    pub fn process(process: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessFailure {
            process: process.into(),
            message: message.into(),
        }
    }

    /// Creates a deadline error.
    #[must_use]
    pub fn deadline(operation: impl Into<String>, duration: Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            duration,
        }
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
