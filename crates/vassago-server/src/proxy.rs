//! Forwarding of invocation bodies to backend REST endpoints.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use vassago_core::{Error, Result};

/// Default per-request deadline for backend calls.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// A request bound for a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Full backend URI, see [`crate::attributes::backend_uri`].
    pub uri: String,
    /// Body to send.
    pub body: Bytes,
    /// `Content-Type` of the body.
    pub content_type: String,
    /// `Accept` header of the original request.
    pub accept: String,
    /// Raw custom-attribute header and the name it travels under.
    pub custom_attributes: Option<(String, String)>,
}

/// What the backend answered.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type`, if the backend set one.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Bytes,
}

impl BackendResponse {
    /// True for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client for backend REST endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl BackendClient {
    /// Creates a client whose calls fail after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build backend client: {e}")))?;
        Ok(Self { http, timeout })
    }

    /// Per-request deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POSTs `request` and returns the backend's answer, whatever its status.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded` when the backend does not answer in time,
    /// `Upstream` for connection and transport failures.
    pub async fn forward(&self, request: BackendRequest) -> Result<BackendResponse> {
        let mut builder = self
            .http
            .post(&request.uri)
            .header(CONTENT_TYPE, &request.content_type)
            .header(ACCEPT, &request.accept)
            .body(request.body);
        if let Some((name, value)) = &request.custom_attributes {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.transport_error(&request.uri, &e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&request.uri, &e))?;

        tracing::debug!(uri = %request.uri, status, bytes = body.len(), "Backend responded");
        Ok(BackendResponse {
            status,
            content_type,
            body,
        })
    }

    fn transport_error(&self, uri: &str, err: &reqwest::Error) -> Error {
        if err.is_timeout() {
            return Error::deadline(format!("POST {uri}"), self.timeout);
        }
        let code = if err.is_connect() {
            "UNAVAILABLE"
        } else {
            "TRANSPORT"
        };
        tracing::warn!(uri = %uri, error = %err, "Backend request failed");
        Error::upstream(code, err.to_string())
    }
}
