//! HTTP server: configuration, shared state, routing and error bodies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use dantalion::ControlPlaneMetrics;
use marbas::ModelRegistry;
use vassago_core::{Error, ErrorKind, Result};

use crate::attributes::{DEFAULT_HEADER, DEFAULT_PREFIX};
use crate::handlers;
use crate::hooks::InvocationHandler;
use crate::proxy::BackendClient;

const DEFAULT_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Enable CORS.
    pub cors: bool,
    /// Model used when an invocation names none.
    pub default_model: Option<String>,
    /// Header carrying custom attributes.
    pub attributes_header: String,
    /// Prefix of recognized custom-attribute keys.
    pub attribute_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServerConfig {
    /// Creates a new server config builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    addr: Option<SocketAddr>,
    cors: Option<bool>,
    default_model: Option<String>,
    attributes_header: Option<String>,
    attribute_prefix: Option<String>,
}

impl ServerConfigBuilder {
    /// Sets the listen address.
    #[must_use]
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Sets whether CORS is enabled.
    #[must_use]
    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors = Some(enabled);
        self
    }

    /// Sets the default model.
    #[must_use]
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Sets the custom-attribute header name.
    #[must_use]
    pub fn attributes_header(mut self, header: impl Into<String>) -> Self {
        self.attributes_header = Some(header.into());
        self
    }

    /// Sets the custom-attribute key prefix.
    #[must_use]
    pub fn attribute_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.attribute_prefix = Some(prefix.into());
        self
    }

    /// Builds the server config.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            addr: self.addr.unwrap_or_else(|| SocketAddr::from(DEFAULT_ADDR)),
            cors: self.cors.unwrap_or(true),
            default_model: self.default_model,
            attributes_header: self
                .attributes_header
                .unwrap_or_else(|| DEFAULT_HEADER.to_string()),
            attribute_prefix: self
                .attribute_prefix
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        }
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Loaded models.
    pub registry: Arc<ModelRegistry>,
    /// Control-plane counters.
    pub metrics: ControlPlaneMetrics,
    /// Backend HTTP client.
    pub client: BackendClient,
    /// Invocation strategy.
    pub handler: InvocationHandler,
    /// Server configuration.
    pub config: ServerConfig,
    /// Server start time.
    pub start_time: Instant,
}

impl AppState {
    /// Creates app state with pass-through invocations.
    #[must_use]
    pub fn new(config: ServerConfig, registry: Arc<ModelRegistry>, client: BackendClient) -> Self {
        Self {
            registry,
            metrics: ControlPlaneMetrics::new(),
            client,
            handler: InvocationHandler::PassThrough,
            config,
            start_time: Instant::now(),
        }
    }

    /// Replaces the invocation strategy.
    #[must_use]
    pub fn with_handler(mut self, handler: InvocationHandler) -> Self {
        self.handler = handler;
        self
    }
}

/// The HTTP server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Creates a server over `state`.
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Shared state, as seen by handlers.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Creates the router.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/ping", get(handlers::ping))
            .route("/status", get(handlers::status))
            .route("/invocations", post(handlers::invocations))
            .route("/models", get(handlers::list_models).post(handlers::load_model))
            .route(
                "/models/{name}",
                get(handlers::get_model).delete(handlers::unload_model),
            )
            .route("/models/{name}/invoke", post(handlers::invoke_model))
            .with_state(self.state.clone());

        router = router.layer(TraceLayer::new_for_http());

        if self.state.config.cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Binds the configured address and serves until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or serving fails.
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let router = self.router();
        tracing::info!(
            addr = %listener.local_addr()?,
            mode = %self.state.registry.mode(),
            hooks = self.state.handler.shape(),
            "Starting Vassago server"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::internal(e.to_string()))?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

// === Error Response ===

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    code: Option<String>,
}

impl ErrorResponse {
    fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
                code: None,
            },
        }
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str, error_type: &str) -> Response {
    let body = Json(ErrorResponse::new(message, error_type));
    (status, body).into_response()
}

/// HTTP status for an error kind.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound | ErrorKind::InvalidArtifact => StatusCode::NOT_FOUND,
        ErrorKind::CapacityExhausted => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::CorruptConfig
        | ErrorKind::Upstream
        | ErrorKind::ProcessFailure
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// [`Error`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = kind.as_str(), "Request failed");
        } else {
            tracing::debug!(error = %self.0, kind = kind.as_str(), "Request rejected");
        }
        error_response(status, &self.0.to_string(), kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::builder()
            .addr("127.0.0.1:3000".parse().unwrap())
            .cors(false)
            .default_model("half_plus_three")
            .attribute_prefix("x-")
            .build();

        assert_eq!(config.addr, "127.0.0.1:3000".parse().unwrap());
        assert!(!config.cors);
        assert_eq!(config.default_model.as_deref(), Some("half_plus_three"));
        assert_eq!(config.attributes_header, DEFAULT_HEADER);
        assert_eq!(config.attribute_prefix, "x-");
    }

    #[test]
    fn test_default_addr() {
        assert_eq!(ServerConfig::default().addr.port(), 8080);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::InvalidArtifact), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorKind::CapacityExhausted),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            status_for(ErrorKind::DeadlineExceeded),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            status_for(ErrorKind::Upstream),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_body() {
        let err = ErrorResponse::new("Model x is not loaded", "not_found");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["type"], "not_found");
        assert!(json["error"]["code"].is_null());
    }
}
