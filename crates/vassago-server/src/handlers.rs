//! Request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use dantalion::{MetricsSnapshot, OperationTimer};
use marbas::UnloadOutcome;
use vassago_core::{Error, ModelState, ModelSummary, ServingMode};

use crate::attributes::{backend_uri, CustomAttributes};
use crate::hooks::{RequestContext, DEFAULT_CONTENT_TYPE};
use crate::proxy::BackendRequest;
use crate::server::{ApiError, AppState};

type ApiResult<T> = std::result::Result<T, ApiError>;

// === Health ===

pub(crate) async fn ping() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub(crate) struct ServerStatus {
    status: &'static str,
    mode: ServingMode,
    uptime_seconds: u64,
    models_loaded: usize,
    default_model: Option<String>,
    hooks: &'static str,
    metrics: MetricsSnapshot,
}

pub(crate) async fn status(State(state): State<Arc<AppState>>) -> Json<ServerStatus> {
    Json(ServerStatus {
        status: "ok",
        mode: state.registry.mode(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        models_loaded: state.registry.ready_count(),
        default_model: state.config.default_model.clone(),
        hooks: state.handler.shape(),
        metrics: state.metrics.snapshot(),
    })
}

// === Model management ===

/// Body of `POST /models`. The legacy `name`/`uri` spelling is accepted.
#[derive(Debug, Deserialize)]
pub(crate) struct LoadRequest {
    #[serde(alias = "name")]
    model_name: String,
    #[serde(alias = "uri")]
    url: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct LoadResponse {
    message: String,
    model_name: String,
    rest_port: u16,
    grpc_port: u16,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModelListing {
    model_name: String,
    model_url: String,
}

impl From<&ModelSummary> for ModelListing {
    fn from(summary: &ModelSummary) -> Self {
        Self {
            model_name: summary.name.clone(),
            model_url: summary.artifact_path.display().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModelDescription {
    model_name: String,
    model_url: String,
    state: ModelState,
    rest_port: u16,
    grpc_port: u16,
}

pub(crate) async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelListing>> {
    Json(state.registry.list().iter().map(ModelListing::from).collect())
}

pub(crate) async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ModelDescription>> {
    let summary = state
        .registry
        .get(&name)
        .ok_or_else(|| Error::not_found(&name))?;
    Ok(Json(ModelDescription {
        model_name: summary.name.clone(),
        model_url: summary.artifact_path.display().to_string(),
        state: summary.state,
        rest_port: summary.endpoint.rest_port,
        grpc_port: summary.endpoint.grpc_port,
    }))
}

pub(crate) async fn load_model(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<LoadResponse>> {
    let request: LoadRequest = serde_json::from_slice(&body).map_err(|e| {
        Error::invalid_request(format!(
            "expected a JSON body with model_name and url: {e}"
        ))
    })?;

    // The load outlives a disconnecting client.
    let registry = Arc::clone(&state.registry);
    let name = request.model_name.clone();
    let result = tokio::spawn(async move { registry.load(&name, &request.url).await })
        .await
        .map_err(|e| Error::internal(format!("load task failed: {e}")))?;
    state.metrics.record_load(result.is_ok());
    let entry = result?;

    let message = format!(
        "Successfully loaded model {}, listening on rest port {} and grpc port {}.",
        entry.name, entry.endpoint.rest_port, entry.endpoint.grpc_port
    );
    tracing::info!(model = %entry.name, rest_port = entry.endpoint.rest_port, "{message}");
    Ok(Json(LoadResponse {
        message,
        model_name: entry.name.clone(),
        rest_port: entry.endpoint.rest_port,
        grpc_port: entry.endpoint.grpc_port,
    }))
}

pub(crate) async fn unload_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    let registry = Arc::clone(&state.registry);
    let target = name.clone();
    let outcome = tokio::spawn(async move { registry.unload(&target).await })
        .await
        .map_err(|e| Error::internal(format!("unload task failed: {e}")))??;

    let message = match outcome {
        UnloadOutcome::Unloaded => {
            state.metrics.record_unload();
            format!("Successfully unloaded model {name}.")
        }
        UnloadOutcome::NotRunning => format!("Model {name} is not running; nothing to unload."),
    };
    Ok(Json(MessageResponse { message }))
}

// === Invocation ===

pub(crate) async fn invocations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    invoke(&state, None, &headers, body).await
}

pub(crate) async fn invoke_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    invoke(&state, Some(name), &headers, body).await
}

async fn invoke(state: &AppState, path_model: Option<String>, headers: &HeaderMap, body: Bytes) -> Response {
    let timer = OperationTimer::start("invoke");
    let result = dispatch(state, path_model, headers, body).await;
    state
        .metrics
        .record_invocation(result.is_ok(), timer.stop());
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn dispatch(
    state: &AppState,
    path_model: Option<String>,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let config = &state.config;
    let attributes = header_str(headers, &config.attributes_header)
        .map(|raw| CustomAttributes::parse(raw, &config.attribute_prefix))
        .unwrap_or_default();

    let model = path_model
        .or_else(|| attributes.model_name.clone())
        .or_else(|| config.default_model.clone())
        .ok_or_else(|| Error::invalid_request("Invocation request does not contain model name."))?;

    let endpoint = state.registry.resolve(&model)?;
    let method = attributes.method_or_default().to_string();
    let uri = backend_uri(
        &endpoint,
        &model,
        attributes.model_version.as_deref(),
        &method,
    );

    let content_type = header_str(headers, header::CONTENT_TYPE.as_str())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let accept = header_str(headers, header::ACCEPT.as_str())
        .filter(|a| !a.is_empty() && *a != "*/*")
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let context = RequestContext {
        model_name: model.clone(),
        model_version: attributes.model_version.clone(),
        method,
        rest_uri: uri.clone(),
        grpc_port: endpoint.grpc_port,
        custom_attributes: attributes.raw.clone(),
        request_content_type: content_type.clone(),
        accept_header: accept.clone(),
        content_length: body.len(),
    };
    let request = BackendRequest {
        uri,
        body,
        content_type,
        accept,
        custom_attributes: attributes
            .raw
            .map(|raw| (config.attributes_header.clone(), raw)),
    };

    tracing::debug!(model = %model, uri = %request.uri, "Forwarding invocation");
    let response = state
        .handler
        .invoke(&state.client, request, &context)
        .await?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response())
}
