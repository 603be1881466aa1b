//! Out-of-band configuration reload for the shared backend.
//!
//! The backend's management RPC replaces its whole model configuration, so
//! every push carries the complete desired list rather than a delta.

use std::time::Duration;

use async_trait::async_trait;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use vassago_core::{Error, Result};

use crate::model_config::ModelConfig;

/// Default deadline for a reload call.
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

const RELOAD_PATH: &str = "/tensorflow.serving.ModelService/HandleReloadConfigRequest";

/// Pushes a full model configuration into a running backend.
#[async_trait]
pub trait ConfigReloader: Send + Sync {
    /// Replaces the backend's configuration with `models`.
    ///
    /// Implementations must not retry: a retry after partial success could
    /// apply the same entry twice.
    async fn push(&self, models: &[ModelConfig]) -> Result<()>;
}

/// Wire messages for the reload RPC.
pub mod proto {
    /// A single model block.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelConfig {
        /// Model name.
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        /// Artifact path.
        #[prost(string, tag = "2")]
        pub base_path: ::prost::alloc::string::String,
        /// Model platform.
        #[prost(string, tag = "4")]
        pub model_platform: ::prost::alloc::string::String,
    }

    /// List of model blocks.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelConfigList {
        /// Blocks.
        #[prost(message, repeated, tag = "1")]
        pub config: ::prost::alloc::vec::Vec<ModelConfig>,
    }

    /// Top-level server configuration.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelServerConfig {
        /// Model list.
        #[prost(message, optional, tag = "1")]
        pub model_config_list: ::core::option::Option<ModelConfigList>,
    }

    /// Reload request.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReloadConfigRequest {
        /// Desired configuration.
        #[prost(message, optional, tag = "1")]
        pub config: ::core::option::Option<ModelServerConfig>,
    }

    /// Status carried in reload responses.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StatusProto {
        /// Canonical error code; zero means OK.
        #[prost(int32, tag = "1")]
        pub error_code: i32,
        /// Error message.
        #[prost(string, tag = "2")]
        pub error_message: ::prost::alloc::string::String,
    }

    /// Reload response.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReloadConfigResponse {
        /// Outcome.
        #[prost(message, optional, tag = "1")]
        pub status: ::core::option::Option<StatusProto>,
    }
}

impl From<&ModelConfig> for proto::ModelConfig {
    fn from(config: &ModelConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_path: config.base_path.to_string_lossy().into_owned(),
            model_platform: config.platform.clone(),
        }
    }
}

/// Builds the reload request for `models`.
#[must_use]
pub fn reload_request(models: &[ModelConfig]) -> proto::ReloadConfigRequest {
    proto::ReloadConfigRequest {
        config: Some(proto::ModelServerConfig {
            model_config_list: Some(proto::ModelConfigList {
                config: models.iter().map(Into::into).collect(),
            }),
        }),
    }
}

/// gRPC client for the backend's model management service.
#[derive(Debug, Clone)]
pub struct GrpcReloadClient {
    channel: Channel,
    timeout: Duration,
}

impl GrpcReloadClient {
    /// Creates a client for the backend at `uri`. The connection is opened
    /// lazily on the first push.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `uri` is not a valid endpoint.
    pub fn new(uri: impl Into<String>, timeout: Duration) -> Result<Self> {
        let uri = uri.into();
        let channel = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::invalid_config(format!("invalid reload endpoint {uri}: {e}")))?
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self { channel, timeout })
    }

    async fn call(&self, request: proto::ReloadConfigRequest) -> Result<proto::ReloadConfigResponse> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::upstream("UNAVAILABLE", e.to_string()))?;

        let mut request = tonic::Request::new(request);
        request.set_timeout(self.timeout);
        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(RELOAD_PATH),
                ProstCodec::<proto::ReloadConfigRequest, proto::ReloadConfigResponse>::default(),
            )
            .await
            .map_err(|status| map_code(status.code(), status.message(), self.timeout))?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl ConfigReloader for GrpcReloadClient {
    async fn push(&self, models: &[ModelConfig]) -> Result<()> {
        let started = std::time::Instant::now();
        let response = tokio::time::timeout(self.timeout, self.call(reload_request(models)))
            .await
            .map_err(|_| Error::deadline("reload config", self.timeout))??;

        if let Some(status) = response.status {
            if status.error_code != 0 {
                return Err(map_code(
                    Code::from_i32(status.error_code),
                    &status.error_message,
                    self.timeout,
                ));
            }
        }

        tracing::debug!(
            models = models.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend accepted config reload"
        );
        Ok(())
    }
}

fn map_code(code: Code, message: &str, timeout: Duration) -> Error {
    match code {
        Code::DeadlineExceeded => Error::deadline("reload config", timeout),
        Code::InvalidArgument | Code::AlreadyExists => Error::conflict(message.to_string()),
        other => Error::upstream(format!("{other:?}"), message),
    }
}
