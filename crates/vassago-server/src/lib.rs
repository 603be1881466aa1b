//! # Vassago Server
//!
//! HTTP surface of the Vassago control plane: model management endpoints and
//! the request router that forwards invocations to backend model servers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attributes;
mod handlers;
pub mod hooks;
pub mod proxy;
pub mod server;

pub use attributes::CustomAttributes;
pub use hooks::{
    HookCommand, HookOutput, HooksConfig, InvocationHandler, RequestContext, ScriptHook,
};
pub use proxy::{BackendClient, BackendRequest, BackendResponse, DEFAULT_INVOKE_TIMEOUT};
pub use server::{shutdown_signal, ApiError, AppState, Server, ServerConfig};
