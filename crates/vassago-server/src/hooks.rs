//! Pre/post-processing of invocation bodies.
//!
//! A hook is an external executable. It receives the body on stdin, the
//! request context as `VASSAGO_*` environment variables, and writes its
//! result to stdout. To declare the content type of that result it writes
//! the type to the file named by `VASSAGO_RESPONSE_CONTENT_TYPE_FILE`.
//! The shape is fixed at startup:
//!
//! - a `handler` command owns the whole exchange, including the backend call;
//! - an `input` and an `output` command wrap the forwarded call;
//! - with neither, bodies pass through untouched.

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use vassago_core::{Error, Result};

use crate::proxy::{BackendClient, BackendRequest, BackendResponse};

/// Content type assumed when a request does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Environment variable naming the file a hook writes its content type to.
pub const CONTENT_TYPE_FILE_ENV: &str = "VASSAGO_RESPONSE_CONTENT_TYPE_FILE";

/// One hook executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCommand {
    /// Program to run.
    pub program: String,
    /// Arguments passed before anything else.
    #[serde(default)]
    pub args: Vec<String>,
}

impl HookCommand {
    /// Creates a hook command.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// The `[hooks]` configuration table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Full handler.
    pub handler: Option<HookCommand>,
    /// Request transform, paired with `output`.
    pub input: Option<HookCommand>,
    /// Response transform, paired with `input`.
    pub output: Option<HookCommand>,
}

/// Everything a hook may want to know about the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Target model.
    pub model_name: String,
    /// Requested version, if any.
    pub model_version: Option<String>,
    /// Backend method (`predict`, `classify`, ...).
    pub method: String,
    /// Backend REST URI for this request.
    pub rest_uri: String,
    /// Backend gRPC port.
    pub grpc_port: u16,
    /// Raw custom-attribute header.
    pub custom_attributes: Option<String>,
    /// Request `Content-Type`.
    pub request_content_type: String,
    /// Request `Accept`.
    pub accept_header: String,
    /// Length of the request body.
    pub content_length: usize,
}

impl RequestContext {
    fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("VASSAGO_MODEL_NAME", self.model_name.clone()),
            ("VASSAGO_METHOD", self.method.clone()),
            ("VASSAGO_REST_URI", self.rest_uri.clone()),
            ("VASSAGO_GRPC_PORT", self.grpc_port.to_string()),
            ("VASSAGO_CONTENT_TYPE", self.request_content_type.clone()),
            ("VASSAGO_ACCEPT", self.accept_header.clone()),
            ("VASSAGO_CONTENT_LENGTH", self.content_length.to_string()),
        ];
        if let Some(version) = &self.model_version {
            env.push(("VASSAGO_MODEL_VERSION", version.clone()));
        }
        if let Some(attrs) = &self.custom_attributes {
            env.push(("VASSAGO_CUSTOM_ATTRIBUTES", attrs.clone()));
        }
        env
    }
}

/// What a hook produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutput {
    /// Transformed body.
    pub body: Bytes,
    /// Content type the hook declared, if any.
    pub content_type: Option<String>,
}

/// A hook executable bound to a deadline.
#[derive(Debug, Clone)]
pub struct ScriptHook {
    command: HookCommand,
    label: &'static str,
    timeout: Duration,
}

impl ScriptHook {
    /// Wraps `command`; `label` names it in logs and errors.
    #[must_use]
    pub fn new(command: HookCommand, label: &'static str, timeout: Duration) -> Self {
        Self {
            command,
            label,
            timeout,
        }
    }

    /// Runs the hook over `input`.
    ///
    /// # Errors
    ///
    /// `ProcessFailure` if the hook cannot start or exits non-zero,
    /// `DeadlineExceeded` if it outlives the deadline.
    pub async fn run(
        &self,
        input: Bytes,
        context: &RequestContext,
        extra_env: &[(&'static str, String)],
    ) -> Result<HookOutput> {
        let scratch = tempfile::tempdir()?;
        let type_file = scratch.path().join("content-type");

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(context.env())
            .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())))
            .env(CONTENT_TYPE_FILE_ENV, &type_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::process(self.label, format!("failed to start {}: {e}", self.command.program)))?;

        let stdin = child.stdin.take();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A hook that ignores its input closes the pipe early.
                let _ = stdin.write_all(&input).await;
            }
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::deadline(format!("{} hook", self.label), self.timeout))?
            .map_err(|e| Error::process(self.label, e.to_string()))?;
        let _ = feeder.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                hook = self.label,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "Hook failed"
            );
            return Err(Error::process(
                self.label,
                format!("exited with {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        let content_type = match tokio::fs::read_to_string(&type_file).await {
            Ok(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(HookOutput {
            body: Bytes::from(output.stdout),
            content_type,
        })
    }
}

/// Result of handling one invocation.
#[derive(Debug, Clone)]
pub struct InvocationResponse {
    /// Status to return to the caller.
    pub status: u16,
    /// Response content type.
    pub content_type: String,
    /// Response body.
    pub body: Bytes,
}

impl InvocationResponse {
    fn relay(response: BackendResponse, accept: &str) -> Self {
        Self {
            status: response.status,
            content_type: response
                .content_type
                .unwrap_or_else(|| accept.to_string()),
            body: response.body,
        }
    }
}

/// How invocations are processed, selected once at startup.
#[derive(Debug, Clone, Default)]
pub enum InvocationHandler {
    /// Forward the body and relay the backend's answer.
    #[default]
    PassThrough,
    /// A single hook produces the response.
    Full(ScriptHook),
    /// Transform the request, forward it, transform the response.
    Split {
        /// Request transform.
        input: ScriptHook,
        /// Response transform.
        output: ScriptHook,
    },
}

impl InvocationHandler {
    /// Resolves the `[hooks]` table into a handler.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when only one of `input`/`output` is configured.
    pub fn from_config(config: &HooksConfig, timeout: Duration) -> Result<Self> {
        if let Some(handler) = &config.handler {
            if config.input.is_some() || config.output.is_some() {
                tracing::warn!("Hook handler configured; ignoring input/output hooks");
            }
            return Ok(Self::Full(ScriptHook::new(handler.clone(), "handler", timeout)));
        }
        match (&config.input, &config.output) {
            (Some(input), Some(output)) => Ok(Self::Split {
                input: ScriptHook::new(input.clone(), "input", timeout),
                output: ScriptHook::new(output.clone(), "output", timeout),
            }),
            (None, None) => Ok(Self::PassThrough),
            (Some(_), None) => Err(Error::invalid_config(
                "input hook configured without an output hook",
            )),
            (None, Some(_)) => Err(Error::invalid_config(
                "output hook configured without an input hook",
            )),
        }
    }

    /// Short name for logs and the status endpoint.
    #[must_use]
    pub fn shape(&self) -> &'static str {
        match self {
            Self::PassThrough => "pass-through",
            Self::Full(_) => "handler",
            Self::Split { .. } => "input-output",
        }
    }

    /// Handles one invocation.
    ///
    /// # Errors
    ///
    /// Backend transport errors and hook failures.
    pub async fn invoke(
        &self,
        client: &BackendClient,
        request: BackendRequest,
        context: &RequestContext,
    ) -> Result<InvocationResponse> {
        match self {
            Self::PassThrough => {
                let accept = request.accept.clone();
                let response = client.forward(request).await?;
                Ok(InvocationResponse::relay(response, &accept))
            }
            Self::Full(handler) => {
                let out = handler.run(request.body, context, &[]).await?;
                Ok(InvocationResponse {
                    status: 200,
                    content_type: out
                        .content_type
                        .unwrap_or_else(|| context.accept_header.clone()),
                    body: out.body,
                })
            }
            Self::Split { input, output } => {
                let transformed = input.run(request.body.clone(), context, &[]).await?;
                let accept = request.accept.clone();
                let content_type = transformed
                    .content_type
                    .unwrap_or_else(|| request.content_type.clone());
                let response = client
                    .forward(BackendRequest {
                        body: transformed.body,
                        content_type,
                        ..request
                    })
                    .await?;
                let status = response.status;
                let backend_type = response
                    .content_type
                    .clone()
                    .unwrap_or_else(|| accept.clone());
                let out = output
                    .run(
                        response.body,
                        context,
                        &[
                            ("VASSAGO_BACKEND_STATUS", status.to_string()),
                            ("VASSAGO_BACKEND_CONTENT_TYPE", backend_type),
                        ],
                    )
                    .await?;
                Ok(InvocationResponse {
                    status,
                    content_type: out.content_type.unwrap_or(accept),
                    body: out.body,
                })
            }
        }
    }
}
