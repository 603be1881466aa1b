//! # Marbas
//!
//! *"The President who reveals hidden things and repairs what is broken"*
//!
//! Marbas is the model lifecycle manager of the Vassago control plane. It
//! keeps the mapping between model names, the ports they are served on, and
//! the backend processes serving them consistent across concurrent loads,
//! unloads and backend crashes.
//!
//! ## Components
//!
//! - **Ports**: disjoint (REST, gRPC) pairs carved from one configured range
//! - **Config store**: the backend's model configuration, shared under a
//!   cross-process lock or split into one directory per model
//! - **Supervisor**: a single reaper task that launches, watches, restarts
//!   and stops backend processes
//! - **Reload**: pushes a full configuration into a running shared backend
//! - **Registry**: the source of truth, with a lock-free read path

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod backend;
pub mod config_store;
pub mod model_config;
pub mod ports;
pub mod registry;
pub mod reload;
pub mod supervisor;

pub use artifact::{discover_models, validate_artifact, validate_name, DiscoveredModel};
pub use backend::{BackendCommand, BatchingConfig};
pub use config_store::{DedicatedConfigStore, SharedConfigStore};
pub use model_config::{ConfigEdit, ModelConfig};
pub use ports::{PortAllocator, PortRange};
pub use registry::{DedicatedBackend, Deployment, ModelRegistry, SharedBackend, UnloadOutcome};
pub use reload::{ConfigReloader, GrpcReloadClient};
pub use supervisor::{
    ExitEvent, LaunchSpec, ProcessInfo, ProcessState, RestartPolicy, Supervisor, SupervisorConfig,
};
