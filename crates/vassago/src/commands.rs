//! CLI command implementations.

use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};

use marbas::{
    discover_models, validate_artifact, BackendCommand, DedicatedBackend, DedicatedConfigStore,
    Deployment, GrpcReloadClient, LaunchSpec, ModelConfig, ModelRegistry, PortAllocator,
    RestartPolicy, SharedBackend, SharedConfigStore, Supervisor,
};
use vassago_core::{Endpoint, ServingMode};
use vassago_server::{AppState, BackendClient, InvocationHandler, Server, ServerConfig};

use crate::config::Config;

/// Start the control plane and block until shutdown.
pub async fn serve(config: Config) -> Result<()> {
    config.validate()?;
    tracing::info!(mode = %config.mode, port_range = %config.port_range, "Starting Vassago");

    let ports = Arc::new(PortAllocator::new(config.port_range()?));
    let supervisor = Supervisor::start(config.supervisor_config());

    let result = run(&config, ports, &supervisor).await;

    supervisor.shutdown().await;
    tracing::info!("Vassago stopped");
    result
}

async fn run(config: &Config, ports: Arc<PortAllocator>, supervisor: &Supervisor) -> Result<()> {
    let mut command = BackendCommand::new(&config.backend.program, config.backend.args.clone());
    if let Some(file) = config.backend.batching.write(&config.state_dir).await? {
        tracing::info!(file = %file.display(), "Batching enabled");
        command = command.with_batching(file);
    }
    command.log_version().await;

    let mut default_model = config.default_model_name.clone();
    let mut adopted = Vec::new();

    let deployment = match config.mode {
        ServingMode::Shared => {
            let base = config.model_base_path.clone();
            let discovered = tokio::task::spawn_blocking(move || discover_models(&base)).await?;
            if default_model.is_none() {
                default_model = discovered.first().map(|m| m.name.clone());
            }
            adopted = discovered
                .iter()
                .map(|m| ModelConfig {
                    platform: config.backend.platform.clone(),
                    ..ModelConfig::new(&m.name, &m.path)
                })
                .collect();
            tracing::info!(
                models = adopted.len(),
                base_path = %config.model_base_path.display(),
                "Discovered models"
            );

            let store = SharedConfigStore::new(&config.state_dir, config.backend.settle_delay());
            store.initialize(&adopted).await?;

            let pair = ports.reserve()?;
            let spec = command.launch_spec("shared-backend", pair, store.path(), ServingMode::Shared);
            supervisor.spawn(spec, RestartPolicy::Always).await?;

            let endpoint = Endpoint::localhost(pair);
            let reloader = GrpcReloadClient::new(endpoint.grpc_uri(), config.backend.reload_timeout())?;
            Deployment::Shared(SharedBackend::new(store, Arc::new(reloader), endpoint))
        }
        ServingMode::Dedicated => {
            // No backend from a previous run survives, so neither may its config.
            let store = DedicatedConfigStore::new(&config.state_dir);
            store.reset().await?;
            Deployment::Dedicated(
                DedicatedBackend::new(Arc::clone(&ports), store, command, supervisor.clone())
                    .with_startup_delay(config.backend.startup_delay()),
            )
        }
    };

    let registry = Arc::new(ModelRegistry::new(deployment));
    if config.mode == ServingMode::Shared {
        registry.adopt(&adopted)?;
    }
    let watcher = registry.watch_exits();

    for aux in &config.auxiliary {
        let spec = LaunchSpec::new(&aux.name, &aux.program, aux.args.clone());
        let id = supervisor.spawn(spec, RestartPolicy::Always).await?;
        tracing::info!(name = %aux.name, process = %id, "Auxiliary process started");
    }

    let mut server_config = ServerConfig::builder()
        .addr(config.listen_addr())
        .cors(config.server.cors)
        .attributes_header(&config.custom_attributes_header)
        .attribute_prefix(&config.attribute_prefix);
    if let Some(model) = default_model {
        server_config = server_config.default_model(model);
    }

    let client = BackendClient::new(config.backend.invoke_timeout())?;
    let handler = InvocationHandler::from_config(&config.hooks, config.backend.invoke_timeout())?;
    let state = AppState::new(server_config.build(), registry, client).with_handler(handler);

    let served = Server::new(state).run().await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    served?;
    Ok(())
}

/// Check a model directory the way a load would.
pub async fn validate(path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre!("{} has no usable directory name", path.display()))?
        .to_string();

    let target = path.to_path_buf();
    let checked = name.clone();
    tokio::task::spawn_blocking(move || validate_artifact(&checked, &target)).await??;
    marbas::validate_name(&name)?;

    println!("\x1b[32m✓\x1b[0m {} is a valid artifact for model {name}", path.display());
    Ok(())
}

/// Display version information.
pub fn version() {
    println!("Vassago {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Finds what was lost and serves what was hidden.");
    println!();
    println!("Components:");
    println!("  Marbas     - Model lifecycle manager");
    println!("  Dantalion  - Observability");
    println!("  Server     - HTTP control plane and request router");
    println!();
    println!("Daemoniorum, LLC - Building Tomorrow's Intelligence");
}
