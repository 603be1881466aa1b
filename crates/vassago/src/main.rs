//! # Vassago CLI
//!
//! *"The Prince who finds what was lost and serves what was hidden"*
//!
//! The command-line interface of the Vassago model-serving control plane.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use vassago_core::ServingMode;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "vassago")]
#[command(author = "Daemoniorum Engineering")]
#[command(version)]
#[command(about = "Control plane for multi-model serving sidecars", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<std::net::IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Serving mode (shared or dedicated)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<ServingMode>,

        /// Model used when a request names none
        #[arg(long)]
        default_model: Option<String>,
    },

    /// Check that a directory is a loadable model artifact
    Validate {
        /// Model directory
        path: PathBuf,
    },

    /// Display version and build info
    Version,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show config file path
    Path,
}

fn parse_mode(s: &str) -> std::result::Result<ServingMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "shared" => Ok(ServingMode::Shared),
        "dedicated" => Ok(ServingMode::Dedicated),
        other => Err(format!("unknown mode {other:?}, expected shared or dedicated")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let telemetry_config = dantalion::TelemetryConfig::new("vassago").with_log_level(&cli.log_level);
    let telemetry_config = if cli.json_logs {
        telemetry_config.with_json_logs()
    } else {
        telemetry_config
    };
    dantalion::init_logging(&telemetry_config)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            mode,
            default_model,
        } => {
            let mut cfg = config::Config::load(cli.config.as_deref())
                .map_err(|e| eyre!("failed to load configuration: {e}"))?;
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Some(mode) = mode {
                cfg.mode = mode;
            }
            if default_model.is_some() {
                cfg.default_model_name = default_model;
            }
            commands::serve(cfg).await?;
        }

        Commands::Validate { path } => {
            commands::validate(&path).await?;
        }

        Commands::Version => {
            commands::version();
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let cfg = config::Config::load(cli.config.as_deref())
                    .map_err(|e| eyre!("failed to load configuration: {e}"))?;
                config::show_config(&cfg, cli.config.as_deref());
            }
            ConfigAction::Path => {
                let path = cli.config.unwrap_or_else(config::Config::config_path);
                println!("{}", path.display());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve_overrides() {
        let cli = Cli::try_parse_from([
            "vassago", "--config", "/etc/vassago.toml", "serve", "--port", "9090", "--mode", "dedicated",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vassago.toml")));
        match cli.command {
            Commands::Serve { port, mode, .. } => {
                assert_eq!(port, Some(9090));
                assert_eq!(mode, Some(ServingMode::Dedicated));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["vassago", "serve", "--mode", "pooled"]).is_err());
    }
}
