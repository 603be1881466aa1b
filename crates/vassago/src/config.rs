//! Configuration management for the Vassago CLI.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Command-line arguments
//! 2. Environment variables (`VASSAGO_*`, nested keys split on `__`)
//! 3. Config file (`--config`, else `~/.config/vassago/config.toml`)
//! 4. Default values

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use marbas::{BatchingConfig, PortRange, SupervisorConfig};
use vassago_core::{Error, Result, ServingMode, DEFAULT_PLATFORM};
use vassago_server::attributes::{DEFAULT_HEADER, DEFAULT_PREFIX};
use vassago_server::{HooksConfig, InvocationHandler};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared or dedicated backends.
    pub mode: ServingMode,
    /// Inclusive `LOW-HIGH` range backend ports are drawn from.
    pub port_range: String,
    /// Model used when an invocation names none.
    pub default_model_name: Option<String>,
    /// Directory scanned for models at startup (shared mode).
    pub model_base_path: PathBuf,
    /// Where configuration and lock files are written.
    pub state_dir: PathBuf,
    /// Header carrying custom attributes.
    pub custom_attributes_header: String,
    /// Prefix of recognized custom-attribute keys.
    pub attribute_prefix: String,
    /// HTTP listener.
    pub server: ServerSection,
    /// Backend model server.
    pub backend: BackendSection,
    /// Pre/post-processing hooks.
    pub hooks: HooksConfig,
    /// Always-on helper processes.
    pub auxiliary: Vec<AuxiliaryProcess>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ServingMode::Shared,
            port_range: "9000-9999".to_string(),
            default_model_name: None,
            model_base_path: PathBuf::from("/opt/ml/models"),
            state_dir: PathBuf::from("/sagemaker"),
            custom_attributes_header: DEFAULT_HEADER.to_string(),
            attribute_prefix: DEFAULT_PREFIX.to_string(),
            server: ServerSection::default(),
            backend: BackendSection::default(),
            hooks: HooksConfig::default(),
            auxiliary: Vec::new(),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind.
    pub host: IpAddr,
    /// Port to listen on.
    pub port: u16,
    /// Enable permissive CORS.
    pub cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            cors: true,
        }
    }
}

/// `[backend]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Model server executable.
    pub program: String,
    /// Arguments placed before the generated ones.
    pub args: Vec<String>,
    /// Platform of models discovered at startup.
    pub platform: String,
    /// Wait after launching a dedicated backend.
    pub startup_delay_ms: u64,
    /// Deadline of a configuration reload.
    pub reload_timeout_ms: u64,
    /// Pause after a shared configuration change.
    pub settle_delay_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace_ms: u64,
    /// Deadline of a forwarded invocation.
    pub invoke_timeout_ms: u64,
    /// `[backend.batching]`
    pub batching: BatchingConfig,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            program: marbas::backend::DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            platform: DEFAULT_PLATFORM.to_string(),
            startup_delay_ms: 1_000,
            reload_timeout_ms: 5_000,
            settle_delay_ms: 1_000,
            stop_grace_ms: 10_000,
            invoke_timeout_ms: 60_000,
            batching: BatchingConfig::default(),
        }
    }
}

impl BackendSection {
    /// Post-launch delay.
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Reload RPC deadline.
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }

    /// Pause after shared configuration changes.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Invocation deadline.
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}

/// One `[[auxiliary]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryProcess {
    /// Name used in logs.
    pub name: String,
    /// Executable.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Loads configuration from every source. An explicit `path` must exist.
    ///
    /// # Errors
    ///
    /// Returns the figment error if a source is malformed, or if `path` is
    /// given and missing.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, figment::Error> {
        let toml = match path {
            Some(path) if !path.exists() => {
                return Err(figment::Error::from(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            Some(path) => Toml::file(path),
            None => Toml::file(Self::config_path()),
        };

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(toml)
            .merge(Env::prefixed("VASSAGO_").split("__"))
            .extract()
    }

    /// Returns the path to the default config file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vassago")
            .join("config.toml")
    }

    /// The parsed port range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the range does not parse or cannot
    /// hold a pair.
    pub fn port_range(&self) -> Result<PortRange> {
        self.port_range.parse()
    }

    /// Listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.port)
    }

    /// Supervisor timing derived from the backend section.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stop_grace: Duration::from_millis(self.backend.stop_grace_ms),
            ..SupervisorConfig::default()
        }
    }

    /// Checks everything that would otherwise fail halfway through startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.port_range()?;
        self.backend.batching.validate()?;
        InvocationHandler::from_config(&self.hooks, self.backend.invoke_timeout())?;
        if self.backend.program.trim().is_empty() {
            return Err(Error::invalid_config("backend.program is empty"));
        }
        if self.attribute_prefix.is_empty() {
            return Err(Error::invalid_config("attribute_prefix is empty"));
        }
        if let Some(aux) = self.auxiliary.iter().find(|a| a.program.trim().is_empty()) {
            return Err(Error::invalid_config(format!(
                "auxiliary process {} has no program",
                aux.name
            )));
        }
        Ok(())
    }
}

/// Prints the effective configuration and its sources.
pub fn show_config(config: &Config, path: Option<&Path>) {
    let config_path = path.map_or_else(Config::config_path, Path::to_path_buf);

    println!("Vassago Configuration");
    println!("=====================\n");

    println!("Config file: {}", config_path.display());
    if config_path.exists() {
        println!("Status: Found\n");
    } else {
        println!("Status: Not found (using defaults)\n");
    }

    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => println!("(could not render configuration: {e})"),
    }

    if let Err(e) = config.validate() {
        println!("\x1b[33mWarning:\x1b[0m {e}");
    }

    println!("\nEnvironment variables use the VASSAGO_ prefix; nested keys are");
    println!("separated by a double underscore, e.g. VASSAGO_SERVER__PORT=8081.");
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port_range().unwrap().low(), 9000);
        assert_eq!(config.listen_addr().port(), 8080);
    }

    #[test]
    fn test_file_layers_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
mode = "dedicated"
port_range = "20000-20009"
default_model_name = "half_plus_three"

[server]
port = 9090

[backend]
program = "/usr/bin/tensorflow_model_server"
invoke_timeout_ms = 1500

[backend.batching]
enabled = true
max_batch_size = 8
batch_timeout_micros = 1000
max_enqueued_batches = 4

[hooks.handler]
program = "/opt/hooks/handler"

[[auxiliary]]
name = "nginx"
program = "nginx"
args = ["-g", "daemon off;"]
"#,
        );

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.mode, ServingMode::Dedicated);
        assert_eq!(config.port_range().unwrap().capacity(), 4);
        assert_eq!(config.default_model_name.as_deref(), Some("half_plus_three"));
        assert_eq!(config.server.port, 9090);
        assert!(config.server.cors);
        assert_eq!(config.backend.invoke_timeout(), Duration::from_millis(1500));
        assert_eq!(config.backend.reload_timeout(), Duration::from_secs(5));
        assert_eq!(config.backend.settle_delay(), Duration::from_secs(1));
        assert!(config.backend.batching.enabled);
        assert_eq!(config.auxiliary[0].args.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_invalid_settings_fail_validation() {
        let mut config = Config {
            port_range: "9000".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));

        config.port_range = "9000-9003".to_string();
        assert!(config.validate().is_ok());

        config.backend.batching.enabled = true;
        assert!(config.validate().is_err());
        config.backend.batching.enabled = false;

        config.hooks.output = Some(vassago_server::HookCommand::new("cat", Vec::new()));
        assert!(config.validate().is_err());
    }
}
