use std::{env, net::SocketAddr, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use processor::{
    dispatcher::DispatcherConfig,
    engine::EngineConfig,
    logs::LogsConfig,
    reconciler::ReconcilerConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    // Export traces over OTLP.
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    // OTLP collector endpoint, defaults to the exporter's own default.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: 10,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub state_store_path: String,
    pub listen_addr: String,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
    pub engine: EngineConfig,
    pub logs: LogsConfig,
    pub dispatcher: DispatcherConfig,
    pub reconciler: ReconcilerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_store_path = env::current_dir()
            .unwrap_or_default()
            .join("sparkpilot_storage/state");
        ServerConfig {
            state_store_path: state_store_path.to_string_lossy().to_string(),
            listen_addr: "0.0.0.0:8900".to_string(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
            engine: EngineConfig::default(),
            logs: LogsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a YAML file over the defaults. `SPARKPILOT_` environment
    /// variables override both, with `__` separating nested keys.
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed("SPARKPILOT_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.state_store_path.is_empty() {
            return Err(anyhow::anyhow!("state_store_path must not be empty"));
        }
        if self.telemetry.enable_metrics && self.telemetry.metrics_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "telemetry.metrics_interval_secs must be positive"
            ));
        }
        self.engine.validate()?;
        self.logs.validate()?;
        self.dispatcher.validate()?;
        self.reconciler.validate()?;
        Ok(())
    }
}
