use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `sawmill.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// One ClickHouse-backed log source.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    /// Comma-separated ClickHouse HTTP endpoints, e.g.
    /// `http://clickhouse-0:8123,http://clickhouse-1:8123`.
    pub address: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime_secs: u64,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: usize,
    /// Extra physical columns beyond the default fields. Field names listed
    /// here are addressed directly instead of through the map columns.
    #[serde(default)]
    pub materialized_columns: Vec<String>,
}

fn default_database() -> String {
    "logs".to_string()
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_conn_max_lifetime() -> u64 {
    3600
}

fn default_max_idle_conns() -> usize {
    5
}

fn default_max_open_conns() -> usize {
    10
}

impl Config {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
