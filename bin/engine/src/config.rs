//! Centralized engine configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested keys (`NATS__URL`, `SWEEP__INTERVAL_SECONDS`).

use flowgate_workflow::NatsConfig;
use serde::Deserialize;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// PostgreSQL URL for the workflow definition table.
    pub database_url: String,

    /// NATS settings for the execution store.
    pub nats: NatsSettings,

    /// HTTP listener settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Approval expiry sweep settings.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// NATS connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    /// NATS server URL.
    pub url: String,

    /// KV bucket holding execution instances.
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Address to bind.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Approval expiry sweep settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_bucket() -> String {
    "workflow-executions".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_sweep_interval_seconds() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl SweepConfig {
    /// Returns the sweep interval, never shorter than one second.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl NatsSettings {
    /// Returns the execution store configuration.
    #[must_use]
    pub fn store_config(&self) -> NatsConfig {
        NatsConfig::new(&self.url).with_bucket(&self.bucket)
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
