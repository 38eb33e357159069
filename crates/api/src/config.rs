//! Service configuration
//!
//! Layered: serde defaults, then an optional `cronwatch.toml`, then
//! `CRONWATCH_*` environment variables (double underscore separates
//! nesting, e.g. `CRONWATCH_SERVER__PORT=9090`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub scanner: ScannerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Ping rate limit per token, requests per minute
    pub ping_rate_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded work-queue depth; sends past this apply back-pressure
    pub queue_depth: usize,
    /// Number of concurrent pipeline workers
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Seconds between missed-run sweeps
    pub sweep_interval_sec: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            scanner: ScannerSettings::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ping_rate_per_minute: 60,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            workers: 4,
        }
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_sec: 60,
        }
    }
}

impl AppConfig {
    /// Load from `cronwatch.toml` (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("cronwatch").required(false))
            .add_source(
                config::Environment::with_prefix("CRONWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        // Missing keys fall back to the serde defaults.
        Ok(settings.try_deserialize()?)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
