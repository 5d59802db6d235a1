//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sidebar_core::EngineConfig;

pub const CONFIG_FILE: &str = "config.json";

/// Daemon configuration, read from `<config-dir>/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root sessions per directory page (clamped to 10..=200 by the engine)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pending directory reloads kept before the oldest is evicted
    #[serde(default = "default_refresh_queue_max_items")]
    pub refresh_queue_max_items: usize,

    /// Delay between the last preference edit and the write
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Concurrent directory reloads
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,

    /// Idle runtime entries older than this are pruned (0 keeps them)
    #[serde(default = "default_idle_runtime_max_age_ms")]
    pub idle_runtime_max_age_ms: i64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Patch stream reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per failed attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_factor.max(1.0).powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }
}

fn default_page_size() -> usize {
    10
}

fn default_refresh_queue_max_items() -> usize {
    sidebar_core::refresh_queue::DEFAULT_MAX_ITEMS
}

fn default_persist_debounce_ms() -> u64 {
    sidebar_core::persist::DEFAULT_PERSIST_DEBOUNCE_MS
}

fn default_refresh_concurrency() -> usize {
    sidebar_core::worker::DEFAULT_REFRESH_CONCURRENCY
}

fn default_idle_runtime_max_age_ms() -> i64 {
    30 * 60 * 1000 // 30 minutes
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            refresh_queue_max_items: default_refresh_queue_max_items(),
            persist_debounce_ms: default_persist_debounce_ms(),
            refresh_concurrency: default_refresh_concurrency(),
            idle_runtime_max_age_ms: default_idle_runtime_max_age_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory, writing the defaults
    /// there on first start.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            return Ok(config);
        }

        tracing::info!("No config file found at {:?}, using defaults", config_file);
        let config = Config::default();

        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        let content = serde_json::to_string_pretty(&config)?;
        std::fs::write(&config_file, content)
            .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
        tracing::info!("Created default config at {:?}", config_file);

        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.page_size,
            refresh_queue_max_items: self.refresh_queue_max_items,
            persist_debounce_ms: self.persist_debounce_ms,
        }
    }
}
