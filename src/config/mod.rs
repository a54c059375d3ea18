use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::services::dispatcher::DispatchSettings;

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Health/metrics listener address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Identity stamped into `jobs.locked_by`. Defaults to the host name.
    #[serde(default = "default_worker_id")]
    #[garde(length(min = 1, max = 255))]
    pub worker_id: String,

    /// Seconds to sleep between claim attempts
    #[serde(default = "default_poll_interval_sec")]
    #[garde(range(min = 1, max = 3600))]
    pub poll_interval_sec: u64,

    /// Seconds after which another worker may reclaim a leased job
    #[serde(default = "default_lock_timeout_sec")]
    #[garde(range(min = 1))]
    pub lock_timeout_sec: u64,

    /// Jobs claimed per poll
    #[serde(default = "default_batch_size")]
    #[garde(range(min = 1, max = 100))]
    pub batch_size: i64,

    /// Claims before a failing job is moved to FAILED. 0 means unlimited.
    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 0))]
    pub max_attempts: i32,

    /// Image generation provider endpoint
    #[garde(length(min = 1))]
    pub generation_api_url: String,

    /// Bearer token for the provider, if it requires one
    #[serde(default)]
    #[garde(skip)]
    pub generation_api_key: Option<String>,

    /// Per-request timeout for the provider call
    #[serde(default = "default_generation_timeout_sec")]
    #[garde(range(min = 1))]
    pub generation_timeout_sec: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_worker_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
}

fn default_poll_interval_sec() -> u64 {
    10
}

fn default_lock_timeout_sec() -> u64 {
    300
}

fn default_batch_size() -> i64 {
    5
}

fn default_max_attempts() -> i32 {
    3
}

fn default_generation_timeout_sec() -> u64 {
    120
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_sec)
    }

    /// Loop parameters handed to the dispatcher.
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            worker_id: self.worker_id.clone(),
            batch_size: self.batch_size,
            lease_timeout: Duration::from_secs(self.lock_timeout_sec),
            poll_interval: Duration::from_secs(self.poll_interval_sec),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
