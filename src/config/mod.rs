//! Server configuration.
//!
//! All tunables live in an explicit [`ServerConfig`] value passed at
//! construction. Defaults are applied per-field via serde, so a partial TOML
//! file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address used by `listen_and_serve` (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Hard cap on concurrent connections. Fixed for the server's lifetime;
    /// the live ceiling can be adjusted anywhere in `0..=throttle_max`.
    pub throttle_max: usize,

    /// Initial ceiling. Values above `throttle_max` are clamped down.
    /// `None` means "start at `throttle_max`".
    pub initial_ceiling: Option<usize>,

    /// Accept-error backoff tuning.
    pub accept_backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            throttle_max: 1024,
            initial_ceiling: None,
            accept_backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// The ceiling the server starts with, clamped into `0..=throttle_max`.
    pub fn effective_initial_ceiling(&self) -> usize {
        self.initial_ceiling.unwrap_or(self.throttle_max).min(self.throttle_max)
    }
}

/// Backoff applied when `accept` fails with a transient error.
///
/// The delay starts at `initial_ms` and doubles on every consecutive failure,
/// capped at `max_ms`. A successful accept resets it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay, in milliseconds.
    pub initial_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_ms: 5, max_ms: 1_000 }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Next delay after `current`, or the initial delay when starting over.
    pub fn next(&self, current: Option<Duration>) -> Duration {
        match current {
            None => self.initial(),
            Some(d) => (d * 2).min(self.max()),
        }
    }
}
