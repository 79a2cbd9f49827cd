//! Aggregate configuration: one JSON document for every component.
//!
//! ```json
//! {
//!   "connection": { "base_url": "https://relay.example.org", "session_path": "/ws/thread-9" },
//!   "fusion": { "replay": { "mode": "bypass" } },
//!   "replay": { "speed": 2.0 }
//! }
//! ```
//!
//! Every field is optional and falls back to its component default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{socket_endpoint, ConnectionConfig, ConnectionError};
use crate::fusion::FusionConfig;
use crate::replay::ReplayConfig;

pub const ENV_BASE_URL: &str = "LIFELINE_BASE_URL";
pub const ENV_THREAD_PATH: &str = "LIFELINE_THREAD_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Endpoint(#[from] ConnectionError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifelineConfig {
    pub connection: ConnectionConfig,
    pub fusion: FusionConfig,
    pub replay: ReplayConfig,
}

impl LifelineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Applies `LIFELINE_BASE_URL` / `LIFELINE_THREAD_PATH` from the
    /// process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.connection.base_url = Some(base_url);
        }
        if let Some(path) = lookup(ENV_THREAD_PATH) {
            self.connection.session_path = path;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        socket_endpoint(c.base_url.as_deref(), &c.page_origin, &c.session_path)?;
        Ok(())
    }
}
