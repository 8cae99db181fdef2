//! Logging setup
//!
//! Components log through the `tracing` facade. Applications that do not
//! install their own subscriber can call [`init_tracing`] once at startup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line human-readable output
    #[default]
    Pretty,
    /// Single-line human-readable output
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl LogFormat {
    /// Parse a format name
    pub fn from_arg(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Output format
    pub format: LogFormat,
    /// Include the event target
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "provider_ensemble=info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Check that the configured filter directive parses
    pub fn validate(&self) -> Result<()> {
        EnvFilter::try_new(&self.filter)
            .map(|_| ())
            .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", self.filter, e)))
    }

    /// Build the filter, preferring `RUST_LOG` when set
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter)
                .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", self.filter, e))),
        }
    }
}

/// Install the global subscriber.
///
/// Fails if the filter is invalid or a global subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| Error::config(format!("Failed to install tracing subscriber: {}", e)))
}
