//! Configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{builtin_decoders, ConfigError, DecoderConfig};
use crate::bus::DEFAULT_EVENT_CAPACITY;
use crate::dashboard::DashboardConfig;
use crate::supervisor::{SessionSettings, DEFAULT_GRACE_PERIOD, DEFAULT_REAP_TIMEOUT};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub dashboard: DashboardConfig,
    pub publish: PublishConfig,
    /// User-defined decoders. Entries override built-ins of the same name.
    pub decoders: BTreeMap<String, DecoderConfig>,
}

impl Config {
    /// Built-in decoders overlaid with the configured ones.
    #[must_use]
    pub fn catalog(&self) -> BTreeMap<String, DecoderConfig> {
        let mut catalog = builtin_decoders();
        catalog.extend(
            self.decoders
                .iter()
                .map(|(name, decoder)| (name.clone(), decoder.clone())),
        );
        catalog
    }

    /// Look up a decoder by name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownDecoder` if neither the file nor the
    /// built-in catalog defines `name`.
    pub fn decoder(&self, name: &str) -> Result<DecoderConfig, ConfigError> {
        self.decoders
            .get(name)
            .cloned()
            .or_else(|| builtin_decoders().remove(name))
            .ok_or_else(|| ConfigError::UnknownDecoder {
                name: name.to_string(),
            })
    }
}

/// Process supervision timing and bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Time a stage gets to exit after SIGTERM.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Ceiling for any single wait after SIGKILL.
    #[serde(default = "default_reap_timeout_ms")]
    pub reap_timeout_ms: u64,
    /// Messages buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[allow(clippy::cast_possible_truncation)]
fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn default_reap_timeout_ms() -> u64 {
    DEFAULT_REAP_TIMEOUT.as_millis() as u64
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl SupervisorConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            grace_period: self.grace_period(),
            reap_timeout: Duration::from_millis(self.reap_timeout_ms),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            reap_timeout_ms: default_reap_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Output format for published events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFormat {
    /// One tracing event per message.
    #[default]
    Log,
    /// One JSON object per line.
    JsonLines,
}

/// Where decoded events are forwarded besides bus subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub format: PublishFormat,
    /// JSON lines destination; stdout when unset.
    pub path: Option<PathBuf>,
}
