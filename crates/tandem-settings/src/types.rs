//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each section implements
//! [`Default`] with production values, and `#[serde(default)]` lets a settings
//! file name only the keys it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "engine": { "maxRoundTrips": 20 },
///   "context": { "highWaterTokens": 90000, "keepRecent": 4 },
///   "logging": { "format": "json", "modules": { "tandem_engine": "debug" } }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TandemSettings {
    pub engine: EngineSettings,
    pub context: ContextSettings,
    pub retry: RetrySettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl TandemSettings {
    /// Clamp correctable values and reject the ones that cannot be fixed.
    pub fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            let clamped = self.retry.jitter_factor.clamp(0.0, 1.0);
            tracing::warn!(
                value = self.retry.jitter_factor,
                clamped,
                "jitterFactor out of range, clamped"
            );
            self.retry.jitter_factor = clamped;
        }
        if self.engine.max_round_trips == 0 {
            return Err(SettingsError::Invalid {
                key: "engine.maxRoundTrips",
                reason: "must be at least 1".into(),
            });
        }
        if self.context.high_water_tokens == 0 {
            return Err(SettingsError::Invalid {
                key: "context.highWaterTokens",
                reason: "must be at least 1".into(),
            });
        }
        if self.engine.event_buffer == 0 {
            return Err(SettingsError::Invalid {
                key: "engine.eventBuffer",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Turn engine and tool executor limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Request/tool round-trips allowed per turn.
    pub max_round_trips: u32,
    pub tool_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// How long a background job's early output is collected before replying.
    pub background_grace_ms: u64,
    /// Capacity of the session event broadcast channel.
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_round_trips: 50,
            tool_timeout_ms: 120_000,
            request_timeout_ms: 300_000,
            background_grace_ms: 1_000,
            event_buffer: 1024,
        }
    }
}

impl EngineSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }
}

/// Context window compaction thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    pub high_water_tokens: usize,
    /// Most recent messages never folded into a summary.
    pub keep_recent: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            high_water_tokens: 150_000,
            keep_recent: 6,
        }
    }
}

/// Provider retry and circuit breaker settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_ms: 60_000,
        }
    }
}

/// Session persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite file holding sessions. A leading `~/` expands to `$HOME`.
    pub database_path: String,
    /// Keep sessions in memory only.
    pub in_memory: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "~/.tandem/sessions.db".to_string(),
            in_memory: false,
        }
    }
}

impl StorageSettings {
    pub fn resolved_database_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
    /// Per-module level overrides, e.g. `{"tandem_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            modules: BTreeMap::new(),
        }
    }
}

pub(crate) fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(raw),
    }
}
