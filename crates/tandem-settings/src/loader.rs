//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TandemSettings::default()`]
//! 2. If `~/.tandem/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TANDEM_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TandemSettings;

/// Resolve the path to the settings file (`~/.tandem/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tandem").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TandemSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TandemSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<TandemSettings> {
    let defaults = serde_json::to_value(TandemSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value =
            serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_owned(),
                source,
            })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TANDEM_*` environment variable overrides to loaded settings.
///
/// Invalid or out-of-range values are logged at warn and ignored.
pub fn apply_env_overrides(settings: &mut TandemSettings) {
    // ── Engine ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TANDEM_MAX_ROUND_TRIPS", 1, 10_000) {
        settings.engine.max_round_trips = v as u32;
    }
    if let Some(v) = read_env_u64("TANDEM_TOOL_TIMEOUT_MS", 100, 86_400_000) {
        settings.engine.tool_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TANDEM_REQUEST_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.engine.request_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TANDEM_BACKGROUND_GRACE_MS", 0, 60_000) {
        settings.engine.background_grace_ms = v;
    }

    // ── Context ─────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("TANDEM_HIGH_WATER_TOKENS", 1, 10_000_000) {
        settings.context.high_water_tokens = v;
    }
    if let Some(v) = read_env_usize("TANDEM_KEEP_RECENT", 0, 10_000) {
        settings.context.keep_recent = v;
    }

    // ── Retry ───────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TANDEM_MAX_RETRIES", 0, 100) {
        settings.retry.max_retries = v as u32;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TANDEM_DB_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = read_env_bool("TANDEM_IN_MEMORY") {
        settings.storage.in_memory = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TANDEM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("TANDEM_LOG_FORMAT") {
        if parse_log_format(&v).is_some() {
            settings.logging.format = v.to_lowercase();
        } else {
            tracing::warn!(key = "TANDEM_LOG_FORMAT", value = %v, "invalid log format env var, ignoring");
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// `pretty` or `json`, case-insensitive.
pub fn parse_log_format(val: &str) -> Option<&'static str> {
    match val.to_lowercase().as_str() {
        "pretty" => Some("pretty"),
        "json" => Some("json"),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, min, max, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"engine": {"maxRoundTrips": 50, "toolTimeoutMs": 1}});
        let source = serde_json::json!({"engine": {"maxRoundTrips": 5}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["engine"]["maxRoundTrips"], 5);
        assert_eq!(merged["engine"]["toolTimeoutMs"], 1);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let target = serde_json::json!({"a": [1, 2, 3]});
        let source = serde_json::json!({"a": [9]});
        assert_eq!(deep_merge(target, source)["a"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = read_settings_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, TandemSettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"context": {"keepRecent": 3}, "logging": {"modules": {"tandem_engine": "debug"}}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.context.keep_recent, 3);
        assert_eq!(settings.context.high_water_tokens, 150_000);
        assert_eq!(
            settings.logging.modules.get("tandem_engine").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            read_settings_file(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range(" 7 ", 0, 10), Some(7));
        assert_eq!(parse_usize_range("-1", 0, 10), None);
    }

    #[test]
    fn parse_log_formats() {
        assert_eq!(parse_log_format("JSON"), Some("json"));
        assert_eq!(parse_log_format("pretty"), Some("pretty"));
        assert_eq!(parse_log_format("xml"), None);
    }
}
