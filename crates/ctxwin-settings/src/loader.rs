//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `~/.ctxwin/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CTXWIN_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{ctxwin_dir, ProviderKind, Settings};

/// Resolve the path to the settings file (`~/.ctxwin/settings.json`).
pub fn settings_path() -> PathBuf {
    ctxwin_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
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

/// Apply `CTXWIN_*` environment variable overrides. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("CTXWIN_DB") {
        settings.database.path = PathBuf::from(v);
    }
    if let Some(v) = read("CTXWIN_CONTEXT") {
        settings.session.default_context = v;
    }
    if let Some(v) = read("CTXWIN_THREADING") {
        match parse_bool(&v) {
            Some(b) => settings.session.server_side_threading = Some(b),
            None => warn!(key = "CTXWIN_THREADING", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("CTXWIN_MAX_TOKENS") {
        match parse_u64_range(&v, 1, 10_000_000) {
            Some(n) => settings.session.max_tokens = n,
            None => warn!(key = "CTXWIN_MAX_TOKENS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("CTXWIN_MAX_TOOL_ITERATIONS") {
        match parse_u64_range(&v, 0, 10_000) {
            Some(n) => settings.session.max_tool_iterations = n as u32,
            None => warn!(
                key = "CTXWIN_MAX_TOOL_ITERATIONS",
                value = %v,
                "invalid u64 env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("CTXWIN_PROVIDER") {
        match v.parse::<ProviderKind>() {
            Ok(kind) => settings.provider.kind = kind,
            Err(e) => warn!(key = "CTXWIN_PROVIDER", error = %e, "invalid provider env var, ignoring"),
        }
    }
    if let Some(v) = read("CTXWIN_MODEL") {
        settings.provider.model = v;
    }
    if let Some(v) = read("CTXWIN_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

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
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
