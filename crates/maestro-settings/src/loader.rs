//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MaestroSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `MAESTRO_*` environment overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{MaestroSettings, MetricsBackend};

/// `$MAESTRO_SETTINGS`, or `~/.maestro/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os("MAESTRO_SETTINGS").filter(|v| !v.is_empty()) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".maestro").join("settings.json")
}

pub fn load_settings() -> Result<MaestroSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or invalid values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<MaestroSettings> {
    let defaults = serde_json::to_value(MaestroSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MaestroSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
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
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut MaestroSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are logged and
/// ignored.
pub fn apply_overrides_from(settings: &mut MaestroSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("MAESTRO_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("MAESTRO_LOG_FORMAT") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(format) => settings.logging.format = format,
            Err(_) => warn!(key = "MAESTRO_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }

    // ── Event bus ───────────────────────────────────────────────────
    if let Some(v) = env.u32("MAESTRO_BUS_FAILURE_THRESHOLD", 1, 10_000) {
        settings.bus.failure_threshold = v;
    }
    if let Some(v) = env.u64("MAESTRO_BUS_RECOVERY_TIMEOUT_MS", 1, 3_600_000) {
        settings.bus.recovery_timeout_ms = v;
    }
    if let Some(v) = env.ratio("MAESTRO_BUS_HANDLER_FAILURE_RATIO") {
        settings.bus.handler_failure_ratio = v;
    }
    if let Some(v) = env.u64("MAESTRO_BUS_HANDLER_TIMEOUT_MS", 1, 600_000) {
        settings.bus.handler_timeout_ms = v;
    }

    // ── Workflow defaults ───────────────────────────────────────────
    if let Some(v) = env.u64("MAESTRO_STAGE_TIMEOUT_MS", 1, 86_400_000) {
        settings.workflow.stage_timeout_ms = v;
    }
    if let Some(v) = env.u32("MAESTRO_RETRY_ATTEMPTS", 1, 100) {
        settings.workflow.retry_attempts = v;
    }
    if let Some(v) = env.ratio("MAESTRO_ERROR_THRESHOLD") {
        settings.workflow.error_threshold = v;
    }
    if let Some(v) = env.u64("MAESTRO_BUDGET_MEMORY_MB", 0, u64::MAX) {
        settings.workflow.max_resource_budget.memory_mb = v;
    }
    if let Some(v) = env.u64("MAESTRO_BUDGET_CPU_MILLIS", 0, u64::MAX) {
        settings.workflow.max_resource_budget.cpu_millis = v;
    }
    if let Some(v) = env.u64("MAESTRO_BACKOFF_BASE_MS", 0, 600_000) {
        settings.workflow.backoff.base_delay_ms = v;
    }

    // ── Coordinator ─────────────────────────────────────────────────
    if let Some(v) = env.bool("MAESTRO_AUTO_RECOVER") {
        settings.coordinator.auto_recover = v;
    }
    if let Some(v) = env.u64("MAESTRO_VIOLATION_WINDOW_SECS", 1, 604_800) {
        settings.coordinator.violation_window_secs = v;
    }

    // ── Metrics ─────────────────────────────────────────────────────
    if let Some(v) = env.string("MAESTRO_METRICS_BACKEND") {
        match serde_json::from_value::<MetricsBackend>(Value::String(v.clone())) {
            Ok(backend) => settings.metrics.backend = backend,
            Err(_) => warn!(key = "MAESTRO_METRICS_BACKEND", value = %v, "invalid metrics backend, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// A finite float in `0.0..=1.0`.
pub fn parse_ratio(val: &str) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && (0.0..=1.0).contains(&n)).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name)
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.raw(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn ratio(&self, name: &str) -> Option<f64> {
        self.parsed(name, "ratio", parse_ratio)
    }
}
