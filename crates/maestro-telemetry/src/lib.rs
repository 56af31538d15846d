mod recorder;
mod sinks;

pub use recorder::{HistogramSummary, MetricValue, MetricsRecorder, MetricsReport};
pub use sinks::{FacadeMetrics, MetricsSink, NoopMetrics};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Per-module level overrides (e.g. `maestro_scheduler` => `debug`).
    #[serde(default)]
    pub module_levels: Vec<(String, String)>,
}

fn default_level() -> String {
    "info".into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            module_levels: Vec::new(),
        }
    }
}

/// Parse a level name, accepting any case.
pub fn parse_level(value: &str) -> Option<Level> {
    value.trim().parse::<Level>().ok()
}

impl TelemetryConfig {
    /// `EnvFilter` directive string, e.g. `info,maestro_bus=debug`.
    pub fn filter_directives(&self) -> String {
        let base = parse_level(&self.level).unwrap_or(Level::INFO);
        let mut directives = base.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            if let Some(level) = parse_level(level) {
                directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
            }
        }
        directives
    }
}

/// Install the global tracing subscriber. Returns `false` if one was
/// already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            level: "WARN".into(),
            format: LogFormat::Json,
            module_levels: vec![
                ("maestro_bus".into(), "debug".into()),
                ("noisy".into(), "not-a-level".into()),
            ],
        };
        assert_eq!(config.filter_directives(), "warn,maestro_bus=debug");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let config = TelemetryConfig {
            level: "loud".into(),
            ..TelemetryConfig::default()
        };
        assert_eq!(config.filter_directives(), "info");
    }

    #[test]
    fn config_deserializes_from_partial_json() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"format": "json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(!init_telemetry(&config));
    }
}
