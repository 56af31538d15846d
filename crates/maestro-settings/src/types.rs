use maestro_core::{BreakerPolicy, CoordinatorPolicy, WorkflowConfig};
use maestro_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document (`~/.maestro/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaestroSettings {
    #[serde(default)]
    pub logging: TelemetryConfig,
    /// Event channel circuit breaker.
    #[serde(default)]
    pub bus: BreakerPolicy,
    /// Defaults applied to workflows that do not carry their own config.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub coordinator: CoordinatorPolicy,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsBackend {
    /// Keep metrics in process, queryable through the recorder.
    #[default]
    Memory,
    /// Forward to the `metrics` facade.
    Facade,
    Disabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub backend: MetricsBackend,
}

impl MaestroSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.bus
            .validate()
            .map_err(|e| SettingsError::InvalidValue(format!("bus: {e}")))?;
        self.workflow
            .validate()
            .map_err(|e| SettingsError::InvalidValue(format!("workflow: {e}")))?;
        if self.coordinator.violation_window_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "coordinator: violation_window_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
