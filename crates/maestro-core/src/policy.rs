//! Policy objects passed into the bus, scheduler and coordinator
//! constructors.
//!
//! Every field carries a serde default so partial JSON documents (settings
//! files, workflow declarations) deserialize into complete policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::ids::AgentId;
use crate::resources::ResourceRequirements;

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff between stage attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter, 0.0–1.0.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before the retry following `retry` failed attempts (zero-based).
    ///
    /// `min(max_delay, base_delay * 2^retry) * (1 ± jitter)`, where `random`
    /// in `[0.0, 1.0)` picks the point inside the jitter band.
    #[allow(clippy::cast_sign_loss)]
    pub fn delay_for(&self, retry: u32, random: f64) -> Duration {
        let exponential = self.base_delay_ms.saturating_mul(1u64 << retry.min(31));
        let capped = exponential.min(self.max_delay_ms);

        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor.clamp(0.0, 1.0);
        let with_jitter = (capped as f64) * jitter;

        Duration::from_millis(with_jitter.round().max(0.0) as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Circuit breaker
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HANDLER_FAILURE_RATIO: f64 = 0.5;
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Consecutive failed publishes that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the breaker stays open before a probe is let through.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// A publish fails when the share of failing handlers exceeds this.
    #[serde(default = "default_handler_failure_ratio")]
    pub handler_failure_ratio: f64,
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_recovery_timeout_ms() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT_MS
}
fn default_handler_failure_ratio() -> f64 {
    DEFAULT_HANDLER_FAILURE_RATIO
}
fn default_handler_timeout_ms() -> u64 {
    DEFAULT_HANDLER_TIMEOUT_MS
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_ms: DEFAULT_RECOVERY_TIMEOUT_MS,
            handler_failure_ratio: DEFAULT_HANDLER_FAILURE_RATIO,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
        }
    }
}

impl BreakerPolicy {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.failure_threshold == 0 {
            return Err(EngineError::validation("failure_threshold must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.handler_failure_ratio) {
            return Err(EngineError::validation(
                "handler_failure_ratio must be within 0.0..=1.0",
            ));
        }
        if self.handler_timeout_ms == 0 {
            return Err(EngineError::validation("handler_timeout_ms must be positive"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_RESETS: u32 = 1;

/// What `handle_stage_failure` does with a failed stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Resets allowed per stage before failures cascade to dependents.
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,
    /// Agent that takes over a reset stage, if any.
    #[serde(default)]
    pub fallback_agent: Option<AgentId>,
}

fn default_max_resets() -> u32 {
    DEFAULT_MAX_RESETS
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_resets: DEFAULT_MAX_RESETS,
            fallback_agent: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.2;
pub const DEFAULT_BUDGET: ResourceRequirements = ResourceRequirements::new(4096, 4000);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Executions per stage including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// The workflow fails once failed/total stages is strictly above this.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "default_budget")]
    pub max_resource_budget: ResourceRequirements,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    /// Also reject workflows whose topological layers overrun the budget.
    #[serde(default)]
    pub strict_frontier_budget: bool,
}

fn default_stage_timeout_ms() -> u64 {
    DEFAULT_STAGE_TIMEOUT_MS
}
fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}
fn default_error_threshold() -> f64 {
    DEFAULT_ERROR_THRESHOLD
}
fn default_budget() -> ResourceRequirements {
    DEFAULT_BUDGET
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            max_resource_budget: DEFAULT_BUDGET,
            backoff: BackoffPolicy::default(),
            recovery: RecoveryPolicy::default(),
            strict_frontier_budget: false,
        }
    }
}

impl WorkflowConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Attempt budget, never below one.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stage_timeout_ms == 0 {
            return Err(EngineError::validation("stage_timeout_ms must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(EngineError::validation("retry_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.error_threshold) {
            return Err(EngineError::validation("error_threshold must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
            return Err(EngineError::validation("jitter_factor must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_RECOVERY_ROUNDS: u32 = 3;
pub const DEFAULT_VIOLATION_WINDOW_SECS: u64 = 300;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorPolicy {
    /// Apply `handle_stage_failure` automatically while a workflow recovers.
    #[serde(default = "default_true")]
    pub auto_recover: bool,
    #[serde(default = "default_max_recovery_rounds")]
    pub max_recovery_rounds: u32,
    /// Rolling window for the security-violation counter.
    #[serde(default = "default_violation_window_secs")]
    pub violation_window_secs: u64,
    /// Reject workflows whose stages target unregistered agents.
    #[serde(default = "default_true")]
    pub require_registered_agents: bool,
}

fn default_true() -> bool {
    true
}
fn default_max_recovery_rounds() -> u32 {
    DEFAULT_MAX_RECOVERY_ROUNDS
}
fn default_violation_window_secs() -> u64 {
    DEFAULT_VIOLATION_WINDOW_SECS
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self {
            auto_recover: true,
            max_recovery_rounds: DEFAULT_MAX_RECOVERY_ROUNDS,
            violation_window_secs: DEFAULT_VIOLATION_WINDOW_SECS,
            require_registered_agents: true,
        }
    }
}

impl CoordinatorPolicy {
    pub fn violation_window(&self) -> Duration {
        Duration::from_secs(self.violation_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn backoff_doubles_until_cap() {
        let p = BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        };
        assert_eq!(p.delay_for(0, 0.5), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, 0.5), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, 0.5), Duration::from_millis(800));
        assert_eq!(p.delay_for(4, 0.5), Duration::from_millis(1000));
        assert_eq!(p.delay_for(40, 0.5), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_jitter_is_symmetric() {
        let p = BackoffPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
        };
        assert_eq!(p.delay_for(0, 0.0), Duration::from_millis(800));
        assert_eq!(p.delay_for(0, 0.5), Duration::from_millis(1000));
        assert!(p.delay_for(0, 0.999) <= Duration::from_millis(1200));
    }

    #[test]
    fn immediate_backoff_is_zero() {
        assert_eq!(BackoffPolicy::immediate().delay_for(5, 0.7), Duration::ZERO);
    }

    #[test]
    fn workflow_config_defaults_from_empty_json() {
        let cfg: WorkflowConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, WorkflowConfig::default());
        assert_eq!(cfg.retry_attempts, 3);
        assert!((cfg.error_threshold - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn workflow_config_partial_override() {
        let cfg: WorkflowConfig = serde_json::from_str(
            r#"{"retry_attempts": 5, "backoff": {"base_delay_ms": 10}, "recovery": {"fallback_agent": "agent_b"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.retry_attempts, 5);
        assert_eq!(cfg.backoff.base_delay_ms, 10);
        assert_eq!(cfg.backoff.max_delay_ms, DEFAULT_MAX_DELAY_MS);
        assert_eq!(cfg.recovery.fallback_agent, Some(AgentId::from_raw("agent_b")));
    }

    #[test]
    fn workflow_config_validation() {
        let bad = WorkflowConfig {
            error_threshold: 1.5,
            ..WorkflowConfig::default()
        };
        assert_matches!(bad.validate(), Err(EngineError::Validation(_)));

        let bad = WorkflowConfig {
            retry_attempts: 0,
            ..WorkflowConfig::default()
        };
        assert_matches!(bad.validate(), Err(EngineError::Validation(_)));
        assert_eq!(bad.max_attempts(), 1);

        assert!(WorkflowConfig::default().validate().is_ok());
    }

    #[test]
    fn breaker_policy_validation() {
        assert!(BreakerPolicy::default().validate().is_ok());
        let bad = BreakerPolicy {
            failure_threshold: 0,
            ..BreakerPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delay_never_exceeds_jittered_cap(
                retry in 0u32..64,
                base in 0u64..5_000,
                cap in 0u64..120_000,
                jitter in 0.0f64..1.0,
                random in 0.0f64..1.0,
            ) {
                let p = BackoffPolicy { base_delay_ms: base, max_delay_ms: cap, jitter_factor: jitter };
                let ms = p.delay_for(retry, random).as_millis() as f64;
                prop_assert!(ms <= (cap as f64) * (1.0 + jitter) + 1.0);
            }
        }
    }
}
