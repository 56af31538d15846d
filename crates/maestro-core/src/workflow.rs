//! Workflow and stage records.
//!
//! The scheduler owns the only mutable copy of each [`Workflow`]; callers
//! receive clones, so a snapshot never changes underneath them.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;
use crate::ids::{AgentId, StageId, WorkflowId};
use crate::policy::WorkflowConfig;
use crate::resources::ResourceRequirements;

// ─────────────────────────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Recovering,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed edges: `pending → running → {completed | failed}`,
    /// `running ⇄ recovering`, `recovering → {completed | failed}`, and
    /// `pending → failed` for workflows cancelled before they start.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Recovering | Self::Completed | Self::Failed)
                | (Self::Recovering, Self::Running | Self::Completed | Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    /// Dependencies satisfied, waiting for resource budget.
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Not yet handed to an executor.
    pub fn is_unstarted(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage ended up failed or skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetriesExhausted,
    Fatal,
    DependencyFailed,
    Cancelled,
    WorkflowAborted,
    Operator,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Fatal => "fatal",
            Self::DependencyFailed => "dependency_failed",
            Self::Cancelled => "cancelled",
            Self::WorkflowAborted => "workflow_aborted",
            Self::Operator => "operator",
        }
    }
}

/// Outcome of `handle_stage_failure`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    Reset,
    Reassign { agent_id: AgentId },
    Cascade { dependents: Vec<StageId> },
}

// ─────────────────────────────────────────────────────────────────────────────
// Stages
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-supplied stage declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub agent_id: AgentId,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<StageId>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl StageSpec {
    pub fn new(id: impl Into<StageId>, agent_id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            config: Value::Null,
            depends_on: Vec::new(),
            resources: ResourceRequirements::ZERO,
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StageId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageErrorContext {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub agent_id: AgentId,
    pub config: Value,
    pub depends_on: Vec<StageId>,
    pub resources: ResourceRequirements,
    pub state: StageState,
    /// Executions across every run of this stage, resets included.
    pub attempts: u32,
    pub resets: u32,
    pub error: Option<StageErrorContext>,
    /// Errors cleared by recovery resets, oldest first.
    pub error_history: Vec<StageErrorContext>,
    pub output: Option<Value>,
    pub latency_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn from_spec(spec: StageSpec) -> Self {
        Self {
            id: spec.id,
            agent_id: spec.agent_id,
            config: spec.config,
            depends_on: spec.depends_on,
            resources: spec.resources,
            state: StageState::Pending,
            attempts: 0,
            resets: 0,
            error: None,
            error_history: Vec::new(),
            output: None,
            latency_ms: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark the stage failed or skipped with a fresh error context.
    pub fn fail(&mut self, state: StageState, kind: FailureKind, message: impl Into<String>) {
        self.state = state;
        self.finished_at = Some(Utc::now());
        self.error = Some(StageErrorContext {
            kind,
            message: message.into(),
            attempts: self.attempts,
            occurred_at: Utc::now(),
        });
    }

    /// Back to `pending`, keeping the cleared error in the history.
    pub fn reset(&mut self) {
        if let Some(error) = self.error.take() {
            self.error_history.push(error);
        }
        self.state = StageState::Pending;
        self.resets += 1;
        self.output = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflows
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub stages_total: usize,
    pub stages_pending: usize,
    pub stages_running: usize,
    pub stages_completed: usize,
    pub stages_failed: usize,
    pub stages_skipped: usize,
    pub total_attempts: u64,
    pub total_retries: u64,
    pub cumulative_latency_ms: u64,
    pub failure_ratio: f64,
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub config: WorkflowConfig,
    pub state: WorkflowState,
    /// Stages in declaration order.
    pub stages: Vec<Stage>,
    /// Failed stages awaiting `handle_stage_failure`.
    pub unresolved_failures: BTreeSet<StageId>,
    pub cancelled: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(id: WorkflowId, config: WorkflowConfig, stages: Vec<StageSpec>) -> Self {
        Self {
            id,
            config,
            state: WorkflowState::Pending,
            stages: stages.into_iter().map(Stage::from_spec).collect(),
            unresolved_failures: BTreeSet::new(),
            cancelled: false,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.id == id)
    }

    pub fn stage_mut(&mut self, id: &StageId) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| &s.id == id)
    }

    pub fn count_in(&self, state: StageState) -> usize {
        self.stages.iter().filter(|s| s.state == state).count()
    }

    /// Failed stages over total stages. Skipped stages do not count.
    pub fn failure_ratio(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        self.count_in(StageState::Failed) as f64 / self.stages.len() as f64
    }

    pub fn exceeds_error_threshold(&self) -> bool {
        self.failure_ratio() > self.config.error_threshold
    }

    pub fn all_stages_terminal(&self) -> bool {
        self.stages.iter().all(|s| s.state.is_terminal())
    }

    pub fn metrics(&self) -> WorkflowMetrics {
        let total_attempts: u64 = self.stages.iter().map(|s| u64::from(s.attempts)).sum();
        let executed = self.stages.iter().filter(|s| s.attempts > 0).count() as u64;
        WorkflowMetrics {
            stages_total: self.stages.len(),
            stages_pending: self.count_in(StageState::Pending) + self.count_in(StageState::Ready),
            stages_running: self.count_in(StageState::Running),
            stages_completed: self.count_in(StageState::Completed),
            stages_failed: self.count_in(StageState::Failed),
            stages_skipped: self.count_in(StageState::Skipped),
            total_attempts,
            total_retries: total_attempts.saturating_sub(executed),
            cumulative_latency_ms: self.stages.iter().map(|s| s.latency_ms).sum(),
            failure_ratio: self.failure_ratio(),
            duration_ms: match (self.started_at, self.finished_at) {
                (Some(start), Some(end)) => u64::try_from((end - start).num_milliseconds()).ok(),
                _ => None,
            },
        }
    }

    /// Move to `next`, stamping start and finish times. Edges outside
    /// [`WorkflowState::can_transition_to`] are refused and leave the record
    /// untouched.
    pub fn transition_to(&mut self, next: WorkflowState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidState {
                workflow_id: self.id.clone(),
                state: self.state,
                operation: match next {
                    WorkflowState::Pending => "reset",
                    WorkflowState::Running => "run",
                    WorkflowState::Recovering => "recover",
                    WorkflowState::Completed => "complete",
                    WorkflowState::Failed => "fail",
                },
            });
        }
        let now = Utc::now();
        if next == WorkflowState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Output of a completed stage, or the error it failed or was skipped
    /// with.
    pub fn stage_result(&self, id: &StageId) -> Result<&Value, EngineError> {
        let stage = self.stage(id).ok_or_else(|| EngineError::StageNotFound {
            workflow_id: self.id.clone(),
            stage_id: id.clone(),
        })?;
        match (&stage.output, &stage.error) {
            (Some(output), _) if stage.state == StageState::Completed => Ok(output),
            (_, Some(error)) if matches!(stage.state, StageState::Failed | StageState::Skipped) => {
                Err(EngineError::StageExecution {
                    stage_id: id.clone(),
                    message: error.message.clone(),
                })
            }
            _ => Err(EngineError::InvalidStageState {
                stage_id: id.clone(),
                state: stage.state,
                operation: "read the result of",
            }),
        }
    }

    /// Turn a settled snapshot into a `Result`, failing for anything other
    /// than `completed`.
    pub fn ensure_completed(&self) -> Result<(), EngineError> {
        match self.state {
            WorkflowState::Completed => Ok(()),
            WorkflowState::Failed => Err(EngineError::WorkflowFailed {
                workflow_id: self.id.clone(),
                reason: self
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "workflow failed".into()),
            }),
            state => Err(EngineError::InvalidState {
                workflow_id: self.id.clone(),
                state,
                operation: "complete",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn five_stage_workflow(threshold: f64) -> Workflow {
        let config = WorkflowConfig {
            error_threshold: threshold,
            ..WorkflowConfig::default()
        };
        let stages = (0..5).map(|i| StageSpec::new(format!("s{i}").as_str(), "agent_a")).collect();
        Workflow::new(WorkflowId::from_raw("wf_t"), config, stages)
    }

    #[test]
    fn workflow_transitions() {
        use WorkflowState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Recovering));
        assert!(Recovering.can_transition_to(Running));
        assert!(Recovering.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Recovering));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Recovering.is_terminal());
    }

    #[test]
    fn transition_to_stamps_times_and_refuses_illegal_edges() {
        let mut wf = five_stage_workflow(0.2);
        assert_matches!(
            wf.transition_to(WorkflowState::Completed),
            Err(EngineError::InvalidState { state: WorkflowState::Pending, operation: "complete", .. })
        );
        assert_eq!(wf.state, WorkflowState::Pending);

        wf.transition_to(WorkflowState::Running).unwrap();
        let started = wf.started_at.unwrap();
        wf.transition_to(WorkflowState::Recovering).unwrap();
        wf.transition_to(WorkflowState::Running).unwrap();
        assert_eq!(wf.started_at, Some(started));
        assert!(wf.finished_at.is_none());

        wf.transition_to(WorkflowState::Failed).unwrap();
        assert!(wf.finished_at.is_some());
        assert_matches!(
            wf.transition_to(WorkflowState::Running),
            Err(EngineError::InvalidState { state: WorkflowState::Failed, .. })
        );
    }

    #[test]
    fn stage_result_distinguishes_output_and_failure() {
        let mut wf = five_stage_workflow(0.5);
        wf.stages[0].state = StageState::Completed;
        wf.stages[0].output = Some(serde_json::json!({ "rows": 3 }));
        wf.stages[1].fail(StageState::Failed, FailureKind::Fatal, "disk full");

        assert_eq!(wf.stage_result(&StageId::from("s0")).unwrap()["rows"], 3);
        let err = wf.stage_result(&StageId::from("s1")).unwrap_err();
        assert_matches!(&err, EngineError::StageExecution { message, .. } if message == "disk full");
        assert!(err.is_retryable());
        assert_eq!(err.error_kind(), "stage_execution");
        assert_matches!(
            wf.stage_result(&StageId::from("s2")),
            Err(EngineError::InvalidStageState { state: StageState::Pending, .. })
        );
        assert_matches!(
            wf.stage_result(&StageId::from("nope")),
            Err(EngineError::StageNotFound { .. })
        );
    }

    #[test]
    fn threshold_is_strict() {
        let mut wf = five_stage_workflow(0.2);
        wf.stages[0].fail(StageState::Failed, FailureKind::Fatal, "boom");
        assert!((wf.failure_ratio() - 0.2).abs() < f64::EPSILON);
        assert!(!wf.exceeds_error_threshold());

        wf.stages[1].fail(StageState::Failed, FailureKind::Fatal, "boom");
        assert!(wf.exceeds_error_threshold());
    }

    #[test]
    fn skipped_stages_do_not_count_as_failures() {
        let mut wf = five_stage_workflow(0.0);
        wf.stages[0].fail(StageState::Skipped, FailureKind::Cancelled, "cancelled");
        assert!(!wf.exceeds_error_threshold());
    }

    #[test]
    fn reset_moves_error_to_history() {
        let mut stage = Stage::from_spec(StageSpec::new("s", "a"));
        stage.attempts = 3;
        stage.fail(StageState::Failed, FailureKind::RetriesExhausted, "down");
        stage.reset();
        assert_eq!(stage.state, StageState::Pending);
        assert_eq!(stage.resets, 1);
        assert!(stage.error.is_none());
        assert_eq!(stage.error_history.len(), 1);
        assert_eq!(stage.error_history[0].attempts, 3);
    }

    #[test]
    fn metrics_count_retries() {
        let mut wf = five_stage_workflow(0.5);
        wf.stages[0].attempts = 3;
        wf.stages[0].state = StageState::Completed;
        wf.stages[1].attempts = 1;
        wf.stages[1].state = StageState::Completed;
        wf.stages[0].latency_ms = 40;
        wf.stages[1].latency_ms = 10;
        let m = wf.metrics();
        assert_eq!(m.total_attempts, 4);
        assert_eq!(m.total_retries, 2);
        assert_eq!(m.stages_completed, 2);
        assert_eq!(m.stages_pending, 3);
        assert_eq!(m.cumulative_latency_ms, 50);
    }

    #[test]
    fn ensure_completed_maps_states() {
        let mut wf = five_stage_workflow(0.2);
        assert_matches!(wf.ensure_completed(), Err(EngineError::InvalidState { .. }));
        wf.state = WorkflowState::Failed;
        wf.failure_reason = Some("too many failures".into());
        assert_matches!(
            wf.ensure_completed(),
            Err(EngineError::WorkflowFailed { reason, .. }) if reason == "too many failures"
        );
        wf.state = WorkflowState::Completed;
        assert!(wf.ensure_completed().is_ok());
    }

    #[test]
    fn stage_spec_builder() {
        let spec = StageSpec::new("load", "loader")
            .depends_on(["extract", "clean"])
            .with_resources(ResourceRequirements::memory(128));
        assert_eq!(spec.depends_on.len(), 2);
        assert_eq!(spec.resources.memory_mb, 128);
    }
}
