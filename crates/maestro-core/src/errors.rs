use std::time::Duration;

use crate::ids::{StageId, WorkflowId};
use crate::resources::ResourceRequirements;
use crate::workflow::{StageState, WorkflowState};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy surfaced by the bus, scheduler and coordinator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    // Rejected input, no side effects
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("resource budget exceeded{}: requested {requested}, budget {budget}", stage_suffix(.stage_id.as_ref()))]
    ResourceExceeded {
        stage_id: Option<StageId>,
        requested: ResourceRequirements,
        budget: ResourceRequirements,
    },
    #[error("security check failed: {0}")]
    Security(String),

    // Runtime
    #[error("stage {stage_id} failed: {message}")]
    StageExecution { stage_id: StageId, message: String },
    #[error("event channel unavailable, retry after {retry_after:?}")]
    ChannelUnavailable { retry_after: Duration },
    #[error("workflow {workflow_id} failed: {reason}")]
    WorkflowFailed {
        workflow_id: WorkflowId,
        reason: String,
    },

    // Lookup / state
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
    #[error("stage {stage_id} not found in workflow {workflow_id}")]
    StageNotFound {
        workflow_id: WorkflowId,
        stage_id: StageId,
    },
    #[error("cannot {operation} workflow {workflow_id} in state {state}")]
    InvalidState {
        workflow_id: WorkflowId,
        state: WorkflowState,
        operation: &'static str,
    },
    #[error("cannot {operation} stage {stage_id} in state {state}")]
    InvalidStageState {
        stage_id: StageId,
        state: StageState,
        operation: &'static str,
    },
    #[error("workflow {0} is already executing")]
    WorkflowBusy(WorkflowId),

    #[error("internal error: {0}")]
    Internal(String),
}

fn stage_suffix(stage_id: Option<&StageId>) -> String {
    stage_id.map(|id| format!(" by stage {id}")).unwrap_or_default()
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable { .. } | Self::StageExecution { .. } | Self::WorkflowBusy(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::Security(_) => "security",
            Self::StageExecution { .. } => "stage_execution",
            Self::ChannelUnavailable { .. } => "channel_unavailable",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::StageNotFound { .. } => "stage_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidStageState { .. } => "invalid_stage_state",
            Self::WorkflowBusy(_) => "workflow_busy",
            Self::Internal(_) => "internal",
        }
    }
}

/// Failure reported by a stage executor for a single attempt.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    /// Non-retryable errors skip the remaining retry budget.
    pub retryable: bool,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("stage timed out after {after:?}"))
    }
}
