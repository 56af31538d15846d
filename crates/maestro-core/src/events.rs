//! Typed events published on the bus.
//!
//! [`EventType`] is a closed enumeration with a dense index so subscriber
//! tables can be plain vectors; [`EventPayload`] carries the data for each
//! type and always reports the matching [`EventType`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CorrelationId, EventId, StageId, WorkflowId};
use crate::workflow::{FailureKind, RecoveryAction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    AgentDeregistered,
    WorkflowCreated,
    WorkflowStarted,
    WorkflowRecovering,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    StageStarted,
    StageRetrying,
    StageCompleted,
    StageFailed,
    StageSkipped,
    StageRecovery,
    SecurityViolation,
}

impl EventType {
    pub const ALL: [Self; 16] = [
        Self::AgentRegistered,
        Self::AgentDeregistered,
        Self::WorkflowCreated,
        Self::WorkflowStarted,
        Self::WorkflowRecovering,
        Self::WorkflowResumed,
        Self::WorkflowCompleted,
        Self::WorkflowFailed,
        Self::WorkflowCancelled,
        Self::StageStarted,
        Self::StageRetrying,
        Self::StageCompleted,
        Self::StageFailed,
        Self::StageSkipped,
        Self::StageRecovery,
        Self::SecurityViolation,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Types describing workflow lifecycle changes.
    pub const WORKFLOW_LIFECYCLE: [Self; 7] = [
        Self::WorkflowCreated,
        Self::WorkflowStarted,
        Self::WorkflowRecovering,
        Self::WorkflowResumed,
        Self::WorkflowCompleted,
        Self::WorkflowFailed,
        Self::WorkflowCancelled,
    ];

    /// Dense index in `0..COUNT`.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_workflow_scoped(self) -> bool {
        !matches!(
            self,
            Self::AgentRegistered | Self::AgentDeregistered | Self::SecurityViolation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentRegistered => "agent_registered",
            Self::AgentDeregistered => "agent_deregistered",
            Self::WorkflowCreated => "workflow_created",
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowRecovering => "workflow_recovering",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::StageStarted => "stage_started",
            Self::StageRetrying => "stage_retrying",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::StageRecovery => "stage_recovery",
            Self::SecurityViolation => "security_violation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentRegistered {
        agent_id: AgentId,
        agent_type: String,
    },
    AgentDeregistered {
        agent_id: AgentId,
    },
    WorkflowCreated {
        workflow_id: WorkflowId,
        stage_count: usize,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
    },
    WorkflowRecovering {
        workflow_id: WorkflowId,
        failed_stages: Vec<StageId>,
    },
    WorkflowResumed {
        workflow_id: WorkflowId,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        stages_completed: usize,
        stages_failed: usize,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        reason: String,
    },
    WorkflowCancelled {
        workflow_id: WorkflowId,
    },
    StageStarted {
        workflow_id: WorkflowId,
        stage_id: StageId,
        agent_id: AgentId,
    },
    StageRetrying {
        workflow_id: WorkflowId,
        stage_id: StageId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StageCompleted {
        workflow_id: WorkflowId,
        stage_id: StageId,
        attempts: u32,
        latency_ms: u64,
    },
    StageFailed {
        workflow_id: WorkflowId,
        stage_id: StageId,
        kind: FailureKind,
        error: String,
    },
    StageSkipped {
        workflow_id: WorkflowId,
        stage_id: StageId,
        kind: FailureKind,
    },
    StageRecovery {
        workflow_id: WorkflowId,
        stage_id: StageId,
        action: RecoveryAction,
    },
    SecurityViolation {
        principal: String,
        agent_id: Option<AgentId>,
        reason: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AgentRegistered { .. } => EventType::AgentRegistered,
            Self::AgentDeregistered { .. } => EventType::AgentDeregistered,
            Self::WorkflowCreated { .. } => EventType::WorkflowCreated,
            Self::WorkflowStarted { .. } => EventType::WorkflowStarted,
            Self::WorkflowRecovering { .. } => EventType::WorkflowRecovering,
            Self::WorkflowResumed { .. } => EventType::WorkflowResumed,
            Self::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventType::WorkflowFailed,
            Self::WorkflowCancelled { .. } => EventType::WorkflowCancelled,
            Self::StageStarted { .. } => EventType::StageStarted,
            Self::StageRetrying { .. } => EventType::StageRetrying,
            Self::StageCompleted { .. } => EventType::StageCompleted,
            Self::StageFailed { .. } => EventType::StageFailed,
            Self::StageSkipped { .. } => EventType::StageSkipped,
            Self::StageRecovery { .. } => EventType::StageRecovery,
            Self::SecurityViolation { .. } => EventType::SecurityViolation,
        }
    }

    pub fn workflow_id(&self) -> Option<&WorkflowId> {
        match self {
            Self::WorkflowCreated { workflow_id, .. }
            | Self::WorkflowStarted { workflow_id }
            | Self::WorkflowRecovering { workflow_id, .. }
            | Self::WorkflowResumed { workflow_id }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id }
            | Self::StageStarted { workflow_id, .. }
            | Self::StageRetrying { workflow_id, .. }
            | Self::StageCompleted { workflow_id, .. }
            | Self::StageFailed { workflow_id, .. }
            | Self::StageSkipped { workflow_id, .. }
            | Self::StageRecovery { workflow_id, .. } => Some(workflow_id),
            Self::AgentRegistered { .. }
            | Self::AgentDeregistered { .. }
            | Self::SecurityViolation { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Build an event, correlating it with its workflow when it has one.
    pub fn new(payload: EventPayload) -> Self {
        let correlation_id = payload
            .workflow_id()
            .map_or_else(CorrelationId::new, CorrelationId::for_workflow);
        Self::correlated(correlation_id, payload)
    }

    pub fn correlated(correlation_id: CorrelationId, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            correlation_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn workflow_id(&self) -> Option<&WorkflowId> {
        self.payload.workflow_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_ordered() {
        for (i, ty) in EventType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i, "{ty:?}");
        }
        assert_eq!(EventType::COUNT, 16);
    }

    #[test]
    fn payload_reports_its_type() {
        let payload = EventPayload::StageRetrying {
            workflow_id: WorkflowId::from_raw("wf_a"),
            stage_id: StageId::from_raw("s1"),
            attempt: 2,
            delay_ms: 400,
            error: "flaky".into(),
        };
        assert_eq!(payload.event_type(), EventType::StageRetrying);
        assert_eq!(payload.workflow_id().map(WorkflowId::as_str), Some("wf_a"));
    }

    #[test]
    fn workflow_events_share_correlation() {
        let wf = WorkflowId::from_raw("wf_corr");
        let a = Event::new(EventPayload::WorkflowStarted { workflow_id: wf.clone() });
        let b = Event::new(EventPayload::WorkflowCancelled { workflow_id: wf });
        assert_eq!(a.correlation_id, b.correlation_id);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn agent_events_are_not_workflow_scoped() {
        let ev = Event::new(EventPayload::AgentDeregistered {
            agent_id: AgentId::from_raw("agent_x"),
        });
        assert!(ev.workflow_id().is_none());
        assert!(!ev.event_type().is_workflow_scoped());
        assert!(EventType::StageFailed.is_workflow_scoped());
    }

    #[test]
    fn serializes_with_type_tag() {
        let ev = Event::new(EventPayload::WorkflowFailed {
            workflow_id: WorkflowId::from_raw("wf_a"),
            reason: "threshold".into(),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "workflow_failed");
        assert_eq!(json["workflow_id"], "wf_a");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn as_str_matches_serde_name() {
        for ty in EventType::ALL {
            let json = serde_json::to_value(ty).unwrap();
            assert_eq!(json, ty.as_str());
        }
    }
}
