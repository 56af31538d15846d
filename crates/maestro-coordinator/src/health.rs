use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use maestro_bus::{BreakerSnapshot, BreakerState, EventHandler, HandlerError};
use maestro_core::{Event, EventPayload, EventType, WorkflowId, WorkflowState};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub breaker: BreakerSnapshot,
    pub agents_registered: usize,
    pub workflows_running: usize,
    pub workflows_recovering: usize,
    pub workflows_failed: usize,
    pub workflows_completed: usize,
    /// Security violations inside the rolling window.
    pub security_violations: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// An open breaker still cooling down is unhealthy. A breaker ready to
    /// probe, recovering workflows or recent security violations degrade.
    pub(crate) fn status_for(
        breaker: &BreakerSnapshot,
        workflows_recovering: usize,
        security_violations: usize,
    ) -> HealthStatus {
        match breaker.state {
            BreakerState::Open if breaker.retry_after_ms.is_some_and(|ms| ms > 0) => {
                HealthStatus::Unhealthy
            }
            BreakerState::Open | BreakerState::HalfOpen => HealthStatus::Degraded,
            BreakerState::Closed if workflows_recovering > 0 || security_violations > 0 => {
                HealthStatus::Degraded
            }
            BreakerState::Closed => HealthStatus::Healthy,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkflowCounts {
    pub running: usize,
    pub recovering: usize,
    pub failed: usize,
    pub completed: usize,
}

/// Bus subscriber that tracks workflow states and security violations.
pub struct HealthAggregator {
    workflows: DashMap<WorkflowId, WorkflowState>,
    violations: Mutex<VecDeque<Instant>>,
    window: Duration,
}

impl HealthAggregator {
    /// Event types the aggregator must be subscribed to.
    pub const SUBSCRIBED: [EventType; 8] = [
        EventType::WorkflowCreated,
        EventType::WorkflowStarted,
        EventType::WorkflowRecovering,
        EventType::WorkflowResumed,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::WorkflowCancelled,
        EventType::SecurityViolation,
    ];

    pub fn new(window: Duration) -> Self {
        Self {
            workflows: DashMap::new(),
            violations: Mutex::new(VecDeque::new()),
            window,
        }
    }

    pub fn observe(&self, event: &Event) {
        let transition = match &event.payload {
            EventPayload::WorkflowCreated { workflow_id, .. } => {
                Some((workflow_id, WorkflowState::Pending))
            }
            EventPayload::WorkflowStarted { workflow_id }
            | EventPayload::WorkflowResumed { workflow_id } => {
                Some((workflow_id, WorkflowState::Running))
            }
            EventPayload::WorkflowRecovering { workflow_id, .. } => {
                Some((workflow_id, WorkflowState::Recovering))
            }
            EventPayload::WorkflowCompleted { workflow_id, .. } => {
                Some((workflow_id, WorkflowState::Completed))
            }
            EventPayload::WorkflowFailed { workflow_id, .. } => {
                Some((workflow_id, WorkflowState::Failed))
            }
            EventPayload::SecurityViolation { .. } => {
                self.violations.lock().push_back(Instant::now());
                None
            }
            _ => None,
        };

        if let Some((workflow_id, next)) = transition {
            let mut entry = self
                .workflows
                .entry(workflow_id.clone())
                .or_insert(WorkflowState::Pending);
            // Handlers run concurrently; never move a terminal workflow back.
            if !entry.is_terminal() {
                *entry = next;
            }
        }
    }

    pub fn workflow_counts(&self) -> WorkflowCounts {
        let mut counts = WorkflowCounts::default();
        for entry in &self.workflows {
            match entry.value() {
                WorkflowState::Running => counts.running += 1,
                WorkflowState::Recovering => counts.recovering += 1,
                WorkflowState::Failed => counts.failed += 1,
                WorkflowState::Completed => counts.completed += 1,
                WorkflowState::Pending => {}
            }
        }
        counts
    }

    /// Violations observed within the window; older entries are pruned.
    pub fn recent_violations(&self) -> usize {
        let mut violations = self.violations.lock();
        let now = Instant::now();
        while violations
            .front()
            .is_some_and(|seen| now.duration_since(*seen) > self.window)
        {
            let _ = violations.pop_front();
        }
        violations.len()
    }

    pub fn forget(&self, workflow_id: &WorkflowId) {
        let _ = self.workflows.remove(workflow_id);
    }
}

#[async_trait]
impl EventHandler for HealthAggregator {
    fn name(&self) -> &str {
        "coordinator.health"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.observe(event);
        Ok(())
    }
}
