use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use maestro_core::{
    AgentId, BackoffPolicy, EventPayload, FailureKind, ResourceRequirements, StageError, StageId,
    WorkflowId,
};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::emitter::Emitter;
use crate::executor::{StageExecutor, StageInvocation};

/// Everything a spawned stage task needs; owned so the task is `'static`.
pub(crate) struct AttemptPlan {
    pub workflow_id: WorkflowId,
    pub stage_id: StageId,
    pub agent_id: AgentId,
    pub config: Value,
    pub resources: ResourceRequirements,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

pub(crate) struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of running one stage through its retry budget.
pub(crate) struct StageRun {
    pub stage_id: StageId,
    pub resources: ResourceRequirements,
    pub outcome: Result<Value, StageFailure>,
    pub attempts: u32,
    pub latency_ms: u64,
}

impl StageRun {
    /// Fatal outcome for a stage whose task panicked or was aborted before
    /// reporting back. Carries the reservation so it can still be released.
    pub(crate) fn lost(stage_id: StageId, resources: ResourceRequirements, message: String) -> Self {
        Self {
            stage_id,
            resources,
            outcome: Err(StageFailure {
                kind: FailureKind::Fatal,
                message,
            }),
            attempts: 1,
            latency_ms: 0,
        }
    }
}

/// Execute a stage until it succeeds, fails fatally, exhausts its attempts
/// or is cancelled during backoff. Attempts already in progress are never
/// interrupted by cancellation.
pub(crate) async fn run_stage(
    plan: AttemptPlan,
    executor: Arc<dyn StageExecutor>,
    emitter: Emitter,
    cancel: CancellationToken,
) -> StageRun {
    let max_attempts = plan.max_attempts.max(1);
    let mut latency = Duration::ZERO;
    let mut attempt = 0;

    let failure = loop {
        attempt += 1;
        let invocation = StageInvocation {
            workflow_id: plan.workflow_id.clone(),
            stage_id: plan.stage_id.clone(),
            attempt,
            config: plan.config.clone(),
        };

        let started = Instant::now();
        let call = std::panic::AssertUnwindSafe(executor.execute_stage(&plan.agent_id, &invocation))
            .catch_unwind();
        let result = match tokio::time::timeout(plan.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(StageError::fatal("stage executor panicked")),
            Err(_elapsed) => Err(StageError::timeout(plan.timeout)),
        };
        latency += started.elapsed();

        let error = match result {
            Ok(output) => {
                debug!(stage = %plan.stage_id, attempt, "stage attempt succeeded");
                return StageRun {
                    stage_id: plan.stage_id,
                    resources: plan.resources,
                    outcome: Ok(output),
                    attempts: attempt,
                    latency_ms: latency.as_millis() as u64,
                };
            }
            Err(error) => error,
        };

        if !error.retryable {
            break StageFailure {
                kind: FailureKind::Fatal,
                message: error.message,
            };
        }
        if attempt >= max_attempts {
            break StageFailure {
                kind: FailureKind::RetriesExhausted,
                message: error.message,
            };
        }
        if cancel.is_cancelled() {
            break StageFailure {
                kind: FailureKind::Cancelled,
                message: format!("cancelled after attempt {attempt}: {}", error.message),
            };
        }

        let delay = plan.backoff.delay_for(attempt - 1, rand::random::<f64>());
        warn!(
            stage = %plan.stage_id,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error.message,
            "stage attempt failed, retrying"
        );
        emitter.metrics().counter("scheduler.stage.retries", &[], 1);
        emitter
            .emit(EventPayload::StageRetrying {
                workflow_id: plan.workflow_id.clone(),
                stage_id: plan.stage_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.message.clone(),
            })
            .await;

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                break StageFailure {
                    kind: FailureKind::Cancelled,
                    message: format!("cancelled during backoff after attempt {attempt}"),
                };
            }
        }
    };

    StageRun {
        stage_id: plan.stage_id,
        resources: plan.resources,
        outcome: Err(failure),
        attempts: attempt,
        latency_ms: latency.as_millis() as u64,
    }
}
