//! Stand-in executor for `maestro run`.
//!
//! Each stage's behaviour comes from its `config`:
//! - `duration_ms`: how long every call takes (default 0)
//! - `fail_times`: calls that fail before the stage succeeds, counted across
//!   recovery resets (default 0)
//! - `fatal`: failures are non-retryable

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use maestro_core::{AgentId, StageError, StageId, WorkflowId};
use maestro_scheduler::{StageExecutor, StageInvocation};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

#[derive(Default)]
pub struct SimulatedExecutor {
    calls: Mutex<HashMap<(WorkflowId, StageId), u64>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_call(&self, invocation: &StageInvocation) -> u64 {
        let mut calls = self.calls.lock();
        let count = calls
            .entry((invocation.workflow_id.clone(), invocation.stage_id.clone()))
            .or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    async fn execute_stage(
        &self,
        agent_id: &AgentId,
        invocation: &StageInvocation,
    ) -> Result<Value, StageError> {
        let config = &invocation.config;
        let duration_ms = config.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
        let fail_times = config.get("fail_times").and_then(Value::as_u64).unwrap_or(0);
        let fatal = config.get("fatal").and_then(Value::as_bool).unwrap_or(false);

        let call = self.next_call(invocation);
        debug!(
            stage_id = %invocation.stage_id,
            agent_id = %agent_id,
            attempt = invocation.attempt,
            call,
            "simulating stage"
        );
        if duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        }

        if call <= fail_times {
            let message = format!("simulated failure {call} of {fail_times}");
            return Err(if fatal {
                StageError::fatal(message)
            } else {
                StageError::transient(message)
            });
        }
        Ok(json!({
            "agent_id": agent_id.as_str(),
            "call": call,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(stage: &str, config: Value) -> StageInvocation {
        StageInvocation {
            workflow_id: WorkflowId::from_raw("wf_sim"),
            stage_id: StageId::from(stage),
            attempt: 1,
            config,
        }
    }

    #[tokio::test]
    async fn fails_then_succeeds() {
        let executor = SimulatedExecutor::new();
        let agent = AgentId::from_raw("agent_a");
        let inv = invocation("s", json!({ "fail_times": 2 }));

        let first = executor.execute_stage(&agent, &inv).await.unwrap_err();
        assert!(first.retryable);
        assert!(executor.execute_stage(&agent, &inv).await.is_err());
        let output = executor.execute_stage(&agent, &inv).await.unwrap();
        assert_eq!(output["call"], 3);
        assert_eq!(output["agent_id"], "agent_a");
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retryable() {
        let executor = SimulatedExecutor::new();
        let inv = invocation("s", json!({ "fail_times": 1, "fatal": true }));
        let err = executor
            .execute_stage(&AgentId::from_raw("a"), &inv)
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn counts_are_per_stage() {
        let executor = SimulatedExecutor::new();
        let agent = AgentId::from_raw("a");
        let flaky = invocation("flaky", json!({ "fail_times": 1 }));
        assert!(executor.execute_stage(&agent, &flaky).await.is_err());
        assert!(executor.execute_stage(&agent, &invocation("other", Value::Null)).await.is_ok());
        assert!(executor.execute_stage(&agent, &flaky).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_is_simulated() {
        let executor = SimulatedExecutor::new();
        let start = tokio::time::Instant::now();
        let _ = executor
            .execute_stage(&AgentId::from_raw("a"), &invocation("slow", json!({ "duration_ms": 250 })))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
