use async_trait::async_trait;
use maestro_core::{AgentId, StageError, StageId, WorkflowId};
use serde_json::Value;

/// One attempt handed to a stage executor.
#[derive(Clone, Debug, PartialEq)]
pub struct StageInvocation {
    pub workflow_id: WorkflowId,
    pub stage_id: StageId,
    /// 1-based attempt number within the current run of the stage.
    pub attempt: u32,
    pub config: Value,
}

/// Runs stage work on behalf of an agent.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute_stage(
        &self,
        agent_id: &AgentId,
        invocation: &StageInvocation,
    ) -> Result<Value, StageError>;
}
