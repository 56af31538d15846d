//! Foundation types shared by every maestro crate.
//!
//! Nothing in here performs I/O or spawns tasks: the bus, scheduler and
//! coordinator crates build on these types and own all runtime behaviour.

pub mod agent;
pub mod errors;
pub mod events;
pub mod ids;
pub mod policy;
pub mod resources;
pub mod workflow;

pub use agent::{AgentConfig, AgentRegistration, Permission, Role, SecurityContext, SecurityVerdict};
pub use errors::{EngineError, Result, StageError};
pub use events::{Event, EventPayload, EventType};
pub use ids::{AgentId, CorrelationId, EventId, StageId, WorkflowId};
pub use policy::{BackoffPolicy, BreakerPolicy, CoordinatorPolicy, RecoveryPolicy, WorkflowConfig};
pub use resources::ResourceRequirements;
pub use workflow::{
    FailureKind, RecoveryAction, Stage, StageErrorContext, StageSpec, StageState, Workflow,
    WorkflowMetrics, WorkflowState,
};
