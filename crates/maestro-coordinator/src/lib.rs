//! Agent coordinator: the entry point composing the event bus and the
//! workflow scheduler with agent identity and security enforcement.

mod coordinator;
mod directory;
mod health;
mod monitor;
mod security;

pub use coordinator::AgentCoordinator;
pub use directory::{AgentDirectory, InMemoryAgentDirectory};
pub use health::{HealthAggregator, HealthSnapshot, HealthStatus, WorkflowCounts};
pub use monitor::{MONITOR_CAPACITY, WorkflowMonitor};
pub use security::{SecurityValidator, TokenSecurityValidator};
