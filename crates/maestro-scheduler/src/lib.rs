//! Workflow scheduler.
//!
//! Validates stage graphs, admits ready stages against a per-workflow
//! resource ledger, runs them concurrently with retry/backoff, and applies
//! the error-threshold and recovery rules that drive workflow state.

mod attempt;
mod emitter;
mod executor;
mod graph;
mod ledger;
mod scheduler;

pub use executor::{StageExecutor, StageInvocation};
pub use graph::StageGraph;
pub use ledger::ResourceLedger;
pub use scheduler::{WorkflowScheduler, WorkflowSummary};
