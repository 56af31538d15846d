use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use maestro_bus::EventBus;
use maestro_core::{
    EngineError, EventPayload, FailureKind, RecoveryAction, ResourceRequirements, Result,
    StageErrorContext, StageId, StageSpec, StageState, Workflow, WorkflowConfig, WorkflowId,
    WorkflowMetrics, WorkflowState,
};
use maestro_telemetry::{MetricsSink, NoopMetrics};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, instrument, warn};

use crate::attempt::{AttemptPlan, StageRun, run_stage};
use crate::emitter::Emitter;
use crate::executor::StageExecutor;
use crate::graph::StageGraph;
use crate::ledger::ResourceLedger;

/// Lightweight listing entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub stages_total: usize,
    pub stages_completed: usize,
    pub stages_failed: usize,
    pub created_at: DateTime<Utc>,
}

struct WorkflowHandle {
    record: RwLock<Workflow>,
    graph: StageGraph,
    ledger: ResourceLedger,
    cancel: CancellationToken,
    executing: AtomicBool,
}

/// Clears the executing flag once the execution task finishes or unwinds.
struct ExecutionGuard(Arc<WorkflowHandle>);

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.0.executing.store(false, Ordering::SeqCst);
    }
}

/// Owns every workflow record and drives stage execution.
///
/// Locks on a workflow are only held for synchronous bookkeeping; events are
/// published and stages awaited with no lock held, so workflows never block
/// one another.
pub struct WorkflowScheduler {
    workflows: DashMap<WorkflowId, Arc<WorkflowHandle>>,
    executor: Arc<dyn StageExecutor>,
    bus: Arc<EventBus>,
    metrics: Arc<dyn MetricsSink>,
    emitter: Emitter,
}

impl WorkflowScheduler {
    pub fn new(bus: Arc<EventBus>, executor: Arc<dyn StageExecutor>) -> Self {
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        Self {
            workflows: DashMap::new(),
            executor,
            emitter: Emitter::new(Arc::clone(&bus), Arc::clone(&metrics)),
            bus,
            metrics,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.emitter = Emitter::new(Arc::clone(&self.bus), Arc::clone(&metrics));
        self.metrics = metrics;
        self
    }

    fn handle(&self, workflow_id: &WorkflowId) -> Result<Arc<WorkflowHandle>> {
        self.workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────────────────

    /// Validate and register a workflow in `pending`.
    ///
    /// Rejections (`Validation`, `ResourceExceeded`) leave no trace: nothing
    /// is stored and no event is published.
    #[instrument(skip_all, fields(workflow_id = %workflow_id, stages = stages.len()))]
    pub async fn create_workflow(
        &self,
        workflow_id: WorkflowId,
        stages: Vec<StageSpec>,
        config: WorkflowConfig,
    ) -> Result<Workflow> {
        config.validate()?;
        let graph = StageGraph::build(&stages)?;

        let budget = config.max_resource_budget;
        if let Some(stage) = stages.iter().find(|s| !s.resources.fits_within(&budget)) {
            return Err(EngineError::ResourceExceeded {
                stage_id: Some(stage.id.clone()),
                requested: stage.resources,
                budget,
            });
        }
        if config.strict_frontier_budget {
            if let Some(level) = graph
                .level_requirements(&stages)
                .into_iter()
                .find(|level| !level.fits_within(&budget))
            {
                return Err(EngineError::ResourceExceeded {
                    stage_id: None,
                    requested: level,
                    budget,
                });
            }
        }

        let stage_count = stages.len();
        let workflow = Workflow::new(workflow_id.clone(), config, stages);
        let snapshot = workflow.clone();
        let handle = Arc::new(WorkflowHandle {
            record: RwLock::new(workflow),
            graph,
            ledger: ResourceLedger::new(budget),
            cancel: CancellationToken::new(),
            executing: AtomicBool::new(false),
        });

        match self.workflows.entry(workflow_id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::validation(format!(
                    "workflow {workflow_id} already exists"
                )));
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(handle);
            }
        }

        info!(stage_count, "workflow created");
        self.metrics.counter("scheduler.workflows.created", &[], 1);
        self.emitter
            .emit(EventPayload::WorkflowCreated {
                workflow_id,
                stage_count,
            })
            .await;
        Ok(snapshot)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Run the workflow until no further progress is possible.
    ///
    /// Returns the settled snapshot: `completed`, `failed`, or `recovering`
    /// when failed stages are waiting on `handle_stage_failure`. A
    /// `recovering` or `running` workflow may be executed again to resume.
    ///
    /// The frontier runs on its own task. Dropping the returned future stops
    /// the wait, not the execution: admitted stages finish, their resources
    /// are released and the workflow still settles.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn execute_workflow(&self, workflow_id: &WorkflowId) -> Result<Workflow> {
        let handle = self.handle(workflow_id)?;
        if handle.executing.swap(true, Ordering::SeqCst) {
            return Err(EngineError::WorkflowBusy(workflow_id.clone()));
        }
        let guard = ExecutionGuard(Arc::clone(&handle));

        let opening = {
            let mut wf = handle.record.write();
            match wf.state {
                state @ (WorkflowState::Completed | WorkflowState::Failed) => {
                    return Err(EngineError::InvalidState {
                        workflow_id: workflow_id.clone(),
                        state,
                        operation: "execute",
                    });
                }
                WorkflowState::Pending => {
                    wf.transition_to(WorkflowState::Running)?;
                    EventPayload::WorkflowStarted {
                        workflow_id: workflow_id.clone(),
                    }
                }
                WorkflowState::Running | WorkflowState::Recovering => EventPayload::WorkflowResumed {
                    workflow_id: workflow_id.clone(),
                },
            }
        };
        info!(event = opening.event_type().as_str(), "executing workflow");

        let driver = self.driver();
        let execution = tokio::spawn(
            async move {
                let _guard = guard;
                driver.emitter.emit(opening).await;
                driver.drive(&handle).await;
                driver.settle(&handle).await;
                handle.record.read().clone()
            }
            .instrument(Span::current()),
        );
        let snapshot = execution
            .await
            .map_err(|e| EngineError::Internal(format!("workflow execution task failed: {e}")))?;
        info!(state = %snapshot.state, "workflow execution returned");
        Ok(snapshot)
    }

    fn driver(&self) -> Driver {
        Driver {
            executor: Arc::clone(&self.executor),
            emitter: self.emitter.clone(),
        }
    }
}

/// Owned view of the scheduler used by a detached execution task.
struct Driver {
    executor: Arc<dyn StageExecutor>,
    emitter: Emitter,
}

impl Driver {
    /// Frontier loop: admit every ready stage the ledger allows, then wait
    /// for any running stage to finish, until nothing is running.
    async fn drive(&self, handle: &WorkflowHandle) {
        let mut running: JoinSet<StageRun> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, (StageId, ResourceRequirements)> = HashMap::new();
        loop {
            for plan in admit_ready(handle) {
                self.emitter
                    .emit(EventPayload::StageStarted {
                        workflow_id: plan.workflow_id.clone(),
                        stage_id: plan.stage_id.clone(),
                        agent_id: plan.agent_id.clone(),
                    })
                    .await;
                let key = (plan.stage_id.clone(), plan.resources);
                let spawned = running.spawn(run_stage(
                    plan,
                    Arc::clone(&self.executor),
                    self.emitter.clone(),
                    handle.cancel.child_token(),
                ));
                let _ = in_flight.insert(spawned.id(), key);
            }

            let run = match running.join_next_with_id().await {
                None => break,
                Some(Ok((id, run))) => {
                    let _ = in_flight.remove(&id);
                    run
                }
                Some(Err(join_error)) => {
                    let Some((stage_id, resources)) = in_flight.remove(&join_error.id()) else {
                        error!(error = %join_error, "untracked stage task ended abnormally");
                        continue;
                    };
                    error!(stage = %stage_id, error = %join_error, "stage task ended abnormally");
                    StageRun::lost(stage_id, resources, format!("stage task ended abnormally: {join_error}"))
                }
            };
            self.finish_stage(handle, run).await;
        }
    }

    async fn finish_stage(&self, handle: &WorkflowHandle, run: StageRun) {
        handle.ledger.release(run.resources);
        let metrics = self.emitter.metrics();
        let mut events = Vec::new();
        {
            let mut guard = handle.record.write();
            let wf = &mut *guard;
            let workflow_id = wf.id.clone();
            let Some(stage) = wf.stage_mut(&run.stage_id) else {
                error!(stage = %run.stage_id, "finished stage missing from workflow");
                return;
            };
            stage.attempts += run.attempts;
            stage.latency_ms += run.latency_ms;
            metrics.timing("scheduler.stage.latency_ms", &[], run.latency_ms as f64);

            match run.outcome {
                Ok(output) => {
                    stage.state = StageState::Completed;
                    stage.finished_at = Some(Utc::now());
                    stage.output = Some(output);
                    info!(stage = %stage.id, attempts = run.attempts, "stage completed");
                    metrics.counter("scheduler.stage.finished", &[("outcome", "completed")], 1);
                    events.push(EventPayload::StageCompleted {
                        workflow_id,
                        stage_id: run.stage_id,
                        attempts: stage.attempts,
                        latency_ms: stage.latency_ms,
                    });
                }
                Err(failure) => {
                    stage.fail(StageState::Failed, failure.kind, failure.message.clone());
                    warn!(
                        stage = %stage.id,
                        kind = failure.kind.as_str(),
                        attempts = run.attempts,
                        error = %failure.message,
                        "stage failed"
                    );
                    metrics.counter(
                        "scheduler.stage.finished",
                        &[("outcome", "failed"), ("kind", failure.kind.as_str())],
                        1,
                    );
                    events.push(EventPayload::StageFailed {
                        workflow_id: workflow_id.clone(),
                        stage_id: run.stage_id.clone(),
                        kind: failure.kind,
                        error: failure.message,
                    });

                    if !wf.state.is_terminal() && failure.kind != FailureKind::Cancelled {
                        let _ = wf.unresolved_failures.insert(run.stage_id);
                        if wf.exceeds_error_threshold() {
                            let reason = threshold_reason(wf);
                            events.extend(abort(wf, &handle.graph, reason));
                        } else if wf.state == WorkflowState::Running {
                            advance(wf, WorkflowState::Recovering);
                            events.push(EventPayload::WorkflowRecovering {
                                workflow_id,
                                failed_stages: wf.unresolved_failures.iter().cloned().collect(),
                            });
                        }
                    }
                }
            }
        }
        self.emitter.emit_all(events).await;
    }

    /// Decide the workflow state once nothing is running.
    async fn settle(&self, handle: &WorkflowHandle) {
        let mut events = Vec::new();
        {
            let mut guard = handle.record.write();
            let wf = &mut *guard;
            if wf.state.is_terminal() {
                return;
            }

            if wf.cancelled {
                events.extend(abort(wf, &handle.graph, "workflow cancelled".into()));
            } else if wf.exceeds_error_threshold() {
                let reason = threshold_reason(wf);
                events.extend(abort(wf, &handle.graph, reason));
            } else if wf.all_stages_terminal() && wf.unresolved_failures.is_empty() {
                advance(wf, WorkflowState::Completed);
                let metrics = wf.metrics();
                info!(
                    completed = metrics.stages_completed,
                    failed = metrics.stages_failed,
                    "workflow completed"
                );
                events.push(EventPayload::WorkflowCompleted {
                    workflow_id: wf.id.clone(),
                    stages_completed: metrics.stages_completed,
                    stages_failed: metrics.stages_failed,
                });
            } else if wf.unresolved_failures.is_empty() {
                warn!(state = %wf.state, "workflow stalled without unresolved failures");
            } else if wf.state == WorkflowState::Running {
                advance(wf, WorkflowState::Recovering);
                events.push(EventPayload::WorkflowRecovering {
                    workflow_id: wf.id.clone(),
                    failed_stages: wf.unresolved_failures.iter().cloned().collect(),
                });
            }
        }
        if !events.is_empty() {
            let state = handle.record.read().state;
            self.emitter
                .metrics()
                .counter("scheduler.workflows.settled", &[("state", state.as_str())], 1);
        }
        self.emitter.emit_all(events).await;
    }
}

fn admit_ready(handle: &WorkflowHandle) -> Vec<AttemptPlan> {
    let mut guard = handle.record.write();
    let wf = &mut *guard;
    if wf.state.is_terminal() || wf.cancelled {
        return Vec::new();
    }

    let mut plans = Vec::new();
    for idx in 0..wf.stages.len() {
        if !wf.stages[idx].state.is_unstarted() {
            continue;
        }
        let deps_done = handle
            .graph
            .dependencies(idx)
            .iter()
            .all(|&d| wf.stages[d].state == StageState::Completed);
        if !deps_done {
            continue;
        }

        let stage = &mut wf.stages[idx];
        if handle.ledger.try_allocate(stage.resources) {
            stage.state = StageState::Running;
            stage.started_at = Some(Utc::now());
            plans.push(AttemptPlan {
                workflow_id: wf.id.clone(),
                stage_id: stage.id.clone(),
                agent_id: stage.agent_id.clone(),
                config: stage.config.clone(),
                resources: stage.resources,
                max_attempts: wf.config.max_attempts(),
                timeout: wf.config.stage_timeout(),
                backoff: wf.config.backoff.clone(),
            });
        } else {
            stage.state = StageState::Ready;
        }
    }
    plans
}

impl WorkflowScheduler {
    // ─────────────────────────────────────────────────────────────────────
    // Recovery and cancellation
    // ─────────────────────────────────────────────────────────────────────

    /// Resolve a failed stage according to the workflow's recovery policy.
    ///
    /// While the stage has resets left it goes back to `pending` (moving to
    /// the fallback agent when one is configured); otherwise the failure
    /// cascades to every transitive dependent. The workflow state is then
    /// re-evaluated against the error threshold.
    #[instrument(skip_all, fields(workflow_id = %workflow_id, stage_id = %stage_id))]
    pub async fn handle_stage_failure(
        &self,
        workflow_id: &WorkflowId,
        stage_id: &StageId,
        error: impl Into<String>,
    ) -> Result<RecoveryAction> {
        let handle = self.handle(workflow_id)?;
        let mut events = Vec::new();
        let action = {
            let mut guard = handle.record.write();
            let wf = &mut *guard;
            if wf.state.is_terminal() {
                return Err(EngineError::InvalidState {
                    workflow_id: workflow_id.clone(),
                    state: wf.state,
                    operation: "recover a stage of",
                });
            }
            let Some(idx) = handle.graph.index_of(stage_id) else {
                return Err(EngineError::StageNotFound {
                    workflow_id: workflow_id.clone(),
                    stage_id: stage_id.clone(),
                });
            };

            let stage = &mut wf.stages[idx];
            if stage.state != StageState::Failed {
                return Err(EngineError::InvalidStageState {
                    stage_id: stage_id.clone(),
                    state: stage.state,
                    operation: "recover",
                });
            }
            let kind = stage.error.as_ref().map_or(FailureKind::Operator, |e| e.kind);
            stage.error = Some(StageErrorContext {
                kind,
                message: error.into(),
                attempts: stage.attempts,
                occurred_at: Utc::now(),
            });

            let recovery = &wf.config.recovery;
            let resettable = stage.resets < recovery.max_resets
                && !matches!(kind, FailureKind::DependencyFailed | FailureKind::Cancelled);
            let action = if resettable {
                let action = match &recovery.fallback_agent {
                    Some(fallback) if *fallback != stage.agent_id => {
                        stage.agent_id = fallback.clone();
                        RecoveryAction::Reassign {
                            agent_id: fallback.clone(),
                        }
                    }
                    _ => RecoveryAction::Reset,
                };
                stage.reset();
                action
            } else {
                let mut dependents = Vec::new();
                for d in handle.graph.transitive_dependents(idx) {
                    let dependent = &mut wf.stages[d];
                    if dependent.state.is_terminal() || dependent.state == StageState::Running {
                        continue;
                    }
                    dependent.fail(
                        StageState::Failed,
                        FailureKind::DependencyFailed,
                        format!("dependency {stage_id} failed"),
                    );
                    events.push(EventPayload::StageFailed {
                        workflow_id: workflow_id.clone(),
                        stage_id: dependent.id.clone(),
                        kind: FailureKind::DependencyFailed,
                        error: format!("dependency {stage_id} failed"),
                    });
                    dependents.push(dependent.id.clone());
                }
                RecoveryAction::Cascade { dependents }
            };

            let _ = wf.unresolved_failures.remove(stage_id);
            info!(?action, "stage failure handled");
            events.push(EventPayload::StageRecovery {
                workflow_id: workflow_id.clone(),
                stage_id: stage_id.clone(),
                action: action.clone(),
            });

            if wf.exceeds_error_threshold() {
                let reason = threshold_reason(wf);
                events.extend(abort(wf, &handle.graph, reason));
            } else if wf.unresolved_failures.is_empty() && wf.state == WorkflowState::Recovering {
                if wf.all_stages_terminal() {
                    advance(wf, WorkflowState::Completed);
                    events.push(EventPayload::WorkflowCompleted {
                        workflow_id: workflow_id.clone(),
                        stages_completed: wf.count_in(StageState::Completed),
                        stages_failed: wf.count_in(StageState::Failed),
                    });
                } else {
                    advance(wf, WorkflowState::Running);
                    events.push(EventPayload::WorkflowResumed {
                        workflow_id: workflow_id.clone(),
                    });
                }
            }
            action
        };
        self.metrics.counter("scheduler.stage.recoveries", &[], 1);
        self.emitter.emit_all(events).await;
        Ok(action)
    }

    /// Skip every stage that has not started and stop retries. Stages already
    /// executing run to completion; the workflow then settles in `failed`.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn cancel_workflow(&self, workflow_id: &WorkflowId) -> Result<Workflow> {
        let handle = self.handle(workflow_id)?;
        let mut events = Vec::new();
        let snapshot = {
            let mut guard = handle.record.write();
            let wf = &mut *guard;
            if wf.state.is_terminal() {
                return Err(EngineError::InvalidState {
                    workflow_id: workflow_id.clone(),
                    state: wf.state,
                    operation: "cancel",
                });
            }
            if !wf.cancelled {
                wf.cancelled = true;
                handle.cancel.cancel();
                for stage in wf.stages.iter_mut().filter(|s| s.state.is_unstarted()) {
                    stage.fail(StageState::Skipped, FailureKind::Cancelled, "workflow cancelled");
                    events.push(EventPayload::StageSkipped {
                        workflow_id: workflow_id.clone(),
                        stage_id: stage.id.clone(),
                        kind: FailureKind::Cancelled,
                    });
                }
                events.push(EventPayload::WorkflowCancelled {
                    workflow_id: workflow_id.clone(),
                });

                let idle = !handle.executing.load(Ordering::SeqCst)
                    && wf.count_in(StageState::Running) == 0;
                if idle {
                    events.extend(abort(wf, &handle.graph, "workflow cancelled".into()));
                }
                info!(idle, "workflow cancelled");
            }
            wf.clone()
        };
        self.emitter.emit_all(events).await;
        Ok(snapshot)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Whether `requested` fits the workflow's remaining budget right now.
    /// Reserves nothing.
    pub fn validate_resource_allocation(
        &self,
        workflow_id: &WorkflowId,
        requested: ResourceRequirements,
    ) -> Result<bool> {
        Ok(self.handle(workflow_id)?.ledger.would_fit(requested))
    }

    pub fn allocated_resources(&self, workflow_id: &WorkflowId) -> Result<ResourceRequirements> {
        Ok(self.handle(workflow_id)?.ledger.allocated())
    }

    pub fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Workflow> {
        Ok(self.handle(workflow_id)?.record.read().clone())
    }

    pub fn get_workflow_metrics(&self, workflow_id: &WorkflowId) -> Result<WorkflowMetrics> {
        Ok(self.handle(workflow_id)?.record.read().metrics())
    }

    /// Topological layers of the workflow's stages.
    pub fn execution_plan(&self, workflow_id: &WorkflowId) -> Result<Vec<Vec<StageId>>> {
        Ok(self.handle(workflow_id)?.graph.levels())
    }

    /// All workflows, oldest first.
    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let handles: Vec<Arc<WorkflowHandle>> = self
            .workflows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut summaries: Vec<WorkflowSummary> = handles
            .iter()
            .map(|handle| {
                let wf = handle.record.read();
                WorkflowSummary {
                    workflow_id: wf.id.clone(),
                    state: wf.state,
                    stages_total: wf.stages.len(),
                    stages_completed: wf.count_in(StageState::Completed),
                    stages_failed: wf.count_in(StageState::Failed),
                    created_at: wf.created_at,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        summaries
    }

    /// Drop a terminal workflow. Returns `false` if it did not exist.
    pub fn remove_workflow(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let Ok(handle) = self.handle(workflow_id) else {
            return Ok(false);
        };
        let state = handle.record.read().state;
        if !state.is_terminal() {
            return Err(EngineError::InvalidState {
                workflow_id: workflow_id.clone(),
                state,
                operation: "remove",
            });
        }
        Ok(self.workflows.remove(workflow_id).is_some())
    }
}

fn threshold_reason(wf: &Workflow) -> String {
    format!(
        "{} of {} stages failed, above error threshold {}",
        wf.count_in(StageState::Failed),
        wf.stages.len(),
        wf.config.error_threshold
    )
}

/// Apply a lifecycle edge the caller has already checked.
fn advance(wf: &mut Workflow, next: WorkflowState) {
    if let Err(e) = wf.transition_to(next) {
        error!(error = %e, error_kind = e.error_kind(), "workflow transition refused");
    }
}

/// Move the workflow to `failed`, skipping every stage that has not started.
/// Stages downstream of a failed stage are skipped as `dependency_failed`,
/// the rest as `workflow_aborted`. Stages already running are left to finish.
fn abort(wf: &mut Workflow, graph: &StageGraph, reason: String) -> Vec<EventPayload> {
    let blocked: HashSet<usize> = wf
        .stages
        .iter()
        .enumerate()
        .filter(|(_, stage)| stage.state == StageState::Failed)
        .flat_map(|(idx, _)| graph.transitive_dependents(idx))
        .collect();

    let mut events = Vec::new();
    for (idx, stage) in wf.stages.iter_mut().enumerate() {
        if !stage.state.is_unstarted() {
            continue;
        }
        let (kind, message) = if blocked.contains(&idx) {
            (FailureKind::DependencyFailed, "dependency failed before stage started")
        } else {
            (FailureKind::WorkflowAborted, "workflow failed before stage started")
        };
        stage.fail(StageState::Skipped, kind, message);
        events.push(EventPayload::StageSkipped {
            workflow_id: wf.id.clone(),
            stage_id: stage.id.clone(),
            kind,
        });
    }
    warn!(workflow_id = %wf.id, reason = %reason, "workflow failed");
    advance(wf, WorkflowState::Failed);
    wf.failure_reason = Some(reason.clone());
    events.push(EventPayload::WorkflowFailed {
        workflow_id: wf.id.clone(),
        reason,
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use maestro_core::{AgentId, BreakerPolicy, StageError};
    use serde_json::{Value, json};

    use crate::executor::StageInvocation;

    /// Echoes the stage id; fails stages whose config says so.
    struct EchoExecutor;

    #[async_trait]
    impl StageExecutor for EchoExecutor {
        async fn execute_stage(
            &self,
            _agent_id: &AgentId,
            invocation: &StageInvocation,
        ) -> std::result::Result<Value, StageError> {
            if invocation.config.get("fail").and_then(Value::as_bool) == Some(true) {
                return Err(StageError::fatal("configured to fail"));
            }
            Ok(json!({ "stage": invocation.stage_id.as_str() }))
        }
    }

    fn scheduler() -> WorkflowScheduler {
        let bus = Arc::new(EventBus::new(&BreakerPolicy::default()));
        WorkflowScheduler::new(bus, Arc::new(EchoExecutor))
    }

    fn quick_config() -> WorkflowConfig {
        WorkflowConfig {
            backoff: maestro_core::BackoffPolicy::immediate(),
            ..WorkflowConfig::default()
        }
    }

    fn failing(id: &str) -> StageSpec {
        StageSpec::new(id, "agent_a").with_config(json!({ "fail": true }))
    }

    #[tokio::test]
    async fn create_then_execute_linear_chain() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_chain");
        let wf = s
            .create_workflow(
                id.clone(),
                vec![
                    StageSpec::new("a", "agent_a"),
                    StageSpec::new("b", "agent_a").depends_on(["a"]),
                ],
                quick_config(),
            )
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Pending);

        let done = s.execute_workflow(&id).await.unwrap();
        assert_eq!(done.state, WorkflowState::Completed);
        assert_eq!(done.stage(&StageId::from("b")).unwrap().output, Some(json!({"stage": "b"})));
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_workflow_id_rejected() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_dup");
        let _ = s
            .create_workflow(id.clone(), vec![StageSpec::new("a", "x")], quick_config())
            .await
            .unwrap();
        assert_matches!(
            s.create_workflow(id, vec![StageSpec::new("a", "x")], quick_config()).await,
            Err(EngineError::Validation(_))
        );
    }

    #[tokio::test]
    async fn oversized_stage_rejected_without_side_effects() {
        let s = scheduler();
        let config = WorkflowConfig {
            max_resource_budget: ResourceRequirements::memory(512),
            ..quick_config()
        };
        let id = WorkflowId::from_raw("wf_big");
        let err = s
            .create_workflow(
                id.clone(),
                vec![StageSpec::new("huge", "x").with_resources(ResourceRequirements::memory(1024))],
                config,
            )
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::ResourceExceeded { stage_id: Some(ref sid), .. } if sid.as_str() == "huge");
        assert_matches!(s.get_workflow(&id), Err(EngineError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn strict_frontier_budget_checks_layers() {
        let s = scheduler();
        let config = WorkflowConfig {
            max_resource_budget: ResourceRequirements::memory(1024),
            strict_frontier_budget: true,
            ..quick_config()
        };
        let err = s
            .create_workflow(
                WorkflowId::from_raw("wf_wide"),
                vec![
                    StageSpec::new("a", "x").with_resources(ResourceRequirements::memory(600)),
                    StageSpec::new("b", "x").with_resources(ResourceRequirements::memory(600)),
                ],
                config,
            )
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::ResourceExceeded { stage_id: None, .. });
    }

    #[tokio::test]
    async fn executing_terminal_workflow_is_invalid() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_twice");
        let _ = s
            .create_workflow(id.clone(), vec![StageSpec::new("a", "x")], quick_config())
            .await
            .unwrap();
        let _ = s.execute_workflow(&id).await.unwrap();
        assert_matches!(
            s.execute_workflow(&id).await,
            Err(EngineError::InvalidState { state: WorkflowState::Completed, .. })
        );
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_missing");
        assert_matches!(s.execute_workflow(&id).await, Err(EngineError::WorkflowNotFound(_)));
        assert_matches!(
            s.validate_resource_allocation(&id, ResourceRequirements::ZERO),
            Err(EngineError::WorkflowNotFound(_))
        );
        assert!(!s.remove_workflow(&id).unwrap());
    }

    #[tokio::test]
    async fn single_failure_below_threshold_waits_for_recovery() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_recover");
        let config = WorkflowConfig {
            error_threshold: 0.5,
            ..quick_config()
        };
        let _ = s
            .create_workflow(
                id.clone(),
                vec![
                    StageSpec::new("ok", "x"),
                    failing("bad"),
                    StageSpec::new("after", "x").depends_on(["bad"]),
                ],
                config,
            )
            .await
            .unwrap();

        let wf = s.execute_workflow(&id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Recovering);
        assert!(wf.unresolved_failures.contains(&StageId::from("bad")));
        assert_eq!(wf.stage(&StageId::from("after")).unwrap().state, StageState::Pending);

        // Reset budget is 1 by default: the first call resets, the stage
        // fails again, and the second call cascades.
        let action = s.handle_stage_failure(&id, &StageId::from("bad"), "retry it").await.unwrap();
        assert_eq!(action, RecoveryAction::Reset);
        let wf = s.execute_workflow(&id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Recovering);
        assert_eq!(wf.stage(&StageId::from("bad")).unwrap().error_history.len(), 1);

        let action = s.handle_stage_failure(&id, &StageId::from("bad"), "give up").await.unwrap();
        assert_eq!(
            action,
            RecoveryAction::Cascade {
                dependents: vec![StageId::from("after")]
            }
        );
        let wf = s.get_workflow(&id).unwrap();
        assert_eq!(wf.state, WorkflowState::Failed, "2 of 3 failed exceeds 0.5");
        let after = wf.stage(&StageId::from("after")).unwrap();
        assert_eq!(after.error.as_ref().unwrap().kind, FailureKind::DependencyFailed);
    }

    #[tokio::test]
    async fn handle_stage_failure_rejects_non_failed_stage() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_guard");
        let _ = s
            .create_workflow(
                id.clone(),
                vec![StageSpec::new("a", "x"), StageSpec::new("b", "x")],
                quick_config(),
            )
            .await
            .unwrap();
        assert_matches!(
            s.handle_stage_failure(&id, &StageId::from("a"), "nope").await,
            Err(EngineError::InvalidStageState { state: StageState::Pending, .. })
        );
        assert_matches!(
            s.handle_stage_failure(&id, &StageId::from("zzz"), "nope").await,
            Err(EngineError::StageNotFound { .. })
        );
    }

    #[tokio::test]
    async fn fallback_agent_takes_over_reset_stage() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_fallback");
        let mut config = quick_config();
        config.error_threshold = 0.9;
        config.recovery.fallback_agent = Some(AgentId::from_raw("agent_backup"));
        let _ = s
            .create_workflow(id.clone(), vec![StageSpec::new("ok", "x"), failing("bad")], config)
            .await
            .unwrap();
        let _ = s.execute_workflow(&id).await.unwrap();

        let action = s.handle_stage_failure(&id, &StageId::from("bad"), "switch").await.unwrap();
        assert_eq!(
            action,
            RecoveryAction::Reassign {
                agent_id: AgentId::from_raw("agent_backup")
            }
        );
        let wf = s.get_workflow(&id).unwrap();
        let bad = wf.stage(&StageId::from("bad")).unwrap();
        assert_eq!(bad.agent_id.as_str(), "agent_backup");
        assert_eq!(bad.state, StageState::Pending);
        assert_eq!(wf.state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn cancel_pending_workflow_fails_it_immediately() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_cancel");
        let _ = s
            .create_workflow(
                id.clone(),
                vec![StageSpec::new("a", "x"), StageSpec::new("b", "x").depends_on(["a"])],
                quick_config(),
            )
            .await
            .unwrap();
        let wf = s.cancel_workflow(&id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);
        assert!(wf.stages.iter().all(|st| st.state == StageState::Skipped));
        assert_eq!(wf.failure_reason.as_deref(), Some("workflow cancelled"));
        assert_matches!(s.cancel_workflow(&id).await, Err(EngineError::InvalidState { .. }));
        assert!(s.remove_workflow(&id).unwrap());
    }

    #[tokio::test]
    async fn lost_stage_task_releases_its_reservation() {
        let s = scheduler();
        let id = WorkflowId::from_raw("wf_lost");
        let config = WorkflowConfig {
            max_resource_budget: ResourceRequirements::memory(1024),
            ..quick_config()
        };
        let _ = s
            .create_workflow(
                id.clone(),
                vec![
                    StageSpec::new("a", "x").with_resources(ResourceRequirements::memory(600)),
                    StageSpec::new("b", "x").depends_on(["a"]),
                ],
                config,
            )
            .await
            .unwrap();
        let handle = s.handle(&id).unwrap();
        handle.record.write().transition_to(WorkflowState::Running).unwrap();
        let plans = admit_ready(&handle);
        assert_eq!(plans.len(), 1);
        assert_eq!(handle.ledger.allocated(), ResourceRequirements::memory(600));

        let run = StageRun::lost(plans[0].stage_id.clone(), plans[0].resources, "task aborted".into());
        s.driver().finish_stage(&handle, run).await;

        assert_eq!(handle.ledger.allocated(), ResourceRequirements::ZERO);
        let wf = s.get_workflow(&id).unwrap();
        let a = wf.stage(&StageId::from("a")).unwrap();
        assert_eq!(a.state, StageState::Failed);
        assert_eq!(a.error.as_ref().unwrap().kind, FailureKind::Fatal);
        assert_eq!(wf.state, WorkflowState::Failed);
        let b = wf.stage(&StageId::from("b")).unwrap();
        assert_eq!(b.state, StageState::Skipped);
        assert_eq!(b.error.as_ref().unwrap().kind, FailureKind::DependencyFailed);
    }

    #[tokio::test]
    async fn list_and_plan() {
        let s = scheduler();
        for name in ["wf_1", "wf_2"] {
            let _ = s
                .create_workflow(
                    WorkflowId::from_raw(name),
                    vec![StageSpec::new("a", "x"), StageSpec::new("b", "x").depends_on(["a"])],
                    quick_config(),
                )
                .await
                .unwrap();
        }
        let list = s.list_workflows();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|w| w.state == WorkflowState::Pending && w.stages_total == 2));

        let plan = s.execution_plan(&WorkflowId::from_raw("wf_1")).unwrap();
        assert_eq!(plan, vec![vec![StageId::from("a")], vec![StageId::from("b")]]);

        assert_matches!(
            s.remove_workflow(&WorkflowId::from_raw("wf_1")),
            Err(EngineError::InvalidState { .. })
        );
    }
}
