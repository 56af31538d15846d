use std::sync::Arc;

use chrono::Utc;
use maestro_bus::{EventBus, EventHandler, Subscription};
use maestro_core::{
    AgentConfig, AgentId, AgentRegistration, CoordinatorPolicy, EngineError, Event, EventPayload,
    Permission, RecoveryAction, ResourceRequirements, Result, SecurityContext, SecurityVerdict,
    StageId, StageSpec, Workflow, WorkflowConfig, WorkflowId, WorkflowMetrics, WorkflowState,
};
use maestro_scheduler::{WorkflowScheduler, WorkflowSummary};
use maestro_telemetry::{MetricsSink, NoopMetrics};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::directory::AgentDirectory;
use crate::health::{HealthAggregator, HealthSnapshot};
use crate::monitor::WorkflowMonitor;
use crate::security::SecurityValidator;

/// Entry point tying agent identity and security to workflow execution.
///
/// Constructed once with explicit collaborators; cheap to share behind an
/// `Arc`.
pub struct AgentCoordinator {
    bus: Arc<EventBus>,
    scheduler: Arc<WorkflowScheduler>,
    directory: Arc<dyn AgentDirectory>,
    validator: Arc<dyn SecurityValidator>,
    policy: CoordinatorPolicy,
    health: Arc<HealthAggregator>,
    subscriptions: Mutex<Vec<Subscription>>,
    metrics: Arc<dyn MetricsSink>,
}

impl AgentCoordinator {
    pub fn new(
        bus: Arc<EventBus>,
        scheduler: Arc<WorkflowScheduler>,
        directory: Arc<dyn AgentDirectory>,
        validator: Arc<dyn SecurityValidator>,
        policy: CoordinatorPolicy,
    ) -> Self {
        let health = Arc::new(HealthAggregator::new(policy.violation_window()));
        Self {
            bus,
            scheduler,
            directory,
            validator,
            policy,
            health,
            subscriptions: Mutex::new(Vec::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }

    pub fn policy(&self) -> &CoordinatorPolicy {
        &self.policy
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Bind the health aggregator to the bus. Calling twice is a no-op.
    pub fn start(&self) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        let handler: Arc<dyn EventHandler> = self.health.clone();
        *subscriptions = self.bus.subscribe_many(&HealthAggregator::SUBSCRIBED, &handler);
        info!(subscriptions = subscriptions.len(), "coordinator started");
    }

    /// Unbind internal handlers. Once this returns none of them is running:
    /// new publishes no longer see them and in-flight publishes are drained.
    pub async fn stop(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        if subscriptions.is_empty() {
            return;
        }
        for subscription in subscriptions {
            let _ = self.bus.unsubscribe(subscription);
        }
        self.bus.drain().await;
        info!("coordinator stopped");
    }

    pub fn is_started(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Agents
    // ─────────────────────────────────────────────────────────────────────

    /// Register (or re-register) an agent.
    ///
    /// The context must validate and grant `RegisterAgent`; otherwise a
    /// security violation is published and `EngineError::Security` returned
    /// with the directory untouched.
    #[instrument(skip_all, fields(agent_id = %agent_id, principal = %security.principal))]
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        config: AgentConfig,
        security: SecurityContext,
    ) -> Result<AgentRegistration> {
        let verdict = self.validator.validate(&security).await;
        let verdict = if !verdict.valid {
            verdict
        } else if !security.grants(Permission::RegisterAgent)
            || !self
                .validator
                .validate_permission(&security.principal, Permission::RegisterAgent)
                .await
        {
            SecurityVerdict::deny("register_agent permission not granted")
        } else {
            verdict
        };
        if !verdict.valid {
            let reason = verdict.reason_or_default().to_string();
            self.report_violation(&security.principal, Some(&agent_id), &reason)
                .await;
            return Err(EngineError::Security(reason));
        }

        let registration = AgentRegistration {
            agent_id: agent_id.clone(),
            config,
            security,
            registered_at: Utc::now(),
        };
        let replaced = self.directory.insert(registration.clone()).is_some();
        info!(agent_type = %registration.config.agent_type, replaced, "agent registered");
        self.metrics.counter("coordinator.agents.registered", &[], 1);
        self.announce(EventPayload::AgentRegistered {
            agent_id,
            agent_type: registration.config.agent_type.clone(),
        })
        .await;
        Ok(registration)
    }

    /// Remove an agent. Returns whether it was registered; absent agents are
    /// not an error.
    #[instrument(skip_all, fields(agent_id = %agent_id))]
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> bool {
        if self.directory.remove(agent_id).is_none() {
            return false;
        }
        info!("agent deregistered");
        self.announce(EventPayload::AgentDeregistered {
            agent_id: agent_id.clone(),
        })
        .await;
        true
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<AgentRegistration> {
        self.directory.get(agent_id)
    }

    pub fn list_agents(&self) -> Vec<AgentRegistration> {
        self.directory.list()
    }

    /// Re-check a registered agent's stored context.
    ///
    /// Never errors: unknown agents and rejected contexts come back as a
    /// denied verdict (and are reported as security violations).
    pub async fn validate_security(&self, agent_id: &AgentId) -> SecurityVerdict {
        let Some(registration) = self.directory.get(agent_id) else {
            let verdict = SecurityVerdict::deny(format!("agent {agent_id} is not registered"));
            self.report_violation("unknown", Some(agent_id), verdict.reason_or_default())
                .await;
            return verdict;
        };
        let verdict = self.validator.validate(&registration.security).await;
        if !verdict.valid {
            self.report_violation(
                &registration.security.principal,
                Some(agent_id),
                verdict.reason_or_default(),
            )
            .await;
        }
        verdict
    }

    /// Whether `context` may perform `permission`, per the context itself and
    /// the validator.
    pub async fn check_permission(
        &self,
        context: &SecurityContext,
        permission: Permission,
    ) -> SecurityVerdict {
        let verdict = self.validator.validate(context).await;
        if !verdict.valid {
            return verdict;
        }
        if context.grants(permission)
            && self
                .validator
                .validate_permission(&context.principal, permission)
                .await
        {
            SecurityVerdict::allow()
        } else {
            SecurityVerdict::deny(format!("{} permission not granted", permission.as_str()))
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Workflows
    // ─────────────────────────────────────────────────────────────────────

    /// Create a workflow through the scheduler. With
    /// `require_registered_agents`, every stage agent and the fallback agent
    /// must be registered.
    pub async fn create_workflow(
        &self,
        workflow_id: WorkflowId,
        stages: Vec<StageSpec>,
        config: WorkflowConfig,
    ) -> Result<Workflow> {
        if self.policy.require_registered_agents {
            let fallback = config.recovery.fallback_agent.iter();
            if let Some(missing) = stages
                .iter()
                .map(|s| &s.agent_id)
                .chain(fallback)
                .find(|agent| !self.directory.contains(agent))
            {
                return Err(EngineError::validation(format!(
                    "agent {missing} is not registered"
                )));
            }
        }
        self.scheduler.create_workflow(workflow_id, stages, config).await
    }

    /// Execute a workflow, applying automatic recovery rounds when enabled.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn execute_workflow(&self, workflow_id: &WorkflowId) -> Result<Workflow> {
        let mut workflow = self.scheduler.execute_workflow(workflow_id).await?;
        let mut round = 0;
        while workflow.state == WorkflowState::Recovering
            && self.policy.auto_recover
            && round < self.policy.max_recovery_rounds
        {
            round += 1;
            let failed: Vec<StageId> = workflow.unresolved_failures.iter().cloned().collect();
            info!(round, failed = failed.len(), "automatic recovery round");
            for stage_id in &failed {
                let message = format!("automatic recovery round {round}");
                match self
                    .scheduler
                    .handle_stage_failure(workflow_id, stage_id, message)
                    .await
                {
                    Ok(action) => {
                        self.metrics.counter(
                            "coordinator.recovery.actions",
                            &[("action", recovery_label(&action))],
                            1,
                        );
                    }
                    Err(EngineError::InvalidState { .. }) => break,
                    Err(e) => return Err(e),
                }
            }

            workflow = self.scheduler.get_workflow(workflow_id)?;
            if workflow.state.is_terminal() {
                break;
            }
            workflow = self.scheduler.execute_workflow(workflow_id).await?;
        }
        Ok(workflow)
    }

    pub async fn handle_stage_failure(
        &self,
        workflow_id: &WorkflowId,
        stage_id: &StageId,
        error: impl Into<String>,
    ) -> Result<RecoveryAction> {
        self.scheduler
            .handle_stage_failure(workflow_id, stage_id, error)
            .await
    }

    pub async fn cancel_workflow(&self, workflow_id: &WorkflowId) -> Result<Workflow> {
        self.scheduler.cancel_workflow(workflow_id).await
    }

    /// Subscribe to one workflow's events.
    pub fn monitor_workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowMonitor> {
        let _ = self.scheduler.get_workflow(workflow_id)?;
        Ok(WorkflowMonitor::attach(Arc::clone(&self.bus), workflow_id.clone()))
    }

    pub fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Workflow> {
        self.scheduler.get_workflow(workflow_id)
    }

    pub fn get_workflow_metrics(&self, workflow_id: &WorkflowId) -> Result<WorkflowMetrics> {
        self.scheduler.get_workflow_metrics(workflow_id)
    }

    pub fn validate_resource_allocation(
        &self,
        workflow_id: &WorkflowId,
        requested: ResourceRequirements,
    ) -> Result<bool> {
        self.scheduler
            .validate_resource_allocation(workflow_id, requested)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.scheduler.list_workflows()
    }

    pub fn remove_workflow(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let removed = self.scheduler.remove_workflow(workflow_id)?;
        if removed {
            self.health.forget(workflow_id);
        }
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Health
    // ─────────────────────────────────────────────────────────────────────

    /// Point-in-time health. Reads counters only; never waits on execution.
    pub fn check_health(&self) -> HealthSnapshot {
        let breaker = self.bus.get_metrics().breaker;
        let counts = self.health.workflow_counts();
        let security_violations = self.health.recent_violations();
        let status = HealthSnapshot::status_for(&breaker, counts.recovering, security_violations);
        self.metrics
            .gauge("coordinator.health.violations", &[], security_violations as f64);
        HealthSnapshot {
            status,
            breaker,
            agents_registered: self.directory.len(),
            workflows_running: counts.running,
            workflows_recovering: counts.recovering,
            workflows_failed: counts.failed,
            workflows_completed: counts.completed,
            security_violations,
            checked_at: Utc::now(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    async fn report_violation(&self, principal: &str, agent_id: Option<&AgentId>, reason: &str) {
        warn!(principal, agent_id = ?agent_id.map(AgentId::as_str), reason, "security violation");
        self.metrics.counter("coordinator.security.violations", &[], 1);
        self.announce(EventPayload::SecurityViolation {
            principal: principal.to_string(),
            agent_id: agent_id.cloned(),
            reason: reason.to_string(),
        })
        .await;
    }

    async fn announce(&self, payload: EventPayload) {
        let event_type = payload.event_type();
        if let Err(e) = self.bus.publish(Event::new(payload)).await {
            warn!(
                event_type = event_type.as_str(),
                error = %e,
                error_kind = e.error_kind(),
                retryable = e.is_retryable(),
                "event dropped"
            );
            self.metrics.counter(
                "coordinator.events.dropped",
                &[("event_type", event_type.as_str()), ("error_kind", e.error_kind())],
                1,
            );
        }
    }
}

fn recovery_label(action: &RecoveryAction) -> &'static str {
    match action {
        RecoveryAction::Reset => "reset",
        RecoveryAction::Reassign { .. } => "reassign",
        RecoveryAction::Cascade { .. } => "cascade",
    }
}
