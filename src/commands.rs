//! `plan` and `run` over a workflow declaration.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use maestro_bus::{BusMetrics, EventBus};
use maestro_coordinator::{
    AgentCoordinator, HealthSnapshot, InMemoryAgentDirectory, SecurityValidator,
    TokenSecurityValidator,
};
use maestro_core::{
    EngineError, Event, ResourceRequirements, Role, StageId, Workflow, WorkflowId, WorkflowMetrics,
};
use maestro_scheduler::{StageGraph, WorkflowScheduler};
use maestro_settings::{MaestroSettings, MetricsBackend};
use maestro_telemetry::{FacadeMetrics, MetricsRecorder, MetricsReport, MetricsSink, NoopMetrics};
use serde::Serialize;
use tracing::info;

use crate::declaration::WorkflowDeclaration;
use crate::simulate::SimulatedExecutor;

/// Lifetime of tokens issued to declared agents.
const AGENT_TOKEN_TTL_HOURS: i64 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// plan
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PlanLevel {
    pub stages: Vec<StageId>,
    pub resources: ResourceRequirements,
    /// Combined requirement exceeds the budget, so some stages will queue.
    pub serialized: bool,
}

#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub workflow_id: WorkflowId,
    pub budget: ResourceRequirements,
    pub levels: Vec<PlanLevel>,
}

/// Validate the declaration and lay its stages out in topological levels.
pub fn plan(decl: &WorkflowDeclaration, settings: &MaestroSettings) -> Result<PlanReport> {
    let config = decl.workflow_config(&settings.workflow)?;
    let graph = StageGraph::build(&decl.stages).context("Invalid stage graph")?;
    let budget = config.max_resource_budget;

    if let Some(stage) = decl
        .stages
        .iter()
        .find(|stage| !stage.resources.fits_within(&budget))
    {
        anyhow::bail!(
            "stage {} needs {} but the workflow budget is {budget}",
            stage.id,
            stage.resources
        );
    }

    let levels = graph
        .levels()
        .into_iter()
        .zip(graph.level_requirements(&decl.stages))
        .map(|(stages, resources)| PlanLevel {
            stages,
            resources,
            serialized: !resources.fits_within(&budget),
        })
        .collect();

    Ok(PlanReport {
        workflow_id: decl.id.clone(),
        budget,
        levels,
    })
}

impl PlanReport {
    pub fn render_text(&self) -> String {
        let mut out = format!("workflow {} (budget {})\n", self.workflow_id, self.budget);
        for (index, level) in self.levels.iter().enumerate() {
            let names: Vec<&str> = level.stages.iter().map(StageId::as_str).collect();
            let _ = write!(out, "  level {index}: {} [{}]", names.join(", "), level.resources);
            if level.serialized {
                out.push_str(" (over budget, stages will queue)");
            }
            out.push('\n');
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub workflow: Workflow,
    pub metrics: WorkflowMetrics,
    pub health: HealthSnapshot,
    pub bus: BusMetrics,
    /// Events the workflow emitted after it was created, in order.
    pub events: Vec<Event>,
    /// Present when the in-memory metrics backend is selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_metrics: Option<MetricsReport>,
}

fn metrics_sink(backend: MetricsBackend) -> (Arc<dyn MetricsSink>, Option<Arc<MetricsRecorder>>) {
    match backend {
        MetricsBackend::Memory => {
            let recorder = Arc::new(MetricsRecorder::new());
            let sink: Arc<dyn MetricsSink> = Arc::clone(&recorder) as Arc<dyn MetricsSink>;
            (sink, Some(recorder))
        }
        MetricsBackend::Facade => (Arc::new(FacadeMetrics), None),
        MetricsBackend::Disabled => (Arc::new(NoopMetrics), None),
    }
}

/// Run the declaration end to end against the simulated executor.
///
/// Every agent the workflow references is registered with a freshly issued
/// worker token before the workflow is created.
pub async fn run(decl: &WorkflowDeclaration, settings: &MaestroSettings) -> Result<RunReport> {
    let config = decl.workflow_config(&settings.workflow)?;
    let (sink, recorder) = metrics_sink(settings.metrics.backend);

    let bus = Arc::new(EventBus::new(&settings.bus).with_metrics(Arc::clone(&sink)));
    let scheduler = Arc::new(
        WorkflowScheduler::new(Arc::clone(&bus), Arc::new(SimulatedExecutor::new()))
            .with_metrics(Arc::clone(&sink)),
    );
    let tokens = Arc::new(TokenSecurityValidator::new());
    let validator: Arc<dyn SecurityValidator> = Arc::clone(&tokens) as Arc<dyn SecurityValidator>;
    let coordinator = AgentCoordinator::new(
        bus,
        scheduler,
        Arc::new(InMemoryAgentDirectory::new()),
        validator,
        settings.coordinator.clone(),
    )
    .with_metrics(sink);
    coordinator.start();

    for agent in decl.agents_to_register(&config) {
        let context = tokens.issue(
            format!("maestro-cli:{}", agent.id),
            Role::Worker.permissions(),
            chrono::Duration::hours(AGENT_TOKEN_TTL_HOURS),
        );
        coordinator
            .register_agent(agent.id.clone(), agent.config, context)
            .await
            .with_context(|| format!("Failed to register agent {}", agent.id))?;
    }

    let _ = coordinator
        .create_workflow(decl.id.clone(), decl.stages.clone(), config)
        .await
        .with_context(|| format!("Failed to create workflow {}", decl.id))?;
    let mut monitor = coordinator.monitor_workflow(&decl.id)?;
    info!(workflow_id = %decl.id, stages = decl.stages.len(), "running workflow");

    let workflow = coordinator
        .execute_workflow(&decl.id)
        .await
        .with_context(|| format!("Failed to execute workflow {}", decl.id))?;

    let events = monitor.drain_buffered();
    drop(monitor);
    let health = coordinator.check_health();
    let bus_metrics = coordinator.bus().get_metrics();
    coordinator.stop().await;

    Ok(RunReport {
        metrics: workflow.metrics(),
        workflow,
        health,
        bus: bus_metrics,
        events,
        engine_metrics: recorder.map(|r| r.report()),
    })
}

impl RunReport {
    pub fn render_text(&self) -> String {
        let wf = &self.workflow;
        let m = &self.metrics;
        let mut out = format!(
            "workflow {}: {} ({}/{} stages completed, {} failed, {} attempts, {} retries)\n",
            wf.id,
            wf.state.as_str(),
            m.stages_completed,
            m.stages_total,
            m.stages_failed,
            m.total_attempts,
            m.total_retries,
        );
        if let Some(reason) = &wf.failure_reason {
            let _ = writeln!(out, "  reason: {reason}");
        }
        for stage in &wf.stages {
            let _ = write!(
                out,
                "  {:<20} {:<10} agent={} attempts={} latency={}ms",
                stage.id.as_str(),
                stage.state.as_str(),
                stage.agent_id,
                stage.attempts,
                stage.latency_ms,
            );
            match wf.stage_result(&stage.id) {
                Ok(output) => {
                    let _ = write!(out, " output={output}");
                }
                Err(err @ EngineError::StageExecution { .. }) => {
                    let kind = stage.error.as_ref().map_or("unknown", |e| e.kind.as_str());
                    let _ = write!(out, " error=\"{err}\" ({kind})");
                }
                Err(_) => {}
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "health: {} (breaker {:?}, {} events published)",
            self.health.status.as_str(),
            self.bus.breaker.state,
            self.bus.published,
        );
        out
    }
}
