//! JSON workflow declarations read by the CLI.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use maestro_core::{AgentConfig, AgentId, StageSpec, WorkflowConfig, WorkflowId};
use maestro_settings::deep_merge;
use serde::Deserialize;
use serde_json::Value;

/// A workflow file: its id, config overrides, agents and stages.
///
/// ```json
/// {
///   "id": "nightly_report",
///   "config": { "error_threshold": 0.5 },
///   "agents": [{ "id": "fetcher", "agent_type": "http" }],
///   "stages": [{ "id": "fetch", "agent_id": "fetcher" }]
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowDeclaration {
    pub id: WorkflowId,
    /// Deep-merged over the settings' workflow defaults.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub agents: Vec<AgentDeclaration>,
    pub stages: Vec<StageSpec>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentDeclaration {
    pub id: AgentId,
    #[serde(flatten)]
    pub config: AgentConfig,
}

impl WorkflowDeclaration {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow file {}", path.display()))
    }

    /// Effective workflow config: `defaults` with this file's overrides.
    pub fn workflow_config(&self, defaults: &WorkflowConfig) -> Result<WorkflowConfig> {
        let base = serde_json::to_value(defaults).context("Failed to encode workflow defaults")?;
        let merged = deep_merge(base, self.config.clone());
        let config: WorkflowConfig =
            serde_json::from_value(merged).context("Invalid workflow config")?;
        config.validate().context("Invalid workflow config")?;
        Ok(config)
    }

    /// Declared agents followed by any agent that stages or the fallback
    /// policy reference without declaring. Undeclared agents get the
    /// `simulated` type.
    pub fn agents_to_register(&self, config: &WorkflowConfig) -> Vec<AgentDeclaration> {
        let mut agents = self.agents.clone();
        let mut seen: BTreeSet<AgentId> = agents.iter().map(|a| a.id.clone()).collect();
        let referenced = self
            .stages
            .iter()
            .map(|stage| &stage.agent_id)
            .chain(config.recovery.fallback_agent.as_ref());
        for agent_id in referenced {
            if seen.insert(agent_id.clone()) {
                agents.push(AgentDeclaration {
                    id: agent_id.clone(),
                    config: AgentConfig::new("simulated"),
                });
            }
        }
        agents
    }
}
