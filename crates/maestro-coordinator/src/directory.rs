use dashmap::DashMap;
use maestro_core::{AgentId, AgentRegistration};

/// Storage for agent registrations.
///
/// The coordinator only needs keyed insert/remove/lookup; persistent
/// implementations live outside the engine.
pub trait AgentDirectory: Send + Sync {
    /// Store a registration, returning the one it replaced.
    fn insert(&self, registration: AgentRegistration) -> Option<AgentRegistration>;
    fn remove(&self, agent_id: &AgentId) -> Option<AgentRegistration>;
    fn get(&self, agent_id: &AgentId) -> Option<AgentRegistration>;
    fn list(&self) -> Vec<AgentRegistration>;
    fn len(&self) -> usize;

    fn contains(&self, agent_id: &AgentId) -> bool {
        self.get(agent_id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAgentDirectory {
    agents: DashMap<AgentId, AgentRegistration>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentDirectory for InMemoryAgentDirectory {
    fn insert(&self, registration: AgentRegistration) -> Option<AgentRegistration> {
        self.agents.insert(registration.agent_id.clone(), registration)
    }

    fn remove(&self, agent_id: &AgentId) -> Option<AgentRegistration> {
        self.agents.remove(agent_id).map(|(_, registration)| registration)
    }

    fn get(&self, agent_id: &AgentId) -> Option<AgentRegistration> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Sorted by agent id.
    fn list(&self) -> Vec<AgentRegistration> {
        let mut all: Vec<AgentRegistration> =
            self.agents.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    fn len(&self) -> usize {
        self.agents.len()
    }
}
