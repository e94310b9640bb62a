use crate::AgentConfig;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Known agents keyed by address
#[derive(Debug, Default)]
pub struct AgentPool {
    agents: DashMap<SocketAddr, Arc<AgentConfig>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `agent`, replacing any agent already registered at its address
    ///
    /// Returns the replaced agent, if any.
    pub fn add(&self, agent: AgentConfig) -> Option<Arc<AgentConfig>> {
        let addr = agent.addr();
        let name = agent.name().to_string();
        let replaced = self.agents.insert(addr, Arc::new(agent));

        match &replaced {
            Some(old) => info!(agent = %name, %addr, replaced = %old.name(), "Agent replaced"),
            None => info!(agent = %name, %addr, "Agent added"),
        }
        replaced
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<AgentConfig>> {
        let removed = self.agents.remove(addr).map(|(_, agent)| agent);
        if let Some(agent) = &removed {
            debug!(agent = %agent.name(), %addr, "Agent removed");
        }
        removed
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<AgentConfig>> {
        self.agents.get(addr).map(|entry| entry.value().clone())
    }

    /// First agent with a matching name; names are not unique
    pub fn get_by_name(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.agents
            .iter()
            .find(|entry| entry.value().name() == name)
            .map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<AgentConfig>> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.agents.clear();
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
