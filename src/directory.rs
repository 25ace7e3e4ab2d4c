//! Address directory: the naming authority hosted by the main container.
//!
//! Assigns container and agent identifiers and resolves an agent to the
//! address of the container that owns it. All mutations go through one lock.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::protocol::{AgentId, ContainerId};

#[derive(Debug, Default)]
struct Registries {
    /// containerID -> address
    containers: HashMap<ContainerId, String>,
    /// agentID -> owning containerID
    agents: HashMap<AgentId, ContainerId>,
    max_container_id: ContainerId,
    max_agent_id: AgentId,
    /// Released agent ids, reused oldest first.
    free_agent_ids: VecDeque<AgentId>,
}

/// Directory instance owned by the main container.
#[derive(Debug, Default)]
pub struct AddressDirectory {
    inner: Mutex<Registries>,
}

impl AddressDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container address and return its new identifier.
    pub fn register_container(&self, address: &str) -> ContainerId {
        let mut registries = self.inner.lock();
        registries.max_container_id += 1;
        let id = registries.max_container_id;
        registries.containers.insert(id, address.to_string());
        tracing::debug!(container_id = id, address, "Registered container");
        id
    }

    /// Allocate an agent identifier owned by `container_id`.
    pub fn register_agent(&self, container_id: ContainerId) -> Result<AgentId> {
        let mut registries = self.inner.lock();
        if !registries.containers.contains_key(&container_id) {
            return Err(Error::NotFound(format!("container {}", container_id)));
        }

        let id = match registries.free_agent_ids.pop_front() {
            Some(id) => id,
            None => {
                registries.max_agent_id += 1;
                registries.max_agent_id
            }
        };
        registries.agents.insert(id, container_id);
        tracing::debug!(agent_id = id, container_id, "Registered agent");
        Ok(id)
    }

    /// Address of the container owning `agent_id`.
    pub fn resolve_agent_address(&self, agent_id: AgentId) -> Result<String> {
        let registries = self.inner.lock();
        let container_id = registries
            .agents
            .get(&agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        registries
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {}", container_id)))
    }

    /// Forget an agent and make its id available for reuse. This is the only
    /// way an id is ever handed out twice.
    pub fn release_agent(&self, agent_id: AgentId) -> Result<()> {
        let mut registries = self.inner.lock();
        if registries.agents.remove(&agent_id).is_none() {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }
        registries.free_agent_ids.push_back(agent_id);
        tracing::debug!(agent_id, "Released agent id");
        Ok(())
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().agents.len()
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }
}
