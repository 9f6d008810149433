//! Live directory of worker processes. Transient and in-memory by design:
//! crash recovery goes through the Bead's lock timeout, not through this
//! table surviving a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub task_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentRegistration>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, agent_id: &str, pid: u32, task_id: &str) {
        let now = Utc::now();
        self.agents.lock().unwrap().insert(
            agent_id.to_string(),
            AgentRegistration {
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                pid,
                started_at: now,
                last_heartbeat: now,
            },
        );
    }

    pub fn update_heartbeat(&self, agent_id: &str) {
        if let Some(entry) = self.agents.lock().unwrap().get_mut(agent_id) {
            entry.last_heartbeat = Utc::now();
        }
    }

    pub fn unregister(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.lock().unwrap().remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.lock().unwrap().get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentRegistration> {
        self.agents.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
