//! The unit-of-work contract.
//!
//! The engine never inspects a target's internals; it only needs the target
//! to be invokable with a JSON input, producing content and usage or an
//! `ExecutionError`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::ExecutionError;
use crate::types::StepOutput;

/// Core trait for invokable targets (agents, model ids, sub-services).
#[async_trait]
pub trait Agent: Send + Sync {
    /// Returns the agent ID.
    fn id(&self) -> &str;

    /// Execute one unit of work.
    async fn invoke(&self, input: Value) -> Result<StepOutput, ExecutionError>;
}

/// Registry resolving target ids to agents.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<dyn Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own id. Replaces any existing entry.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        self.agents.write().insert(agent.id().to_string(), agent);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(id).cloned()
    }

    /// Resolve an id or fail with `ExecutionError::Internal`.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Agent>, ExecutionError> {
        self.get(id)
            .ok_or_else(|| ExecutionError::Internal(format!("agent not registered: {}", id)))
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}
