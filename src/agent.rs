//! Agent registry and the generic invocation seam.
//!
//! Every concrete worker capability (scanning, diffing, exporting, ...)
//! is an opaque implementor of [`AgentInvoker`]. The core never inspects
//! payload or output semantics; it only routes, times, and records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::FleetError;
use crate::versioning::SemVer;

/// Unique identifier for a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a fresh unique agent ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared capability traits of an agent, relevant to coordination
/// decisions (not to what the agent actually computes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTag {
    /// The agent writes to shared files; parallel runs may interfere
    /// unless isolated per-task workspaces are used.
    MutatesSharedFiles,
    /// The agent only reads its inputs.
    ReadOnly,
    /// The agent calls out to external network services.
    NetworkBound,
}

/// A registered worker agent.
///
/// Agents are registered once and never deleted, only marked retired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub version: SemVer,
    pub capability_tags: Vec<CapabilityTag>,
    pub retired: bool,
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat seen, if any. Liveness tracking itself lives in the
    /// health monitor; this field is informational.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(name: impl Into<String>, version: SemVer, tags: Vec<CapabilityTag>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            version,
            capability_tags: tags,
            retired: false,
            registered_at: Utc::now(),
            last_heartbeat: None,
        }
    }

    /// Whether parallel runs of this agent can corrupt shared state.
    pub fn mutates_shared_files(&self) -> bool {
        self.capability_tags
            .iter()
            .any(|t| matches!(t, CapabilityTag::MutatesSharedFiles))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Thread-safe agent table, injected into every component that needs it.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentId, Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent, returning its ID.
    pub async fn register(&self, agent: Agent) -> AgentId {
        let id = agent.id;
        let mut agents = self.agents.write().await;
        tracing::info!(agent_id = %id, name = %agent.name, version = %agent.version, "Agent registered");
        agents.insert(id, agent);
        id
    }

    pub async fn get(&self, id: AgentId) -> Option<Agent> {
        self.agents.read().await.get(&id).cloned()
    }

    /// Mark an agent retired. Retired agents stay in the table.
    pub async fn retire(&self, id: AgentId) -> Result<(), FleetError> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&id) {
            Some(agent) => {
                agent.retired = true;
                tracing::info!(agent_id = %id, name = %agent.name, "Agent retired");
                Ok(())
            }
            None => Err(FleetError::UnknownAgent { agent_id: id }),
        }
    }

    /// Record the in-table heartbeat timestamp.
    pub async fn touch_heartbeat(&self, id: AgentId) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(&id) {
            agent.last_heartbeat = Some(Utc::now());
        }
    }

    /// Update the recorded current version (called by the version manager
    /// after an accepted update or rollback).
    pub async fn set_version(&self, id: AgentId, version: SemVer) -> Result<(), FleetError> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&id) {
            Some(agent) => {
                agent.version = version;
                Ok(())
            }
            None => Err(FleetError::UnknownAgent { agent_id: id }),
        }
    }

    pub async fn list(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Active (non-retired) agent count.
    pub async fn active_count(&self) -> usize {
        self.agents.read().await.values().filter(|a| !a.retired).count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invocation seam
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a single task invocation, as reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub success: bool,
    /// Opaque worker output. The core never inspects its semantics.
    pub output: serde_json::Value,
    /// Present on failure; used for pattern matching in the healing engine.
    pub error_signature: Option<String>,
    pub duration: Duration,
}

impl InvocationOutcome {
    pub fn ok(output: serde_json::Value, duration: Duration) -> Self {
        Self {
            success: true,
            output,
            error_signature: None,
            duration,
        }
    }

    pub fn failed(signature: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error_signature: Some(signature.into()),
            duration,
        }
    }
}

/// The single interface between the core and concrete worker capabilities.
///
/// Implementors are black boxes: the core submits an opaque payload and
/// receives an outcome. Everything else (health, healing, planning) is
/// layered on top of this seam.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run one task on the given agent. Implementations should return an
    /// `InvocationOutcome` with `success = false` and an error signature
    /// for worker-level failures rather than an `Err`; `Err` is reserved
    /// for infrastructure problems (unknown agent, transport down).
    async fn submit_task(
        &self,
        agent_id: AgentId,
        payload: serde_json::Value,
    ) -> Result<InvocationOutcome, FleetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent() -> Agent {
        Agent::new(
            "a11y-scanner",
            SemVer::new(1, 0, 0),
            vec![CapabilityTag::ReadOnly],
        )
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = AgentRegistry::new();
        let id = registry.register(sample_agent()).await;
        let agent = registry.get(id).await.unwrap();
        assert_eq!(agent.name, "a11y-scanner");
        assert!(!agent.retired);
    }

    #[tokio::test]
    async fn retire_keeps_agent_in_table() {
        let registry = AgentRegistry::new();
        let id = registry.register(sample_agent()).await;
        registry.retire(id).await.unwrap();
        let agent = registry.get(id).await.unwrap();
        assert!(agent.retired);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn retire_unknown_agent_fails() {
        let registry = AgentRegistry::new();
        let err = registry.retire(AgentId::new()).await.unwrap_err();
        assert!(matches!(err, FleetError::UnknownAgent { .. }));
    }

    #[test]
    fn mutating_tag_detected() {
        let mut agent = sample_agent();
        assert!(!agent.mutates_shared_files());
        agent.capability_tags.push(CapabilityTag::MutatesSharedFiles);
        assert!(agent.mutates_shared_files());
    }
}
