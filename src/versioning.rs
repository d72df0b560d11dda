//! Semantic versioning and dependency management across the fleet.
//!
//! The agent dependency graph is an adjacency list over integer node
//! indices. Acyclicity is an enforced invariant: every candidate edge is
//! checked with a DFS back-edge scan *before* insertion, so the stored
//! graph is never cyclic and no periodic re-validation is needed.
//!
//! Version history is append-only (stored in the knowledge store);
//! rollback appends a record restoring the prior snapshot rather than
//! rewriting history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agent::{AgentId, AgentRegistry};
use crate::error::FleetError;
use crate::knowledge::{KnowledgeStore, VersionRecord};

// ─────────────────────────────────────────────────────────────────────────────
// Semantic versions
// ─────────────────────────────────────────────────────────────────────────────

/// Fleet versions are plain [`semver::Version`]s, with parsing, ordering
/// (including pre-release precedence), and serde handled by the crate.
/// The alias names the concern at call sites.
pub type SemVer = semver::Version;

/// Kind of version bump, per semver contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionBump {
    /// Breaking change — capabilities removed or changed.
    Major,
    /// Additive capability.
    Minor,
    /// Fix only.
    Patch,
}

/// Bump construction and classification helpers layered over
/// [`semver::Version`].
pub trait SemVerExt {
    /// Breaking change.
    fn bump_major(&self) -> SemVer;
    /// Additive capability.
    fn bump_minor(&self) -> SemVer;
    /// Fix only.
    fn bump_patch(&self) -> SemVer;
    /// Classify the bump from `self` to `next`.
    ///
    /// Returns `None` when `next` does not increase on `self`.
    fn bump_to(&self, next: &SemVer) -> Option<VersionBump>;
}

impl SemVerExt for SemVer {
    fn bump_major(&self) -> SemVer {
        SemVer::new(self.major + 1, 0, 0)
    }

    fn bump_minor(&self) -> SemVer {
        SemVer::new(self.major, self.minor + 1, 0)
    }

    fn bump_patch(&self) -> SemVer {
        SemVer::new(self.major, self.minor, self.patch + 1)
    }

    fn bump_to(&self, next: &SemVer) -> Option<VersionBump> {
        if next <= self {
            return None;
        }
        if next.major > self.major {
            Some(VersionBump::Major)
        } else if next.minor > self.minor {
            Some(VersionBump::Minor)
        } else {
            Some(VersionBump::Patch)
        }
    }
}

/// Risk classification for an update as seen by dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRisk {
    Low,
    High,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dependency graph (arena + index)
// ─────────────────────────────────────────────────────────────────────────────

/// A directed dependency edge: `from` depends on `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_agent: AgentId,
    pub to_agent: AgentId,
}

#[derive(Debug, Default)]
struct DepGraph {
    nodes: Vec<AgentId>,
    index: HashMap<AgentId, usize>,
    /// adj[i] = nodes that node i depends on.
    adj: Vec<Vec<usize>>,
    /// radj[i] = nodes that depend on node i.
    radj: Vec<Vec<usize>>,
}

impl DepGraph {
    fn node(&mut self, id: AgentId) -> usize {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(id);
        self.index.insert(id, idx);
        self.adj.push(Vec::new());
        self.radj.push(Vec::new());
        idx
    }

    /// DFS back-edge scan over the graph plus one candidate edge.
    ///
    /// Returns the cycle path (as agent IDs) that the candidate would
    /// create, or `None` if the graph stays acyclic.
    fn cycle_with_candidate(&self, from: usize, to: usize) -> Option<Vec<AgentId>> {
        let neighbors = |n: usize| -> Vec<usize> {
            let mut out = self.adj[n].clone();
            if n == from {
                out.push(to);
            }
            out
        };

        let n = self.nodes.len();
        let mut visited = vec![false; n];
        let mut rec_stack = vec![false; n];
        let mut path: Vec<usize> = Vec::new();

        fn dfs(
            node: usize,
            neighbors: &dyn Fn(usize) -> Vec<usize>,
            visited: &mut [bool],
            rec_stack: &mut [bool],
            path: &mut Vec<usize>,
        ) -> bool {
            if rec_stack[node] {
                path.push(node);
                return true;
            }
            if visited[node] {
                return false;
            }
            visited[node] = true;
            rec_stack[node] = true;
            path.push(node);
            for next in neighbors(node) {
                if dfs(next, neighbors, visited, rec_stack, path) {
                    return true;
                }
            }
            rec_stack[node] = false;
            path.pop();
            false
        }

        // Only a cycle through the candidate edge is possible: the stored
        // graph is acyclic by construction, so starting from `from` suffices.
        if dfs(from, &neighbors, &mut visited, &mut rec_stack, &mut path) {
            // Trim the path prefix before the repeated node.
            let repeated = *path.last()?;
            let start = path.iter().position(|&n| n == repeated)?;
            Some(path[start..].iter().map(|&n| self.nodes[n]).collect())
        } else {
            None
        }
    }

    /// Transitive dependents of a node via reverse-graph BFS, in BFS order.
    fn transitive_dependents(&self, start: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::new();
        let mut out = Vec::new();
        seen[start] = true;
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            for &dep in &self.radj[node] {
                if !seen[dep] {
                    seen[dep] = true;
                    out.push(dep);
                    queue.push_back(dep);
                }
            }
        }
        out
    }

    fn edges(&self) -> Vec<DependencyEdge> {
        let mut out = Vec::new();
        for (from, deps) in self.adj.iter().enumerate() {
            for &to in deps {
                out.push(DependencyEdge {
                    from_agent: self.nodes[from],
                    to_agent: self.nodes[to],
                });
            }
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Analysis results
// ─────────────────────────────────────────────────────────────────────────────

/// Result of analyzing a proposed version update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateImpact {
    pub agent_id: AgentId,
    pub current_version: SemVer,
    pub proposed_version: SemVer,
    pub bump: VersionBump,
    /// Transitive dependents that could be affected, BFS order.
    pub affected: Vec<AgentId>,
    pub risk: UpdateRisk,
    pub reasoning: Vec<String>,
}

/// Dependency-ordered batching of a version rollout: all agents within a
/// phase may be updated in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub agent_id: AgentId,
    pub target_version: SemVer,
    pub phases: Vec<Vec<AgentId>>,
    pub reasoning: Vec<String>,
}

/// Result of a rollback. Rollback is never refused on risk grounds,
/// but crossing a MAJOR boundary is flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub agent_id: AgentId,
    pub rolled_back_from: SemVer,
    pub restored_version: SemVer,
    /// Set when the rollback crosses a MAJOR version boundary.
    pub dangerous: bool,
    pub reasoning: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Maintains the fleet dependency graph and sequences version changes.
pub struct VersionManager {
    registry: AgentRegistry,
    knowledge: Arc<KnowledgeStore>,
    graph: RwLock<DepGraph>,
}

impl VersionManager {
    pub fn new(registry: AgentRegistry, knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            registry,
            knowledge,
            graph: RwLock::new(DepGraph::default()),
        }
    }

    /// Declare that `from` depends on `to`.
    ///
    /// The candidate edge is cycle-checked before acceptance; on rejection
    /// the graph is left unmodified.
    pub async fn add_dependency(&self, from: AgentId, to: AgentId) -> Result<(), FleetError> {
        for id in [from, to] {
            if self.registry.get(id).await.is_none() {
                return Err(FleetError::UnknownAgent { agent_id: id });
            }
        }

        let mut graph = self.graph.write().await;
        let from_idx = graph.node(from);
        let to_idx = graph.node(to);

        if graph.adj[from_idx].contains(&to_idx) {
            return Ok(()); // already present
        }

        if let Some(cycle) = graph.cycle_with_candidate(from_idx, to_idx) {
            return Err(FleetError::CircularDependency {
                from: from.to_string(),
                to: to.to_string(),
                cycle: cycle.iter().map(|id| id.to_string()).collect(),
            });
        }

        graph.adj[from_idx].push(to_idx);
        graph.radj[to_idx].push(from_idx);
        tracing::debug!(from = %from, to = %to, "Dependency edge added");
        Ok(())
    }

    /// All accepted edges.
    pub async fn dependency_edges(&self) -> Vec<DependencyEdge> {
        self.graph.read().await.edges()
    }

    /// Direct dependents of an agent.
    pub async fn dependents(&self, agent_id: AgentId) -> Vec<AgentId> {
        let graph = self.graph.read().await;
        match graph.index.get(&agent_id) {
            Some(&idx) => graph.radj[idx].iter().map(|&i| graph.nodes[i]).collect(),
            None => Vec::new(),
        }
    }

    /// Apply a version update to an agent.
    ///
    /// The new version must strictly increase on the agent's current
    /// version; the accepted record is appended to the version history.
    pub async fn update(
        &self,
        agent_id: AgentId,
        new_version: SemVer,
        changelog: impl Into<String>,
    ) -> Result<VersionRecord, FleetError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(FleetError::UnknownAgent { agent_id })?;

        let bump = agent
            .version
            .bump_to(&new_version)
            .ok_or_else(|| FleetError::VersionNotIncreasing {
                current: agent.version.clone(),
                proposed: new_version.clone(),
            })?;

        // Seed the registration version as the first history entry so a
        // rollback immediately after the first update has a snapshot to
        // restore.
        if self.knowledge.version_history(agent_id).await.is_empty() {
            self.knowledge
                .append_version_record(VersionRecord {
                    agent_id,
                    version: agent.version.clone(),
                    changelog: "initial registration".to_string(),
                    timestamp: agent.registered_at,
                    rollback_of: None,
                })
                .await?;
        }

        let record = VersionRecord {
            agent_id,
            version: new_version.clone(),
            changelog: changelog.into(),
            timestamp: Utc::now(),
            rollback_of: None,
        };
        self.knowledge.append_version_record(record.clone()).await?;
        self.registry
            .set_version(agent_id, new_version.clone())
            .await?;
        tracing::info!(
            agent_id = %agent_id,
            from = %agent.version,
            to = %new_version,
            bump = ?bump,
            "Agent updated"
        );
        Ok(record)
    }

    /// Compute the blast radius of a proposed update.
    ///
    /// Risk is `High` when the bump is MAJOR (a capability was removed or
    /// changed under the semver contract) and at least one dependent
    /// relies on the agent; otherwise `Low`.
    pub async fn analyze_update_impact(
        &self,
        agent_id: AgentId,
        new_version: SemVer,
    ) -> Result<UpdateImpact, FleetError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or(FleetError::UnknownAgent { agent_id })?;
        let bump = agent
            .version
            .bump_to(&new_version)
            .ok_or_else(|| FleetError::VersionNotIncreasing {
                current: agent.version.clone(),
                proposed: new_version.clone(),
            })?;

        let graph = self.graph.read().await;
        let affected: Vec<AgentId> = match graph.index.get(&agent_id) {
            Some(&idx) => graph
                .transitive_dependents(idx)
                .into_iter()
                .map(|i| graph.nodes[i])
                .collect(),
            None => Vec::new(),
        };
        drop(graph);

        let mut reasoning = vec![format!(
            "{} -> {} is a {:?} bump",
            agent.version, new_version, bump
        )];
        let risk = if bump == VersionBump::Major && !affected.is_empty() {
            reasoning.push(format!(
                "{} transitive dependent(s) rely on capabilities that a MAJOR bump may remove or change",
                affected.len()
            ));
            UpdateRisk::High
        } else {
            reasoning.push(if affected.is_empty() {
                "no dependents are affected".to_string()
            } else {
                format!(
                    "{} dependent(s) affected, but the bump is non-breaking",
                    affected.len()
                )
            });
            UpdateRisk::Low
        };

        Ok(UpdateImpact {
            agent_id,
            current_version: agent.version,
            proposed_version: new_version,
            bump,
            affected,
            risk,
            reasoning,
        })
    }

    /// Plan a phased rollout of an update across the dependent subgraph.
    ///
    /// Dependents are batched by graph depth (longest dependency path from
    /// the updated agent), so each phase only contains agents whose
    /// prerequisites were updated in earlier phases and is internally
    /// parallel-safe.
    pub async fn plan_phased_rollout(
        &self,
        agent_id: AgentId,
        new_version: SemVer,
    ) -> Result<RolloutPlan, FleetError> {
        let impact = self
            .analyze_update_impact(agent_id, new_version.clone())
            .await?;

        let graph = self.graph.read().await;
        let mut depth: HashMap<AgentId, usize> = HashMap::new();
        if let Some(&start) = graph.index.get(&agent_id) {
            // Longest-path layering over the acyclic dependent subgraph:
            // a dependent's phase is one past the deepest prerequisite it
            // depends on within the subgraph.
            depth.insert(agent_id, 0);
            let mut queue: VecDeque<usize> = VecDeque::new();
            queue.push_back(start);
            while let Some(node) = queue.pop_front() {
                let node_depth = depth[&graph.nodes[node]];
                for &dep in &graph.radj[node] {
                    let dep_id = graph.nodes[dep];
                    let candidate = node_depth + 1;
                    let current = depth.get(&dep_id).copied().unwrap_or(0);
                    if candidate > current {
                        depth.insert(dep_id, candidate);
                        queue.push_back(dep);
                    }
                }
            }
        }
        drop(graph);

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut phases: Vec<Vec<AgentId>> = vec![Vec::new(); max_depth];
        for (&id, &d) in &depth {
            if d > 0 {
                phases[d - 1].push(id);
            }
        }
        // Deterministic order within a phase.
        for phase in &mut phases {
            phase.sort();
        }

        let mut reasoning = impact.reasoning.clone();
        reasoning.push(format!(
            "{} dependent(s) batched into {} dependency-ordered phase(s); agents within a phase update in parallel",
            impact.affected.len(),
            phases.len()
        ));
        for (i, phase) in phases.iter().enumerate() {
            reasoning.push(format!("phase {}: {} agent(s)", i + 1, phase.len()));
        }

        Ok(RolloutPlan {
            agent_id,
            target_version: new_version,
            phases,
            reasoning,
        })
    }

    /// Roll an agent back to its immediately prior version.
    ///
    /// Appends a new record restoring the prior snapshot — history is
    /// never mutated. Fails only when no prior version exists.
    pub async fn rollback(
        &self,
        agent_id: AgentId,
        reason: impl Into<String>,
    ) -> Result<RollbackResult, FleetError> {
        let history = self.knowledge.version_history(agent_id).await;
        if history.len() < 2 {
            return Err(FleetError::RollbackNotFound { agent_id });
        }
        let current = &history[history.len() - 1];
        let prior = &history[history.len() - 2];

        let dangerous = current.version.major != prior.version.major;
        let reason = reason.into();
        let mut reasoning = vec![
            format!("rollback requested: {}", reason),
            format!("restoring {} (was {})", prior.version, current.version),
        ];
        if dangerous {
            reasoning.push("rollback crosses a MAJOR version boundary".to_string());
            tracing::warn!(
                agent_id = %agent_id,
                from = %current.version,
                to = %prior.version,
                "Rollback crosses a MAJOR version boundary"
            );
        }

        let record = VersionRecord {
            agent_id,
            version: prior.version.clone(),
            changelog: prior.changelog.clone(),
            timestamp: Utc::now(),
            rollback_of: Some(current.version.clone()),
        };
        let rolled_back_from = current.version.clone();
        let restored_version = prior.version.clone();
        self.knowledge
            .append_version_record(record)
            .await?;
        self.registry
            .set_version(agent_id, restored_version.clone())
            .await?;
        tracing::info!(agent_id = %agent_id, restored = %restored_version, %reason, "Agent rolled back");

        Ok(RollbackResult {
            agent_id,
            rolled_back_from,
            restored_version,
            dangerous,
            reasoning,
        })
    }
}
