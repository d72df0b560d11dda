//! Append-only knowledge store: learned remediation patterns, per-agent
//! historical task durations, version history, and realized execution
//! outcomes.
//!
//! This is the leaf dependency of the whole core. It is always injected
//! (`Arc<KnowledgeStore>`) into the components that consult it rather
//! than reached through ambient state, so confidence-update races can
//! be exercised in isolation.
//!
//! # How learning works
//!
//! 1. Task outcomes are recorded with durations per agent.
//! 2. Duration estimates are simple moving averages over a bounded window.
//! 3. Pattern confidence is reinforced after every application:
//!    `c' = clamp(c + alpha * (outcome - c), 0, 1)`.
//! 4. Realized plan outcomes are kept keyed by (strategy, agent set) so
//!    future predictions can be compared against reality.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::FleetError;
use crate::versioning::SemVer;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// How risky it is to apply a remediation automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// A learned association between an error signature and a fix.
///
/// Confidence must be earned: patterns are never created with
/// confidence above 0.5, regardless of what the caller passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPattern {
    pub id: Uuid,
    pub error_signature: String,
    /// Opaque description of the fix to apply (consumed by the operator
    /// layer / the agent itself, not interpreted by the core).
    pub remediation: String,
    pub risk_tier: RiskTier,
    pub confidence: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pattern matched against a live error signature.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: RemediationPattern,
    /// Token-Jaccard similarity between the stored and live signatures.
    pub similarity: f64,
}

/// Immutable version history entry. Rollback appends a new record
/// pointing at the restored snapshot rather than mutating history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub agent_id: AgentId,
    pub version: SemVer,
    pub changelog: String,
    pub timestamp: DateTime<Utc>,
    /// Set when this record was produced by a rollback; names the version
    /// that was rolled back *from*.
    pub rollback_of: Option<SemVer>,
}

/// Realized outcome of an executed plan, for refining future estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealizedOutcome {
    pub predicted_duration: Duration,
    pub actual_duration: Duration,
    pub success_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Tunables for the store's bounded histories.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    /// Samples kept per agent for the duration moving average.
    pub duration_window: usize,
    /// Realized outcomes kept per (strategy, agent set) key.
    pub outcome_window: usize,
    /// Hard cap applied to the confidence of newly created patterns.
    pub initial_confidence_cap: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            duration_window: 50,
            outcome_window: 50,
            initial_confidence_cap: 0.5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signature similarity
// ─────────────────────────────────────────────────────────────────────────────

/// Token-Jaccard similarity between two error signatures in [0, 1].
///
/// Signatures are lowercased and split on non-alphanumeric boundaries;
/// similarity is |intersection| / |union| of the token sets. Pure
/// function so the matching behavior is testable on its own.
pub fn signature_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> BTreeSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    };
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    patterns: Vec<RemediationPattern>,
    durations: HashMap<AgentId, VecDeque<Duration>>,
    versions: HashMap<AgentId, Vec<VersionRecord>>,
    outcomes: HashMap<OutcomeKey, VecDeque<RealizedOutcome>>,
}

type OutcomeKey = (String, Vec<AgentId>);

/// Concurrency-safe knowledge store shared across the core.
///
/// All mutation happens under a single write lock, so concurrent workers
/// reporting outcomes simultaneously cannot lose updates to the same
/// pattern's confidence.
pub struct KnowledgeStore {
    inner: Arc<RwLock<Inner>>,
    config: KnowledgeConfig,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::with_config(KnowledgeConfig::default())
    }

    pub fn with_config(config: KnowledgeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                patterns: Vec::new(),
                durations: HashMap::new(),
                versions: HashMap::new(),
                outcomes: HashMap::new(),
            })),
            config,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Remediation patterns
    // ─────────────────────────────────────────────────────────────────────

    /// Create a pattern for a newly observed successful fix, or update the
    /// remediation/risk tier of an existing one with the same signature.
    ///
    /// Initial confidence is capped at `initial_confidence_cap` (0.5 by
    /// default): confidence above that must be earned via reinforcement.
    pub async fn upsert_pattern(
        &self,
        error_signature: impl Into<String>,
        remediation: impl Into<String>,
        risk_tier: RiskTier,
        initial_confidence: f64,
    ) -> RemediationPattern {
        let signature = error_signature.into();
        let remediation = remediation.into();
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        if let Some(existing) = inner
            .patterns
            .iter_mut()
            .find(|p| p.error_signature == signature)
        {
            existing.remediation = remediation;
            existing.risk_tier = risk_tier;
            existing.updated_at = now;
            return existing.clone();
        }

        let pattern = RemediationPattern {
            id: Uuid::new_v4(),
            error_signature: signature,
            remediation,
            risk_tier,
            confidence: initial_confidence
                .clamp(0.0, self.config.initial_confidence_cap),
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(
            pattern_id = %pattern.id,
            signature = %pattern.error_signature,
            confidence = pattern.confidence,
            "Remediation pattern created"
        );
        inner.patterns.push(pattern.clone());
        pattern
    }

    /// Find patterns whose stored signature matches `signature` with at
    /// least `min_similarity`, best match first.
    pub async fn find_patterns(&self, signature: &str, min_similarity: f64) -> Vec<PatternMatch> {
        let inner = self.inner.read().await;
        let mut matches: Vec<PatternMatch> = inner
            .patterns
            .iter()
            .filter_map(|p| {
                let similarity = signature_similarity(&p.error_signature, signature);
                (similarity >= min_similarity).then(|| PatternMatch {
                    pattern: p.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.pattern
                        .confidence
                        .partial_cmp(&a.pattern.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        matches
    }

    /// Reinforce a pattern with the observed outcome of applying it.
    ///
    /// `c' = clamp(c + alpha * (outcome - c), 0, 1)` where outcome is 1.0
    /// on success and 0.0 on failure. Runs entirely under the write lock
    /// so concurrent reinforcements are serialized.
    ///
    /// Returns the updated confidence.
    pub async fn reinforce(
        &self,
        pattern_id: Uuid,
        success: bool,
        alpha: f64,
    ) -> Result<f64, FleetError> {
        let mut inner = self.inner.write().await;
        let pattern = inner
            .patterns
            .iter_mut()
            .find(|p| p.id == pattern_id)
            .ok_or_else(|| FleetError::Structural {
                reason: format!("unknown remediation pattern {}", pattern_id),
            })?;

        let outcome = if success { 1.0 } else { 0.0 };
        let before = pattern.confidence;
        pattern.confidence = (pattern.confidence + alpha * (outcome - pattern.confidence))
            .clamp(0.0, 1.0);
        if success {
            pattern.success_count += 1;
        } else {
            pattern.failure_count += 1;
        }
        pattern.updated_at = Utc::now();
        tracing::debug!(
            pattern_id = %pattern_id,
            success,
            confidence_before = before,
            confidence_after = pattern.confidence,
            "Pattern confidence reinforced"
        );
        Ok(pattern.confidence)
    }

    pub async fn get_pattern(&self, pattern_id: Uuid) -> Option<RemediationPattern> {
        let inner = self.inner.read().await;
        inner.patterns.iter().find(|p| p.id == pattern_id).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Task durations
    // ─────────────────────────────────────────────────────────────────────

    /// Record a completed task's duration for future estimates.
    pub async fn record_task_outcome(&self, agent_id: AgentId, duration: Duration, success: bool) {
        let window = self.config.duration_window;
        let mut inner = self.inner.write().await;
        let history = inner.durations.entry(agent_id).or_default();
        history.push_back(duration);
        while history.len() > window {
            history.pop_front();
        }
        tracing::debug!(
            agent_id = %agent_id,
            duration_secs = duration.as_secs_f64(),
            success,
            samples = history.len(),
            "Task outcome recorded"
        );
    }

    /// Moving-average historical duration for an agent, if any samples exist.
    pub async fn historical_duration(&self, agent_id: AgentId) -> Option<Duration> {
        let inner = self.inner.read().await;
        let history = inner.durations.get(&agent_id)?;
        if history.is_empty() {
            return None;
        }
        let total: f64 = history.iter().map(|d| d.as_secs_f64()).sum();
        Some(Duration::from_secs_f64(total / history.len() as f64))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Version history
    // ─────────────────────────────────────────────────────────────────────

    /// Append a version record for an agent.
    ///
    /// Versions must be strictly increasing on the current (latest)
    /// record unless the record is a rollback (`rollback_of` set), which
    /// restores a prior snapshot by appending.
    pub async fn append_version_record(&self, record: VersionRecord) -> Result<(), FleetError> {
        let mut inner = self.inner.write().await;
        let history = inner.versions.entry(record.agent_id).or_default();
        if record.rollback_of.is_none() {
            if let Some(current) = history.last() {
                if record.version <= current.version {
                    return Err(FleetError::VersionNotIncreasing {
                        current: current.version.clone(),
                        proposed: record.version,
                    });
                }
            }
        }
        history.push(record);
        Ok(())
    }

    /// Full append-only version history, oldest first.
    pub async fn version_history(&self, agent_id: AgentId) -> Vec<VersionRecord> {
        let inner = self.inner.read().await;
        inner.versions.get(&agent_id).cloned().unwrap_or_default()
    }

    /// The latest version record for an agent, if any.
    pub async fn current_version(&self, agent_id: AgentId) -> Option<VersionRecord> {
        let inner = self.inner.read().await;
        inner.versions.get(&agent_id).and_then(|h| h.last()).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Realized execution outcomes
    // ─────────────────────────────────────────────────────────────────────

    /// Record a realized plan outcome keyed by (strategy, agent set).
    pub async fn record_execution_outcome(
        &self,
        strategy: &str,
        agents: &[AgentId],
        outcome: RealizedOutcome,
    ) {
        let mut key_agents: Vec<AgentId> = agents.to_vec();
        key_agents.sort();
        key_agents.dedup();
        let window = self.config.outcome_window;
        let mut inner = self.inner.write().await;
        let history = inner
            .outcomes
            .entry((strategy.to_string(), key_agents))
            .or_default();
        history.push_back(outcome);
        while history.len() > window {
            history.pop_front();
        }
    }

    /// Realized outcomes previously recorded for this (strategy, agent set).
    pub async fn execution_outcomes(
        &self,
        strategy: &str,
        agents: &[AgentId],
    ) -> Vec<RealizedOutcome> {
        let mut key_agents: Vec<AgentId> = agents.to_vec();
        key_agents.sort();
        key_agents.dedup();
        let inner = self.inner.read().await;
        inner
            .outcomes
            .get(&(strategy.to_string(), key_agents))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for KnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_identical_and_disjoint() {
        assert_eq!(signature_similarity("timeout on export", "timeout on export"), 1.0);
        assert_eq!(signature_similarity("disk full", "network unreachable"), 0.0);
    }

    #[test]
    fn similarity_is_case_and_punctuation_insensitive() {
        let s = signature_similarity("Connection timeout: export", "connection TIMEOUT export!");
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_partial_overlap() {
        // tokens {a,b,c} vs {b,c,d}: 2/4
        let s = signature_similarity("alpha beta gamma", "beta gamma delta");
        assert!((s - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn new_patterns_never_exceed_half_confidence() {
        let store = KnowledgeStore::new();
        let p = store
            .upsert_pattern("timeout", "restart worker", RiskTier::Low, 0.95)
            .await;
        assert!(p.confidence <= 0.5);
    }

    #[tokio::test]
    async fn confidence_stays_bounded_under_reinforcement() {
        let store = KnowledgeStore::new();
        let p = store
            .upsert_pattern("timeout", "restart worker", RiskTier::Low, 0.5)
            .await;
        for _ in 0..200 {
            store.reinforce(p.id, true, 0.1).await.unwrap();
        }
        let c = store.get_pattern(p.id).await.unwrap().confidence;
        assert!(c <= 1.0 && c > 0.9);
        for _ in 0..200 {
            store.reinforce(p.id, false, 0.1).await.unwrap();
        }
        let c = store.get_pattern(p.id).await.unwrap().confidence;
        assert!((0.0..=1.0).contains(&c) && c < 0.1);
    }

    #[tokio::test]
    async fn failed_reinforcement_strictly_decreases_confidence() {
        let store = KnowledgeStore::new();
        let p = store
            .upsert_pattern("timeout", "restart worker", RiskTier::Low, 0.4)
            .await;
        let after = store.reinforce(p.id, false, 0.1).await.unwrap();
        assert!(after < 0.4);
    }

    #[tokio::test]
    async fn concurrent_reinforcement_loses_no_updates() {
        let store = Arc::new(KnowledgeStore::new());
        let p = store
            .upsert_pattern("timeout", "restart worker", RiskTier::Low, 0.5)
            .await;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = p.id;
            handles.push(tokio::spawn(async move {
                store.reinforce(id, true, 0.1).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let pattern = store.get_pattern(p.id).await.unwrap();
        assert_eq!(pattern.success_count, 20);
    }

    #[tokio::test]
    async fn duration_window_evicts_oldest() {
        let store = KnowledgeStore::with_config(KnowledgeConfig {
            duration_window: 3,
            ..Default::default()
        });
        let agent = AgentId::new();
        for secs in [100, 100, 10, 10, 10] {
            store
                .record_task_outcome(agent, Duration::from_secs(secs), true)
                .await;
        }
        // Only the last 3 samples (all 10s) survive.
        let avg = store.historical_duration(agent).await.unwrap();
        assert_eq!(avg, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn no_history_means_no_estimate() {
        let store = KnowledgeStore::new();
        assert!(store.historical_duration(AgentId::new()).await.is_none());
    }

    #[tokio::test]
    async fn version_records_must_increase() {
        let store = KnowledgeStore::new();
        let agent = AgentId::new();
        let rec = |v: SemVer, rollback_of: Option<SemVer>| VersionRecord {
            agent_id: agent,
            version: v,
            changelog: String::new(),
            timestamp: Utc::now(),
            rollback_of,
        };
        store
            .append_version_record(rec(SemVer::new(1, 2, 0), None))
            .await
            .unwrap();
        let err = store
            .append_version_record(rec(SemVer::new(1, 1, 9), None))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::VersionNotIncreasing { .. }));
        // Rollback records bypass the strictly-increasing check.
        store
            .append_version_record(rec(SemVer::new(1, 1, 9), Some(SemVer::new(1, 2, 0))))
            .await
            .unwrap();
        assert_eq!(store.version_history(agent).await.len(), 2);
    }

    #[tokio::test]
    async fn best_match_first() {
        let store = KnowledgeStore::new();
        store
            .upsert_pattern("network timeout fetching report", "retry fetch", RiskTier::Low, 0.5)
            .await;
        store
            .upsert_pattern("network timeout", "reconnect", RiskTier::Low, 0.5)
            .await;
        let matches = store.find_patterns("network timeout", 0.3).await;
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern.error_signature, "network timeout");
        assert!((matches[0].similarity - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn execution_outcomes_keyed_by_agent_set_order_independent() {
        let store = KnowledgeStore::new();
        let a = AgentId::new();
        let b = AgentId::new();
        store
            .record_execution_outcome(
                "parallel",
                &[a, b],
                RealizedOutcome {
                    predicted_duration: Duration::from_secs(60),
                    actual_duration: Duration::from_secs(70),
                    success_rate: 1.0,
                    recorded_at: Utc::now(),
                },
            )
            .await;
        assert_eq!(store.execution_outcomes("parallel", &[b, a]).await.len(), 1);
        assert!(store.execution_outcomes("sequential", &[a, b]).await.is_empty());
    }
}
