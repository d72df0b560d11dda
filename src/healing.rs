//! Autonomous failure remediation with confidence-gated decisions.
//!
//! On a task failure or an unhealthy/critical health event, the engine:
//!
//! 1. Classifies the error. Transient (network/timeout-class) failures
//!    are retried with exponential backoff *before* any pattern lookup;
//!    structural failures are never retried.
//! 2. Queries the knowledge store for remediation patterns matching the
//!    signature at or above the similarity threshold.
//! 3. Gates on the best match's confidence: high-confidence fixes are
//!    auto-applied, mid-confidence fixes are applied but flagged for a
//!    one-time review, low-confidence matches are escalated as
//!    [`UnresolvedIncident`]s instead of acted on.
//! 4. After an applied fix, re-checks health after a grace period and
//!    reinforces the pattern's confidence with the observed outcome.
//!
//! At most one remediation runs per agent at a time; racing fixes are
//! serialized on a per-agent lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::UnresolvedIncident;
use crate::health::{HealthMonitor, HealthState, HealthStateChange};
use crate::knowledge::KnowledgeStore;

/// Maximum number of healing reports kept in the ring buffer.
const MAX_RECENT_REPORTS: usize = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse error classification driving retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout-like; worth retrying with backoff.
    Transient,
    /// Bad input or incompatible version; retrying cannot help.
    Structural,
}

/// What the engine decided to do about a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HealingDecision {
    /// A transient failure cleared on retry; no pattern was needed.
    RetrySucceeded { attempts: u32 },
    /// High-confidence pattern applied immediately, no confirmation.
    AutoApplied {
        pattern_id: Uuid,
        confidence: f64,
        similarity: f64,
    },
    /// Mid-confidence pattern applied but flagged for one-time review.
    AppliedFlaggedForReview {
        pattern_id: Uuid,
        confidence: f64,
        similarity: f64,
    },
    /// Confidence too low (or no match, or retries exhausted with no
    /// pattern): escalated, nothing applied.
    Escalated,
}

/// Result of one healing attempt. Carried in the mission report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingReport {
    pub agent_id: AgentId,
    pub error_signature: String,
    pub decision: HealingDecision,
    /// Whether the failure is considered resolved (retry cleared it, or
    /// an applied fix passed the post-fix health check).
    pub resolved: bool,
    /// Escalation payload when the engine declined or failed to act.
    pub incident: Option<UnresolvedIncident>,
    /// Ordered decision trail, human-readable.
    pub reasoning: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Tunables for classification, retry, and the decision policy.
///
/// The thresholds are heuristic business rules, not physics; they are
/// deliberately configuration.
#[derive(Debug, Clone)]
pub struct HealingConfig {
    /// Minimum signature similarity for a pattern to be considered.
    pub similarity_threshold: f64,
    /// Confidence at or above which a fix is applied with no confirmation.
    pub auto_apply_threshold: f64,
    /// Confidence at or above which a fix is applied but flagged.
    pub review_threshold: f64,
    /// Reinforcement rate for confidence updates.
    pub reinforcement_alpha: f64,
    /// Transient retry budget.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Wait before re-sampling health after an applied fix.
    pub health_grace_period: Duration,
    /// Substrings (lowercased) marking a signature as transient.
    pub transient_markers: Vec<String>,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            auto_apply_threshold: 0.8,
            review_threshold: 0.5,
            reinforcement_alpha: std::env::var("FLEET_REINFORCEMENT_ALPHA")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.1),
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            health_grace_period: Duration::from_secs(5),
            transient_markers: [
                "timeout",
                "timed out",
                "network",
                "connection refused",
                "connection reset",
                "unreachable",
                "rate limit",
                "too many requests",
                "429",
                "502",
                "503",
                "504",
                "temporarily unavailable",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl HealingConfig {
    /// Classify an error signature. Unknown shapes default to structural:
    /// blind retries of genuinely bad input only burn the retry budget.
    pub fn classify(&self, signature: &str) -> ErrorClass {
        let lower = signature.to_lowercase();
        if self.transient_markers.iter().any(|m| lower.contains(m)) {
            ErrorClass::Transient
        } else {
            ErrorClass::Structural
        }
    }

    /// Backoff delay before retry `attempt` (1-based): exponential on the
    /// base delay, capped, with up to 10% jitter to avoid thundering
    /// herds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + rand::thread_rng().gen_range(-0.1..0.1);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// The self-healing engine.
pub struct SelfHealingEngine {
    knowledge: Arc<KnowledgeStore>,
    health: Arc<HealthMonitor>,
    config: HealingConfig,
    /// One remediation in flight per agent at a time.
    agent_locks: Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,
    /// Recent reports (ring buffer, newest last).
    recent: RwLock<Vec<HealingReport>>,
}

impl SelfHealingEngine {
    pub fn new(knowledge: Arc<KnowledgeStore>, health: Arc<HealthMonitor>) -> Self {
        Self::with_config(knowledge, health, HealingConfig::default())
    }

    pub fn with_config(
        knowledge: Arc<KnowledgeStore>,
        health: Arc<HealthMonitor>,
        config: HealingConfig,
    ) -> Self {
        Self {
            knowledge,
            health,
            config,
            agent_locks: Mutex::new(HashMap::new()),
            recent: RwLock::new(Vec::new()),
        }
    }

    /// Handle a task failure for an agent.
    ///
    /// `retry` re-invokes the failed work and reports whether it
    /// succeeded; it is only called for transient errors.
    pub async fn handle_failure<F, Fut>(
        &self,
        agent_id: AgentId,
        error_signature: &str,
        retry: F,
    ) -> HealingReport
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool> + Send,
    {
        // Serialize remediations per agent.
        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        let mut reasoning = Vec::new();
        let class = self.config.classify(error_signature);
        reasoning.push(format!("error classified as {:?}", class));

        if class == ErrorClass::Transient {
            for attempt in 1..=self.config.max_retries {
                let delay = self.config.backoff_delay(attempt);
                reasoning.push(format!(
                    "transient retry {}/{} after {:.1}s backoff",
                    attempt,
                    self.config.max_retries,
                    delay.as_secs_f64()
                ));
                tokio::time::sleep(delay).await;
                if retry().await {
                    reasoning.push(format!("retry {} succeeded", attempt));
                    tracing::info!(
                        agent_id = %agent_id,
                        signature = error_signature,
                        attempt,
                        "Transient failure cleared on retry"
                    );
                    return self
                        .finish(HealingReport {
                            agent_id,
                            error_signature: error_signature.to_string(),
                            decision: HealingDecision::RetrySucceeded { attempts: attempt },
                            resolved: true,
                            incident: None,
                            reasoning,
                            at: Utc::now(),
                        })
                        .await;
                }
            }
            reasoning.push(format!(
                "all {} retries exhausted, consulting remediation patterns",
                self.config.max_retries
            ));
        } else {
            reasoning.push("structural errors are never retried".to_string());
        }

        self.consult_patterns(agent_id, error_signature, reasoning)
            .await
    }

    /// Handle a pushed health-state event. No re-invocable work exists
    /// here, so this goes straight to the pattern policy.
    pub async fn handle_health_event(&self, change: HealthStateChange) -> HealingReport {
        let lock = self.agent_lock(change.agent_id).await;
        let _guard = lock.lock().await;

        let signature = format!("health degraded to {}", change.to);
        let reasoning = vec![format!(
            "health event: {} -> {} (score {:.1})",
            change.from, change.to, change.score
        )];
        self.consult_patterns(change.agent_id, &signature, reasoning)
            .await
    }

    /// Consume the health monitor's event stream until it closes.
    /// Intended to be spawned as a background task.
    pub async fn run(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<HealthStateChange>,
    ) {
        while let Some(change) = events.recv().await {
            let report = self.handle_health_event(change).await;
            if !report.resolved {
                tracing::warn!(
                    agent_id = %report.agent_id,
                    signature = %report.error_signature,
                    "Health event remediation unresolved"
                );
            }
        }
    }

    /// Recent healing reports (newest last).
    pub async fn recent_reports(&self, limit: usize) -> Vec<HealingReport> {
        let recent = self.recent.read().await;
        let start = recent.len().saturating_sub(limit);
        recent[start..].to_vec()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Decision policy
    // ─────────────────────────────────────────────────────────────────────

    async fn consult_patterns(
        &self,
        agent_id: AgentId,
        error_signature: &str,
        mut reasoning: Vec<String>,
    ) -> HealingReport {
        let matches = self
            .knowledge
            .find_patterns(error_signature, self.config.similarity_threshold)
            .await;

        let best = match matches.first() {
            Some(best) => best.clone(),
            None => {
                reasoning.push(format!(
                    "no remediation pattern matches at similarity >= {:.2}",
                    self.config.similarity_threshold
                ));
                return self
                    .escalate(agent_id, error_signature, reasoning, "no matching pattern")
                    .await;
            }
        };

        reasoning.push(format!(
            "best pattern {} matches at similarity {:.2} with confidence {:.2}",
            best.pattern.id, best.similarity, best.pattern.confidence
        ));

        let confidence = best.pattern.confidence;
        let decision = if confidence >= self.config.auto_apply_threshold {
            reasoning.push(format!(
                "confidence >= {:.2}: auto-applying without confirmation",
                self.config.auto_apply_threshold
            ));
            HealingDecision::AutoApplied {
                pattern_id: best.pattern.id,
                confidence,
                similarity: best.similarity,
            }
        } else if confidence >= self.config.review_threshold {
            reasoning.push(format!(
                "confidence in [{:.2}, {:.2}): applying but flagging for review",
                self.config.review_threshold, self.config.auto_apply_threshold
            ));
            HealingDecision::AppliedFlaggedForReview {
                pattern_id: best.pattern.id,
                confidence,
                similarity: best.similarity,
            }
        } else {
            reasoning.push(format!(
                "confidence {:.2} below {:.2}: refusing to act autonomously",
                confidence, self.config.review_threshold
            ));
            return self
                .escalate(
                    agent_id,
                    error_signature,
                    reasoning,
                    "best match confidence too low",
                )
                .await;
        };

        tracing::info!(
            agent_id = %agent_id,
            pattern_id = %best.pattern.id,
            confidence,
            similarity = best.similarity,
            remediation = %best.pattern.remediation,
            "Applying remediation"
        );

        // Re-sample health after the grace period and feed the outcome
        // back into the pattern's confidence.
        tokio::time::sleep(self.config.health_grace_period).await;
        let state = self.health.current_state(agent_id).await;
        let succeeded = matches!(state, HealthState::Healthy | HealthState::Warning);
        reasoning.push(format!(
            "post-fix health check after {:.1}s grace: {} ({})",
            self.config.health_grace_period.as_secs_f64(),
            state,
            if succeeded { "fix held" } else { "fix did not hold" }
        ));
        match self
            .knowledge
            .reinforce(best.pattern.id, succeeded, self.config.reinforcement_alpha)
            .await
        {
            Ok(updated) => {
                reasoning.push(format!("pattern confidence reinforced to {:.3}", updated))
            }
            Err(e) => reasoning.push(format!("reinforcement failed: {}", e)),
        }

        self.finish(HealingReport {
            agent_id,
            error_signature: error_signature.to_string(),
            decision,
            resolved: succeeded,
            incident: None,
            reasoning,
            at: Utc::now(),
        })
        .await
    }

    async fn escalate(
        &self,
        agent_id: AgentId,
        error_signature: &str,
        mut reasoning: Vec<String>,
        reason: &str,
    ) -> HealingReport {
        reasoning.push(format!("escalating as unresolved incident: {}", reason));
        tracing::warn!(
            agent_id = %agent_id,
            signature = error_signature,
            reason,
            "Healing escalated to operator"
        );
        let incident = UnresolvedIncident {
            agent_id,
            error_signature: error_signature.to_string(),
            reason: reason.to_string(),
            reasoning: reasoning.clone(),
            occurred_at: Utc::now(),
        };
        self.finish(HealingReport {
            agent_id,
            error_signature: error_signature.to_string(),
            decision: HealingDecision::Escalated,
            resolved: false,
            incident: Some(incident),
            reasoning,
            at: Utc::now(),
        })
        .await
    }

    async fn finish(&self, report: HealingReport) -> HealingReport {
        let mut recent = self.recent.write().await;
        recent.push(report.clone());
        if recent.len() > MAX_RECENT_REPORTS {
            let excess = recent.len() - MAX_RECENT_REPORTS;
            recent.drain(..excess);
        }
        report
    }

    async fn agent_lock(&self, agent_id: AgentId) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().await;
        locks.entry(agent_id).or_default().clone()
    }
}
