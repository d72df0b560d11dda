//! Fleet health tracking.
//!
//! Each agent has a bounded rolling window of health samples. Every new
//! sample recomputes a weighted 0–100 score and maps it to one of four
//! bands; band transitions are returned to the caller, and transitions
//! into `Unhealthy`/`Critical` are also pushed to the healing
//! engine over a channel rather than polled.
//!
//! A missing heartbeat beyond the configured timeout forces `Critical`
//! regardless of how good the windowed samples look: absence of evidence
//! is treated as evidence of failure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// One health observation for an agent, created on every heartbeat or
/// task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    /// Fraction of recent invocations that succeeded, in [0, 1].
    pub success_rate: f64,
    pub p95_latency: Duration,
    /// Fraction of recent invocations that errored, in [0, 1].
    pub error_rate: f64,
}

/// Derived health band. Mutated only by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
    Critical,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl HealthState {
    /// Whether the healing engine should be notified of a transition
    /// into this state.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Unhealthy | Self::Critical)
    }
}

/// Emitted when an agent's health band changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStateChange {
    pub agent_id: AgentId,
    pub from: HealthState,
    pub to: HealthState,
    pub score: f64,
    pub at: DateTime<Utc>,
}

/// Per-state counts and mean score across the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetHealthSummary {
    pub healthy: usize,
    pub warning: usize,
    pub unhealthy: usize,
    pub critical: usize,
    pub mean_score: f64,
}

/// Tunables for scoring and liveness.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Rolling window capacity per agent.
    pub window_size: usize,
    /// Weight of the success-rate component.
    pub success_weight: f64,
    /// Weight of the latency component.
    pub latency_weight: f64,
    /// Weight of the (inverse) error-rate component.
    pub error_weight: f64,
    /// Latency at which the latency component scores 0.5. Lower observed
    /// p95 always scores higher.
    pub latency_target: Duration,
    /// Score bands: >= healthy_min is Healthy, etc.
    pub healthy_min: f64,
    pub warning_min: f64,
    pub unhealthy_min: f64,
    /// No heartbeat or sample for this long forces Critical.
    pub heartbeat_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            success_weight: 0.5,
            latency_weight: 0.3,
            error_weight: 0.2,
            latency_target: Duration::from_secs(2),
            healthy_min: 90.0,
            warning_min: 70.0,
            unhealthy_min: 50.0,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    /// Weighted 0–100 score for a single sample.
    ///
    /// The latency term is `target / (target + p95)`, so improving any
    /// metric never decreases the score.
    fn sample_score(&self, sample: &HealthSample) -> f64 {
        let target = self.latency_target.as_secs_f64();
        let latency_score = if target > 0.0 {
            target / (target + sample.p95_latency.as_secs_f64())
        } else {
            1.0
        };
        let weighted = self.success_weight * sample.success_rate.clamp(0.0, 1.0)
            + self.latency_weight * latency_score
            + self.error_weight * (1.0 - sample.error_rate.clamp(0.0, 1.0));
        let total = self.success_weight + self.latency_weight + self.error_weight;
        100.0 * weighted / total
    }

    fn band(&self, score: f64) -> HealthState {
        if score >= self.healthy_min {
            HealthState::Healthy
        } else if score >= self.warning_min {
            HealthState::Warning
        } else if score >= self.unhealthy_min {
            HealthState::Unhealthy
        } else {
            HealthState::Critical
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AgentHealth {
    window: VecDeque<HealthSample>,
    state: HealthState,
    score: f64,
    last_seen: DateTime<Utc>,
}

/// Tracks per-agent rolling health and emits state-change events.
pub struct HealthMonitor {
    agents: Arc<RwLock<HashMap<AgentId, AgentHealth>>>,
    config: HealthConfig,
    events_tx: mpsc::UnboundedSender<HealthStateChange>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HealthStateChange>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    pub fn with_config(config: HealthConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the state-change event stream. Transitions into Unhealthy or
    /// Critical are pushed here; intended to be consumed by the healing
    /// engine. Can be taken exactly once.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<HealthStateChange>> {
        self.events_rx.lock().await.take()
    }

    /// Record a liveness heartbeat without metrics.
    pub async fn record_heartbeat(&self, agent_id: AgentId) {
        let mut agents = self.agents.write().await;
        let entry = agents.entry(agent_id).or_insert_with(|| AgentHealth {
            window: VecDeque::new(),
            state: HealthState::Healthy,
            score: 100.0,
            last_seen: Utc::now(),
        });
        entry.last_seen = Utc::now();
    }

    /// Append a sample to the agent's rolling window, recompute the
    /// windowed score, and return a state-change event iff the band
    /// changed. Transitions needing attention are also pushed to the
    /// event channel.
    pub async fn record_sample(&self, sample: HealthSample) -> Option<HealthStateChange> {
        let agent_id = sample.agent_id;
        let mut agents = self.agents.write().await;
        let entry = agents.entry(agent_id).or_insert_with(|| AgentHealth {
            window: VecDeque::new(),
            state: HealthState::Healthy,
            score: 100.0,
            last_seen: Utc::now(),
        });

        entry.last_seen = Utc::now();
        entry.window.push_back(sample);
        while entry.window.len() > self.config.window_size {
            entry.window.pop_front();
        }

        let score = entry
            .window
            .iter()
            .map(|s| self.config.sample_score(s))
            .sum::<f64>()
            / entry.window.len() as f64;
        let band = self.config.band(score);
        entry.score = score;

        if band == entry.state {
            return None;
        }
        let change = HealthStateChange {
            agent_id,
            from: entry.state,
            to: band,
            score,
            at: Utc::now(),
        };
        entry.state = band;
        drop(agents);

        tracing::info!(
            agent_id = %agent_id,
            from = %change.from,
            to = %change.to,
            score,
            "Agent health state changed"
        );
        if band.needs_attention() {
            // Receiver may be gone (healing engine shut down); nothing to do.
            let _ = self.events_tx.send(change.clone());
        }
        Some(change)
    }

    /// Current state for an agent, with the stale-heartbeat override
    /// applied: no sample or heartbeat within the timeout means Critical
    /// no matter what the window says.
    pub async fn current_state(&self, agent_id: AgentId) -> HealthState {
        let agents = self.agents.read().await;
        match agents.get(&agent_id) {
            Some(entry) => {
                if self.is_stale(entry) {
                    HealthState::Critical
                } else {
                    entry.state
                }
            }
            // Never heard from at all.
            None => HealthState::Critical,
        }
    }

    /// Current windowed score for an agent (stale override not applied).
    pub async fn current_score(&self, agent_id: AgentId) -> Option<f64> {
        let agents = self.agents.read().await;
        agents.get(&agent_id).map(|e| e.score)
    }

    /// Force stale agents to Critical and emit events for the ones that
    /// were not already Critical. Intended to run on a periodic sweep.
    pub async fn sweep_stale(&self) -> Vec<HealthStateChange> {
        let mut agents = self.agents.write().await;
        let mut changes = Vec::new();
        for (&agent_id, entry) in agents.iter_mut() {
            if self.is_stale(entry) && entry.state != HealthState::Critical {
                let change = HealthStateChange {
                    agent_id,
                    from: entry.state,
                    to: HealthState::Critical,
                    score: entry.score,
                    at: Utc::now(),
                };
                entry.state = HealthState::Critical;
                tracing::warn!(
                    agent_id = %agent_id,
                    last_seen = %change.at,
                    "Heartbeat missing beyond timeout, forcing critical"
                );
                let _ = self.events_tx.send(change.clone());
                changes.push(change);
            }
        }
        changes
    }

    /// Per-state counts and mean score across the fleet, with the stale
    /// override applied per agent.
    pub async fn summary(&self) -> FleetHealthSummary {
        let agents = self.agents.read().await;
        let mut summary = FleetHealthSummary::default();
        let mut total_score = 0.0;
        for entry in agents.values() {
            let state = if self.is_stale(entry) {
                HealthState::Critical
            } else {
                entry.state
            };
            match state {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Warning => summary.warning += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Critical => summary.critical += 1,
            }
            total_score += entry.score;
        }
        if !agents.is_empty() {
            summary.mean_score = total_score / agents.len() as f64;
        }
        summary
    }

    /// Drive the stale sweep on a fixed interval until cancelled.
    ///
    /// Spawned alongside the healing engine's event loop so silently dead
    /// agents reach the event channel without anyone polling; nothing
    /// else in the crate calls `sweep_stale` on a schedule.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let changes = self.sweep_stale().await;
                    if !changes.is_empty() {
                        tracing::debug!(
                            count = changes.len(),
                            "Stale sweep forced agents critical"
                        );
                    }
                }
            }
        }
    }

    fn is_stale(&self, entry: &AgentHealth) -> bool {
        let elapsed = (Utc::now() - entry.last_seen)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed > self.config.heartbeat_timeout
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent_id: AgentId, success: f64, latency_ms: u64, error: f64) -> HealthSample {
        HealthSample {
            agent_id,
            timestamp: Utc::now(),
            success_rate: success,
            p95_latency: Duration::from_millis(latency_ms),
            error_rate: error,
        }
    }

    #[test]
    fn perfect_sample_scores_100() {
        let config = HealthConfig::default();
        let s = sample(AgentId::new(), 1.0, 0, 0.0);
        assert!((config.sample_score(&s) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn improving_every_metric_never_decreases_score() {
        let config = HealthConfig::default();
        let id = AgentId::new();
        let worse = sample(id, 0.6, 5000, 0.3);
        let better = sample(id, 0.8, 2000, 0.1);
        let best = sample(id, 1.0, 100, 0.0);
        let (a, b, c) = (
            config.sample_score(&worse),
            config.sample_score(&better),
            config.sample_score(&best),
        );
        assert!(a <= b && b <= c);
    }

    #[test]
    fn bands_map_per_thresholds() {
        let config = HealthConfig::default();
        assert_eq!(config.band(95.0), HealthState::Healthy);
        assert_eq!(config.band(90.0), HealthState::Healthy);
        assert_eq!(config.band(89.9), HealthState::Warning);
        assert_eq!(config.band(70.0), HealthState::Warning);
        assert_eq!(config.band(69.9), HealthState::Unhealthy);
        assert_eq!(config.band(50.0), HealthState::Unhealthy);
        assert_eq!(config.band(49.9), HealthState::Critical);
    }

    #[tokio::test]
    async fn window_evicts_oldest_beyond_capacity() {
        let monitor = HealthMonitor::with_config(HealthConfig {
            window_size: 3,
            ..Default::default()
        });
        let id = AgentId::new();
        // Three terrible samples, then three perfect ones: the bad samples
        // must be fully evicted and the score recover.
        for _ in 0..3 {
            monitor.record_sample(sample(id, 0.0, 60_000, 1.0)).await;
        }
        for _ in 0..3 {
            monitor.record_sample(sample(id, 1.0, 0, 0.0)).await;
        }
        let score = monitor.current_score(id).await.unwrap();
        assert!((score - 100.0).abs() < 1e-9);
        assert_eq!(monitor.current_state(id).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn state_change_returned_only_on_band_transition() {
        let monitor = HealthMonitor::new();
        let id = AgentId::new();
        // First healthy sample: no transition (starts Healthy).
        assert!(monitor.record_sample(sample(id, 1.0, 10, 0.0)).await.is_none());
        assert!(monitor.record_sample(sample(id, 1.0, 10, 0.0)).await.is_none());
    }

    #[tokio::test]
    async fn unhealthy_transition_is_pushed_to_channel() {
        let monitor = HealthMonitor::new();
        let mut rx = monitor.take_event_receiver().await.unwrap();
        let id = AgentId::new();
        let change = monitor
            .record_sample(sample(id, 0.0, 60_000, 1.0))
            .await
            .expect("band must change");
        assert_eq!(change.to, HealthState::Critical);
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.agent_id, id);
        assert_eq!(pushed.to, HealthState::Critical);
    }

    #[tokio::test]
    async fn stale_heartbeat_forces_critical_despite_healthy_window() {
        let monitor = HealthMonitor::with_config(HealthConfig {
            heartbeat_timeout: Duration::from_millis(5),
            ..Default::default()
        });
        let id = AgentId::new();
        for _ in 0..19 {
            monitor.record_sample(sample(id, 1.0, 10, 0.0)).await;
        }
        assert_eq!(monitor.current_state(id).await, HealthState::Healthy);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.current_state(id).await, HealthState::Critical);

        let changes = monitor.sweep_stale().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, HealthState::Critical);
    }

    #[tokio::test]
    async fn sweeper_pushes_stale_transition_without_manual_poll() {
        let monitor = Arc::new(HealthMonitor::with_config(HealthConfig {
            heartbeat_timeout: Duration::from_millis(10),
            ..Default::default()
        }));
        let mut rx = monitor.take_event_receiver().await.unwrap();
        let id = AgentId::new();
        monitor.record_sample(sample(id, 1.0, 10, 0.0)).await;

        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(
            monitor
                .clone()
                .run_sweeper(Duration::from_millis(5), cancel.clone()),
        );

        // No sweep_stale call here: the spawned loop must push the
        // forced Critical transition on its own.
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.agent_id, id);
        assert_eq!(pushed.to, HealthState::Critical);

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_refresh_clears_staleness() {
        let monitor = HealthMonitor::with_config(HealthConfig {
            heartbeat_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let id = AgentId::new();
        monitor.record_sample(sample(id, 1.0, 10, 0.0)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.record_heartbeat(id).await;
        tokio::time::sleep(Duration::from_millis(12)).await;
        // Last heartbeat was ~12ms ago, within the 20ms timeout.
        assert_eq!(monitor.current_state(id).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn summary_counts_states_and_mean() {
        let monitor = HealthMonitor::new();
        let a = AgentId::new();
        let b = AgentId::new();
        monitor.record_sample(sample(a, 1.0, 0, 0.0)).await;
        monitor.record_sample(sample(b, 0.0, 60_000, 1.0)).await;
        let summary = monitor.summary().await;
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.critical, 1);
        assert!(summary.mean_score > 0.0 && summary.mean_score < 100.0);
    }

    #[tokio::test]
    async fn unknown_agent_is_critical() {
        let monitor = HealthMonitor::new();
        assert_eq!(
            monitor.current_state(AgentId::new()).await,
            HealthState::Critical
        );
    }
}
