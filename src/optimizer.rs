//! Concurrency strategy selection with predictive performance modeling.
//!
//! Given a batch of tasks, the optimizer estimates per-task durations
//! (explicit override, else learned moving average, else a static
//! default), models the expected speedup of running them on a bounded
//! worker pool, decides whether isolated per-task workspaces pay for
//! themselves, and emits an [`ExecutionPlan`] with an explainable
//! confidence score and the full reasoning trail — the numbers alone are
//! not auditable, the trail is.
//!
//! All tuning constants are empirically chosen and live in
//! [`OptimizerConfig`], not at use sites.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, AgentRegistry};
use crate::knowledge::{KnowledgeStore, RealizedOutcome};
use crate::mission::Task;

// ─────────────────────────────────────────────────────────────────────────────
// Plan types
// ─────────────────────────────────────────────────────────────────────────────

/// How a mission's tasks are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One worker, tasks in submission order.
    Sequential,
    /// Bounded worker pool, shared workspace.
    Parallel,
    /// Bounded worker pool, one disposable workspace per task.
    ParallelIsolated,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::ParallelIsolated => "parallel_isolated",
        }
    }

    pub fn isolated(&self) -> bool {
        matches!(self, Self::ParallelIsolated)
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The optimizer's answer for one mission. Computed fresh per mission and
/// discarded after use; only the realized outcome is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub strategy: ExecutionStrategy,
    pub worker_count: usize,
    pub predicted_speedup: f64,
    pub predicted_duration: Duration,
    /// Explainable confidence in [0, confidence_cap].
    pub confidence: f64,
    /// Ordered, human-readable decision trail.
    pub reasoning: Vec<String>,
}

impl ExecutionPlan {
    /// Trivial plan for an empty or single-task mission.
    pub fn sequential_single() -> Self {
        Self {
            strategy: ExecutionStrategy::Sequential,
            worker_count: 1,
            predicted_speedup: 1.0,
            predicted_duration: Duration::ZERO,
            confidence: 0.5,
            reasoning: Vec::new(),
        }
    }
}

/// Caller overrides. The optimizer honors them but still logs its own
/// unused recommendation for later comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOverrides {
    pub worker_count: Option<usize>,
    pub isolation: Option<bool>,
}

/// Tunables for the performance model.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Hard cap on concurrent workers.
    pub max_workers: usize,
    /// Empirical parallel-efficiency factor applied to the theoretical
    /// maximum speedup.
    pub parallel_efficiency: f64,
    /// Fractional speedup loss to scheduling/coordination.
    pub coordination_overhead: f64,
    /// Additional fractional speedup loss when isolation is on.
    pub isolation_overhead_fraction: f64,
    /// Fixed per-task cost of setting up an isolated workspace. Isolation
    /// is only worth it when this is under 10% of the average task.
    pub isolation_fixed_cost: Duration,
    /// Below this average task duration, parallelism does not pay.
    pub sequential_threshold: Duration,
    /// Estimate used when neither the caller nor history knows a duration.
    pub default_task_duration: Duration,
    /// Confidence is additive and capped here.
    pub confidence_cap: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_workers: std::env::var("FLEET_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            parallel_efficiency: std::env::var("FLEET_PARALLEL_EFFICIENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.70),
            coordination_overhead: 0.05,
            isolation_overhead_fraction: 0.03,
            isolation_fixed_cost: Duration::from_millis(800),
            sequential_threshold: Duration::from_secs(30),
            default_task_duration: Duration::from_secs(30),
            confidence_cap: 0.95,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Optimizer
// ─────────────────────────────────────────────────────────────────────────────

/// Plans the concurrency strategy for a batch of tasks.
pub struct ParallelExecutionOptimizer {
    registry: AgentRegistry,
    knowledge: Arc<KnowledgeStore>,
    config: OptimizerConfig,
}

impl ParallelExecutionOptimizer {
    pub fn new(registry: AgentRegistry, knowledge: Arc<KnowledgeStore>) -> Self {
        Self::with_config(registry, knowledge, OptimizerConfig::default())
    }

    pub fn with_config(
        registry: AgentRegistry,
        knowledge: Arc<KnowledgeStore>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            registry,
            knowledge,
            config,
        }
    }

    /// Compute a plan with no caller overrides.
    pub async fn plan(&self, tasks: &[Task]) -> ExecutionPlan {
        self.plan_with_overrides(tasks, PlanOverrides::default()).await
    }

    /// Compute a plan, honoring caller overrides where given.
    pub async fn plan_with_overrides(
        &self,
        tasks: &[Task],
        overrides: PlanOverrides,
    ) -> ExecutionPlan {
        let recommended = self.recommend(tasks).await;
        if overrides.worker_count.is_none() && overrides.isolation.is_none() {
            return recommended;
        }

        // Re-model with the caller's choices, keeping the recommendation
        // in the trail for later comparison.
        let durations = self.estimate_durations(tasks).await;
        let serial_total: Duration = durations.iter().map(|(_, d)| *d).sum();
        let task_count = tasks.len();
        let worker_count = overrides
            .worker_count
            .unwrap_or(recommended.worker_count)
            .clamp(1, self.config.max_workers);
        let isolated = overrides
            .isolation
            .unwrap_or(recommended.strategy.isolated());

        let mut reasoning = vec![format!(
            "caller override: workers={:?} isolation={:?}; own recommendation was {} with {} worker(s)",
            overrides.worker_count, overrides.isolation, recommended.strategy, recommended.worker_count
        )];
        tracing::info!(
            recommended_strategy = %recommended.strategy,
            recommended_workers = recommended.worker_count,
            override_workers = ?overrides.worker_count,
            override_isolation = ?overrides.isolation,
            "Plan overridden by caller; recommendation recorded unused"
        );

        let strategy = if worker_count <= 1 {
            ExecutionStrategy::Sequential
        } else if isolated {
            ExecutionStrategy::ParallelIsolated
        } else {
            ExecutionStrategy::Parallel
        };
        let (speedup, predicted_duration) =
            self.model_speedup(task_count, worker_count, isolated, serial_total, &mut reasoning);
        let confidence = self.confidence(task_count, &durations, speedup, &mut reasoning);
        reasoning.extend(recommended.reasoning.iter().map(|r| format!("[unused recommendation] {}", r)));

        ExecutionPlan {
            strategy,
            worker_count,
            predicted_speedup: speedup,
            predicted_duration,
            confidence,
            reasoning,
        }
    }

    /// The optimizer's own recommendation, before any caller overrides.
    async fn recommend(&self, tasks: &[Task]) -> ExecutionPlan {
        let mut reasoning = Vec::new();
        let task_count = tasks.len();

        // Step 1: trivial batches are sequential by definition.
        if task_count < 2 {
            reasoning.push(format!(
                "{} task(s) submitted: nothing to parallelize, sequential with 1 worker",
                task_count
            ));
            let durations = self.estimate_durations(tasks).await;
            let serial_total: Duration = durations.iter().map(|(_, d)| *d).sum();
            let confidence = self.confidence(task_count, &durations, 1.0, &mut reasoning);
            return ExecutionPlan {
                strategy: ExecutionStrategy::Sequential,
                worker_count: 1,
                predicted_speedup: 1.0,
                predicted_duration: serial_total,
                confidence,
                reasoning,
            };
        }

        // Step 2–3: estimate durations and the serial total.
        let durations = self.estimate_durations(tasks).await;
        let serial_total: Duration = durations.iter().map(|(_, d)| *d).sum();
        let avg = serial_total / task_count as u32;
        reasoning.push(format!(
            "{} tasks, serial total {:.1}s, average {:.1}s",
            task_count,
            serial_total.as_secs_f64(),
            avg.as_secs_f64()
        ));

        // Step 4: size the pool.
        let worker_count = task_count.min(self.config.max_workers);
        reasoning.push(format!(
            "worker pool sized to min(max_workers={}, task_count={}) = {}",
            self.config.max_workers, task_count, worker_count
        ));

        // Step 5: does isolation pay for itself?
        let any_mutating = self.any_mutating_agent(tasks).await;
        let overhead_ok = self.config.isolation_fixed_cost.as_secs_f64()
            < 0.10 * avg.as_secs_f64();
        let isolate = any_mutating && overhead_ok;
        if any_mutating {
            reasoning.push(if isolate {
                format!(
                    "file-mutating agent present and isolation cost {:.1}s is under 10% of the {:.1}s average task: isolating",
                    self.config.isolation_fixed_cost.as_secs_f64(),
                    avg.as_secs_f64()
                )
            } else {
                format!(
                    "file-mutating agent present but isolation cost {:.1}s would dominate the {:.1}s average task: not isolating",
                    self.config.isolation_fixed_cost.as_secs_f64(),
                    avg.as_secs_f64()
                )
            });
        } else {
            reasoning.push("no file-mutating agents: isolation unnecessary".to_string());
        }

        // Step 8 (ordering): short tasks are not worth the pool at all.
        if avg < self.config.sequential_threshold {
            reasoning.push(format!(
                "average task ({:.1}s) is under the {:.0}s threshold: pool overhead would dominate, running sequentially",
                avg.as_secs_f64(),
                self.config.sequential_threshold.as_secs_f64()
            ));
            let confidence = self.confidence(task_count, &durations, 1.0, &mut reasoning);
            return ExecutionPlan {
                strategy: ExecutionStrategy::Sequential,
                worker_count: 1,
                predicted_speedup: 1.0,
                predicted_duration: serial_total,
                confidence,
                reasoning,
            };
        }

        // Step 6: speedup model.
        let (speedup, predicted_duration) =
            self.model_speedup(task_count, worker_count, isolate, serial_total, &mut reasoning);

        // Step 7: explainable confidence.
        let confidence = self.confidence(task_count, &durations, speedup, &mut reasoning);

        let strategy = if isolate {
            ExecutionStrategy::ParallelIsolated
        } else {
            ExecutionStrategy::Parallel
        };
        reasoning.push(format!("selected strategy: {}", strategy));

        ExecutionPlan {
            strategy,
            worker_count,
            predicted_speedup: speedup,
            predicted_duration,
            confidence,
            reasoning,
        }
    }

    /// Duration estimate per task: explicit override, else the learned
    /// moving average for that agent, else the static default.
    async fn estimate_durations(&self, tasks: &[Task]) -> Vec<(AgentId, Duration)> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            let duration = match task.estimated_duration {
                Some(d) => d,
                None => match self.knowledge.historical_duration(task.agent_id).await {
                    Some(d) => d,
                    None => self.config.default_task_duration,
                },
            };
            out.push((task.agent_id, duration));
        }
        out
    }

    async fn any_mutating_agent(&self, tasks: &[Task]) -> bool {
        for task in tasks {
            if let Some(agent) = self.registry.get(task.agent_id).await {
                if agent.mutates_shared_files() {
                    return true;
                }
            }
        }
        false
    }

    /// Theoretical maximum capped by pool and batch size, degraded by the
    /// empirical efficiency factor and overhead fractions.
    fn model_speedup(
        &self,
        task_count: usize,
        worker_count: usize,
        isolated: bool,
        serial_total: Duration,
        reasoning: &mut Vec<String>,
    ) -> (f64, Duration) {
        let theoretical_max = task_count.min(worker_count) as f64;
        let overhead = self.config.coordination_overhead
            + if isolated {
                self.config.isolation_overhead_fraction
            } else {
                0.0
            };
        let speedup =
            (theoretical_max * self.config.parallel_efficiency * (1.0 - overhead)).max(1.0);
        let predicted_duration = Duration::from_secs_f64(serial_total.as_secs_f64() / speedup);
        reasoning.push(format!(
            "theoretical max speedup {:.1}x, efficiency {:.0}%, overhead {:.0}%: expecting {:.2}x ({:.1}s predicted)",
            theoretical_max,
            self.config.parallel_efficiency * 100.0,
            overhead * 100.0,
            speedup,
            predicted_duration.as_secs_f64()
        ));
        (speedup, predicted_duration)
    }

    /// Additive confidence: base 0.5 plus bonuses per task-count,
    /// duration, and speedup bucket, capped.
    fn confidence(
        &self,
        task_count: usize,
        durations: &[(AgentId, Duration)],
        speedup: f64,
        reasoning: &mut Vec<String>,
    ) -> f64 {
        let mut confidence: f64 = 0.5;
        let mut notes = vec!["base 0.5".to_string()];

        if task_count >= 4 {
            confidence += 0.2;
            notes.push(format!("{} tasks: +0.2", task_count));
        } else if task_count >= 2 {
            confidence += 0.1;
            notes.push(format!("{} tasks: +0.1", task_count));
        }

        let avg_secs = if durations.is_empty() {
            0.0
        } else {
            durations.iter().map(|(_, d)| d.as_secs_f64()).sum::<f64>() / durations.len() as f64
        };
        if avg_secs >= 60.0 {
            confidence += 0.2;
            notes.push(format!("{:.0}s average duration: +0.2", avg_secs));
        } else if avg_secs >= 30.0 {
            confidence += 0.1;
            notes.push(format!("{:.0}s average duration: +0.1", avg_secs));
        }

        if speedup >= 2.5 {
            confidence += 0.2;
            notes.push(format!("{:.2}x speedup: +0.2", speedup));
        } else if speedup >= 1.5 {
            confidence += 0.1;
            notes.push(format!("{:.2}x speedup: +0.1", speedup));
        }

        let capped = confidence.min(self.config.confidence_cap);
        reasoning.push(format!(
            "confidence {:.2} ({}){}",
            capped,
            notes.join(", "),
            if capped < confidence {
                format!(", capped at {:.2}", self.config.confidence_cap)
            } else {
                String::new()
            }
        ));
        capped
    }

    /// Feed a realized execution back into the knowledge store so future
    /// plans for the same (strategy, agent set) can be compared against
    /// reality.
    pub async fn record_realized(
        &self,
        plan: &ExecutionPlan,
        agents: &[AgentId],
        actual_duration: Duration,
        success_rate: f64,
    ) {
        self.knowledge
            .record_execution_outcome(
                plan.strategy.as_str(),
                agents,
                RealizedOutcome {
                    predicted_duration: plan.predicted_duration,
                    actual_duration,
                    success_rate,
                    recorded_at: chrono::Utc::now(),
                },
            )
            .await;
        tracing::debug!(
            strategy = %plan.strategy,
            predicted_secs = plan.predicted_duration.as_secs_f64(),
            actual_secs = actual_duration.as_secs_f64(),
            success_rate,
            "Realized plan outcome recorded"
        );
    }
}
