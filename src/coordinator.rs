//! Mission orchestration: planning, dispatch, failure routing, and the
//! final report.
//!
//! The coordinator owns the mission lifecycle end to end. It asks the
//! optimizer for an execution plan, dispatches tasks through the worker
//! pool under a semaphore, routes every failure through the self-healing
//! engine exactly once, and feeds all outcomes back into the health
//! monitor and knowledge store. Every submitted mission produces a
//! [`MissionReport`] with the plan, per-task results, healing actions,
//! and any unresolved incidents.
//!
//! Cancellation is cooperative: in-flight tasks run to completion,
//! unstarted tasks are reported as skipped, and isolated workspaces are
//! released either way.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentId, AgentInvoker, AgentRegistry, InvocationOutcome};
use crate::error::UnresolvedIncident;
use crate::healing::{HealingDecision, HealingReport, SelfHealingEngine};
use crate::health::{HealthMonitor, HealthSample};
use crate::knowledge::KnowledgeStore;
use crate::mission::{
    Mission, MissionReport, MissionStatus, Task, TaskResult, TaskResultStatus,
};
use crate::optimizer::{ExecutionPlan, ParallelExecutionOptimizer, PlanOverrides};
use crate::workspace::WorkspaceManager;

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Per-task timeout is this multiple of the task's estimated duration.
    pub timeout_multiplier: f64,
    /// Floor for the per-task timeout so short estimates are not starved.
    pub min_task_timeout: Duration,
    /// Estimate used when neither the caller nor history knows a duration.
    pub default_task_duration: Duration,
    /// Root directory for isolated workspaces.
    pub workspace_root: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout_multiplier: std::env::var("FLEET_TASK_TIMEOUT_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10.0),
            min_task_timeout: Duration::from_secs(5),
            default_task_duration: Duration::from_secs(30),
            workspace_root: std::env::var("FLEET_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("fleet-workspaces")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Central orchestrator for the fleet.
pub struct Coordinator {
    registry: AgentRegistry,
    knowledge: Arc<KnowledgeStore>,
    health: Arc<HealthMonitor>,
    healing: Arc<SelfHealingEngine>,
    optimizer: Arc<ParallelExecutionOptimizer>,
    workspaces: WorkspaceManager,
    invoker: Arc<dyn AgentInvoker>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        registry: AgentRegistry,
        knowledge: Arc<KnowledgeStore>,
        health: Arc<HealthMonitor>,
        healing: Arc<SelfHealingEngine>,
        optimizer: Arc<ParallelExecutionOptimizer>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        Self::with_config(
            registry,
            knowledge,
            health,
            healing,
            optimizer,
            invoker,
            CoordinatorConfig::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_config(
        registry: AgentRegistry,
        knowledge: Arc<KnowledgeStore>,
        health: Arc<HealthMonitor>,
        healing: Arc<SelfHealingEngine>,
        optimizer: Arc<ParallelExecutionOptimizer>,
        invoker: Arc<dyn AgentInvoker>,
        config: CoordinatorConfig,
    ) -> Self {
        let workspaces = WorkspaceManager::new(config.workspace_root.clone());
        Self {
            registry,
            knowledge,
            health,
            healing,
            optimizer,
            workspaces,
            invoker,
            config,
        }
    }

    /// Run a mission to completion with no overrides or cancellation.
    pub async fn submit_mission(&self, mission: Mission) -> MissionReport {
        self.submit_mission_with(mission, PlanOverrides::default(), CancellationToken::new())
            .await
    }

    /// Run a mission with caller plan overrides and a cancellation token.
    ///
    /// Always returns a report; orchestration errors surface as failed
    /// task results or unresolved incidents, never as a lost mission.
    pub async fn submit_mission_with(
        &self,
        mission: Mission,
        overrides: PlanOverrides,
        cancel: CancellationToken,
    ) -> MissionReport {
        let started_at = Utc::now();
        let mut status = MissionStatus::Pending;
        tracing::info!(
            mission_id = %mission.id,
            tasks = mission.tasks.len(),
            "Mission submitted"
        );

        // Pending -> Planning. These transitions cannot fail from the
        // states the coordinator drives, so errors are logged, not bubbled.
        self.advance(&mut status, MissionStatus::Planning, mission.id);
        let plan = self
            .optimizer
            .plan_with_overrides(&mission.tasks, overrides)
            .await;
        tracing::info!(
            mission_id = %mission.id,
            strategy = %plan.strategy,
            workers = plan.worker_count,
            predicted_speedup = plan.predicted_speedup,
            confidence = plan.confidence,
            "Execution plan ready"
        );

        self.advance(&mut status, MissionStatus::Executing, mission.id);
        let mut results = self.dispatch(&mission, &plan, &cancel).await;

        // Route failures through healing, once per failed task.
        let mut healing_actions: Vec<HealingReport> = Vec::new();
        let mut unresolved: Vec<UnresolvedIncident> = Vec::new();
        let failed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                matches!(r.status, TaskResultStatus::Failed | TaskResultStatus::TimedOut)
            })
            .map(|(i, _)| i)
            .collect();

        if !failed.is_empty() && !cancel.is_cancelled() {
            self.advance(&mut status, MissionStatus::Healing, mission.id);
            let mut any_retry = false;
            for idx in failed {
                let task = mission
                    .tasks
                    .iter()
                    .find(|t| t.id == results[idx].task_id)
                    .cloned();
                let Some(task) = task else { continue };
                let (report, healed) = self.heal_task(&task, &results[idx]).await;
                if let Some(incident) = report.incident.clone() {
                    unresolved.push(incident);
                }
                let retried = healed.is_some();
                if let Some(result) = healed {
                    results[idx] = result;
                }
                healing_actions.push(report);
                any_retry |= retried;
            }
            if any_retry {
                self.advance(&mut status, MissionStatus::Retrying, mission.id);
            }
            self.advance(&mut status, MissionStatus::Executing, mission.id);
        }

        let terminal = Self::terminal_status(&results);
        self.advance(&mut status, terminal, mission.id);
        let finished_at = Utc::now();

        let report = MissionReport {
            mission_id: mission.id,
            status,
            plan: plan.clone(),
            task_results: results,
            healing_actions,
            unresolved_incidents: unresolved,
            started_at,
            finished_at,
        };

        // Close the loop: realized outcome refines future plans.
        let agents: Vec<AgentId> = mission.tasks.iter().map(|t| t.agent_id).collect();
        self.optimizer
            .record_realized(&plan, &agents, report.actual_duration(), report.success_rate())
            .await;

        tracing::info!(
            mission_id = %mission.id,
            status = %report.status,
            success_rate = report.success_rate(),
            healing_actions = report.healing_actions.len(),
            unresolved = report.unresolved_incidents.len(),
            "Mission finished"
        );
        report
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    async fn dispatch(
        &self,
        mission: &Mission,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let semaphore = Arc::new(Semaphore::new(plan.worker_count.max(1)));
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let isolated = plan.strategy.isolated();

        for task in &mission.tasks {
            let task = task.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let invoker = self.invoker.clone();
            let workspaces = self.workspaces.clone();
            let timeout = self.task_timeout(&task).await;

            join_set.spawn(async move {
                // Closed semaphores cannot happen here; treat it like
                // cancellation if it ever does.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return skipped(&task),
                };
                if cancel.is_cancelled() {
                    return skipped(&task);
                }

                // The guard ties workspace lifetime to the task: dropped
                // (and the directory removed) on success, failure, and
                // timeout alike.
                let _workspace = if isolated {
                    match workspaces.acquire(task.id) {
                        Ok(ws) => Some(ws),
                        Err(e) => {
                            return TaskResult {
                                task_id: task.id,
                                agent_id: task.agent_id,
                                status: TaskResultStatus::Failed,
                                output: serde_json::Value::Null,
                                error_signature: Some(format!(
                                    "workspace acquisition failed: {}",
                                    e
                                )),
                                duration: Duration::ZERO,
                                healed_retry: false,
                            }
                        }
                    }
                } else {
                    None
                };

                invoke_once(&*invoker, &task, timeout, false).await
            });
        }

        let mut results = Vec::with_capacity(mission.tasks.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    self.record_outcome(&result).await;
                    results.push(result);
                }
                Err(e) => {
                    tracing::error!(mission_id = %mission.id, error = %e, "Task join failed");
                }
            }
        }
        // Stable report order regardless of completion order.
        let order: HashMap<Uuid, usize> = mission
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        results.sort_by_key(|r| order.get(&r.task_id).copied().unwrap_or(usize::MAX));
        results
    }

    /// Route one failed task through the healing engine. Returns the
    /// healing report and, when remediation warranted a re-dispatch, the
    /// replacement task result.
    async fn heal_task(
        &self,
        task: &Task,
        failed: &TaskResult,
    ) -> (HealingReport, Option<TaskResult>) {
        let signature = failed
            .error_signature
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        let timeout = self.task_timeout(task).await;

        // The retry callback is the transient path's re-invocation; a
        // successful call's result is kept so the work is not run twice.
        let retry_slot: Arc<Mutex<Option<TaskResult>>> = Arc::new(Mutex::new(None));
        let report = {
            let invoker = self.invoker.clone();
            let task = task.clone();
            let retry_slot = retry_slot.clone();
            self.healing
                .handle_failure(task.agent_id, &signature, move || {
                    let invoker = invoker.clone();
                    let task = task.clone();
                    let retry_slot = retry_slot.clone();
                    async move {
                        let result = invoke_once(&*invoker, &task, timeout, true).await;
                        let ok = result.status == TaskResultStatus::Completed;
                        if ok {
                            *retry_slot.lock().await = Some(result);
                        }
                        ok
                    }
                })
                .await
        };

        if !report.resolved {
            return (report, None);
        }

        match report.decision {
            HealingDecision::RetrySucceeded { .. } => {
                let result = retry_slot.lock().await.take();
                if let Some(ref r) = result {
                    self.record_outcome(r).await;
                }
                (report, result)
            }
            // An applied fix that held earns the task one re-dispatch.
            HealingDecision::AutoApplied { .. }
            | HealingDecision::AppliedFlaggedForReview { .. } => {
                let result = invoke_once(&*self.invoker, task, timeout, true).await;
                self.record_outcome(&result).await;
                (report, Some(result))
            }
            HealingDecision::Escalated => (report, None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Feedback and bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    /// Feed one task result into the health monitor and knowledge store.
    async fn record_outcome(&self, result: &TaskResult) {
        if result.status == TaskResultStatus::Skipped {
            return;
        }
        let success = result.status == TaskResultStatus::Completed;
        self.health
            .record_sample(HealthSample {
                agent_id: result.agent_id,
                timestamp: Utc::now(),
                success_rate: if success { 1.0 } else { 0.0 },
                p95_latency: result.duration,
                error_rate: if success { 0.0 } else { 1.0 },
            })
            .await;
        self.knowledge
            .record_task_outcome(result.agent_id, result.duration, success)
            .await;
        self.registry.touch_heartbeat(result.agent_id).await;
    }

    async fn task_timeout(&self, task: &Task) -> Duration {
        let estimate = match task.estimated_duration {
            Some(d) => d,
            None => self
                .knowledge
                .historical_duration(task.agent_id)
                .await
                .unwrap_or(self.config.default_task_duration),
        };
        estimate
            .mul_f64(self.config.timeout_multiplier)
            .max(self.config.min_task_timeout)
    }

    /// Failed is reserved for missions where work actually failed:
    /// a cancellation that only skipped tasks is an interrupted mission,
    /// not a failed one, and maps to PartiallyFailed.
    fn terminal_status(results: &[TaskResult]) -> MissionStatus {
        let completed = results
            .iter()
            .filter(|r| r.status == TaskResultStatus::Completed)
            .count();
        let failed = results
            .iter()
            .filter(|r| {
                matches!(r.status, TaskResultStatus::Failed | TaskResultStatus::TimedOut)
            })
            .count();
        if results.is_empty() || completed == results.len() {
            MissionStatus::Completed
        } else if completed > 0 || failed == 0 {
            MissionStatus::PartiallyFailed
        } else {
            MissionStatus::Failed
        }
    }

    fn advance(&self, status: &mut MissionStatus, to: MissionStatus, mission_id: Uuid) {
        if let Err(e) = status.advance(to) {
            tracing::error!(mission_id = %mission_id, error = %e, "Mission transition rejected");
        }
    }
}

/// One invocation attempt with its timeout, mapped to a task result.
async fn invoke_once(
    invoker: &dyn AgentInvoker,
    task: &Task,
    timeout: Duration,
    healed_retry: bool,
) -> TaskResult {
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(
        timeout,
        invoker.submit_task(task.agent_id, task.payload.clone()),
    )
    .await;

    match outcome {
        Ok(Ok(InvocationOutcome {
            success: true,
            output,
            duration,
            ..
        })) => TaskResult {
            task_id: task.id,
            agent_id: task.agent_id,
            status: TaskResultStatus::Completed,
            output,
            error_signature: None,
            duration,
            healed_retry,
        },
        Ok(Ok(outcome)) => TaskResult {
            task_id: task.id,
            agent_id: task.agent_id,
            status: TaskResultStatus::Failed,
            output: outcome.output,
            error_signature: outcome
                .error_signature
                .or_else(|| Some("unknown failure".to_string())),
            duration: outcome.duration,
            healed_retry,
        },
        Ok(Err(e)) => TaskResult {
            task_id: task.id,
            agent_id: task.agent_id,
            status: TaskResultStatus::Failed,
            output: serde_json::Value::Null,
            error_signature: Some(e.to_string()),
            duration: started.elapsed(),
            healed_retry,
        },
        Err(_) => {
            tracing::warn!(
                task_id = %task.id,
                agent_id = %task.agent_id,
                timeout_secs = timeout.as_secs_f64(),
                "Task timed out"
            );
            TaskResult {
                task_id: task.id,
                agent_id: task.agent_id,
                status: TaskResultStatus::TimedOut,
                output: serde_json::Value::Null,
                error_signature: Some(format!(
                    "task timed out after {:.1}s",
                    timeout.as_secs_f64()
                )),
                duration: started.elapsed(),
                healed_retry,
            }
        }
    }
}

fn skipped(task: &Task) -> TaskResult {
    TaskResult {
        task_id: task.id,
        agent_id: task.agent_id,
        status: TaskResultStatus::Skipped,
        output: serde_json::Value::Null,
        error_signature: None,
        duration: Duration::ZERO,
        healed_retry: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, CapabilityTag};
    use crate::error::FleetError;
    use crate::healing::HealingConfig;
    use crate::health::HealthConfig;
    use crate::versioning::SemVer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Scriptable invoker: per-agent behavior keyed by call count.
    struct ScriptedInvoker {
        calls: AtomicU32,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        /// Calls (1-based) that should fail, and with what signature.
        failures: HashMap<u32, String>,
        /// After this many failures, further calls succeed.
        fail_only_first: bool,
    }

    impl ScriptedInvoker {
        fn succeeding() -> Self {
            Self {
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(5),
                failures: HashMap::new(),
                fail_only_first: false,
            }
        }

        fn failing_first(signature: &str) -> Self {
            let mut failures = HashMap::new();
            failures.insert(1, signature.to_string());
            Self {
                failures,
                fail_only_first: true,
                ..Self::succeeding()
            }
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedInvoker {
        async fn submit_task(
            &self,
            _agent_id: AgentId,
            payload: serde_json::Value,
        ) -> Result<InvocationOutcome, FleetError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let fail = if self.fail_only_first {
                self.failures.contains_key(&1) && call == 1
            } else {
                self.failures.contains_key(&call)
            };
            if fail {
                let sig = self
                    .failures
                    .values()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "scripted failure".to_string());
                Ok(InvocationOutcome::failed(sig, self.delay))
            } else {
                Ok(InvocationOutcome::ok(payload, self.delay))
            }
        }
    }

    struct Fixture {
        coordinator: Coordinator,
        invoker: Arc<ScriptedInvoker>,
        agent: AgentId,
    }

    async fn fixture_with(invoker: ScriptedInvoker, tags: Vec<CapabilityTag>) -> Fixture {
        let registry = AgentRegistry::new();
        let knowledge = Arc::new(KnowledgeStore::new());
        let health = Arc::new(HealthMonitor::with_config(HealthConfig::default()));
        let healing = Arc::new(SelfHealingEngine::with_config(
            knowledge.clone(),
            health.clone(),
            HealingConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                health_grace_period: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let optimizer = Arc::new(ParallelExecutionOptimizer::new(
            registry.clone(),
            knowledge.clone(),
        ));
        let agent = registry
            .register(Agent::new("exporter", SemVer::new(1, 0, 0), tags))
            .await;
        let invoker = Arc::new(invoker);
        let config = CoordinatorConfig {
            workspace_root: std::env::temp_dir().join(format!("fleet-test-{}", Uuid::new_v4())),
            ..Default::default()
        };
        let coordinator = Coordinator::with_config(
            registry,
            knowledge,
            health,
            healing,
            optimizer,
            invoker.clone(),
            config,
        );
        Fixture {
            coordinator,
            invoker,
            agent,
        }
    }

    fn tasks(agent: AgentId, n: usize, estimate: Duration) -> Vec<Task> {
        (0..n)
            .map(|i| {
                Task::new(agent, serde_json::json!({ "job": i })).with_estimate(estimate)
            })
            .collect()
    }

    #[tokio::test]
    async fn mission_of_independent_tasks_completes_in_parallel() {
        let fx = fixture_with(ScriptedInvoker::succeeding(), vec![CapabilityTag::ReadOnly]).await;
        let mission = Mission::new(tasks(fx.agent, 4, Duration::from_secs(60)));
        let report = fx.coordinator.submit_mission(mission).await;

        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.task_results.len(), 4);
        assert!(report
            .task_results
            .iter()
            .all(|r| r.status == TaskResultStatus::Completed));
        assert!(report.plan.worker_count > 1);
        assert!(report.healing_actions.is_empty());
        assert!(report.unresolved_incidents.is_empty());
        // All four ran, and the pool actually overlapped them.
        assert_eq!(fx.invoker.calls.load(Ordering::SeqCst), 4);
        assert!(fx.invoker.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn worker_pool_respects_the_planned_limit() {
        let fx = fixture_with(ScriptedInvoker::succeeding(), vec![CapabilityTag::ReadOnly]).await;
        let mission = Mission::new(tasks(fx.agent, 6, Duration::from_secs(60)));
        let report = fx
            .coordinator
            .submit_mission_with(
                mission,
                PlanOverrides {
                    worker_count: Some(2),
                    isolation: None,
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.plan.worker_count, 2);
        assert!(fx.invoker.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn transient_failure_is_healed_and_reported_as_retry() {
        let fx = fixture_with(
            ScriptedInvoker::failing_first("connection timeout talking to worker"),
            vec![CapabilityTag::ReadOnly],
        )
        .await;
        let mission = Mission::new(tasks(fx.agent, 1, Duration::from_secs(10)));
        let report = fx.coordinator.submit_mission(mission).await;

        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.task_results.len(), 1);
        assert_eq!(report.task_results[0].status, TaskResultStatus::Completed);
        assert!(report.task_results[0].healed_retry);
        assert_eq!(report.healing_actions.len(), 1);
        assert!(matches!(
            report.healing_actions[0].decision,
            HealingDecision::RetrySucceeded { .. }
        ));
        assert!(report.unresolved_incidents.is_empty());
    }

    #[tokio::test]
    async fn structural_failure_surfaces_as_unresolved_incident() {
        let fx = fixture_with(
            ScriptedInvoker::failing_first("payload missing field 'url'"),
            vec![CapabilityTag::ReadOnly],
        )
        .await;
        let mission = Mission::new(tasks(fx.agent, 1, Duration::from_secs(10)));
        let report = fx.coordinator.submit_mission(mission).await;

        // No pattern, no retry: the failure stands and is escalated.
        assert_eq!(report.status, MissionStatus::Failed);
        assert_eq!(report.task_results[0].status, TaskResultStatus::Failed);
        assert_eq!(report.unresolved_incidents.len(), 1);
        assert_eq!(
            report.unresolved_incidents[0].error_signature,
            "payload missing field 'url'"
        );
        // The failed work ran exactly once.
        assert_eq!(fx.invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mixed_outcomes_yield_partially_failed() {
        let mut invoker = ScriptedInvoker::succeeding();
        invoker.failures.insert(2, "schema validation failed".to_string());
        let fx = fixture_with(invoker, vec![CapabilityTag::ReadOnly]).await;
        let mission = Mission::new(tasks(fx.agent, 3, Duration::from_secs(10)));
        let report = fx
            .coordinator
            .submit_mission_with(
                mission,
                PlanOverrides {
                    worker_count: Some(1),
                    isolation: None,
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.status, MissionStatus::PartiallyFailed);
        assert!((report.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn slow_task_times_out() {
        let mut invoker = ScriptedInvoker::succeeding();
        invoker.delay = Duration::from_millis(200);
        let fx = fixture_with(invoker, vec![CapabilityTag::ReadOnly]).await;
        let config = CoordinatorConfig {
            timeout_multiplier: 1.0,
            min_task_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        // Rebuild with the tight timeout config.
        let fx2 = {
            let registry = AgentRegistry::new();
            let knowledge = Arc::new(KnowledgeStore::new());
            let health = Arc::new(HealthMonitor::new());
            let healing = Arc::new(SelfHealingEngine::with_config(
                knowledge.clone(),
                health.clone(),
                HealingConfig {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    health_grace_period: Duration::from_millis(1),
                    ..Default::default()
                },
            ));
            let optimizer = Arc::new(ParallelExecutionOptimizer::new(
                registry.clone(),
                knowledge.clone(),
            ));
            let agent = registry
                .register(Agent::new(
                    "slowpoke",
                    SemVer::new(1, 0, 0),
                    vec![CapabilityTag::ReadOnly],
                ))
                .await;
            let coordinator = Coordinator::with_config(
                registry,
                knowledge,
                health,
                healing,
                optimizer,
                fx.invoker.clone(),
                config,
            );
            (coordinator, agent)
        };

        let mission = Mission::new(tasks(fx2.1, 1, Duration::from_millis(20)));
        let report = fx2.0.submit_mission(mission).await;
        let result = &report.task_results[0];
        assert_eq!(result.status, TaskResultStatus::TimedOut);
        assert!(result
            .error_signature
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_skips_unstarted_tasks_and_finishes_in_flight() {
        let mut invoker = ScriptedInvoker::succeeding();
        invoker.delay = Duration::from_millis(50);
        let fx = fixture_with(invoker, vec![CapabilityTag::ReadOnly]).await;
        let cancel = CancellationToken::new();
        let mission = Mission::new(tasks(fx.agent, 6, Duration::from_secs(60)));

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel2.cancel();
        });
        let report = fx
            .coordinator
            .submit_mission_with(
                mission,
                PlanOverrides {
                    worker_count: Some(2),
                    isolation: None,
                },
                cancel,
            )
            .await;

        let completed = report
            .task_results
            .iter()
            .filter(|r| r.status == TaskResultStatus::Completed)
            .count();
        let skipped = report
            .task_results
            .iter()
            .filter(|r| r.status == TaskResultStatus::Skipped)
            .count();
        // The two in-flight tasks finish; the rest never start.
        assert_eq!(completed, 2);
        assert_eq!(skipped, 4);
        assert_eq!(report.status, MissionStatus::PartiallyFailed);
        // Cancellation is not failure: no healing ran.
        assert!(report.healing_actions.is_empty());
    }

    #[tokio::test]
    async fn cancelling_before_any_task_starts_is_not_failure() {
        let fx = fixture_with(ScriptedInvoker::succeeding(), vec![CapabilityTag::ReadOnly]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mission = Mission::new(tasks(fx.agent, 3, Duration::from_secs(60)));
        let report = fx
            .coordinator
            .submit_mission_with(mission, PlanOverrides::default(), cancel)
            .await;

        assert!(report
            .task_results
            .iter()
            .all(|r| r.status == TaskResultStatus::Skipped));
        // Nothing ran and nothing failed: interrupted, not Failed.
        assert_eq!(report.status, MissionStatus::PartiallyFailed);
        assert_eq!(fx.invoker.calls.load(Ordering::SeqCst), 0);
        assert!(report.healing_actions.is_empty());
        assert!(report.unresolved_incidents.is_empty());
    }

    #[tokio::test]
    async fn mutating_agents_get_isolated_workspaces() {
        let fx = fixture_with(
            ScriptedInvoker::succeeding(),
            vec![CapabilityTag::MutatesSharedFiles],
        )
        .await;
        let root = fx.coordinator.workspaces.root().to_path_buf();
        let mission = Mission::new(tasks(fx.agent, 3, Duration::from_secs(60)));
        let report = fx.coordinator.submit_mission(mission).await;

        assert_eq!(report.status, MissionStatus::Completed);
        assert!(report.plan.strategy.isolated());
        // Guards released: no per-task directories remain.
        let leftovers = std::fs::read_dir(&root)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn empty_mission_completes_trivially() {
        let fx = fixture_with(ScriptedInvoker::succeeding(), vec![CapabilityTag::ReadOnly]).await;
        let report = fx.coordinator.submit_mission(Mission::new(Vec::new())).await;
        assert_eq!(report.status, MissionStatus::Completed);
        assert!(report.task_results.is_empty());
        assert_eq!(report.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn realized_outcome_is_fed_back_to_the_knowledge_store() {
        let fx = fixture_with(ScriptedInvoker::succeeding(), vec![CapabilityTag::ReadOnly]).await;
        let mission = Mission::new(tasks(fx.agent, 4, Duration::from_secs(60)));
        let report = fx.coordinator.submit_mission(mission).await;

        let outcomes = fx
            .coordinator
            .knowledge
            .execution_outcomes(report.plan.strategy.as_str(), &[fx.agent])
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!((outcomes[0].success_rate - 1.0).abs() < 1e-9);
    }
}
