//! Mission and task types, and the mission lifecycle state machine.
//!
//! Missions are transient: they exist to produce a [`MissionReport`] and
//! are not persisted beyond the realized outcome the coordinator feeds
//! back into the knowledge store.
//!
//! # State Machine
//! ```text
//! Pending -> Planning -> Executing -> Completed
//!                              |  \-> PartiallyFailed
//!                              |  \-> Failed
//!                              \-> Healing -> Retrying -> Executing
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::{FleetError, UnresolvedIncident};
use crate::healing::HealingReport;
use crate::optimizer::ExecutionPlan;

/// One unit of work for a specific agent. The payload is opaque to the
/// core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub payload: serde_json::Value,
    /// Explicit caller estimate; overrides learned history when present.
    pub estimated_duration: Option<Duration>,
}

impl Task {
    pub fn new(agent_id: AgentId, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            payload,
            estimated_duration: None,
        }
    }

    pub fn with_estimate(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }
}

/// An ordered batch of tasks submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub tasks: Vec<Task>,
    pub submitted_at: DateTime<Utc>,
}

impl Mission {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tasks,
            submitted_at: Utc::now(),
        }
    }
}

/// Mission lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Planning,
    Executing,
    /// A task failure is being remediated.
    Healing,
    /// A remediated task is being re-dispatched.
    Retrying,
    Completed,
    PartiallyFailed,
    Failed,
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Healing => "healing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Failed
        )
    }

    fn allows(&self, to: MissionStatus) -> bool {
        use MissionStatus::*;
        matches!(
            (*self, to),
            (Pending, Planning)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Healing)
                | (Healing, Retrying)
                | (Healing, Executing)
                | (Retrying, Executing)
                | (Executing, Completed)
                | (Executing, PartiallyFailed)
                | (Executing, Failed)
        )
    }

    /// Validated transition.
    pub fn advance(&mut self, to: MissionStatus) -> Result<(), FleetError> {
        if self.allows(to) {
            *self = to;
            Ok(())
        } else {
            Err(FleetError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Terminal status of a single task within a mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Completed,
    Failed,
    TimedOut,
    /// Not started before the mission was cancelled.
    Skipped,
}

/// Outcome of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_id: AgentId,
    pub status: TaskResultStatus,
    pub output: serde_json::Value,
    pub error_signature: Option<String>,
    pub duration: Duration,
    /// Whether this result came from a retry after remediation.
    pub healed_retry: bool,
}

/// The report returned to the operator for every submitted mission.
///
/// Unresolved incidents are always surfaced here — never dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionReport {
    pub mission_id: Uuid,
    pub status: MissionStatus,
    /// The plan that was actually used (including any caller overrides
    /// and the optimizer's reasoning trail).
    pub plan: ExecutionPlan,
    pub task_results: Vec<TaskResult>,
    pub healing_actions: Vec<HealingReport>,
    pub unresolved_incidents: Vec<UnresolvedIncident>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MissionReport {
    /// Realized wall-clock duration of the mission.
    pub fn actual_duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Fraction of tasks that completed.
    pub fn success_rate(&self) -> f64 {
        if self.task_results.is_empty() {
            return 0.0;
        }
        let ok = self
            .task_results
            .iter()
            .filter(|r| r.status == TaskResultStatus::Completed)
            .count();
        ok as f64 / self.task_results.len() as f64
    }
}
