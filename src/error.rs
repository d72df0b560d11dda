//! Error taxonomy for the coordination core.
//!
//! Two propagation classes:
//! - Transient failures are absorbed by the retry logic in the healing
//!   engine and only surface once retries are exhausted.
//! - Structural and graph-integrity failures surface synchronously to the
//!   caller, naming the violated invariant.
//!
//! `UnresolvedIncident` is deliberately *not* an error type: it is report
//! data carried back to the operator in the mission report and is never
//! silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::versioning::SemVer;

/// Errors surfaced by the coordination core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FleetError {
    /// Network/timeout-class failure. Retried locally with backoff;
    /// bubbles up only when retries exhaust.
    #[error("transient failure: {signature}")]
    Transient { signature: String },

    /// Bad input or incompatible version. Never retried.
    #[error("structural failure: {reason}")]
    Structural { reason: String },

    /// Adding the edge would form a cycle. The graph is left unmodified.
    #[error("dependency {from} -> {to} would create a cycle: {}", cycle.join(" -> "))]
    CircularDependency {
        from: String,
        to: String,
        cycle: Vec<String>,
    },

    /// No prior version exists to roll back to.
    #[error("no prior version to roll back to for agent {agent_id}")]
    RollbackNotFound { agent_id: AgentId },

    /// The agent is not present in the registry.
    #[error("unknown agent {agent_id}")]
    UnknownAgent { agent_id: AgentId },

    /// Version numbers must be strictly increasing per agent.
    #[error("version {proposed} does not increase on current {current}")]
    VersionNotIncreasing { current: SemVer, proposed: SemVer },

    /// Invalid mission/task state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl FleetError {
    /// Whether this error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Transient { .. })
    }
}

/// An incident the healing engine could not resolve autonomously:
/// retries exhausted, no matching pattern, or confidence too low to act.
///
/// Always carried in the mission report for operator visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedIncident {
    pub agent_id: AgentId,
    pub error_signature: String,
    /// Why the engine declined to act (or ran out of options).
    pub reason: String,
    /// Ordered decision trail, human-readable.
    pub reasoning: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn transient_classification() {
        let e = FleetError::Transient {
            signature: "connection reset".to_string(),
        };
        assert!(e.is_transient());

        let e = FleetError::Structural {
            reason: "payload missing field".to_string(),
        };
        assert!(!e.is_transient());
    }

    #[test]
    fn cycle_error_names_the_cycle() {
        let e = FleetError::CircularDependency {
            from: "a".to_string(),
            to: "b".to_string(),
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        let msg = e.to_string();
        assert!(msg.contains("a -> b -> a"));
    }

    #[test]
    fn unknown_agent_displays_id() {
        let id = AgentId::from_uuid(Uuid::nil());
        let e = FleetError::UnknownAgent { agent_id: id };
        assert!(e.to_string().contains("00000000"));
    }
}
