//! # Fleet Core
//!
//! Meta-coordination core for a fleet of worker agents.
//!
//! This library provides:
//! - A knowledge store of remediation patterns, version history, and
//!   realized execution outcomes
//! - Continuous health scoring with push notifications on degradation
//! - Version and dependency management with impact analysis, phased
//!   rollouts, and append-only rollback
//! - A self-healing engine with confidence-gated autonomous fixes
//! - A parallel execution optimizer with an explainable performance model
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │           Coordinator            │
//!        │  (plans, dispatches, reports)    │
//!        └───┬──────────┬──────────┬────────┘
//!            │          │          │
//!            ▼          ▼          ▼
//!     ┌───────────┐ ┌────────┐ ┌──────────┐
//!     │ Optimizer │ │ Health │ │ Healing  │
//!     └─────┬─────┘ └───┬────┘ └────┬─────┘
//!           │           │           │
//!           └───────────┼───────────┘
//!                       ▼
//!              ┌─────────────────┐
//!              │ Knowledge Store │
//!              └─────────────────┘
//! ```
//!
//! ## Mission Flow
//! 1. Receive a mission (batch of tasks for registered agents)
//! 2. Plan concurrency, worker count, and isolation
//! 3. Dispatch through the worker pool; route failures through healing
//! 4. Feed outcomes back into health and knowledge, return the report
//!
//! ## Modules
//! - `coordinator`: mission orchestration and reporting
//! - `knowledge`: shared learning store
//! - `healing`: autonomous failure remediation
//! - `versioning`: versions, dependencies, rollouts, rollback

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod healing;
pub mod health;
pub mod knowledge;
pub mod mission;
pub mod optimizer;
pub mod versioning;
pub mod workspace;

pub use agent::{Agent, AgentId, AgentInvoker, AgentRegistry, CapabilityTag, InvocationOutcome};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{FleetError, UnresolvedIncident};
pub use healing::{HealingConfig, HealingDecision, HealingReport, SelfHealingEngine};
pub use health::{HealthConfig, HealthMonitor, HealthSample, HealthState, HealthStateChange};
pub use knowledge::{KnowledgeStore, RemediationPattern, RiskTier, VersionRecord};
pub use mission::{Mission, MissionReport, MissionStatus, Task, TaskResult, TaskResultStatus};
pub use optimizer::{
    ExecutionPlan, ExecutionStrategy, OptimizerConfig, ParallelExecutionOptimizer, PlanOverrides,
};
pub use versioning::{
    RollbackResult, RolloutPlan, SemVer, SemVerExt, UpdateImpact, UpdateRisk, VersionBump,
    VersionManager,
};
pub use workspace::{IsolatedWorkspace, WorkspaceManager};
