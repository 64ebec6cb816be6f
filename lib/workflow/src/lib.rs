//! Workflow execution engine for flowgate.
//!
//! This crate turns declarative workflow definitions into persisted,
//! resumable execution instances:
//!
//! - **Definitions**: trigger type, optional condition, ordered actions
//! - **Trigger matching**: which definitions a domain event starts
//! - **Approval gates**: sequential or parallel human sign-off with expiry
//! - **Dispatch**: handing actions to registered handlers
//! - **Orchestration**: the resumable per-action loop over a revisioned store
//! - **Storage**: in-memory and NATS JetStream key-value execution stores

pub mod approval;
pub mod condition;
pub mod definition;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod nats;
pub mod orchestrator;
pub mod store;
pub mod trigger;

pub use approval::{ApprovalError, ApprovalMode, ApprovalState, ApprovalStatus};
pub use condition::Condition;
pub use definition::{ActionSpec, ActionType, ApprovalSpec, TriggerType, WorkflowDefinition};
pub use dispatch::{
    ActionContext, ActionDispatcher, ActionHandler, ActionResult, DispatchError, HandlerRegistry,
};
pub use error::{ConditionError, DefinitionError, ExecutionError, TriggerMatchError};
pub use execution::{ExecutionInstance, ExecutionStatus, StepOutcome, StepResult};
pub use nats::{NatsConfig, NatsExecutionStore};
pub use orchestrator::{
    EventOutcome, Orchestrator, OrchestratorError, RecoveryReport, StartFailure, StatusCounts,
    SweepReport,
};
pub use store::{ExecutionStore, InMemoryExecutionStore, Revision, StoreError, Versioned};
pub use trigger::{DomainEvent, MatchReport, TriggerMatcher};
