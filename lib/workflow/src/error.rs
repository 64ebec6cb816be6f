//! Error types for the workflow crate.
//!
//! Errors are layered:
//! - `ConditionError`: a definition's condition cannot be parsed or evaluated
//! - `DefinitionError`: a definition is structurally unusable
//! - `TriggerMatchError`: a definition was skipped while matching an event
//! - `ExecutionError`: a mutation would break an execution instance invariant
//!
//! Boundary errors (`ApprovalError`, `DispatchError`, `StoreError`,
//! `OrchestratorError`) live next to the component that raises them.

use crate::execution::ExecutionStatus;
use flowgate_core::{ExecutionId, WorkflowId};
use std::fmt;

/// Errors from parsing or evaluating a condition predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The condition JSON does not describe a known predicate.
    Malformed { reason: String },
    /// A predicate named an empty field path.
    EmptyFieldPath,
    /// An `all`/`any` group has no members.
    EmptyGroup { op: &'static str },
    /// The payload value and the predicate operand cannot be compared.
    TypeMismatch { field: String, reason: String },
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed condition: {reason}"),
            Self::EmptyFieldPath => write!(f, "condition field path is empty"),
            Self::EmptyGroup { op } => write!(f, "'{op}' condition has no members"),
            Self::TypeMismatch { field, reason } => {
                write!(f, "cannot evaluate condition on '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConditionError {}

/// Errors from validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// The definition has no actions.
    NoActions { workflow_id: WorkflowId },
    /// Two actions share the same order.
    DuplicateOrder { workflow_id: WorkflowId, order: u32 },
    /// An approval spec cannot be satisfied.
    InvalidApproval {
        workflow_id: WorkflowId,
        order: u32,
        reason: String,
    },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActions { workflow_id } => {
                write!(f, "workflow {workflow_id} has no actions")
            }
            Self::DuplicateOrder { workflow_id, order } => {
                write!(f, "workflow {workflow_id} repeats action order {order}")
            }
            Self::InvalidApproval {
                workflow_id,
                order,
                reason,
            } => {
                write!(
                    f,
                    "workflow {workflow_id} action {order} has an invalid approval: {reason}"
                )
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

/// A definition that was skipped while evaluating an event.
///
/// These are reported alongside the match results; they never abort the
/// evaluation of other definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerMatchError {
    /// The definition's condition is malformed.
    MalformedCondition {
        workflow_id: WorkflowId,
        source: ConditionError,
    },
    /// The definition matched but cannot be executed.
    InvalidDefinition { source: DefinitionError },
}

impl TriggerMatchError {
    /// Returns the workflow that was skipped.
    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            Self::MalformedCondition { workflow_id, .. } => *workflow_id,
            Self::InvalidDefinition { source } => match source {
                DefinitionError::NoActions { workflow_id }
                | DefinitionError::DuplicateOrder { workflow_id, .. }
                | DefinitionError::InvalidApproval { workflow_id, .. } => *workflow_id,
            },
        }
    }
}

impl fmt::Display for TriggerMatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCondition {
                workflow_id,
                source,
            } => write!(f, "workflow {workflow_id} skipped: {source}"),
            Self::InvalidDefinition { source } => write!(f, "definition skipped: {source}"),
        }
    }
}

impl std::error::Error for TriggerMatchError {}

/// Errors raised when a mutation would violate an execution invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The instance is already terminal.
    AlreadyTerminal {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// The step is not the next action in the snapshot.
    UnexpectedStep {
        execution_id: ExecutionId,
        expected: Option<u32>,
        got: u32,
    },
    /// The instance cannot complete while actions remain.
    ActionsRemaining {
        execution_id: ExecutionId,
        next_order: u32,
    },
    /// No pending approval exists for the action.
    NoPendingApproval {
        execution_id: ExecutionId,
        action_order: u32,
    },
    /// An approval for the action is already open.
    ApprovalAlreadyOpen {
        execution_id: ExecutionId,
        action_order: u32,
    },
    /// The action does not carry an approval requirement.
    ActionNotGated {
        execution_id: ExecutionId,
        action_order: u32,
    },
    /// The approval deadline cannot be represented.
    DeadlineOutOfRange {
        execution_id: ExecutionId,
        action_order: u32,
    },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyTerminal {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} is already {status}"),
            Self::UnexpectedStep {
                execution_id,
                expected: Some(expected),
                got,
            } => write!(
                f,
                "execution {execution_id} expected a step for action {expected}, got {got}"
            ),
            Self::UnexpectedStep {
                execution_id,
                expected: None,
                got,
            } => write!(
                f,
                "execution {execution_id} has no actions left, got a step for {got}"
            ),
            Self::ActionsRemaining {
                execution_id,
                next_order,
            } => write!(
                f,
                "execution {execution_id} cannot complete, action {next_order} has not run"
            ),
            Self::NoPendingApproval {
                execution_id,
                action_order,
            } => write!(
                f,
                "execution {execution_id} has no pending approval for action {action_order}"
            ),
            Self::ApprovalAlreadyOpen {
                execution_id,
                action_order,
            } => write!(
                f,
                "execution {execution_id} already has an approval open for action {action_order}"
            ),
            Self::ActionNotGated {
                execution_id,
                action_order,
            } => write!(
                f,
                "action {action_order} of execution {execution_id} does not require approval"
            ),
            Self::DeadlineOutOfRange {
                execution_id,
                action_order,
            } => write!(
                f,
                "approval deadline for action {action_order} of execution {execution_id} is out of range"
            ),
        }
    }
}

impl std::error::Error for ExecutionError {}
