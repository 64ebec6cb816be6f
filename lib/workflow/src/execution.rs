//! Execution instance state machine.
//!
//! An `ExecutionInstance` is the whole persisted record of one workflow run.
//! Every mutation goes through a method here so the invariants hold no
//! matter which caller drives the instance:
//!
//! - steps are appended strictly in snapshot order, at most once per action
//! - `pending_approvals` is empty whenever the status is not `Running`
//! - a terminal instance is never mutated again

use crate::approval::{ApprovalState, ApprovalStatus};
use crate::definition::{ActionSpec, ActionType, WorkflowDefinition};
use crate::error::ExecutionError;
use crate::trigger::DomainEvent;
use chrono::{DateTime, Duration, Utc};
use flowgate_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Error message recorded when an approval passes its deadline.
pub const APPROVAL_EXPIRED_MESSAGE: &str = "approval expired";

/// The overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Actions are being processed or the run is waiting on an approval.
    Running,
    /// Every action succeeded.
    Completed,
    /// An action failed or an approval was rejected or expired.
    Failed,
    /// Stopped by an explicit cancel request.
    Cancelled,
}

impl ExecutionStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 4] = [
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns the snake_case name used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The handler reported success.
    Success,
    /// The handler reported failure, or the action could not be dispatched.
    Failure,
}

/// Record of one processed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Order of the action in the snapshot.
    pub action_order: u32,
    /// Type of the action.
    pub action_type: ActionType,
    /// Whether the action succeeded.
    pub outcome: StepOutcome,
    /// When dispatch started.
    pub started_at: DateTime<Utc>,
    /// When dispatch returned.
    pub finished_at: DateTime<Utc>,
    /// Handler output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    /// Handler message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepResult {
    /// Returns true if the step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Success
    }
}

/// Frozen copy of the definition taken when the instance was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Workflow name at creation time.
    pub workflow_name: String,
    /// Actions sorted by order.
    pub actions: Vec<ActionSpec>,
}

impl From<&WorkflowDefinition> for ExecutionSnapshot {
    fn from(definition: &WorkflowDefinition) -> Self {
        Self {
            workflow_name: definition.name.clone(),
            actions: definition.ordered_actions(),
        }
    }
}

/// Checkpoint written just before an action is handed to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightAction {
    /// Order of the action being dispatched.
    pub action_order: u32,
    /// When dispatch started.
    pub started_at: DateTime<Utc>,
}

/// A pending cancel request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Who asked for the cancellation.
    pub requested_by: String,
    /// When it was requested.
    pub requested_at: DateTime<Utc>,
}

/// The persisted record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    /// Unique identifier for this execution.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution was created.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Who started it (the event actor, or `system`).
    pub started_by: String,
    /// The event that started the execution.
    pub trigger: DomainEvent,
    /// Frozen action list.
    pub snapshot: ExecutionSnapshot,
    /// Processed actions, in order.
    pub steps_completed: Vec<StepResult>,
    /// Open approval gates (at most one per gated action).
    pub pending_approvals: Vec<ApprovalState>,
    /// Gates that have resolved.
    #[serde(default)]
    pub resolved_approvals: Vec<ApprovalState>,
    /// Action currently being dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlightAction>,
    /// Cancel request waiting to be applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<CancelRequest>,
    /// Why the execution failed.
    pub error_message: Option<String>,
}

impl ExecutionInstance {
    /// Creates a running instance for a definition and triggering event.
    #[must_use]
    pub fn new(definition: &WorkflowDefinition, trigger: DomainEvent, now: DateTime<Utc>) -> Self {
        let started_by = trigger.actor.clone().unwrap_or_else(|| "system".to_string());
        Self {
            id: ExecutionId::new(),
            workflow_id: definition.id,
            status: ExecutionStatus::Running,
            started_at: now,
            completed_at: None,
            started_by,
            trigger,
            snapshot: ExecutionSnapshot::from(definition),
            steps_completed: Vec::new(),
            pending_approvals: Vec::new(),
            resolved_approvals: Vec::new(),
            in_flight: None,
            cancel_requested: None,
            error_message: None,
        }
    }

    /// Returns the time from start to completion, once terminal.
    #[must_use]
    pub fn execution_time(&self) -> Option<Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    /// Returns true if the instance is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the next action with no recorded step.
    #[must_use]
    pub fn next_action(&self) -> Option<&ActionSpec> {
        match self.steps_completed.last() {
            None => self.snapshot.actions.first(),
            Some(last) => self
                .snapshot
                .actions
                .iter()
                .find(|a| a.order > last.action_order),
        }
    }

    /// Returns the snapshot action with the given order.
    #[must_use]
    pub fn action(&self, order: u32) -> Option<&ActionSpec> {
        self.snapshot.actions.iter().find(|a| a.order == order)
    }

    /// Returns the open gate for an action.
    #[must_use]
    pub fn pending_approval(&self, order: u32) -> Option<&ApprovalState> {
        self.pending_approvals
            .iter()
            .find(|a| a.action_order == order)
    }

    /// Returns the open gate for an action, mutably.
    pub fn pending_approval_mut(&mut self, order: u32) -> Option<&mut ApprovalState> {
        self.pending_approvals
            .iter_mut()
            .find(|a| a.action_order == order)
    }

    /// Returns true if the action's gate resolved approved.
    #[must_use]
    pub fn is_approved(&self, order: u32) -> bool {
        self.resolved_approvals
            .iter()
            .any(|a| a.action_order == order && a.is_approved())
    }

    /// Returns true if the instance is parked on an open approval.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        !self.is_terminal() && !self.pending_approvals.is_empty()
    }

    /// Returns an error if the instance is terminal.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::AlreadyTerminal` for terminal instances.
    pub fn ensure_running(&self) -> Result<(), ExecutionError> {
        if self.is_terminal() {
            return Err(ExecutionError::AlreadyTerminal {
                execution_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Opens an approval gate for a gated action.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal, the action is not the
    /// next one, it is not gated, a gate is already open for it, or its
    /// deadline cannot be represented.
    pub fn open_approval(
        &mut self,
        order: u32,
        now: DateTime<Utc>,
    ) -> Result<&ApprovalState, ExecutionError> {
        self.ensure_running()?;
        let next = self.next_action().map(|a| a.order);
        if next != Some(order) {
            return Err(ExecutionError::UnexpectedStep {
                execution_id: self.id,
                expected: next,
                got: order,
            });
        }
        if self.pending_approval(order).is_some() || self.is_approved(order) {
            return Err(ExecutionError::ApprovalAlreadyOpen {
                execution_id: self.id,
                action_order: order,
            });
        }
        let spec = self
            .action(order)
            .and_then(|a| a.approval.clone())
            .ok_or(ExecutionError::ActionNotGated {
                execution_id: self.id,
                action_order: order,
            })?;

        let gate = ApprovalState::open(order, &spec, now).ok_or(
            ExecutionError::DeadlineOutOfRange {
                execution_id: self.id,
                action_order: order,
            },
        )?;
        self.pending_approvals.push(gate);
        let index = self.pending_approvals.len() - 1;
        Ok(&self.pending_approvals[index])
    }

    /// Moves a resolved gate out of `pending_approvals`.
    ///
    /// # Errors
    ///
    /// Returns an error if no gate is open for the action.
    pub fn settle_approval(&mut self, order: u32) -> Result<&ApprovalState, ExecutionError> {
        let index = self
            .pending_approvals
            .iter()
            .position(|a| a.action_order == order)
            .ok_or(ExecutionError::NoPendingApproval {
                execution_id: self.id,
                action_order: order,
            })?;
        let state = self.pending_approvals.remove(index);
        self.resolved_approvals.push(state);
        let last = self.resolved_approvals.len() - 1;
        Ok(&self.resolved_approvals[last])
    }

    /// Records the dispatch checkpoint for the next action.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal or `order` is not the
    /// next action.
    pub fn begin_action(&mut self, order: u32, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        self.ensure_running()?;
        let next = self.next_action().map(|a| a.order);
        if next != Some(order) {
            return Err(ExecutionError::UnexpectedStep {
                execution_id: self.id,
                expected: next,
                got: order,
            });
        }
        self.in_flight = Some(InFlightAction {
            action_order: order,
            started_at: now,
        });
        Ok(())
    }

    /// Appends a step for the next action and clears the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal or the step is not for
    /// the next action.
    pub fn record_step(&mut self, step: StepResult) -> Result<(), ExecutionError> {
        self.ensure_running()?;
        let next = self.next_action().map(|a| a.order);
        if next != Some(step.action_order) {
            return Err(ExecutionError::UnexpectedStep {
                execution_id: self.id,
                expected: next,
                got: step.action_order,
            });
        }
        self.in_flight = None;
        self.steps_completed.push(step);
        Ok(())
    }

    /// Clears a dispatch checkpoint left by an interrupted run.
    pub fn take_in_flight(&mut self) -> Option<InFlightAction> {
        self.in_flight.take()
    }

    /// Records a cancel request to be applied before the next action.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal.
    pub fn request_cancel(
        &mut self,
        requested_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutionError> {
        self.ensure_running()?;
        if self.cancel_requested.is_none() {
            self.cancel_requested = Some(CancelRequest {
                requested_by: requested_by.into(),
                requested_at: now,
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.in_flight = None;
        self.pending_approvals.clear();
    }

    /// Marks the execution as completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal or some action has no
    /// step yet.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        self.ensure_running()?;
        if let Some(next) = self.next_action() {
            return Err(ExecutionError::ActionsRemaining {
                execution_id: self.id,
                next_order: next.order,
            });
        }
        self.finish(ExecutionStatus::Completed, now);
        Ok(())
    }

    /// Marks the execution as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutionError> {
        self.ensure_running()?;
        self.error_message = Some(error.into());
        self.finish(ExecutionStatus::Failed, now);
        Ok(())
    }

    /// Marks the execution as cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        self.ensure_running()?;
        self.finish(ExecutionStatus::Cancelled, now);
        Ok(())
    }

    /// Expires every overdue pending gate and fails the execution if any
    /// expired.
    ///
    /// Returns the orders of the expired gates.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is terminal.
    pub fn expire_overdue_approvals(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<u32>, ExecutionError> {
        self.ensure_running()?;
        let mut expired = Vec::new();
        for gate in &mut self.pending_approvals {
            if gate.expire_if_overdue(now) {
                expired.push(gate.action_order);
            }
        }
        if expired.is_empty() {
            return Ok(expired);
        }

        for order in &expired {
            self.settle_approval(*order)?;
        }
        self.fail(APPROVAL_EXPIRED_MESSAGE, now)?;
        Ok(expired)
    }
}

/// Builds the failure message for a rejected gate.
#[must_use]
pub fn rejection_message(status: &ApprovalStatus) -> String {
    match status {
        ApprovalStatus::Rejected {
            by,
            reason: Some(reason),
            ..
        } => format!("approval rejected by {by}: {reason}"),
        ApprovalStatus::Rejected { by, reason: None, .. } => format!("approval rejected by {by}"),
        other => format!("approval not granted ({other:?})"),
    }
}
