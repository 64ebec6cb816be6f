//! Workflow definition types.
//!
//! A workflow definition is authored outside the engine and consists of:
//! - A trigger type (which domain event starts it)
//! - An optional condition over the event payload
//! - An ordered list of actions, each optionally gated by an approval
//!
//! The engine only ever reads definitions. Each execution instance takes a
//! snapshot of the action list when it is created.

use crate::approval::ApprovalMode;
use crate::error::DefinitionError;
use chrono::{DateTime, Duration, Utc};
use flowgate_core::WorkflowId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::fmt;

/// The type of domain event that starts a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// A record was created.
    RecordCreated,
    /// A record was updated.
    RecordUpdated,
    /// A record was deleted.
    RecordDeleted,
    /// A record's status field changed.
    StatusChanged,
    /// A form was submitted.
    FormSubmitted,
    /// A document was signed.
    DocumentSigned,
    /// A scheduled tick from an external scheduler.
    Scheduled,
    /// Manual start by a user.
    Manual,
}

impl TriggerType {
    /// Returns the snake_case name used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordCreated => "record_created",
            Self::RecordUpdated => "record_updated",
            Self::RecordDeleted => "record_deleted",
            Self::StatusChanged => "status_changed",
            Self::FormSubmitted => "form_submitted",
            Self::DocumentSigned => "document_signed",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of action a step performs.
///
/// Action types are open-ended: any string is valid here, and whether it
/// can actually run is decided by the handler registry at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionType(String);

impl ActionType {
    /// Creates an action type from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the action type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Longest approval window a definition may ask for.
pub const MAX_APPROVAL_EXPIRY_SECS: i64 = 365 * 24 * 60 * 60;

/// Human approval required before an action may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    /// Whether approvers must respond in order.
    pub mode: ApprovalMode,
    /// Identities whose approval is required.
    pub approvers: Vec<String>,
    /// Seconds from the moment the gate opens until it expires.
    pub expires_after_secs: i64,
}

impl ApprovalSpec {
    /// Creates a sequential approval spec.
    #[must_use]
    pub fn sequential(approvers: Vec<String>, expires_after: Duration) -> Self {
        Self {
            mode: ApprovalMode::Sequential,
            approvers,
            expires_after_secs: expires_after.num_seconds(),
        }
    }

    /// Creates a parallel approval spec.
    #[must_use]
    pub fn parallel(approvers: Vec<String>, expires_after: Duration) -> Self {
        Self {
            mode: ApprovalMode::Parallel,
            approvers,
            expires_after_secs: expires_after.num_seconds(),
        }
    }

    /// Returns the expiry window, or `None` if it does not fit a duration.
    #[must_use]
    pub fn expires_after(&self) -> Option<Duration> {
        Duration::try_seconds(self.expires_after_secs)
    }
}

/// One step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// What the step does.
    pub action_type: ActionType,
    /// Position in the workflow (unique within a definition).
    pub order: u32,
    /// Parameters passed through to the handler untouched.
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    /// Approval required before the step runs, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
}

impl ActionSpec {
    /// Creates an ungated action with no parameters.
    #[must_use]
    pub fn new(action_type: impl Into<ActionType>, order: u32) -> Self {
        Self {
            action_type: action_type.into(),
            order,
            parameters: Map::new(),
            approval: None,
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Gates the action behind an approval.
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalSpec) -> Self {
        self.approval = Some(approval);
        self
    }

    /// Returns true if the action requires approval before running.
    #[must_use]
    pub fn is_gated(&self) -> bool {
        self.approval.is_some()
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Event type that starts the workflow.
    pub trigger: TriggerType,
    /// Authored condition over the event payload (parsed at match time).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<JsonValue>,
    /// Steps, in ascending order.
    pub actions: Vec<ActionSpec>,
    /// Whether the workflow currently reacts to events.
    pub active: bool,
    /// Number of executions recorded by the authoring side.
    #[serde(default)]
    pub execution_count: u64,
    /// When this definition was created.
    pub created_at: DateTime<Utc>,
    /// When this definition was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates an active definition with no condition and no actions.
    #[must_use]
    pub fn new(name: impl Into<String>, trigger: TriggerType) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            trigger,
            condition: None,
            actions: Vec::new(),
            active: true,
            execution_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the condition.
    #[must_use]
    pub fn with_condition(mut self, condition: JsonValue) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Appends an action.
    #[must_use]
    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    /// Returns the actions sorted by order.
    #[must_use]
    pub fn ordered_actions(&self) -> Vec<ActionSpec> {
        let mut actions = self.actions.clone();
        actions.sort_by_key(|a| a.order);
        actions
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition has no actions, repeats an action
    /// order, or carries an unusable approval spec.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.actions.is_empty() {
            return Err(DefinitionError::NoActions {
                workflow_id: self.id,
            });
        }

        let mut seen = HashSet::new();
        for action in &self.actions {
            if !seen.insert(action.order) {
                return Err(DefinitionError::DuplicateOrder {
                    workflow_id: self.id,
                    order: action.order,
                });
            }

            if let Some(approval) = &action.approval {
                validate_approval(self.id, action.order, approval)?;
            }
        }

        Ok(())
    }
}

fn validate_approval(
    workflow_id: WorkflowId,
    order: u32,
    approval: &ApprovalSpec,
) -> Result<(), DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidApproval {
        workflow_id,
        order,
        reason: reason.to_string(),
    };

    if approval.approvers.is_empty() {
        return Err(invalid("no approvers"));
    }
    let unique: HashSet<&String> = approval.approvers.iter().collect();
    if unique.len() != approval.approvers.len() {
        return Err(invalid("duplicate approver"));
    }
    if approval.expires_after_secs <= 0 {
        return Err(invalid("expiry must be positive"));
    }
    if approval.expires_after_secs > MAX_APPROVAL_EXPIRY_SECS {
        return Err(invalid("expiry longer than one year"));
    }
    Ok(())
}
