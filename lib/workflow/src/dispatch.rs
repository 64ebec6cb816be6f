//! Action dispatch boundary.
//!
//! The engine never performs side effects itself. Each action is handed to
//! an `ActionDispatcher`, which in production is a `HandlerRegistry`: a
//! table from action type to handler, built once at startup.
//!
//! Handlers are black boxes. The engine does not retry them, and a handler
//! may be invoked again for the same action when a crashed execution is
//! recovered, so handlers own their idempotency.

use crate::definition::ActionType;
use crate::execution::StepOutcome;
use crate::trigger::DomainEvent;
use async_trait::async_trait;
use flowgate_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Context handed to a handler alongside the action parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    /// The execution the action belongs to.
    pub execution_id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Order of the action.
    pub action_order: u32,
    /// Who started the execution.
    pub started_by: String,
    /// The event that started the execution.
    pub trigger: DomainEvent,
}

/// What a handler reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action succeeded.
    pub outcome: StepOutcome,
    /// Output data.
    pub output: Option<JsonValue>,
    /// Human-readable message (required for failures).
    pub message: Option<String>,
}

impl ActionResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(output: JsonValue) -> Self {
        Self {
            outcome: StepOutcome::Success,
            output: Some(output),
            message: None,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Failure,
            output: None,
            message: Some(message.into()),
        }
    }

    /// Adds a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns true if the action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Success
    }
}

/// Errors that prevent an action from being dispatched at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler is registered for the action type.
    UnknownActionType { action_type: ActionType },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownActionType { action_type } => {
                write!(f, "unknown action type: {action_type}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// A handler for one action type.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Performs the action.
    async fn execute(&self, parameters: &Map<String, JsonValue>, context: &ActionContext)
    -> ActionResult;
}

/// Routes actions to their handlers.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Dispatches one action and waits for its result.
    async fn dispatch(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, JsonValue>,
        context: &ActionContext,
    ) -> Result<ActionResult, DispatchError>;
}

/// Table of registered handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler, replacing any previous one for the type.
    pub fn register(&mut self, action_type: impl Into<ActionType>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// Registers a handler, builder style.
    #[must_use]
    pub fn with_handler(
        mut self,
        action_type: impl Into<ActionType>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.register(action_type, handler);
        self
    }

    /// Returns true if a handler is registered for the type.
    #[must_use]
    pub fn contains(&self, action_type: &ActionType) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Returns the registered action types, sorted.
    #[must_use]
    pub fn action_types(&self) -> Vec<&ActionType> {
        let mut types: Vec<&ActionType> = self.handlers.keys().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}

#[async_trait]
impl ActionDispatcher for HandlerRegistry {
    async fn dispatch(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, JsonValue>,
        context: &ActionContext,
    ) -> Result<ActionResult, DispatchError> {
        let handler =
            self.handlers
                .get(action_type)
                .ok_or_else(|| DispatchError::UnknownActionType {
                    action_type: action_type.clone(),
                })?;
        Ok(handler.execute(parameters, context).await)
    }
}
