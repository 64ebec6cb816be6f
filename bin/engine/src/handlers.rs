//! Built-in action handlers.
//!
//! Real side effects (email, record updates, webhooks) live in their own
//! services and register handlers here at startup. The engine ships only
//! `log`, which records the action and succeeds.

use async_trait::async_trait;
use flowgate_workflow::{ActionContext, ActionHandler, ActionResult, HandlerRegistry};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;

/// Writes the action to the log and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn execute(
        &self,
        parameters: &Map<String, JsonValue>,
        context: &ActionContext,
    ) -> ActionResult {
        let message = parameters
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("workflow action");
        tracing::info!(
            execution_id = %context.execution_id,
            workflow_id = %context.workflow_id,
            action_order = context.action_order,
            "{message}"
        );
        ActionResult::success(json!({ "logged": message }))
    }
}

/// Returns the registry the engine starts with.
pub fn default_registry() -> HandlerRegistry {
    HandlerRegistry::new().with_handler("log", Arc::new(LogHandler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::{ExecutionId, WorkflowId};
    use flowgate_workflow::{ActionType, DomainEvent, TriggerType};

    fn context() -> ActionContext {
        ActionContext {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new(),
            action_order: 1,
            started_by: "system".to_string(),
            trigger: DomainEvent::new(TriggerType::Manual, json!({})),
        }
    }

    #[tokio::test]
    async fn log_handler_echoes_message() {
        let mut parameters = Map::new();
        parameters.insert("message".to_string(), json!("contract signed"));

        let result = LogHandler.execute(&parameters, &context()).await;
        assert!(result.is_success());
        assert_eq!(result.output, Some(json!({"logged": "contract signed"})));
    }

    #[test]
    fn default_registry_knows_log() {
        let registry = default_registry();
        assert!(registry.contains(&ActionType::new("log")));
        assert_eq!(registry.len(), 1);
    }
}
