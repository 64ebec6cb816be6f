//! Workflow definition repository.

use crate::error::DefinitionSourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgate_core::WorkflowId;
use flowgate_workflow::{ActionSpec, TriggerType, WorkflowDefinition};
use rootcause::prelude::Report;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A stored definition that could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableDefinition {
    pub id: String,
    pub reason: String,
}

/// Active definitions for one trigger type.
#[derive(Debug, Clone, Default)]
pub struct ActiveDefinitions {
    pub definitions: Vec<WorkflowDefinition>,
    /// Rows for the trigger that did not parse. They start nothing.
    pub unreadable: Vec<UnreadableDefinition>,
}

/// Where the engine reads workflow definitions from.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Returns the active definitions for a trigger type.
    async fn active_for(
        &self,
        trigger: TriggerType,
    ) -> Result<ActiveDefinitions, Report<DefinitionSourceError>>;
}

/// Row type for definition queries.
#[derive(FromRow)]
struct DefinitionRow {
    id: String,
    name: String,
    trigger: String,
    condition: Option<serde_json::Value>,
    actions: serde_json::Value,
    active: bool,
    execution_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DefinitionRow {
    fn try_into_definition(self) -> Result<WorkflowDefinition, String> {
        let id = WorkflowId::from_str(&self.id)
            .map_err(|e| format!("invalid workflow id '{}': {}", self.id, e))?;
        let trigger: TriggerType =
            serde_json::from_value(serde_json::Value::String(self.trigger.clone()))
                .map_err(|_| format!("unknown trigger type '{}'", self.trigger))?;
        let actions: Vec<ActionSpec> = serde_json::from_value(self.actions)
            .map_err(|e| format!("invalid action list: {e}"))?;

        Ok(WorkflowDefinition {
            id,
            name: self.name,
            trigger,
            condition: self.condition,
            actions,
            active: self.active,
            execution_count: u64::try_from(self.execution_count).unwrap_or(0),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// A broken row must not keep the other workflows from running.
fn read_rows(rows: Vec<DefinitionRow>) -> ActiveDefinitions {
    let mut active = ActiveDefinitions::default();
    for row in rows {
        let id = row.id.clone();
        match row.try_into_definition() {
            Ok(definition) => active.definitions.push(definition),
            Err(reason) => {
                tracing::warn!(workflow_id = %id, %reason, "skipping unreadable workflow definition");
                active.unreadable.push(UnreadableDefinition { id, reason });
            }
        }
    }
    active
}

/// Reads definitions from the `workflow_definitions` table.
#[derive(Clone)]
pub struct PgDefinitionSource {
    pool: PgPool,
}

impl PgDefinitionSource {
    /// Creates a new source.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionSource for PgDefinitionSource {
    async fn active_for(
        &self,
        trigger: TriggerType,
    ) -> Result<ActiveDefinitions, Report<DefinitionSourceError>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, name, trigger, condition, actions, active,
                   execution_count, created_at, updated_at
            FROM workflow_definitions
            WHERE active AND trigger = $1
            ORDER BY id
            "#,
        )
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DefinitionSourceError::Database {
            details: e.to_string(),
        })?;

        Ok(read_rows(rows))
    }
}

/// Definitions held in memory, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDefinitionSource {
    definitions: Arc<RwLock<Vec<WorkflowDefinition>>>,
    unreadable: Arc<RwLock<Vec<(TriggerType, UnreadableDefinition)>>>,
}

impl InMemoryDefinitionSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source holding `definitions`.
    pub fn with_definitions(definitions: Vec<WorkflowDefinition>) -> Self {
        Self {
            definitions: Arc::new(RwLock::new(definitions)),
            unreadable: Arc::default(),
        }
    }

    /// Records a stored definition for `trigger` that cannot be read.
    pub async fn add_unreadable(
        &self,
        trigger: TriggerType,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.unreadable.write().await.push((
            trigger,
            UnreadableDefinition {
                id: id.into(),
                reason: reason.into(),
            },
        ));
    }

    /// Adds or replaces a definition.
    pub async fn upsert(&self, definition: WorkflowDefinition) {
        let mut definitions = self.definitions.write().await;
        definitions.retain(|d| d.id != definition.id);
        definitions.push(definition);
    }
}

#[async_trait]
impl DefinitionSource for InMemoryDefinitionSource {
    async fn active_for(
        &self,
        trigger: TriggerType,
    ) -> Result<ActiveDefinitions, Report<DefinitionSourceError>> {
        let definitions = self
            .definitions
            .read()
            .await
            .iter()
            .filter(|d| d.active && d.trigger == trigger)
            .cloned()
            .collect();
        let unreadable = self
            .unreadable
            .read()
            .await
            .iter()
            .filter(|(t, _)| *t == trigger)
            .map(|(_, u)| u.clone())
            .collect();
        Ok(ActiveDefinitions {
            definitions,
            unreadable,
        })
    }
}
