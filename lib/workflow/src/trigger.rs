//! Trigger matching.
//!
//! Decides which workflow definitions an incoming domain event starts. The
//! matcher is pure: it never touches storage, and the same event and
//! definition set always produce the same match list (ordered by workflow
//! id).

use crate::condition::Condition;
use crate::definition::{TriggerType, WorkflowDefinition};
use crate::error::TriggerMatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// A domain event submitted to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// What happened.
    pub event_type: TriggerType,
    /// Event data, matched against definition conditions.
    #[serde(default)]
    pub payload: JsonValue,
    /// Who caused the event, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// When the event occurred.
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Creates an event that occurred now.
    #[must_use]
    pub fn new(event_type: TriggerType, payload: JsonValue) -> Self {
        Self {
            event_type,
            payload,
            actor: None,
            occurred_at: Utc::now(),
        }
    }

    /// Sets the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Result of matching one event against a set of definitions.
#[derive(Debug, Default)]
pub struct MatchReport<'a> {
    /// Definitions the event starts, ordered by workflow id.
    pub matched: Vec<&'a WorkflowDefinition>,
    /// Definitions skipped because their condition is malformed.
    pub skipped: Vec<TriggerMatchError>,
}

impl MatchReport<'_> {
    /// Returns true if no definition matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }
}

/// Matches events against workflow definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    /// Creates a matcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns the definitions started by `event`.
    ///
    /// A definition matches when it is active, its trigger type equals the
    /// event type, and its condition holds for the payload. A definition
    /// whose condition is malformed is skipped and reported; the rest are
    /// still evaluated.
    #[must_use]
    pub fn match_event<'a>(
        &self,
        event: &DomainEvent,
        definitions: &'a [WorkflowDefinition],
    ) -> MatchReport<'a> {
        let mut candidates: Vec<&WorkflowDefinition> = definitions
            .iter()
            .filter(|d| d.active && d.trigger == event.event_type)
            .collect();
        candidates.sort_by_key(|d| d.id);

        let mut report = MatchReport::default();
        for definition in candidates {
            let outcome = Condition::parse(definition.condition.as_ref())
                .and_then(|c| c.map_or(Ok(true), |c| c.evaluate(&event.payload)));

            match outcome {
                Ok(true) => report.matched.push(definition),
                Ok(false) => {}
                Err(source) => {
                    warn!(
                        workflow_id = %definition.id,
                        error = %source,
                        "skipping workflow with malformed condition"
                    );
                    report.skipped.push(TriggerMatchError::MalformedCondition {
                        workflow_id: definition.id,
                        source,
                    });
                }
            }
        }

        debug!(
            event_type = %event.event_type,
            matched = report.matched.len(),
            skipped = report.skipped.len(),
            "matched event against definitions"
        );
        report
    }
}
