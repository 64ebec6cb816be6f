//! HTTP API.
//!
//! | Method | Path                                          | Operation      |
//! |--------|-----------------------------------------------|----------------|
//! | POST   | `/events`                                     | handle event   |
//! | GET    | `/executions?status=`                         | list           |
//! | GET    | `/executions/stats`                           | status counts  |
//! | GET    | `/executions/{id}`                            | get            |
//! | POST   | `/executions/{id}/cancel`                     | cancel         |
//! | POST   | `/executions/{id}/actions/{order}/approve`    | approve        |
//! | POST   | `/executions/{id}/actions/{order}/reject`     | reject         |

use crate::Engine;
use crate::db::DefinitionSource;
use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use flowgate_core::{ExecutionId, WorkflowId};
use flowgate_workflow::{DomainEvent, ExecutionInstance, ExecutionStatus, StatusCounts};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub definitions: Arc<dyn DefinitionSource>,
}

impl AppState {
    /// Creates handler state.
    pub fn new(engine: Arc<Engine>, definitions: Arc<dyn DefinitionSource>) -> Self {
        Self {
            engine,
            definitions,
        }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(submit_event))
        .route("/executions", get(list_executions))
        .route("/executions/stats", get(execution_stats))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route(
            "/executions/{id}/actions/{order}/approve",
            post(approve_action),
        )
        .route("/executions/{id}/actions/{order}/reject", post(reject_action))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A definition the event could not start.
///
/// The id is kept as stored, since an unreadable row may not carry a
/// valid one.
#[derive(Debug, Serialize)]
pub struct SkippedDefinition {
    pub workflow_id: String,
    pub reason: String,
}

/// A matching definition whose execution could not be started or driven.
#[derive(Debug, Serialize)]
pub struct FailedStart {
    pub workflow_id: WorkflowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    pub reason: String,
}

/// Response to a submitted event.
#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub started: Vec<ExecutionInstance>,
    pub skipped: Vec<SkippedDefinition>,
    pub failed: Vec<FailedStart>,
}

/// Response to a stats request.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub requested_by: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub identity: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub identity: String,
    #[serde(default)]
    pub reason: Option<String>,
}

fn parse_execution_id(raw: &str) -> Result<ExecutionId, ApiError> {
    ExecutionId::from_str(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<DomainEvent>,
) -> Result<Json<EventResponse>, ApiError> {
    let active = state
        .definitions
        .active_for(event.event_type)
        .await
        .map_err(|report| {
            tracing::error!(error = %report, "failed to load workflow definitions");
            ApiError::Internal("workflow definitions unavailable".to_string())
        })?;

    let outcome = state.engine.handle_event(&event, &active.definitions).await;
    let unreadable = active.unreadable.into_iter().map(|u| SkippedDefinition {
        workflow_id: u.id,
        reason: u.reason,
    });
    Ok(Json(EventResponse {
        started: outcome.started,
        skipped: outcome
            .skipped
            .into_iter()
            .map(|skip| SkippedDefinition {
                workflow_id: skip.workflow_id().to_string(),
                reason: skip.to_string(),
            })
            .chain(unreadable)
            .collect(),
        failed: outcome
            .failed
            .into_iter()
            .map(|f| FailedStart {
                workflow_id: f.workflow_id,
                execution_id: f.execution_id,
                reason: f.error.to_string(),
            })
            .collect(),
    }))
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExecutionInstance>>, ApiError> {
    Ok(Json(state.engine.list(query.status).await?))
}

async fn execution_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.engine.status_counts().await?;
    Ok(Json(StatsResponse {
        total: counts.total(),
        counts,
    }))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionInstance>, ApiError> {
    let id = parse_execution_id(&id)?;
    Ok(Json(state.engine.get(id).await?))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<ExecutionInstance>, ApiError> {
    let id = parse_execution_id(&id)?;
    Ok(Json(state.engine.cancel(id, &body.requested_by).await?))
}

async fn approve_action(
    State(state): State<AppState>,
    Path((id, order)): Path<(String, u32)>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<ExecutionInstance>, ApiError> {
    let id = parse_execution_id(&id)?;
    Ok(Json(state.engine.approve(id, order, &body.identity).await?))
}

async fn reject_action(
    State(state): State<AppState>,
    Path((id, order)): Path<(String, u32)>,
    Json(body): Json<RejectBody>,
) -> Result<Json<ExecutionInstance>, ApiError> {
    let id = parse_execution_id(&id)?;
    Ok(Json(
        state
            .engine
            .reject(id, order, &body.identity, body.reason)
            .await?,
    ))
}
