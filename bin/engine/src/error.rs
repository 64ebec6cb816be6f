//! Error types for the engine service.
//!
//! `ApiError` is what HTTP handlers return; it maps orchestrator errors to
//! status codes and never leaks store internals to callers. `StartupError`
//! and `DefinitionSourceError` are carried in `rootcause` reports.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowgate_workflow::{ApprovalError, OrchestratorError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The addressed resource does not exist.
    NotFound(String),
    /// The request could not be understood.
    BadRequest(String),
    /// The caller may not perform the operation.
    Forbidden(String),
    /// The request conflicts with the current state.
    Conflict(String),
    /// The request names something that cannot be executed.
    Unprocessable(String),
    /// The operation could not complete right now; retrying may succeed.
    Unavailable(String),
    /// Something failed on our side.
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg)
            | Self::BadRequest(msg)
            | Self::Forbidden(msg)
            | Self::Conflict(msg)
            | Self::Unprocessable(msg)
            | Self::Unavailable(msg)
            | Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match &e {
            OrchestratorError::NotFound { .. } => Self::NotFound(e.to_string()),
            OrchestratorError::Approval(ApprovalError::NotAnApprover { .. }) => {
                Self::Forbidden(e.to_string())
            }
            OrchestratorError::Approval(_) | OrchestratorError::Execution(_) => {
                Self::Conflict(e.to_string())
            }
            OrchestratorError::InvalidDefinition(_) => Self::Unprocessable(e.to_string()),
            OrchestratorError::Contention { .. } => Self::Unavailable(e.to_string()),
            OrchestratorError::Store(store) => {
                tracing::error!(error = %store, "execution store error");
                Self::Internal("execution store unavailable".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Internal(msg) = &self {
            tracing::error!(error = %msg, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Errors from loading workflow definitions.
#[derive(Debug)]
pub enum DefinitionSourceError {
    /// Database error while reading definitions.
    Database { details: String },
}

impl fmt::Display for DefinitionSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { details } => {
                write!(f, "workflow definition database error: {details}")
            }
        }
    }
}

impl std::error::Error for DefinitionSourceError {}

/// Errors that stop the engine from starting.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// Could not connect to PostgreSQL.
    Database { details: String },
    /// Migrations failed.
    Migration { details: String },
    /// Could not open the execution store.
    ExecutionStore { details: String },
    /// Resuming running executions failed.
    Recovery { details: String },
    /// Could not bind the HTTP listener.
    Bind { addr: String, details: String },
    /// The HTTP server stopped with an error.
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {details}"),
            Self::Database { details } => write!(f, "failed to connect to database: {details}"),
            Self::Migration { details } => write!(f, "failed to run migrations: {details}"),
            Self::ExecutionStore { details } => {
                write!(f, "failed to open execution store: {details}")
            }
            Self::Recovery { details } => {
                write!(f, "failed to resume running executions: {details}")
            }
            Self::Bind { addr, details } => write!(f, "failed to bind to {addr}: {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}
