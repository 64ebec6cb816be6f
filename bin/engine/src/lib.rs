//! flowgate engine service.
//!
//! Wires the workflow orchestrator to its collaborators:
//! - Workflow definitions read from PostgreSQL
//! - Execution instances persisted in a NATS JetStream KV bucket
//! - An HTTP API for events, approvals, cancellation, and monitoring
//! - The approval expiry sweeper

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;

use flowgate_workflow::{ExecutionStore, HandlerRegistry, Orchestrator};
use std::sync::Arc;

/// The orchestrator as the service runs it.
pub type Engine = Orchestrator<Arc<dyn ExecutionStore>, HandlerRegistry>;
