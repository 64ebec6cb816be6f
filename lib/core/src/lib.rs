//! Core types shared by every flowgate crate.
//!
//! This crate provides the strongly-typed identifiers used across the
//! workflow engine and the `rootcause`-based `Result` alias.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ExecutionId, ParseIdError, WorkflowId};
