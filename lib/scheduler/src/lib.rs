//! Time-driven collaborators for the flowgate engine.
//!
//! The workflow crate exposes only explicitly invoked operations. This
//! crate owns the clock:
//!
//! - **Expiry Sweeper**: periodically expires overdue approval gates

pub mod sweep;

pub use sweep::{DEFAULT_SWEEP_INTERVAL, ExpirySweeper, TickReport};
