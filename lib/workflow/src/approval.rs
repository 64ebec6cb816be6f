//! Approval gate for actions that need human sign-off.
//!
//! Each gated action gets one `ApprovalState` when the orchestrator reaches
//! it. The gate is a small state machine:
//!
//! ```text
//! Pending ──approve (all required)──▶ Approved
//!    │  ──reject──────────────────────▶ Rejected
//!    └──expire (sweep)─────────────────▶ Expired
//! ```
//!
//! Every resolution is terminal. Rejected calls leave the state untouched.

use crate::definition::ApprovalSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How approvers may respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Approvers must respond in the listed order.
    Sequential,
    /// Approvers may respond in any order.
    Parallel,
}

/// Resolution state of a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for responses.
    Pending,
    /// Every required approver approved.
    Approved { at: DateTime<Utc> },
    /// A required approver rejected.
    Rejected {
        by: String,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// The gate passed its deadline unresolved.
    Expired { at: DateTime<Utc> },
}

impl ApprovalStatus {
    /// Returns true once the gate has resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Errors from approval calls. None of them change the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    /// The identity is not a required approver.
    NotAnApprover { identity: String },
    /// The identity already approved.
    AlreadyApproved { identity: String },
    /// Sequential gate called out of order.
    OutOfOrder { identity: String, expected: String },
    /// The gate has already resolved.
    AlreadyResolved,
    /// The gate is past its deadline and waiting to be swept.
    Expired { expires_at: DateTime<Utc> },
}

impl fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnApprover { identity } => {
                write!(f, "'{identity}' is not a required approver")
            }
            Self::AlreadyApproved { identity } => write!(f, "'{identity}' already approved"),
            Self::OutOfOrder { identity, expected } => {
                write!(f, "'{identity}' cannot approve yet, waiting on '{expected}'")
            }
            Self::AlreadyResolved => write!(f, "approval already resolved"),
            Self::Expired { expires_at } => write!(f, "approval expired at {expires_at}"),
        }
    }
}

impl std::error::Error for ApprovalError {}

/// Approval tracking for one gated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalState {
    /// Order of the gated action.
    pub action_order: u32,
    /// Ordering constraint on approvers.
    pub mode: ApprovalMode,
    /// Identities that must approve.
    pub required_approvers: Vec<String>,
    /// Identities that have approved, in arrival order.
    pub approved_by: Vec<String>,
    /// When the gate opened.
    pub opened_at: DateTime<Utc>,
    /// Deadline for resolution.
    pub expires_at: DateTime<Utc>,
    /// Current resolution.
    pub status: ApprovalStatus,
}

impl ApprovalState {
    /// Opens a gate for an action.
    ///
    /// Returns `None` if the deadline falls outside the representable
    /// date range.
    #[must_use]
    pub fn open(action_order: u32, spec: &ApprovalSpec, now: DateTime<Utc>) -> Option<Self> {
        let expires_at = spec
            .expires_after()
            .and_then(|window| now.checked_add_signed(window))?;
        Some(Self {
            action_order,
            mode: spec.mode,
            required_approvers: spec.approvers.clone(),
            approved_by: Vec::new(),
            opened_at: now,
            expires_at,
            status: ApprovalStatus::Pending,
        })
    }

    /// Returns true once the gate has resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }

    /// Returns true if the gate resolved as approved.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self.status, ApprovalStatus::Approved { .. })
    }

    /// Returns true if the gate is pending and past its deadline.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_resolved() && self.expires_at < now
    }

    /// Returns the next approver a sequential gate is waiting on.
    #[must_use]
    pub fn next_approver(&self) -> Option<&str> {
        self.required_approvers
            .iter()
            .find(|a| !self.approved_by.contains(a))
            .map(String::as_str)
    }

    fn ensure_open(&self, now: DateTime<Utc>) -> Result<(), ApprovalError> {
        if self.is_resolved() {
            return Err(ApprovalError::AlreadyResolved);
        }
        if self.expires_at < now {
            return Err(ApprovalError::Expired {
                expires_at: self.expires_at,
            });
        }
        Ok(())
    }

    fn ensure_required(&self, identity: &str) -> Result<(), ApprovalError> {
        if self.required_approvers.iter().any(|a| a == identity) {
            Ok(())
        } else {
            Err(ApprovalError::NotAnApprover {
                identity: identity.to_string(),
            })
        }
    }

    /// Records an approval.
    ///
    /// Returns the status after the call; the gate resolves as approved once
    /// every required approver has approved.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the gate untouched, if the gate is resolved
    /// or overdue, the identity is not required or already approved, or a
    /// sequential gate is called out of order.
    pub fn approve(
        &mut self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<&ApprovalStatus, ApprovalError> {
        self.ensure_open(now)?;
        self.ensure_required(identity)?;
        if self.approved_by.iter().any(|a| a == identity) {
            return Err(ApprovalError::AlreadyApproved {
                identity: identity.to_string(),
            });
        }
        if self.mode == ApprovalMode::Sequential
            && let Some(expected) = self.next_approver()
            && expected != identity
        {
            return Err(ApprovalError::OutOfOrder {
                identity: identity.to_string(),
                expected: expected.to_string(),
            });
        }

        self.approved_by.push(identity.to_string());
        if self
            .required_approvers
            .iter()
            .all(|a| self.approved_by.contains(a))
        {
            self.status = ApprovalStatus::Approved { at: now };
        }
        Ok(&self.status)
    }

    /// Rejects the gate.
    ///
    /// Any required approver who has not yet approved may reject, in either
    /// mode.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the gate untouched, if the gate is resolved
    /// or overdue, or the identity may not reject.
    pub fn reject(
        &mut self,
        identity: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<&ApprovalStatus, ApprovalError> {
        self.ensure_open(now)?;
        self.ensure_required(identity)?;
        if self.approved_by.iter().any(|a| a == identity) {
            return Err(ApprovalError::AlreadyApproved {
                identity: identity.to_string(),
            });
        }

        self.status = ApprovalStatus::Rejected {
            by: identity.to_string(),
            reason,
            at: now,
        };
        Ok(&self.status)
    }

    /// Expires the gate if it is pending and `expires_at < now`.
    ///
    /// Returns true if the gate changed.
    pub fn expire_if_overdue(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_overdue(now) {
            return false;
        }
        self.status = ApprovalStatus::Expired { at: now };
        true
    }
}
