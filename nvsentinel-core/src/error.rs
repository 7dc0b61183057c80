//! Controller error taxonomy
//!
//! Every failure a control loop can hit maps onto one of these classes,
//! which decide retry behavior in the runner:
//! - Transient: re-queue with exponential backoff
//! - InvariantViolation: log at error, count, do not retry
//! - PreconditionMissed: silently re-queue (expected under concurrent updates)
//! - ResourceMissing: the target object vanished; reflected in conditions
//! - Fatal: unrecoverable configuration error, only raised at startup

use std::fmt;

use thiserror::Error;

/// Classified controller failure
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Timeouts, conflicts, 5xx from remote APIs
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid phase transition or invariant check failure
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Event observed in an unexpected state
    #[error("precondition missed: {0}")]
    PreconditionMissed(String),

    /// Target node/pod deleted out from under the controller
    #[error("resource missing: {0}")]
    ResourceMissing(String),

    /// Unrecoverable configuration error
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ControllerError {
    /// Wrap any displayable error as Transient
    pub fn transient(err: impl fmt::Display) -> Self {
        ControllerError::Transient(err.to_string())
    }

    /// True if the runner should retry this error with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ControllerError::Transient(_) | ControllerError::PreconditionMissed(_)
        )
    }
}
