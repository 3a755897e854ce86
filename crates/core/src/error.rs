//! Error types for the transaction core
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! Serialization conflicts and deadlocks are deliberately not routed through
//! these variants on the hot path: the row-chain and lock-table code
//! communicates them through the session abort flag and boolean returns,
//! keeping that path allocation-free. The `Conflict` and `Deadlock` variants
//! exist for the outer statement layer, which polls the flag and converts it
//! into a retryable error for the client.

use crate::types::SessionId;
use thiserror::Error;

/// Result type alias for transaction core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the transaction core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Serialization failure; the transaction was aborted and may be retried.
    #[error("serialization failure: transaction of session {0:?} must be retried")]
    Conflict(SessionId),

    /// Deadlock detected before blocking; the requester was aborted.
    #[error("deadlock detected: transaction of session {0:?} rolled back")]
    Deadlock(SessionId),

    /// Transaction control mode cannot change while other transactions are live.
    #[error("cannot switch transaction control: {0} live transaction(s) besides the caller")]
    TransactionControl(usize),

    /// Caller misuse: an operation was invoked in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Internal invariant violated. Fatal; distinct from user-facing errors.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// Commit-log write failed. The in-memory commit already happened, so
    /// callers treat this as a best-effort durability warning.
    #[error("commit log failure: {0}")]
    CommitLog(String),
}

impl Error {
    /// Whether the statement layer should ask the client to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Deadlock(_))
    }

    /// Error reported to the client when `session`'s abort flag was found
    /// set; `deadlock` distinguishes a refused wait from a lost conflict.
    pub fn from_abort(session: SessionId, deadlock: bool) -> Self {
        if deadlock {
            Error::Deadlock(session)
        } else {
            Error::Conflict(session)
        }
    }
}
