//! versadb — embedded relational transaction core
//!
//! Re-exports the public API of the workspace crates: shared types and
//! errors from `versa-core`, the transaction manager, sessions, row version
//! chains and lock table from `versa-txn`.
//!
//! ```
//! use versadb::{IsolationLevel, StatementAccess, TransactionControl, TransactionManager};
//!
//! let manager = TransactionManager::new(TransactionControl::Mvcc);
//! let session = manager.connect(IsolationLevel::ReadCommitted);
//! manager.begin_action(&session, StatementAccess::default());
//! manager.add_insert_action(&session, versadb::TableId(1), versadb::RowId(1));
//! manager.end_action(&session);
//! assert!(manager.commit_transaction(&session));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use versa_core::{
    masks_overlap, AccessMode, ActionKind, ColumnSet, Error, IsolationLevel, Result, RowId,
    SessionId, TableId, Timestamp, UNCOMMITTED,
};
pub use versa_txn::{
    AttachOutcome, ChainState, CommitLog, ConflictSet, Latch, LockTable, NullLog, ResetMode,
    RowChain, RowKey, RowVersion, Savepoint, Session, SessionRegistry, SessionView,
    StatementAccess, TracingLog, TransactionControl, TransactionManager,
};
