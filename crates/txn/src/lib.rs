//! Transaction and concurrency core
//!
//! Row version chains, a table lock table with proactive deadlock
//! detection, and a transaction manager offering two interchangeable
//! strategies: table-granular two-phase locking and MVCC with commit-time
//! validation. The statement-execution layer drives everything through
//! [`TransactionManager`] and per-connection [`Session`] handles.
//!
//! Serialization conflicts and deadlocks are not errors here: they set the
//! session abort flag and surface as boolean returns, and the outer layer
//! converts them into retryable errors for the client.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod locks;
pub mod log;
pub mod manager;
mod mvcc;
pub mod session;
mod tpl;

pub use chain::{AttachOutcome, ChainState, RowChain, RowKey, RowVersion};
pub use locks::{would_deadlock, LockTable, StatementAccess};
pub use log::{CommitLog, NullLog, TracingLog};
pub use manager::{ResetMode, TransactionControl, TransactionManager};
pub use session::{ConflictSet, Latch, Savepoint, Session, SessionRegistry, SessionView};
