//! Commit log collaborator
//!
//! The manager reports transaction lifecycle events and committed row
//! effects to a [`CommitLog`]. Durability is best effort: the in-memory
//! commit has already happened when the log is written, so a failing logger
//! is reported with a warning and never unwinds the commit.

use versa_core::{Result, RowId, SessionId, TableId};

/// Receiver of transaction lifecycle and row-effect records.
///
/// Implementations must be cheap to call under the manager lock; anything
/// slow should buffer internally. Failures surface as
/// [`Error::CommitLog`](versa_core::Error::CommitLog) and are treated as
/// best-effort durability warnings by the manager.
pub trait CommitLog: Send + Sync {
    /// A transaction started.
    fn log_begin(&self, session: SessionId) -> Result<()>;
    /// A committed transaction inserted a row.
    fn log_insert(&self, session: SessionId, table: TableId, row: RowId) -> Result<()>;
    /// A committed transaction deleted a row.
    fn log_delete(&self, session: SessionId, table: TableId, row: RowId) -> Result<()>;
    /// A transaction committed.
    fn log_commit(&self, session: SessionId) -> Result<()>;
    /// A transaction rolled back.
    fn log_rollback(&self, session: SessionId) -> Result<()>;
}

/// Discards everything. The default collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl CommitLog for NullLog {
    fn log_begin(&self, _session: SessionId) -> Result<()> {
        Ok(())
    }

    fn log_insert(&self, _session: SessionId, _table: TableId, _row: RowId) -> Result<()> {
        Ok(())
    }

    fn log_delete(&self, _session: SessionId, _table: TableId, _row: RowId) -> Result<()> {
        Ok(())
    }

    fn log_commit(&self, _session: SessionId) -> Result<()> {
        Ok(())
    }

    fn log_rollback(&self, _session: SessionId) -> Result<()> {
        Ok(())
    }
}

/// Emits every record as a `tracing` event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl CommitLog for TracingLog {
    fn log_begin(&self, session: SessionId) -> Result<()> {
        tracing::debug!(session = session.0, "txn begin");
        Ok(())
    }

    fn log_insert(&self, session: SessionId, table: TableId, row: RowId) -> Result<()> {
        tracing::debug!(session = session.0, table = table.0, row = row.0, "row insert");
        Ok(())
    }

    fn log_delete(&self, session: SessionId, table: TableId, row: RowId) -> Result<()> {
        tracing::debug!(session = session.0, table = table.0, row = row.0, "row delete");
        Ok(())
    }

    fn log_commit(&self, session: SessionId) -> Result<()> {
        tracing::debug!(session = session.0, "txn commit");
        Ok(())
    }

    fn log_rollback(&self, session: SessionId) -> Result<()> {
        tracing::debug!(session = session.0, "txn rollback");
        Ok(())
    }
}
