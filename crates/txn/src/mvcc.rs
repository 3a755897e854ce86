//! MVCC half of the manager
//!
//! Under [`TransactionControl::Mvcc`] statements run without table locks and
//! collide on row version chains instead. A refused attach lands here:
//! waiting only helps while the blocker is still uncommitted, so a conflict
//! with a committed writer is settled immediately by aborting the stale
//! snapshot (read committed never raises one: its fresh statement stamp
//! already sees the committed delete), and a conflict with a pending writer
//! parks the requester behind it after the proactive deadlock check.
//!
//! [`TransactionControl::Mvcc`]: crate::manager::TransactionControl::Mvcc

use crate::locks::would_deadlock;
use crate::manager::TransactionManager;
use crate::session::{ConflictSet, Session};
use tracing::debug;

impl TransactionManager {
    /// Settle a refused write attach for `session`.
    ///
    /// Leaves the session in one of three states: abort flag set (lost the
    /// conflict), parked (latch raised, redo flag set; the caller rolls the
    /// statement back and waits), or untouched (statement-level conflict
    /// handling; the refused statement simply fails).
    pub(crate) fn resolve_write_conflict(
        &self,
        session: &Session,
        blockers: &ConflictSet,
        committed: bool,
    ) {
        if committed {
            // The row was overwritten after our snapshot; no amount of
            // waiting changes that. Only snapshot-isolation sessions are
            // refused over a committed version: read committed draws a fresh
            // statement stamp and simply sees the delete.
            let full_rollback = {
                let tx = session.tx();
                debug_assert!(tx.isolation.uses_snapshot());
                tx.tx_conflict_rollback
            };
            if full_rollback {
                debug!(session = session.id.0, "write on stale snapshot, aborting");
                session.set_abort();
            }
            // With statement-level conflict handling the refused write
            // simply fails; the transaction itself survives.
            return;
        }

        let _state = self.state.write();
        if would_deadlock(&self.sessions, session.id, blockers) {
            debug!(
                session = session.id.0,
                blockers = ?blockers,
                "version wait would deadlock, aborting requester"
            );
            session.set_abort();
            return;
        }

        // The blockers may have finished between the refused attach and
        // this lock; only park behind the ones still in flight.
        let mut live = ConflictSet::new();
        for &b in blockers {
            let still_open = self.sessions.get(b).is_some_and(|h| h.in_transaction());
            if still_open {
                live.push(b);
            }
        }
        {
            let mut tx = session.tx();
            tx.redo_action = true;
            tx.waited_sessions = live.to_vec();
        }
        session.latch.set_count(live.len());
        for &b in &live {
            if let Some(h) = self.sessions.get(b) {
                let mut tx = h.tx();
                if !tx.waiting_sessions.contains(&session.id) {
                    tx.waiting_sessions.push(session.id);
                }
            }
        }
    }

    /// Release every session parked behind `finished` on a version wait.
    /// Caller holds the manager lock.
    pub(crate) fn release_version_waiters(&self, finished: &Session) {
        let waiters = std::mem::take(&mut finished.tx().waiting_sessions);
        for waiter_id in waiters {
            if let Some(waiter) = self.sessions.get(waiter_id) {
                waiter.tx().waited_sessions.retain(|h| *h != finished.id);
                waiter.latch.count_down();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::locks::StatementAccess;
    use crate::manager::{TransactionControl, TransactionManager};
    use versa_core::{AccessMode, ColumnSet, IsolationLevel, RowId, TableId};

    fn t(n: u32) -> TableId {
        TableId(n)
    }

    fn r(n: u64) -> RowId {
        RowId(n)
    }

    #[test]
    fn test_stale_write_aborts_snapshot_session() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let late = mgr.connect(IsolationLevel::RepeatableRead);
        let winner = mgr.connect(IsolationLevel::ReadCommitted);

        // late's snapshot predates winner's committed delete.
        mgr.begin_transaction(&late);
        mgr.begin_action(&winner, StatementAccess::default());
        assert!(mgr.add_delete_action(&winner, t(1), r(1), None));
        mgr.end_action(&winner);
        assert!(mgr.commit_transaction(&winner));

        mgr.begin_action(&late, StatementAccess::default());
        assert!(!mgr.add_delete_action(&late, t(1), r(1), None));
        assert!(late.aborted());
        mgr.rollback(&late);
    }

    #[test]
    fn test_stale_write_redoes_read_committed_session() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let late = mgr.connect(IsolationLevel::ReadCommitted);
        let winner = mgr.connect(IsolationLevel::ReadCommitted);

        mgr.begin_transaction(&late);
        mgr.begin_action(&winner, StatementAccess::default());
        assert!(mgr.add_delete_action(&winner, t(1), r(2), None));
        mgr.end_action(&winner);
        assert!(mgr.commit_transaction(&winner));

        // Read committed is not pinned to its snapshot: a fresh statement
        // stamp sees the committed delete, so the attach simply succeeds
        // with the new visibility (the row is already gone for it).
        mgr.begin_action(&late, StatementAccess::default());
        assert!(!mgr.can_read(&late, t(1), r(2), AccessMode::Read));
        assert!(!late.aborted());
    }

    #[test]
    fn test_statement_level_conflict_spares_transaction() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let late = mgr.connect(IsolationLevel::RepeatableRead);
        let winner = mgr.connect(IsolationLevel::ReadCommitted);
        late.tx().tx_conflict_rollback = false;

        mgr.begin_action(&late, StatementAccess::default());
        mgr.add_insert_action(&late, t(2), r(9));
        mgr.end_action(&late);

        mgr.begin_action(&winner, StatementAccess::default());
        assert!(mgr.add_delete_action(&winner, t(1), r(1), None));
        mgr.end_action(&winner);
        assert!(mgr.commit_transaction(&winner));

        // The stale write fails as a statement; the rest of the
        // transaction survives and commits.
        mgr.begin_action(&late, StatementAccess::default());
        assert!(!mgr.add_delete_action(&late, t(1), r(1), None));
        assert!(!late.aborted());
        mgr.rollback_action(&late);
        assert!(mgr.commit_transaction(&late));
    }

    #[test]
    fn test_write_write_wait_and_release() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let a = mgr.connect(IsolationLevel::ReadCommitted);
        let b = mgr.connect(IsolationLevel::ReadCommitted);

        mgr.begin_action(&a, StatementAccess::default());
        assert!(mgr.add_delete_action(&a, t(1), r(1), None));

        mgr.begin_action(&b, StatementAccess::default());
        assert!(!mgr.add_delete_action(&b, t(1), r(1), None));
        assert!(!b.aborted());
        assert!(b.redo_action());
        assert_eq!(b.latch.count(), 1);
        mgr.rollback_action(&b);

        mgr.rollback(&a);
        assert_eq!(b.latch.count(), 0);

        // Redo succeeds now that a rolled its delete back.
        b.clear_redo();
        mgr.begin_action(&b, StatementAccess::default());
        assert!(mgr.add_delete_action(&b, t(1), r(1), None));
        assert!(mgr.commit_transaction(&b));
    }

    #[test]
    fn test_row_deadlock_aborts_requester() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let a = mgr.connect(IsolationLevel::ReadCommitted);
        let b = mgr.connect(IsolationLevel::ReadCommitted);

        mgr.begin_action(&a, StatementAccess::default());
        assert!(mgr.add_delete_action(&a, t(1), r(1), None));
        mgr.begin_action(&b, StatementAccess::default());
        assert!(mgr.add_delete_action(&b, t(1), r(2), None));

        // b parks behind a.
        assert!(!mgr.add_delete_action(&b, t(1), r(1), None));
        assert!(!b.aborted());

        // a then wants b's row: cycle, a aborts before blocking.
        assert!(!mgr.add_delete_action(&a, t(1), r(2), None));
        assert!(a.aborted());

        mgr.rollback(&a);
        assert_eq!(b.latch.count(), 0);
        assert!(mgr.commit_transaction(&b));
    }

    #[test]
    fn test_delete_blocks_behind_pending_ref() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let referer = mgr.connect(IsolationLevel::ReadCommitted);
        let deleter = mgr.connect(IsolationLevel::ReadCommitted);

        mgr.begin_action(&referer, StatementAccess::default());
        assert!(mgr.add_ref_action(&referer, t(1), r(1), Some(ColumnSet::of(&[0]))));
        mgr.end_action(&referer);

        // Delete of a referenced row blocks behind the reference.
        mgr.begin_action(&deleter, StatementAccess::default());
        assert!(!mgr.add_delete_action(&deleter, t(1), r(1), None));
        assert!(!deleter.aborted());
        assert_eq!(deleter.latch.count(), 1);

        // Referer commits; deleter can redo and win.
        assert!(mgr.commit_transaction(&referer));
        assert_eq!(deleter.latch.count(), 0);
        mgr.begin_action(&deleter, StatementAccess::default());
        assert!(mgr.add_delete_action(&deleter, t(1), r(1), None));
        assert!(mgr.commit_transaction(&deleter));
    }

    #[test]
    fn test_ref_over_unrelated_columns_does_not_block() {
        let mgr = TransactionManager::new(TransactionControl::Mvcc);
        let deleter = mgr.connect(IsolationLevel::ReadCommitted);
        let referer = mgr.connect(IsolationLevel::ReadCommitted);

        mgr.begin_action(&deleter, StatementAccess::default());
        assert!(mgr.add_delete_action(&deleter, t(1), r(1), Some(ColumnSet::of(&[1]))));

        mgr.begin_action(&referer, StatementAccess::default());
        assert!(mgr.add_ref_action(&referer, t(1), r(1), Some(ColumnSet::of(&[6]))));
        assert!(mgr.commit_transaction(&referer));
        assert!(mgr.commit_transaction(&deleter));
    }
}
