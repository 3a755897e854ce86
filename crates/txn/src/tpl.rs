//! Two-phase-locking half of the manager
//!
//! Under [`TransactionControl::Locks`] every statement declares its table
//! access up front. Conflicts therefore surface in `begin_action`, before
//! the statement touches a single row: either all declared locks are granted
//! atomically, or the requester is parked behind the holders, or, if waiting
//! would close a waits-for cycle, the requester is aborted on the spot.
//!
//! When a transaction finishes, the `wake_lock_waiters` cascade walks the
//! sessions that were parked behind it, grants whoever is now unobstructed
//! and re-points the rest at their current blockers.
//!
//! [`TransactionControl::Locks`]: crate::manager::TransactionControl::Locks

use crate::locks::{would_deadlock, StatementAccess};
use crate::manager::{TransactionManager, TxnState};
use crate::session::Session;
use tracing::debug;
use versa_core::SessionId;

impl TransactionManager {
    /// Lock-acquisition phase of `begin_action`. Returns `true` when the
    /// session must block on its latch. Caller holds the manager lock.
    pub(crate) fn begin_action_locks(
        &self,
        state: &mut TxnState,
        session: &Session,
        stmt: &StatementAccess,
    ) -> bool {
        let conflicts = state.locks.compute_conflicts(session.id, stmt);
        if conflicts.is_empty() {
            state.locks.lock(session.id, stmt);
            return false;
        }
        if would_deadlock(&self.sessions, session.id, &conflicts) {
            debug!(
                session = session.id.0,
                blockers = ?conflicts,
                "lock wait would deadlock, aborting requester"
            );
            session.set_abort();
            return false;
        }

        session.latch.set_count(conflicts.len());
        {
            let mut tx = session.tx();
            tx.waited_sessions = conflicts.to_vec();
            tx.redo_action = true;
        }
        for &holder in &conflicts {
            if let Some(h) = self.sessions.get(holder) {
                h.tx().waiting_sessions.push(session.id);
            }
        }
        true
    }

    /// Re-evaluate every session parked behind `finished`: grant the ones
    /// whose declared locks are now free, re-point the rest at whoever
    /// still blocks them. Caller holds the manager lock.
    pub(crate) fn wake_lock_waiters(&self, state: &mut TxnState, finished: SessionId) {
        let waiters: Vec<SessionId> = match self.sessions.get(finished) {
            Some(h) => std::mem::take(&mut h.tx().waiting_sessions),
            None => Vec::new(),
        };

        for waiter_id in waiters {
            let Some(waiter) = self.sessions.get(waiter_id) else {
                continue;
            };
            let stmt = {
                let mut tx = waiter.tx();
                tx.waited_sessions.retain(|h| *h != finished);
                tx.current_statement.clone()
            };
            let Some(stmt) = stmt else {
                waiter.latch.count_down();
                continue;
            };

            let conflicts = state.locks.compute_conflicts(waiter_id, &stmt);
            if conflicts.is_empty() {
                state.locks.lock(waiter_id, &stmt);
                let remaining = std::mem::take(&mut waiter.tx().waited_sessions);
                for holder in remaining {
                    if let Some(h) = self.sessions.get(holder) {
                        h.tx().waiting_sessions.retain(|w| *w != waiter_id);
                    }
                }
                waiter.latch.set_count(0);
            } else {
                let old = std::mem::replace(&mut waiter.tx().waited_sessions, conflicts.to_vec());
                for holder in old {
                    if let Some(h) = self.sessions.get(holder) {
                        h.tx().waiting_sessions.retain(|w| *w != waiter_id);
                    }
                }
                for &holder in &conflicts {
                    if let Some(h) = self.sessions.get(holder) {
                        let mut tx = h.tx();
                        if !tx.waiting_sessions.contains(&waiter_id) {
                            tx.waiting_sessions.push(waiter_id);
                        }
                    }
                }
                waiter.latch.set_count(conflicts.len());
            }
        }
    }
}
