//! Table lock table and deadlock detector
//!
//! Two-phase locking works at table granularity: a statement declares the
//! tables it writes and the tables it reads, the manager computes the
//! sessions currently in the way, and either grants all locks atomically or
//! registers the requester as waiting. Every entry point here runs under the
//! manager-wide write lock; the table itself does not lock.
//!
//! Deadlocks are detected proactively, before the requester ever blocks: if
//! adding the new waits-for edges would close a cycle, the requester is
//! aborted on the spot. There are no lock timeouts.

use crate::session::{push_unique, ConflictSet, SessionRegistry};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use versa_core::{SessionId, TableId};

/// Tables a statement touches, as declared by the statement layer.
#[derive(Debug, Clone, Default)]
pub struct StatementAccess {
    /// Tables the statement modifies; each needs an exclusive lock.
    pub write_tables: Vec<TableId>,
    /// Tables the statement only reads; each needs a shared lock.
    pub read_tables: Vec<TableId>,
}

impl StatementAccess {
    /// Access lists for a statement writing `writes` and reading `reads`.
    pub fn new(writes: &[TableId], reads: &[TableId]) -> Self {
        StatementAccess {
            write_tables: writes.to_vec(),
            read_tables: reads.to_vec(),
        }
    }

    /// A statement that only reads.
    pub fn read_only(reads: &[TableId]) -> Self {
        StatementAccess::new(&[], reads)
    }

    /// Whether the statement takes no locks at all.
    pub fn is_empty(&self) -> bool {
        self.write_tables.is_empty() && self.read_tables.is_empty()
    }
}

/// Table-granular lock state: one exclusive holder or any number of shared
/// holders per table.
#[derive(Debug, Default)]
pub struct LockTable {
    exclusive: FxHashMap<TableId, SessionId>,
    shared: FxHashMap<TableId, SmallVec<[SessionId; 4]>>,
}

impl LockTable {
    /// Empty lock table.
    pub fn new() -> Self {
        LockTable::default()
    }

    /// Sessions that currently prevent `session` from locking `stmt`.
    ///
    /// A written table conflicts with a foreign exclusive holder and every
    /// foreign shared holder; a read table conflicts only with a foreign
    /// exclusive holder. An empty result means `lock` will succeed.
    pub fn compute_conflicts(&self, session: SessionId, stmt: &StatementAccess) -> ConflictSet {
        let mut set = ConflictSet::new();
        for table in &stmt.write_tables {
            if let Some(&holder) = self.exclusive.get(table) {
                if holder != session {
                    push_unique(&mut set, holder);
                }
            }
            if let Some(holders) = self.shared.get(table) {
                for &holder in holders {
                    if holder != session {
                        push_unique(&mut set, holder);
                    }
                }
            }
        }
        for table in &stmt.read_tables {
            if let Some(&holder) = self.exclusive.get(table) {
                if holder != session {
                    push_unique(&mut set, holder);
                }
            }
        }
        set
    }

    /// Grant every lock in `stmt` to `session`.
    ///
    /// Callers must have seen an empty conflict set under the same manager
    /// lock; granting is then unconditional.
    pub fn lock(&mut self, session: SessionId, stmt: &StatementAccess) {
        for &table in &stmt.write_tables {
            self.exclusive.insert(table, session);
        }
        for &table in &stmt.read_tables {
            let holders = self.shared.entry(table).or_default();
            if !holders.contains(&session) {
                holders.push(session);
            }
        }
    }

    /// Release every lock `session` holds.
    pub fn unlock_all(&mut self, session: SessionId) {
        self.exclusive.retain(|_, holder| *holder != session);
        self.shared.retain(|_, holders| {
            holders.retain(|h| *h != session);
            !holders.is_empty()
        });
    }

    /// Release the shared locks `session` holds on `tables`. Used at
    /// statement end under READ COMMITTED, where read locks do not persist
    /// to commit.
    pub fn unlock_read(&mut self, session: SessionId, tables: &[TableId]) {
        for table in tables {
            if let Some(holders) = self.shared.get_mut(table) {
                holders.retain(|h| *h != session);
                if holders.is_empty() {
                    self.shared.remove(table);
                }
            }
        }
    }

    /// Exclusive holder of `table`, if any.
    pub fn exclusive_holder(&self, table: TableId) -> Option<SessionId> {
        self.exclusive.get(&table).copied()
    }

    /// Whether `session` holds any lock.
    pub fn holds_any(&self, session: SessionId) -> bool {
        self.exclusive.values().any(|h| *h == session)
            || self.shared.values().any(|hs| hs.contains(&session))
    }
}

/// Whether letting `session` wait on `conflicts` would close a waits-for
/// cycle.
///
/// The wait graph lives on the sessions themselves: `waiting_sessions` are
/// the sessions blocked on a given one. The check walks every session that
/// transitively waits on the requester; if any of them is a session the
/// requester is about to wait on, the new edges would form a cycle and the
/// requester must abort instead of blocking.
///
/// Runs under the manager write lock, which is what keeps the graph stable
/// during the walk.
pub fn would_deadlock(
    registry: &SessionRegistry,
    session: SessionId,
    conflicts: &ConflictSet,
) -> bool {
    if conflicts.is_empty() {
        return false;
    }
    let mut stack: SmallVec<[SessionId; 8]> = SmallVec::new();
    let mut visited: SmallVec<[SessionId; 8]> = SmallVec::new();
    stack.push(session);
    visited.push(session);

    while let Some(current) = stack.pop() {
        let Some(handle) = registry.get(current) else {
            continue;
        };
        let waiters = handle.tx().waiting_sessions.clone();
        for waiter in waiters {
            if conflicts.contains(&waiter) {
                return true;
            }
            if !visited.contains(&waiter) {
                visited.push(waiter);
                stack.push(waiter);
            }
        }
    }
    false
}


#[cfg(test)]
mod wait_graph_properties {
    use super::*;
    use proptest::prelude::*;
    use versa_core::IsolationLevel;

    proptest! {
        /// Random edge sets: the check flags exactly the requests that
        /// would make some conflict target transitively wait on the
        /// requester.
        #[test]
        fn detector_matches_reachability(
            edges in prop::collection::vec((0usize..6, 0usize..6), 0..12),
            target in 0usize..6,
        ) {
            let registry = SessionRegistry::new();
            let ids: Vec<SessionId> = (0..6)
                .map(|_| registry.register(IsolationLevel::ReadCommitted).id)
                .collect();

            // edge (w, h): w waits on h. Keep it a function: one out-edge
            // per waiter, like real blocked sessions.
            let mut waits: Vec<Option<usize>> = vec![None; 6];
            for (w, h) in edges {
                if w != h && waits[w].is_none() {
                    waits[w] = Some(h);
                    registry.get(ids[h]).unwrap().tx().waiting_sessions.push(ids[w]);
                }
            }

            let requester = 0usize;
            let mut conflicts = ConflictSet::new();
            if target != requester {
                conflicts.push(ids[target]);
            }

            // Reference reachability: does target transitively wait on the
            // requester?
            let mut cycle = false;
            if target != requester {
                let mut current = Some(target);
                let mut steps = 0;
                while let Some(c) = current {
                    if c == requester {
                        cycle = true;
                        break;
                    }
                    current = waits[c];
                    steps += 1;
                    if steps > 6 {
                        break; // pre-existing loop not through requester
                    }
                }
            }

            prop_assert_eq!(would_deadlock(&registry, ids[requester], &conflicts), cycle);
        }
    }
}
