//! Transaction manager
//!
//! The manager owns the pieces the rest of the engine talks to: the global
//! change counter, the live-transaction queue, the table lock table, the
//! row-chain arena and the session registry. Statements drive it through a
//! small façade: `begin_action` / `end_action` around each statement,
//! `add_*_action` per touched row, `commit_transaction` / `rollback` at the
//! end.
//!
//! Two interchangeable concurrency strategies share this façade, selected by
//! [`TransactionControl`]: table-granular two-phase locking, where conflicts
//! surface before a statement runs, and MVCC, where writers collide on row
//! version chains and commits are validated against the snapshot. The
//! strategy-specific halves live in the `tpl` and `mvcc` modules.
//!
//! Locking discipline: the coarse `state` write lock is taken first, session
//! mutexes second (one at a time unless serialized under `state`), row-chain
//! entries last. No call path acquires `state` while holding a session or
//! chain guard.

use crate::chain::{AttachOutcome, ChainState, RowChain, RowKey};
use crate::locks::{LockTable, StatementAccess};
use crate::log::{CommitLog, NullLog};
use crate::session::{ConflictSet, Savepoint, Session, SessionRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use versa_core::{
    AccessMode, ActionKind, ColumnSet, Error, IsolationLevel, Result, RowId, SessionId, TableId,
    Timestamp,
};

/// Concurrency strategy in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    /// Table-granular two-phase locking.
    Locks,
    /// Multi-version concurrency control with commit-time validation.
    Mvcc,
}

/// How an administrative reset treats the target session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Abort the target's transaction; its own thread rolls back on wake.
    Rollback,
    /// Roll the target back on its behalf and unregister it. The target
    /// must be idle or blocked on its latch.
    Close,
}

/// Commit whose chains still await merging, held until every snapshot that
/// could see past it has finished.
#[derive(Debug)]
struct CommittedBatch {
    timestamp: Timestamp,
    keys: Vec<RowKey>,
}

/// Bookkeeping guarded by the manager-wide lock.
pub(crate) struct TxnState {
    pub(crate) control: TransactionControl,
    /// Snapshot timestamps of open transactions, oldest first.
    live_transactions: VecDeque<Timestamp>,
    transaction_count: u64,
    pub(crate) locks: LockTable,
    committed: VecDeque<CommittedBatch>,
}

/// The transaction core.
pub struct TransactionManager {
    global_change_timestamp: AtomicU64,
    pub(crate) state: RwLock<TxnState>,
    pub(crate) rows: DashMap<RowKey, RowChain>,
    pub(crate) sessions: SessionRegistry,
    log: Arc<dyn CommitLog>,
}

impl TransactionManager {
    /// Manager with the given strategy and a discarding commit log.
    pub fn new(control: TransactionControl) -> Self {
        TransactionManager::with_log(control, Arc::new(NullLog))
    }

    /// Manager with the given strategy and commit log.
    pub fn with_log(control: TransactionControl, log: Arc<dyn CommitLog>) -> Self {
        TransactionManager {
            global_change_timestamp: AtomicU64::new(0),
            state: RwLock::new(TxnState {
                control,
                live_transactions: VecDeque::new(),
                transaction_count: 0,
                locks: LockTable::new(),
                committed: VecDeque::new(),
            }),
            rows: DashMap::new(),
            sessions: SessionRegistry::new(),
            log,
        }
    }

    /// Register a new session.
    pub fn connect(&self, isolation: IsolationLevel) -> Arc<Session> {
        self.sessions.register(isolation)
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Strategy currently in force.
    pub fn control(&self) -> TransactionControl {
        self.state.read().control
    }

    /// Current value of the global change counter.
    pub fn global_change_timestamp(&self) -> Timestamp {
        self.global_change_timestamp.load(Ordering::SeqCst)
    }

    /// Number of transactions begun since startup.
    pub fn transaction_count(&self) -> u64 {
        self.state.read().transaction_count
    }

    /// Number of currently open transactions.
    pub fn live_transaction_count(&self) -> usize {
        self.state.read().live_transactions.len()
    }

    fn next_timestamp(&self) -> Timestamp {
        self.global_change_timestamp.fetch_add(1, Ordering::SeqCst) + 1
    }

    // === Transaction lifecycle ===

    /// Open a transaction for `session`. Idempotent while one is open.
    pub fn begin_transaction(&self, session: &Session) {
        let mut state = self.state.write();
        if !self.begin_transaction_locked(&mut state, session) {
            return;
        }
        drop(state);
        if let Err(e) = self.log.log_begin(session.id) {
            warn!(session = session.id.0, error = %e, "commit log write failed");
        }
    }

    fn begin_transaction_locked(&self, state: &mut TxnState, session: &Session) -> bool {
        let mut tx = session.tx();
        if tx.is_transaction {
            return false;
        }
        let ts = self.next_timestamp();
        tx.transaction_timestamp = ts;
        tx.action_timestamp = ts;
        tx.is_transaction = true;
        state.live_transactions.push_back(ts);
        state.transaction_count += 1;
        true
    }

    /// Start a statement.
    ///
    /// Opens a transaction if none is open, stamps the statement with a
    /// fresh timestamp and, under two-phase locking, acquires the declared
    /// table locks. Returns `true` when the caller must block on the session
    /// latch before running the statement; after the wait the caller checks
    /// the abort flag and, if clear, calls `begin_action` again.
    pub fn begin_action(&self, session: &Session, stmt: StatementAccess) -> bool {
        let mut state = self.state.write();
        self.begin_transaction_locked(&mut state, session);
        {
            let mut tx = session.tx();
            tx.action_timestamp = self.next_timestamp();
            tx.action_start_timestamp = tx.action_timestamp;
            tx.action_index = tx.actions.len();
            tx.current_statement = Some(stmt.clone());
            tx.redo_action = false;
        }
        match state.control {
            TransactionControl::Locks => self.begin_action_locks(&mut state, session, &stmt),
            TransactionControl::Mvcc => false,
        }
    }

    /// Finish a statement. Under READ COMMITTED with two-phase locking the
    /// statement's read locks are released here rather than at commit.
    pub fn end_action(&self, session: &Session) {
        let mut state = self.state.write();
        let (isolation, read_tables) = {
            let mut tx = session.tx();
            let reads = tx
                .current_statement
                .take()
                .map(|s| s.read_tables)
                .unwrap_or_default();
            (tx.isolation, reads)
        };
        if matches!(state.control, TransactionControl::Locks)
            && isolation == IsolationLevel::ReadCommitted
            && !read_tables.is_empty()
        {
            state.locks.unlock_read(session.id, &read_tables);
            self.wake_lock_waiters(&mut state, session.id);
        }
    }

    // === Row actions ===

    /// Record an insert of `row` by `session`.
    pub fn add_insert_action(&self, session: &Session, table: TableId, row: RowId) {
        let view = session.view();
        let key = RowKey::new(table, row);
        match self.rows.entry(key) {
            Entry::Occupied(mut e) => {
                // Re-insert over existing history (the row id was deleted by
                // this session earlier in the transaction).
                let mut blockers = ConflictSet::new();
                let _ = e
                    .get_mut()
                    .attach(&view, ActionKind::Insert, None, &mut blockers);
            }
            Entry::Vacant(v) => {
                v.insert(RowChain::for_insert(&view));
            }
        }
        session.tx().actions.push(key);
    }

    /// Record a delete of `row` by `session`; `columns` are the columns the
    /// delete invalidates (`None` = all).
    ///
    /// Returns `false` when another session is in the way. The caller then
    /// inspects the session: abort flag set means the transaction is lost;
    /// otherwise the caller rolls the statement back (`rollback_action`),
    /// waits on the latch and re-runs the statement.
    pub fn add_delete_action(
        &self,
        session: &Session,
        table: TableId,
        row: RowId,
        columns: Option<ColumnSet>,
    ) -> bool {
        self.add_write_action(session, table, row, ActionKind::Delete, columns)
    }

    /// Record a reference-integrity read of `row`; `columns` are the
    /// referenced columns. Same contract as [`add_delete_action`].
    ///
    /// [`add_delete_action`]: TransactionManager::add_delete_action
    pub fn add_ref_action(
        &self,
        session: &Session,
        table: TableId,
        row: RowId,
        columns: Option<ColumnSet>,
    ) -> bool {
        self.add_write_action(session, table, row, ActionKind::Ref, columns)
    }

    fn add_write_action(
        &self,
        session: &Session,
        table: TableId,
        row: RowId,
        kind: ActionKind,
        columns: Option<ColumnSet>,
    ) -> bool {
        let view = session.view();
        let key = RowKey::new(table, row);
        let (outcome, blockers) = {
            let mut chain = self
                .rows
                .entry(key)
                .or_insert_with(RowChain::for_existing_row);
            let mut blockers = ConflictSet::new();
            let outcome = chain.attach(&view, kind, columns, &mut blockers);
            (outcome, blockers)
        };
        match outcome {
            AttachOutcome::Attached => {
                session.tx().actions.push(key);
                true
            }
            AttachOutcome::Conflict { committed } => {
                self.resolve_write_conflict(session, &blockers, committed);
                false
            }
        }
    }

    /// Whether `session` can see `row`.
    ///
    /// Absent chains mean the row has no pending history; it is visible as
    /// stored. An [`AccessMode::Update`] probe additionally fails while
    /// another session has a pending version of the row.
    pub fn can_read(&self, session: &Session, table: TableId, row: RowId, mode: AccessMode) -> bool {
        let view = session.view();
        match self.rows.get(&RowKey::new(table, row)) {
            None => true,
            Some(chain) => {
                let visible = chain.can_read(&view);
                match mode {
                    AccessMode::Update if visible => !chain.has_foreign_pending(view.id),
                    _ => visible,
                }
            }
        }
    }

    // === Commit ===

    /// First phase of a two-phase commit: validate the transaction and mark
    /// its versions prepared. Returns `false` when the transaction cannot
    /// commit and must roll back. A successful prepare binds the second
    /// phase: [`commit_transaction`] does not revalidate prepared chains.
    ///
    /// [`commit_transaction`]: TransactionManager::commit_transaction
    pub fn prepare_commit(&self, session: &Session) -> Result<bool> {
        if session.aborted() {
            return Ok(false);
        }
        let state = self.state.write();
        let mvcc = matches!(state.control, TransactionControl::Mvcc);
        let (snapshot_ts, validate, keys) = {
            let tx = session.tx();
            if !tx.is_transaction {
                return Ok(true);
            }
            (
                tx.transaction_timestamp,
                mvcc && tx.isolation.uses_snapshot(),
                dedup_keys(&tx.actions),
            )
        };
        let mut stale = ConflictSet::new();
        for key in &keys {
            if let Some(chain) = self.rows.get(key) {
                if !chain.can_commit(session.id, snapshot_ts, validate, &mut stale) {
                    return Ok(false);
                }
            }
        }
        let mut losers = ConflictSet::new();
        for key in &keys {
            if let Some(mut chain) = self.rows.get_mut(key) {
                chain.prepare(session.id);
                chain.pending_ref_holders(session.id, &mut losers);
            }
        }
        self.abort_sessions(&losers, session.id);
        Ok(true)
    }

    /// Commit the open transaction.
    ///
    /// Returns `false` when the transaction cannot commit (abort flag set,
    /// or a conflicting write committed after its snapshot); the caller must
    /// then call [`rollback`]. On success the commit record is written to
    /// the log; a log failure is reported as a warning and does not unwind
    /// the commit.
    ///
    /// [`rollback`]: TransactionManager::rollback
    pub fn commit_transaction(&self, session: &Session) -> bool {
        if session.aborted() {
            return false;
        }
        let mut state = self.state.write();
        let mvcc = matches!(state.control, TransactionControl::Mvcc);
        let (snapshot_ts, validate, keys) = {
            let tx = session.tx();
            if !tx.is_transaction {
                return true;
            }
            (
                tx.transaction_timestamp,
                mvcc && tx.isolation.uses_snapshot(),
                dedup_keys(&tx.actions),
            )
        };

        let mut stale = ConflictSet::new();
        for key in &keys {
            if let Some(chain) = self.rows.get(key) {
                if !chain.can_commit(session.id, snapshot_ts, validate, &mut stale) {
                    debug!(
                        session = session.id.0,
                        blockers = ?stale,
                        "commit validation failed"
                    );
                    return false;
                }
            }
        }

        // Readers whose integrity checks our deletes invalidate.
        let mut losers = ConflictSet::new();
        for key in &keys {
            if let Some(chain) = self.rows.get(key) {
                chain.pending_ref_holders(session.id, &mut losers);
            }
        }

        let commit_ts = self.next_timestamp();
        remove_live(&mut state, snapshot_ts);

        for &key in &keys {
            let effect = match self.rows.get_mut(&key) {
                Some(mut chain) => chain.commit(session.id, commit_ts),
                None => ActionKind::None,
            };
            let logged = match effect {
                ActionKind::Insert => self.log.log_insert(session.id, key.table, key.row),
                ActionKind::Delete => self.log.log_delete(session.id, key.table, key.row),
                _ => Ok(()),
            };
            if let Err(e) = logged {
                warn!(session = session.id.0, error = %e, "commit log write failed");
            }
        }
        if let Err(e) = self.log.log_commit(session.id) {
            warn!(session = session.id.0, error = %e, "commit log write failed");
        }

        self.abort_sessions(&losers, session.id);

        // Merge our own chains now if no live snapshot predates the commit,
        // otherwise queue them until the older snapshots finish.
        let oldest_live = state
            .live_transactions
            .front()
            .copied()
            .unwrap_or(Timestamp::MAX);
        if oldest_live > commit_ts {
            for &key in &keys {
                self.merge_chain(key, commit_ts);
            }
        } else {
            state.committed.push_back(CommittedBatch {
                timestamp: commit_ts,
                keys,
            });
        }
        self.merge_expired(&mut state);
        self.finish_transaction(&mut state, session);
        true
    }

    // === Rollback ===

    /// Roll back the open transaction and clear the abort flag.
    pub fn rollback(&self, session: &Session) {
        let mut state = self.state.write();
        let (snapshot_ts, in_txn) = {
            let tx = session.tx();
            (tx.transaction_timestamp, tx.is_transaction)
        };
        if in_txn {
            self.rollback_partial(session, 0, 0);
            remove_live(&mut state, snapshot_ts);
            self.merge_expired(&mut state);
        }
        session.clear_abort();
        self.finish_transaction(&mut state, session);
        drop(state);
        if let Err(e) = self.log.log_rollback(session.id) {
            warn!(session = session.id.0, error = %e, "commit log write failed");
        }
    }

    /// Roll back the current statement only.
    pub fn rollback_action(&self, session: &Session) {
        let (index, ts) = {
            let tx = session.tx();
            (tx.action_index, tx.action_start_timestamp)
        };
        let _state = self.state.write();
        self.rollback_partial(session, index, ts);
    }

    /// Record a savepoint; returns its index for [`rollback_savepoint`].
    ///
    /// The savepoint draws its own timestamp, strictly after every version
    /// the transaction has attached so far, so a rollback to it never
    /// touches earlier work on a row the transaction revisits later.
    ///
    /// [`rollback_savepoint`]: TransactionManager::rollback_savepoint
    pub fn savepoint(&self, session: &Session) -> usize {
        let ts = self.next_timestamp();
        let mut tx = session.tx();
        let sp = Savepoint {
            index: tx.actions.len(),
            timestamp: ts,
        };
        tx.savepoints.push(sp);
        tx.savepoints.len() - 1
    }

    /// Roll back to a savepoint: exactly the actions recorded after it are
    /// reverted, and later savepoints are discarded. The savepoint itself
    /// stays valid for repeated rollbacks.
    pub fn rollback_savepoint(&self, session: &Session, savepoint: usize) -> Result<()> {
        let sp = {
            let mut tx = session.tx();
            let Some(&sp) = tx.savepoints.get(savepoint) else {
                return Err(Error::InvalidState(format!(
                    "no savepoint at index {savepoint}"
                )));
            };
            tx.savepoints.truncate(savepoint + 1);
            sp
        };
        let _state = self.state.write();
        self.rollback_partial(session, sp.index, sp.timestamp);
        Ok(())
    }

    /// Roll back and prune the actions of `session` from `start_index`
    /// onward, newest first. Caller holds the manager lock.
    pub(crate) fn rollback_partial(
        &self,
        session: &Session,
        start_index: usize,
        start_ts: Timestamp,
    ) {
        let keys: Vec<RowKey> = {
            let mut tx = session.tx();
            if start_index >= tx.actions.len() {
                return;
            }
            tx.actions.split_off(start_index)
        };
        for key in keys.iter().rev() {
            if let Some(mut chain) = self.rows.get_mut(key) {
                chain.rollback(session.id, start_ts);
            }
            self.drop_if_spent(*key);
        }
    }

    // === Administration ===

    /// Switch the concurrency strategy. Refused while any transaction other
    /// than the caller's is open; queued merges are flushed first since no
    /// foreign snapshot can still need them.
    pub fn set_transaction_control(
        &self,
        session: &Session,
        control: TransactionControl,
    ) -> Result<()> {
        let mut state = self.state.write();
        let caller_live = session.tx().is_transaction;
        let others = state.live_transactions.len() - usize::from(caller_live);
        if others > 0 {
            return Err(Error::TransactionControl(others));
        }
        loop {
            let Some(batch) = state.committed.pop_front() else {
                break;
            };
            for key in batch.keys {
                self.merge_chain(key, batch.timestamp);
            }
        }
        state.control = control;
        Ok(())
    }

    /// Force a blocked or idle session out of its transaction.
    ///
    /// Callable from any thread. [`ResetMode::Rollback`] sets the target's
    /// abort flag and releases its latch; the target's own thread performs
    /// the rollback when it wakes. [`ResetMode::Close`] additionally rolls
    /// the target back here and unregisters it.
    pub fn reset_session(&self, target: SessionId, mode: ResetMode) -> Result<()> {
        let mut state = self.state.write();
        let Some(handle) = self.sessions.get(target) else {
            return Err(Error::InvalidState(format!(
                "no session with id {}",
                target.0
            )));
        };
        handle.set_abort();
        let waited = {
            let mut tx = handle.tx();
            std::mem::take(&mut tx.waited_sessions)
        };
        for holder in waited {
            if let Some(h) = self.sessions.get(holder) {
                h.tx().waiting_sessions.retain(|w| *w != target);
            }
        }
        handle.latch.set_count(0);

        if matches!(mode, ResetMode::Close) {
            let (snapshot_ts, in_txn) = {
                let tx = handle.tx();
                (tx.transaction_timestamp, tx.is_transaction)
            };
            if in_txn {
                self.rollback_partial(&handle, 0, 0);
                remove_live(&mut state, snapshot_ts);
                self.merge_expired(&mut state);
            }
            handle.clear_abort();
            self.finish_transaction(&mut state, &handle);
            self.sessions.remove(target);
        }
        Ok(())
    }

    // === Shared internals ===

    /// Close out the transaction on `session`: clear its state, sever its
    /// wait edges and run the strategy epilogue that releases whoever was
    /// blocked behind it.
    pub(crate) fn finish_transaction(&self, state: &mut TxnState, session: &Session) {
        let waited = {
            let mut tx = session.tx();
            tx.is_transaction = false;
            tx.actions.clear();
            tx.savepoints.clear();
            tx.current_statement = None;
            tx.redo_action = false;
            std::mem::take(&mut tx.waited_sessions)
        };
        for holder in waited {
            if let Some(h) = self.sessions.get(holder) {
                h.tx().waiting_sessions.retain(|w| *w != session.id);
            }
        }
        match state.control {
            TransactionControl::Locks => {
                state.locks.unlock_all(session.id);
                self.wake_lock_waiters(state, session.id);
            }
            TransactionControl::Mvcc => self.release_version_waiters(session),
        }
    }

    /// Set the abort flag on every session in `losers` except `winner`.
    pub(crate) fn abort_sessions(&self, losers: &ConflictSet, winner: SessionId) {
        for &id in losers {
            if id == winner {
                continue;
            }
            if let Some(h) = self.sessions.get(id) {
                debug!(session = id.0, winner = winner.0, "aborting conflicting session");
                h.set_abort();
            }
        }
    }

    /// Merge one chain to `boundary` and drop it if nothing remains.
    pub(crate) fn merge_chain(&self, key: RowKey, boundary: Timestamp) {
        if let Some(mut chain) = self.rows.get_mut(&key) {
            chain.merge_to_timestamp(boundary);
        }
        self.drop_if_spent(key);
    }

    /// Merge every queued commit no live snapshot can still distinguish.
    pub(crate) fn merge_expired(&self, state: &mut TxnState) {
        let oldest_live = state
            .live_transactions
            .front()
            .copied()
            .unwrap_or(Timestamp::MAX);
        loop {
            let expired = matches!(
                state.committed.front(),
                Some(batch) if batch.timestamp <= oldest_live
            );
            if !expired {
                break;
            }
            if let Some(batch) = state.committed.pop_front() {
                for key in batch.keys {
                    self.merge_chain(key, batch.timestamp);
                }
            }
        }
    }

    /// Remove a chain that carries no information: fully rolled back, or
    /// merged down to a live baseline row. A `DeleteFinal` chain stays as a
    /// tombstone until storage reclaims the row.
    fn drop_if_spent(&self, key: RowKey) {
        self.rows.remove_if(&key, |_, chain| {
            chain.state() == ChainState::NoOp
                || (chain.is_empty() && chain.state() == ChainState::Active)
        });
    }

    // === Introspection (tests and administration) ===

    /// Terminal state of the chain for `row`, if one exists.
    pub fn chain_state(&self, table: TableId, row: RowId) -> Option<ChainState> {
        self.rows.get(&RowKey::new(table, row)).map(|c| c.state())
    }

    /// Number of versions in the chain for `row`.
    pub fn chain_len(&self, table: TableId, row: RowId) -> usize {
        self.rows
            .get(&RowKey::new(table, row))
            .map_or(0, |c| c.len())
    }
}

fn dedup_keys(keys: &[RowKey]) -> Vec<RowKey> {
    let mut out = Vec::with_capacity(keys.len());
    for &k in keys {
        if !out.contains(&k) {
            out.push(k);
        }
    }
    out
}

fn remove_live(state: &mut TxnState, ts: Timestamp) {
    if let Some(pos) = state.live_transactions.iter().position(|&t| t == ts) {
        state.live_transactions.remove(pos);
    }
}
