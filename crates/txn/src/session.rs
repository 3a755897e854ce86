//! Session surface and blocking primitive
//!
//! A [`Session`] is the per-connection handle the statement layer passes
//! into every call of the transaction core. It carries the session's
//! isolation level, its transaction and statement timestamps, the list of
//! row actions attached during the transaction, savepoint bookkeeping, and
//! the wait-graph edges used by the deadlock detector.
//!
//! The only suspension point in the whole core is the per-session [`Latch`]:
//! a session blocks on its own latch while the locks (or row versions) it
//! needs are held elsewhere, and is released by the wake cascade when the
//! holders finish.
//!
//! Sessions reference each other by [`SessionId`] only. Row actions are
//! likewise referenced by [`RowKey`], never by pointer, so there are no
//! Session/RowAction ownership cycles.

use crate::chain::RowKey;
use crate::locks::StatementAccess;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use versa_core::{Error, IsolationLevel, Result, SessionId, Timestamp};

/// Scratch set of conflicting session ids, reused across calls.
pub type ConflictSet = SmallVec<[SessionId; 4]>;

/// Insert an id into a conflict set if not already present.
pub(crate) fn push_unique(set: &mut ConflictSet, id: SessionId) {
    if !set.contains(&id) {
        set.push(id);
    }
}

/// Count-up/count-down latch; the per-session blocking primitive.
///
/// The count tracks how many sessions this session is currently waiting on.
/// `wait` blocks until the count reaches zero. The wake cascade adjusts the
/// count under the manager lock; an administrative reset may force it to
/// zero at any time.
#[derive(Debug, Default)]
pub struct Latch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    /// New latch with a zero count (not blocking).
    pub fn new() -> Self {
        Latch::default()
    }

    /// Current count.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block the calling thread until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    pub(crate) fn set_count(&self, n: usize) {
        let mut count = self.count.lock();
        *count = n;
        if n == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn count_down(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }
}

/// A recorded savepoint: action-list index plus its own timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    /// Length of the row-action list when the savepoint was taken.
    pub index: usize,
    /// Timestamp drawn for the savepoint itself; later than every version
    /// attached before it, earlier than every version attached after.
    pub timestamp: Timestamp,
}

/// Mutable per-session transaction state, guarded by the session mutex.
#[derive(Debug)]
pub struct SessionTx {
    /// Isolation level; may only change between transactions.
    pub isolation: IsolationLevel,
    /// Snapshot timestamp fixed at transaction start.
    pub transaction_timestamp: Timestamp,
    /// Per-statement timestamp, bumped by `begin_action`.
    pub action_timestamp: Timestamp,
    /// Action timestamp at the start of the current statement.
    pub action_start_timestamp: Timestamp,
    /// Length of `actions` at the start of the current statement.
    pub action_index: usize,
    /// Whether a transaction is open.
    pub is_transaction: bool,
    /// Keys of row chains this transaction has attached actions to, in order.
    pub actions: Vec<RowKey>,
    /// Savepoints, oldest first.
    pub savepoints: Vec<Savepoint>,
    /// Sessions currently waiting on this one (wait-graph in-edges).
    pub waiting_sessions: Vec<SessionId>,
    /// Sessions this one currently waits on (wait-graph out-edges).
    pub waited_sessions: Vec<SessionId>,
    /// Table-access lists of the statement in flight, if any.
    pub current_statement: Option<StatementAccess>,
    /// Set when the current statement must be re-executed after a wait.
    pub redo_action: bool,
    /// Whether an unresolvable write conflict aborts the whole transaction
    /// or only fails the statement.
    pub tx_conflict_rollback: bool,
}

impl SessionTx {
    fn new(isolation: IsolationLevel) -> Self {
        SessionTx {
            isolation,
            transaction_timestamp: 0,
            action_timestamp: 0,
            action_start_timestamp: 0,
            action_index: 0,
            is_transaction: false,
            actions: Vec::new(),
            savepoints: Vec::new(),
            waiting_sessions: Vec::new(),
            waited_sessions: Vec::new(),
            current_statement: None,
            redo_action: false,
            tx_conflict_rollback: true,
        }
    }
}

/// Immutable snapshot of the session fields the row-chain code needs.
///
/// Taken once per operation so chain walks never touch the session mutex.
#[derive(Debug, Clone, Copy)]
pub struct SessionView {
    /// Session id.
    pub id: SessionId,
    /// Isolation level at the time of the call.
    pub isolation: IsolationLevel,
    /// Per-statement timestamp.
    pub action_timestamp: Timestamp,
    /// Snapshot timestamp.
    pub transaction_timestamp: Timestamp,
}

/// Per-connection handle supplied by the surrounding engine.
#[derive(Debug)]
pub struct Session {
    /// Session id, unique within the registry.
    pub id: SessionId,
    /// Set by the strategies when the transaction must abort; polled by the
    /// statement layer after every call that can conflict.
    abort_transaction: AtomicBool,
    /// Blocking primitive.
    pub latch: Latch,
    tx: Mutex<SessionTx>,
}

impl Session {
    /// New session with the given id and isolation level.
    pub fn new(id: SessionId, isolation: IsolationLevel) -> Arc<Self> {
        Arc::new(Session {
            id,
            abort_transaction: AtomicBool::new(false),
            latch: Latch::new(),
            tx: Mutex::new(SessionTx::new(isolation)),
        })
    }

    /// Lock the mutable transaction state.
    pub fn tx(&self) -> MutexGuard<'_, SessionTx> {
        self.tx.lock()
    }

    /// Snapshot of the fields visibility checks need.
    pub fn view(&self) -> SessionView {
        let tx = self.tx.lock();
        SessionView {
            id: self.id,
            isolation: tx.isolation,
            action_timestamp: tx.action_timestamp,
            transaction_timestamp: tx.transaction_timestamp,
        }
    }

    /// Whether the abort flag is set.
    pub fn aborted(&self) -> bool {
        self.abort_transaction.load(Ordering::Acquire)
    }

    /// Set the abort flag. The outer layer converts it into a retryable
    /// serialization error after the current call returns.
    pub fn set_abort(&self) {
        self.abort_transaction.store(true, Ordering::Release);
    }

    /// Clear the abort flag (done by rollback).
    pub fn clear_abort(&self) {
        self.abort_transaction.store(false, Ordering::Release);
    }

    /// Whether the last statement must be re-executed after waiting.
    pub fn redo_action(&self) -> bool {
        self.tx.lock().redo_action
    }

    /// Clear the redo flag before re-executing a statement.
    pub fn clear_redo(&self) {
        self.tx.lock().redo_action = false;
    }

    /// Current isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.tx.lock().isolation
    }

    /// Change the isolation level. Only allowed between transactions.
    pub fn set_isolation(&self, isolation: IsolationLevel) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.is_transaction {
            return Err(Error::InvalidState(
                "isolation level cannot change inside a transaction".into(),
            ));
        }
        tx.isolation = isolation;
        Ok(())
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.tx.lock().is_transaction
    }

    /// Number of row actions attached in the open transaction.
    pub fn transaction_size(&self) -> usize {
        self.tx.lock().actions.len()
    }
}

/// Registry of live sessions, id -> handle.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<FxHashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Create and register a new session.
    pub fn register(&self, isolation: IsolationLevel) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let session = Session::new(id, isolation);
        self.inner.write().insert(id, Arc::clone(&session));
        session
    }

    /// Look up a session by id.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().get(&id).cloned()
    }

    /// All registered sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner.read().values().cloned().collect()
    }

    /// Remove a session (administrative close).
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.write().remove(&id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
