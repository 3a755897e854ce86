//! Row version chains
//!
//! Every modified row carries a chain of [`RowVersion`] records, one per
//! modification, ordered by action timestamp. The chain answers three
//! questions: can a given session see this row (`can_read`), may a new
//! modification attach without conflicting (`attach`), and may the owning
//! transaction commit (`can_commit`). Committed versions older than every
//! live snapshot are pruned by `merge_to_timestamp`, which may collapse the
//! chain into a terminal state.
//!
//! Chains are plain data addressed by [`RowKey`]; sessions record keys, not
//! references, so chains and sessions never own each other. The arena
//! (a `DashMap` in the manager) provides per-row exclusion; nothing in this
//! module locks.

use crate::session::{push_unique, ConflictSet, SessionView};
use versa_core::{
    masks_overlap, ActionKind, ColumnSet, RowId, SessionId, TableId, Timestamp, UNCOMMITTED,
};

/// Address of a row chain in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowKey {
    /// Table the row belongs to.
    pub table: TableId,
    /// Row within the table.
    pub row: RowId,
}

impl RowKey {
    /// Key for `(table, row)`.
    pub fn new(table: TableId, row: RowId) -> Self {
        RowKey { table, row }
    }
}

/// One modification record in a chain.
#[derive(Debug, Clone)]
pub struct RowVersion {
    /// Session that made the modification.
    pub session: SessionId,
    /// What the modification was. Only `Insert`, `Delete` and `Ref` appear
    /// as chain entries.
    pub kind: ActionKind,
    /// Statement timestamp at which the modification was made.
    pub action_timestamp: Timestamp,
    /// Commit timestamp; [`UNCOMMITTED`] until the owner commits.
    pub commit_timestamp: Timestamp,
    /// Set when the owner rolled this modification back.
    pub rolled_back: bool,
    /// Set by the first phase of a two-phase commit.
    pub prepared: bool,
    /// Columns the modification touches; `None` means all columns.
    pub changed_columns: Option<ColumnSet>,
}

impl RowVersion {
    fn is_pending(&self) -> bool {
        self.commit_timestamp == UNCOMMITTED && !self.rolled_back
    }

    /// Whether this version settles row existence (insert or delete).
    fn is_determinant(&self) -> bool {
        matches!(self.kind, ActionKind::Insert | ActionKind::Delete)
    }
}

/// Terminal classification of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Versions remain, or the row is live with no pending history.
    Active,
    /// The chain carries no net effect; the arena entry can be dropped.
    NoOp,
    /// The row is permanently deleted; storage may reclaim it.
    DeleteFinal,
}

/// Result of trying to attach a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The version was appended.
    Attached,
    /// Another session blocks the attach. `committed` is true when the
    /// blocker already committed (a stale overwrite under snapshot
    /// isolation); waiting cannot help then and the requester must retry.
    Conflict {
        /// Whether the blocking modification has already committed.
        committed: bool,
    },
}

/// Time-ordered version chain for one row.
#[derive(Debug, Clone)]
pub struct RowChain {
    versions: Vec<RowVersion>,
    state: ChainState,
    /// Whether the row existed before the first version of this chain.
    /// False for chains born from an insert; flipped as committed
    /// determinants are merged away.
    row_preexisting: bool,
}

impl RowChain {
    /// Chain for a row that already exists in storage.
    pub fn for_existing_row() -> Self {
        RowChain {
            versions: Vec::new(),
            state: ChainState::Active,
            row_preexisting: true,
        }
    }

    /// Chain born from an insert by `view`.
    pub fn for_insert(view: &SessionView) -> Self {
        let mut chain = RowChain {
            versions: Vec::new(),
            state: ChainState::Active,
            row_preexisting: false,
        };
        chain.push(view, ActionKind::Insert, None);
        chain
    }

    /// Terminal state of the chain.
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Whether no versions remain.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Number of versions, pruned ones excluded.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether `session` has an uncommitted, live version here.
    pub fn has_pending(&self, session: SessionId) -> bool {
        self.versions
            .iter()
            .any(|v| v.session == session && v.is_pending())
    }

    /// Whether any session other than `session` has an uncommitted, live
    /// version here.
    pub fn has_foreign_pending(&self, session: SessionId) -> bool {
        self.versions
            .iter()
            .any(|v| v.session != session && v.is_pending())
    }

    #[cfg(test)]
    pub(crate) fn push_version_for_test(&mut self, version: RowVersion) {
        self.versions.push(version);
    }

    fn push(&mut self, view: &SessionView, kind: ActionKind, columns: Option<ColumnSet>) {
        self.state = ChainState::Active;
        self.versions.push(RowVersion {
            session: view.id,
            kind,
            action_timestamp: view.action_timestamp,
            commit_timestamp: UNCOMMITTED,
            rolled_back: false,
            prepared: false,
            changed_columns: columns,
        });
    }

    // === Attach ===

    /// Try to append a modification by `view`.
    ///
    /// A DELETE conflicts with any pending version of another session,
    /// whatever it touches: row death is a whole-row event. A REF conflicts
    /// only with a pending DELETE of another session whose column mask
    /// overlaps the referenced columns (`None` meaning all columns). Pending
    /// versions of the *same* session never conflict.
    ///
    /// Under snapshot isolation a DELETE also conflicts with a delete that
    /// another session committed after `view.transaction_timestamp`; that is
    /// reported with `committed: true` since waiting cannot resolve it.
    ///
    /// On conflict the blocking session ids are added to `conflicts` and the
    /// chain is left unchanged; the strategy decides wait versus abort.
    pub fn attach(
        &mut self,
        view: &SessionView,
        kind: ActionKind,
        columns: Option<ColumnSet>,
        conflicts: &mut ConflictSet,
    ) -> AttachOutcome {
        debug_assert!(matches!(
            kind,
            ActionKind::Insert | ActionKind::Delete | ActionKind::Ref
        ));

        let mut blocked = false;
        let mut blocked_committed = false;

        for v in &self.versions {
            if v.session == view.id {
                continue;
            }
            match kind {
                ActionKind::Delete => {
                    if v.is_pending() {
                        push_unique(conflicts, v.session);
                        blocked = true;
                    } else if v.kind == ActionKind::Delete
                        && !v.rolled_back
                        && v.commit_timestamp != UNCOMMITTED
                        && view.isolation.uses_snapshot()
                        && v.commit_timestamp > view.transaction_timestamp
                    {
                        // Stale overwrite: the row we are deleting was
                        // already deleted after our snapshot.
                        push_unique(conflicts, v.session);
                        blocked = true;
                        blocked_committed = true;
                    }
                }
                ActionKind::Ref => {
                    if v.is_pending()
                        && v.kind == ActionKind::Delete
                        && masks_overlap(columns.as_ref(), v.changed_columns.as_ref())
                    {
                        push_unique(conflicts, v.session);
                        blocked = true;
                    }
                }
                _ => {}
            }
        }

        if blocked {
            return AttachOutcome::Conflict {
                committed: blocked_committed,
            };
        }

        self.push(view, kind, columns);
        AttachOutcome::Attached
    }

    // === Visibility ===

    /// Whether the row is visible to `view`.
    ///
    /// Walks the chain earliest to latest and keeps the last applicable
    /// insert or delete: versions of the calling session always apply;
    /// versions of other sessions apply when committed at or below the
    /// session's visibility threshold. With no applicable determinant the
    /// row is visible iff it pre-existed the chain.
    pub fn can_read(&self, view: &SessionView) -> bool {
        let threshold = view
            .isolation
            .read_threshold(view.action_timestamp, view.transaction_timestamp);

        let mut visible = self.row_preexisting;
        for v in &self.versions {
            if v.rolled_back || !v.is_determinant() {
                continue;
            }
            let applies = if v.session == view.id {
                true
            } else {
                v.commit_timestamp != UNCOMMITTED && v.commit_timestamp <= threshold
            };
            if applies {
                visible = v.kind == ActionKind::Insert;
            }
        }
        visible
    }

    // === Commit ===

    /// Whether `session` may commit its versions of this chain.
    ///
    /// Under two-phase locking the locks already guarantee it. Under MVCC
    /// the chain is checked for a delete that another session committed
    /// after `snapshot_ts`: committing on top of it would silently overwrite
    /// a row the transaction never saw die, so the commit must fail and the
    /// transaction retry. Conflicting writers are reported through
    /// `conflicts`.
    ///
    /// Versions already marked by [`prepare`] pass without revalidation: the
    /// first phase of a two-phase commit settled the verdict, and the second
    /// phase must stand by it.
    ///
    /// [`prepare`]: RowChain::prepare
    pub fn can_commit(
        &self,
        session: SessionId,
        snapshot_ts: Timestamp,
        mvcc: bool,
        conflicts: &mut ConflictSet,
    ) -> bool {
        if !mvcc {
            return true;
        }
        if self
            .versions
            .iter()
            .any(|v| v.session == session && v.is_pending() && v.prepared)
        {
            return true;
        }
        let mut ok = true;
        for v in &self.versions {
            if v.session != session
                && v.kind == ActionKind::Delete
                && !v.rolled_back
                && v.commit_timestamp != UNCOMMITTED
                && v.commit_timestamp > snapshot_ts
            {
                push_unique(conflicts, v.session);
                ok = false;
            }
        }
        ok
    }

    /// Sessions holding a pending REF here that would observe a delete by
    /// `session` commit under them. Used at commit time to abort readers
    /// whose integrity checks the delete invalidates; only references whose
    /// column mask overlaps the delete's count.
    pub fn pending_ref_holders(&self, session: SessionId, conflicts: &mut ConflictSet) {
        for d in &self.versions {
            if d.session != session || !d.is_pending() || d.kind != ActionKind::Delete {
                continue;
            }
            for v in &self.versions {
                if v.session != session
                    && v.is_pending()
                    && v.kind == ActionKind::Ref
                    && masks_overlap(d.changed_columns.as_ref(), v.changed_columns.as_ref())
                {
                    push_unique(conflicts, v.session);
                }
            }
        }
    }

    /// Stamp every pending version of `session` with `commit_ts` and return
    /// the aggregate effect: `Insert`, `Delete`, `InsertDelete` (the row was
    /// born and died in one transaction, storage may reclaim it) or `None`
    /// (references only).
    pub fn commit(&mut self, session: SessionId, commit_ts: Timestamp) -> ActionKind {
        let mut saw_insert = false;
        let mut saw_delete = false;
        for v in &mut self.versions {
            if v.session == session && v.is_pending() {
                v.commit_timestamp = commit_ts;
                v.prepared = false;
                match v.kind {
                    ActionKind::Insert => saw_insert = true,
                    ActionKind::Delete => saw_delete = true,
                    _ => {}
                }
            }
        }
        match (saw_insert, saw_delete) {
            (true, true) => ActionKind::InsertDelete,
            (true, false) => ActionKind::Insert,
            (false, true) => ActionKind::Delete,
            (false, false) => ActionKind::None,
        }
    }

    /// Mark every pending version of `session` as prepared.
    pub fn prepare(&mut self, session: SessionId) {
        for v in &mut self.versions {
            if v.session == session && v.is_pending() {
                v.prepared = true;
            }
        }
    }

    // === Rollback ===

    /// Roll back the versions `session` attached at or after `from_ts` and
    /// prune them. Returns the net effect that was undone (`Insert`,
    /// `Delete`, `InsertDelete` or `None`); the manager uses it to decide
    /// whether storage must reinstate or reclaim the row.
    pub fn rollback(&mut self, session: SessionId, from_ts: Timestamp) -> ActionKind {
        let mut saw_insert = false;
        let mut saw_delete = false;
        for v in &mut self.versions {
            if v.session == session && v.is_pending() && v.action_timestamp >= from_ts {
                v.rolled_back = true;
                match v.kind {
                    ActionKind::Insert => saw_insert = true,
                    ActionKind::Delete => saw_delete = true,
                    _ => {}
                }
            }
        }
        self.versions.retain(|v| !v.rolled_back);
        if self.versions.is_empty() && !self.row_preexisting {
            // The insert that created the chain is gone; nothing happened.
            self.state = ChainState::NoOp;
        }
        match (saw_insert, saw_delete) {
            (true, true) => ActionKind::InsertDelete,
            (true, false) => ActionKind::Insert,
            (false, true) => ActionKind::Delete,
            (false, false) => ActionKind::None,
        }
    }

    // === Merge ===

    /// Prune versions no live snapshot can distinguish: references whose
    /// owner has finished, and inserts/deletes committed at or below
    /// `oldest_live`. When the chain empties, the last pruned committed
    /// determinant decides the terminal state: a delete leaves
    /// [`ChainState::DeleteFinal`], anything else [`ChainState::NoOp`] with
    /// the row kept if an insert committed.
    pub fn merge_to_timestamp(&mut self, oldest_live: Timestamp) -> ChainState {
        let mut kept = Vec::with_capacity(self.versions.len());
        let mut last_pruned_determinant: Option<ActionKind> = None;

        for v in self.versions.drain(..) {
            let prune = if v.rolled_back {
                true
            } else if v.kind == ActionKind::Ref {
                // References carry no row state; they expire as soon as the
                // owning transaction has finished.
                v.commit_timestamp != UNCOMMITTED
            } else {
                v.commit_timestamp != UNCOMMITTED && v.commit_timestamp <= oldest_live
            };
            if prune {
                if !v.rolled_back && v.is_determinant() && v.commit_timestamp != UNCOMMITTED {
                    last_pruned_determinant = Some(v.kind);
                    // The merged history becomes the row's baseline.
                    self.row_preexisting = v.kind == ActionKind::Insert;
                }
            } else {
                kept.push(v);
            }
        }
        self.versions = kept;

        if self.versions.is_empty() {
            self.state = match last_pruned_determinant {
                Some(ActionKind::Delete) => ChainState::DeleteFinal,
                _ if !self.row_preexisting => ChainState::NoOp,
                _ => ChainState::Active,
            };
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versa_core::{IsolationLevel, RowId, TableId};

    fn view(id: u64, isolation: IsolationLevel, action_ts: Timestamp, txn_ts: Timestamp) -> SessionView {
        SessionView {
            id: SessionId(id),
            isolation,
            action_timestamp: action_ts,
            transaction_timestamp: txn_ts,
        }
    }

    fn rc(id: u64, ts: Timestamp) -> SessionView {
        view(id, IsolationLevel::ReadCommitted, ts, ts)
    }

    fn rr(id: u64, ts: Timestamp) -> SessionView {
        view(id, IsolationLevel::RepeatableRead, ts, ts)
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(
            RowKey::new(TableId(1), RowId(2)),
            RowKey::new(TableId(1), RowId(2))
        );
        assert_ne!(
            RowKey::new(TableId(1), RowId(2)),
            RowKey::new(TableId(1), RowId(3))
        );
    }

    // === Attach conflicts ===

    #[test]
    fn test_delete_conflicts_with_pending_delete() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        assert_eq!(
            chain.attach(&writer, ActionKind::Delete, None, &mut set),
            AttachOutcome::Attached
        );

        let other = rc(2, 11);
        let outcome = chain.attach(&other, ActionKind::Delete, None, &mut set);
        assert_eq!(outcome, AttachOutcome::Conflict { committed: false });
        assert_eq!(set.as_slice(), &[SessionId(1)]);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_delete_conflicts_with_pending_ref() {
        // Row death is whole-row; even a narrow reference blocks it.
        let reader = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&reader, ActionKind::Ref, Some(ColumnSet::of(&[3])), &mut set);

        let writer = rc(2, 11);
        assert_eq!(
            chain.attach(&writer, ActionKind::Delete, None, &mut set),
            AttachOutcome::Conflict { committed: false }
        );
    }

    #[test]
    fn test_same_session_reattach_always_succeeds() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_insert(&s);
        let mut set = ConflictSet::new();
        assert_eq!(
            chain.attach(&s, ActionKind::Delete, None, &mut set),
            AttachOutcome::Attached
        );
        assert!(set.is_empty());
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_ref_conflicts_with_pending_delete_on_overlap() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, Some(ColumnSet::of(&[1, 2])), &mut set);

        let reader = rc(2, 11);
        assert_eq!(
            chain.attach(&reader, ActionKind::Ref, Some(ColumnSet::of(&[2])), &mut set),
            AttachOutcome::Conflict { committed: false }
        );
    }

    #[test]
    fn test_ref_passes_pending_delete_without_overlap() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, Some(ColumnSet::of(&[1])), &mut set);

        let reader = rc(2, 11);
        assert_eq!(
            chain.attach(&reader, ActionKind::Ref, Some(ColumnSet::of(&[5])), &mut set),
            AttachOutcome::Attached
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_ref_null_mask_means_all_columns() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, Some(ColumnSet::of(&[9])), &mut set);

        let reader = rc(2, 11);
        assert_eq!(
            chain.attach(&reader, ActionKind::Ref, None, &mut set),
            AttachOutcome::Conflict { committed: false }
        );
    }

    #[test]
    fn test_ref_ignores_committed_delete() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, None, &mut set);
        chain.commit(SessionId(1), 12);

        let reader = rc(2, 13);
        assert_eq!(
            chain.attach(&reader, ActionKind::Ref, None, &mut set),
            AttachOutcome::Attached
        );
    }

    #[test]
    fn test_delete_over_post_snapshot_committed_delete_is_fatal_conflict() {
        let writer = rr(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, None, &mut set);
        chain.commit(SessionId(1), 20);

        // Snapshot taken before the delete committed.
        let late = rr(2, 15);
        assert_eq!(
            chain.attach(&late, ActionKind::Delete, None, &mut set),
            AttachOutcome::Conflict { committed: true }
        );

        // A snapshot taken after sees the delete and never gets here in
        // practice, but the attach itself is not blocked.
        let fresh = rr(3, 25);
        assert_eq!(
            chain.attach(&fresh, ActionKind::Delete, None, &mut set),
            AttachOutcome::Attached
        );
    }

    // === Visibility ===

    #[test]
    fn test_own_uncommitted_insert_visible_only_to_owner() {
        let writer = rc(1, 10);
        let chain = RowChain::for_insert(&writer);
        assert!(chain.can_read(&writer));
        assert!(!chain.can_read(&rc(2, 11)));
    }

    #[test]
    fn test_read_committed_sees_commit_at_next_statement() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_insert(&writer);
        chain.commit(SessionId(1), 12);

        // Statement older than the commit: invisible.
        assert!(!chain.can_read(&rc(2, 11)));
        // Statement at or after the commit: visible.
        assert!(chain.can_read(&rc(2, 12)));
        assert!(chain.can_read(&rc(2, 30)));
    }

    #[test]
    fn test_repeatable_read_pins_to_snapshot() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_insert(&writer);
        chain.commit(SessionId(1), 12);

        // Snapshot before the commit stays blind even as statements advance.
        let pinned = view(2, IsolationLevel::RepeatableRead, 30, 11);
        assert!(!chain.can_read(&pinned));

        let fresh = rr(3, 12);
        assert!(chain.can_read(&fresh));
    }

    #[test]
    fn test_read_uncommitted_sees_any_commit() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_insert(&writer);
        chain.commit(SessionId(1), 50);
        assert!(chain.can_read(&view(2, IsolationLevel::ReadUncommitted, 1, 1)));
    }

    #[test]
    fn test_delete_hides_row_from_later_readers() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, None, &mut set);

        // Pending delete: still visible to others, gone for the owner.
        assert!(chain.can_read(&rc(2, 11)));
        assert!(!chain.can_read(&writer));

        chain.commit(SessionId(1), 12);
        assert!(!chain.can_read(&rc(2, 12)));
        // A snapshot from before the delete still sees the row.
        assert!(chain.can_read(&rr(3, 11)));
    }

    #[test]
    fn test_refs_do_not_affect_visibility() {
        let reader = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&reader, ActionKind::Ref, None, &mut set);
        assert!(chain.can_read(&rc(2, 11)));
        assert!(chain.can_read(&reader));
    }

    // === Commit validation ===

    #[test]
    fn test_can_commit_always_true_under_locks() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, None, &mut set);
        chain.commit(SessionId(1), 20);
        assert!(chain.can_commit(SessionId(2), 5, false, &mut set));
    }

    #[test]
    fn test_can_commit_rejects_post_snapshot_delete() {
        let writer = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&writer, ActionKind::Delete, None, &mut set);
        chain.commit(SessionId(1), 20);

        assert!(!chain.can_commit(SessionId(2), 15, true, &mut set));
        assert_eq!(set.as_slice(), &[SessionId(1)]);

        set.clear();
        assert!(chain.can_commit(SessionId(2), 20, true, &mut set));
    }

    #[test]
    fn test_prepared_versions_pass_without_revalidation() {
        // A reference prepared in phase one, then a foreign delete commits
        // under it through the attach/commit race. The phase-one verdict
        // stands; a plain commit would still fail.
        let referer = rr(2, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&referer, ActionKind::Ref, Some(ColumnSet::of(&[1])), &mut set);
        chain.push_version_for_test(RowVersion {
            session: SessionId(1),
            kind: ActionKind::Delete,
            action_timestamp: 12,
            commit_timestamp: 20,
            rolled_back: false,
            prepared: false,
            changed_columns: Some(ColumnSet::of(&[5])),
        });

        assert!(!chain.can_commit(SessionId(2), 10, true, &mut set));

        chain.prepare(SessionId(2));
        assert!(chain.can_commit(SessionId(2), 10, true, &mut set));

        // Commit clears the mark.
        chain.commit(SessionId(2), 25);
        assert!(!chain.has_pending(SessionId(2)));
    }

    #[test]
    fn test_pending_ref_holders_reported_for_deleter() {
        // A reference can slip in between the delete's attach and its
        // commit; build that interleaving directly.
        let deleter = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&deleter, ActionKind::Delete, Some(ColumnSet::of(&[0, 4])), &mut set);
        chain.push_version_for_test(RowVersion {
            session: SessionId(2),
            kind: ActionKind::Ref,
            action_timestamp: 11,
            commit_timestamp: UNCOMMITTED,
            rolled_back: false,
            prepared: false,
            changed_columns: Some(ColumnSet::of(&[4])),
        });
        // A non-overlapping reference attaches normally.
        chain.attach(&rc(3, 12), ActionKind::Ref, Some(ColumnSet::of(&[7])), &mut set);

        // Only the overlapping reference is reported.
        let mut holders = ConflictSet::new();
        chain.pending_ref_holders(SessionId(1), &mut holders);
        assert_eq!(holders.as_slice(), &[SessionId(2)]);

        // Not deleting: nothing reported.
        let mut none = ConflictSet::new();
        chain.pending_ref_holders(SessionId(2), &mut none);
        assert!(none.is_empty());
    }

    // === Commit stamping ===

    #[test]
    fn test_commit_aggregate_effects() {
        let s = rc(1, 10);
        let mut set = ConflictSet::new();

        let mut insert = RowChain::for_insert(&s);
        assert_eq!(insert.commit(SessionId(1), 20), ActionKind::Insert);

        let mut delete = RowChain::for_existing_row();
        delete.attach(&s, ActionKind::Delete, None, &mut set);
        assert_eq!(delete.commit(SessionId(1), 20), ActionKind::Delete);

        let mut both = RowChain::for_insert(&s);
        both.attach(&s, ActionKind::Delete, None, &mut set);
        assert_eq!(both.commit(SessionId(1), 20), ActionKind::InsertDelete);

        let mut reference = RowChain::for_existing_row();
        reference.attach(&s, ActionKind::Ref, None, &mut set);
        assert_eq!(reference.commit(SessionId(1), 20), ActionKind::None);
    }

    // === Rollback ===

    #[test]
    fn test_rollback_insert_leaves_noop_chain() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_insert(&s);
        assert_eq!(chain.rollback(SessionId(1), 0), ActionKind::Insert);
        assert!(chain.is_empty());
        assert_eq!(chain.state(), ChainState::NoOp);
        // No trace for anyone.
        assert!(!chain.can_read(&rc(2, 11)));
    }

    #[test]
    fn test_rollback_delete_reinstates_row() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&s, ActionKind::Delete, None, &mut set);
        assert!(!chain.can_read(&s));

        assert_eq!(chain.rollback(SessionId(1), 0), ActionKind::Delete);
        assert!(chain.can_read(&s));
        assert!(chain.can_read(&rc(2, 11)));
        assert_eq!(chain.state(), ChainState::Active);
    }

    #[test]
    fn test_partial_rollback_respects_timestamp() {
        let mut chain = RowChain::for_insert(&rc(1, 10));
        let mut set = ConflictSet::new();
        chain.attach(&rc(1, 15), ActionKind::Delete, None, &mut set);

        // Only the later delete is undone.
        assert_eq!(chain.rollback(SessionId(1), 12), ActionKind::Delete);
        assert_eq!(chain.len(), 1);
        assert!(chain.can_read(&rc(1, 16)));
    }

    // === Merge ===

    #[test]
    fn test_merge_committed_insert_keeps_row() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_insert(&s);
        chain.commit(SessionId(1), 20);
        assert_eq!(chain.merge_to_timestamp(20), ChainState::Active);
        assert!(chain.is_empty());
        // The insert became the baseline.
        assert!(chain.can_read(&rc(2, 21)));
    }

    #[test]
    fn test_merge_committed_delete_is_final() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&s, ActionKind::Delete, None, &mut set);
        chain.commit(SessionId(1), 20);
        assert_eq!(chain.merge_to_timestamp(20), ChainState::DeleteFinal);
    }

    #[test]
    fn test_merge_insert_delete_same_transaction_is_final() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_insert(&s);
        let mut set = ConflictSet::new();
        chain.attach(&s, ActionKind::Delete, None, &mut set);
        chain.commit(SessionId(1), 20);
        assert_eq!(chain.merge_to_timestamp(20), ChainState::DeleteFinal);
    }

    #[test]
    fn test_merge_rolled_back_insert_is_noop() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_insert(&s);
        chain.rollback(SessionId(1), 0);
        assert_eq!(chain.merge_to_timestamp(20), ChainState::NoOp);
    }

    #[test]
    fn test_merge_respects_live_snapshot_boundary() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_insert(&s);
        chain.commit(SessionId(1), 20);
        // Oldest live snapshot predates the commit: nothing is pruned.
        assert_eq!(chain.merge_to_timestamp(15), ChainState::Active);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.merge_to_timestamp(20), ChainState::Active);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_merge_expires_finished_refs_unconditionally() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&s, ActionKind::Ref, None, &mut set);
        chain.commit(SessionId(1), 30);

        // Boundary far below the ref's commit; it is pruned anyway.
        assert_eq!(chain.merge_to_timestamp(5), ChainState::Active);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_merge_keeps_pending_refs() {
        let s = rc(1, 10);
        let mut chain = RowChain::for_existing_row();
        let mut set = ConflictSet::new();
        chain.attach(&s, ActionKind::Ref, None, &mut set);
        chain.merge_to_timestamp(Timestamp::MAX);
        assert_eq!(chain.len(), 1);
    }
}
