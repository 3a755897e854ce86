//! Identifiers, timestamps and bitmaps shared across the transaction core
//!
//! The surrounding statement-execution layer addresses everything by stable
//! ids: a table id, a row id and a session id. The transaction core never
//! interprets row contents; column-level granularity is expressed through
//! [`ColumnSet`] change bitmaps.

use serde::{Deserialize, Serialize};

/// Stable identifier of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

/// Stable identifier of a logical row within a table.
///
/// Row ids are assigned by the storage layer and never reused while a
/// version chain for the row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

/// Stable identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Global change number.
///
/// A single monotonically increasing counter doubles as both the commit
/// ordering key and the visibility threshold for reads. The value 0 is
/// reserved: a version with `commit_timestamp == 0` is uncommitted.
pub type Timestamp = u64;

/// Reserved commit timestamp meaning "not committed yet".
pub const UNCOMMITTED: Timestamp = 0;

/// SQL isolation level of a session.
///
/// The level determines the visibility threshold used when walking a row
/// version chain: which committed versions of other sessions a read may
/// observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Dirty reads allowed: every version is visible once present.
    ReadUncommitted,
    /// Versions committed at or before the current statement are visible.
    ReadCommitted,
    /// Versions committed at or before the transaction snapshot are visible.
    RepeatableRead,
    /// Same visibility as repeatable read; conflicts abort at commit.
    Serializable,
}

impl IsolationLevel {
    /// Visibility threshold for reads by a session at this level.
    ///
    /// A version from another session is visible when its commit timestamp
    /// is non-zero and at or below the returned threshold.
    pub fn read_threshold(self, action_timestamp: Timestamp, transaction_timestamp: Timestamp) -> Timestamp {
        match self {
            IsolationLevel::ReadUncommitted => Timestamp::MAX,
            IsolationLevel::ReadCommitted => action_timestamp,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => transaction_timestamp,
        }
    }

    /// Whether the level pins reads to the transaction snapshot.
    pub fn uses_snapshot(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

/// Purpose of a visibility probe against a row version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Plain read.
    Read,
    /// Update-conflict probe before modifying the row.
    Update,
    /// Reference-integrity probe (foreign key check).
    Ref,
}

/// Kind of a row modification, and the aggregate states a chain can report.
///
/// `Insert`, `Delete` and `Ref` appear as individual versions in a chain.
/// `InsertDelete` is an aggregate commit effect: the row was born and died
/// inside one transaction, so storage may reclaim it physically.
/// `DeleteFinal` marks a chain that has merged down to a committed delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// No net modification.
    None,
    /// Row inserted.
    Insert,
    /// Row deleted.
    Delete,
    /// Row referenced for integrity purposes; never a net effect.
    Ref,
    /// Row inserted and deleted by the same committed transaction.
    InsertDelete,
    /// Row permanently deleted; the chain is terminal.
    DeleteFinal,
}

/// Column-change bitmap.
///
/// Identifies which columns of a row an operation touches. Stored as packed
/// 64-bit words; tables wider than the allocated set grow the word vector on
/// demand. At call sites an `Option<ColumnSet>` of `None` means "all
/// columns" and overlaps everything (see [`masks_overlap`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSet {
    words: Vec<u64>,
}

impl ColumnSet {
    /// Empty set: touches no columns.
    pub fn new() -> Self {
        ColumnSet { words: Vec::new() }
    }

    /// Set containing the given column indexes.
    pub fn of(columns: &[usize]) -> Self {
        let mut set = ColumnSet::new();
        for &c in columns {
            set.insert(c);
        }
        set
    }

    /// Mark a column as changed.
    pub fn insert(&mut self, column: usize) {
        let word = column / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (column % 64);
    }

    /// Whether a column is in the set.
    pub fn contains(&self, column: usize) -> bool {
        let word = column / 64;
        self.words.get(word).is_some_and(|w| w & (1u64 << (column % 64)) != 0)
    }

    /// Whether the set touches no columns.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Whether two sets share at least one column.
    pub fn overlaps(&self, other: &ColumnSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }
}

/// Overlap test over optional column masks.
///
/// A `None` mask means "all columns": it overlaps any other mask, including
/// another `None`. Two present masks overlap when they share a column.
pub fn masks_overlap(a: Option<&ColumnSet>, b: Option<&ColumnSet>) -> bool {
    match (a, b) {
        (None, _) | (_, None) => true,
        (Some(a), Some(b)) => a.overlaps(b),
    }
}
