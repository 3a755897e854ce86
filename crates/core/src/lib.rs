//! Shared types for the versa transaction core
//!
//! This crate defines the identifiers, timestamps, isolation levels, column
//! bitmaps and error taxonomy used by the concurrency layer. It has no
//! behavior of its own; everything here is plain data.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    masks_overlap, AccessMode, ActionKind, ColumnSet, IsolationLevel, RowId, SessionId, TableId,
    Timestamp, UNCOMMITTED,
};
