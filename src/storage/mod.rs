//! Relational store collaborator
//!
//! The loader only needs four primitives: begin, bulk-insert a lazy row
//! sequence into a named relation, commit, rollback. `SqliteStore` is the
//! production implementation.

pub mod sqlite;

use anyhow::Result;
pub use rusqlite::types::Value;

pub use sqlite::SqliteStore;

/// A lazy, finite, non-restartable sequence of row-value tuples.
pub type RowSource<'a> = &'a mut dyn Iterator<Item = Vec<Value>>;

pub trait BulkStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn BulkTransaction + '_>>;
}

/// An open transaction. Dropping it without `commit` rolls back.
pub trait BulkTransaction {
    /// Streams every row from `rows` into `table` and returns the number of
    /// rows accepted.
    fn copy_in(&mut self, table: &str, columns: &[&str], rows: RowSource<'_>) -> Result<u64>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}
