//! Row-oriented storage collaborator.
//!
//! Documents are stored as rows addressed by `(schema.table, conflict
//! columns)`:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ public.documents                             │
//! ├──────────────┬───────────────────────────────┤
//! │ name (key)   │ content (base64 yrs state)    │
//! ├──────────────┼───────────────────────────────┤
//! │ "doc-1"      │ "AQLM2v…"                      │
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! Upserts replace the row whose conflict columns match, or insert a new
//! row (201). `select_one` behaves like a single-row query: zero rows is
//! `Ok(None)`, more than one is an error.
//!
//! Backends:
//! - [`MemoryStore`]: in-process map, for tests and embedding
//! - [`RocksStore`]: RocksDB, LZ4-compressed bincode rows

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// A row: column name → text value.
pub type Row = BTreeMap<String, String>;

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `schema.table`, or just `table` with an empty schema.
    pub fn qualified(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// Equality filter for single-row lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column) == Some(&self.value)
    }
}

/// Acknowledgement of a write, HTTP-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreResponse {
    pub status: u16,
}

impl StoreResponse {
    pub const OK: StoreResponse = StoreResponse { status: 200 };
    pub const CREATED: StoreResponse = StoreResponse { status: 201 };

    /// Created or updated.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend failure (unreachable, I/O, RocksDB)
    #[error("database error: {0}")]
    Database(String),
    /// Row lacks a column the operation needs
    #[error("row is missing column `{0}`")]
    MissingColumn(String),
    /// Single-row query matched several rows
    #[error("expected a single row in {table}, found {count}")]
    MultipleRows { table: String, count: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Row store addressed by table and row key.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert `row`, or replace the row whose `on_conflict` columns match.
    ///
    /// `on_conflict` is a comma-separated column list; `None` always inserts.
    async fn upsert(
        &self,
        table: &TableRef,
        row: Row,
        on_conflict: Option<&str>,
    ) -> Result<StoreResponse, StoreError>;

    /// Fetch `column` of the single row matching `filter`.
    async fn select_one(
        &self,
        table: &TableRef,
        column: &str,
        filter: &Filter,
    ) -> Result<Option<Row>, StoreError>;
}

/// Split a conflict target into column names.
pub(crate) fn conflict_columns(on_conflict: Option<&str>) -> Vec<&str> {
    on_conflict
        .map(|target| {
            target.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Whether `existing` collides with `row` on every conflict column.
pub(crate) fn same_key(existing: &Row, row: &Row, columns: &[&str]) -> bool {
    !columns.is_empty() && columns.iter().all(|c| existing.get(*c) == row.get(*c))
}

/// Ensure the row carries every conflict column.
pub(crate) fn check_conflict_columns(row: &Row, columns: &[&str]) -> Result<(), StoreError> {
    match columns.iter().find(|c| !row.contains_key(**c)) {
        Some(missing) => Err(StoreError::MissingColumn((*missing).to_string())),
        None => Ok(()),
    }
}

/// Keep only `column` (plus nothing else) from a selected row.
pub(crate) fn project(row: &Row, column: &str) -> Row {
    row.iter()
        .filter(|(k, _)| k.as_str() == column)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
