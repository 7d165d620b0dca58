//! In-memory row store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    check_conflict_columns, conflict_columns, project, same_key, Filter, Row, RowStore, StoreError,
    StoreResponse, TableRef,
};

/// Row store held entirely in memory. Cheap to create per test.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<TableRef, Vec<Row>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row of a table, in insertion order.
    pub async fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &TableRef) -> usize {
        self.tables.read().await.get(table).map_or(0, Vec::len)
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn upsert(
        &self,
        table: &TableRef,
        row: Row,
        on_conflict: Option<&str>,
    ) -> Result<StoreResponse, StoreError> {
        let columns = conflict_columns(on_conflict);
        check_conflict_columns(&row, &columns)?;

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.clone()).or_default();
        match rows.iter_mut().find(|existing| same_key(existing, &row, &columns)) {
            Some(existing) => {
                existing.extend(row);
                Ok(StoreResponse::OK)
            }
            None => {
                rows.push(row);
                Ok(StoreResponse::CREATED)
            }
        }
    }

    async fn select_one(
        &self,
        table: &TableRef,
        column: &str,
        filter: &Filter,
    ) -> Result<Option<Row>, StoreError> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(table) else {
            return Ok(None);
        };
        let matches: Vec<&Row> = rows.iter().filter(|r| filter.matches(r)).collect();
        match matches.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(project(single, column))),
            many => Err(StoreError::MultipleRows {
                table: table.qualified(),
                count: many.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_row(name: &str, content: &str) -> Row {
        Row::from([
            ("name".to_string(), name.to_string()),
            ("content".to_string(), content.to_string()),
        ])
    }

    fn table() -> TableRef {
        TableRef::new("public", "documents")
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = MemoryStore::new();
        let first = store.upsert(&table(), doc_row("doc-1", "a"), Some("name")).await.unwrap();
        assert_eq!(first, StoreResponse::CREATED);

        let second = store.upsert(&table(), doc_row("doc-1", "b"), Some("name")).await.unwrap();
        assert_eq!(second, StoreResponse::OK);
        assert_eq!(store.row_count(&table()).await, 1);

        let row = store
            .select_one(&table(), "content", &Filter::eq("name", "doc-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("content").map(String::as_str), Some("b"));
        assert!(row.get("name").is_none());
    }

    #[tokio::test]
    async fn test_select_missing_row_is_none() {
        let store = MemoryStore::new();
        let found = store
            .select_one(&table(), "content", &Filter::eq("name", "nope"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_insert_without_conflict_target_duplicates() {
        let store = MemoryStore::new();
        store.upsert(&table(), doc_row("doc-1", "a"), None).await.unwrap();
        store.upsert(&table(), doc_row("doc-1", "b"), None).await.unwrap();

        let result = store
            .select_one(&table(), "content", &Filter::eq("name", "doc-1"))
            .await;
        assert!(matches!(result, Err(StoreError::MultipleRows { count: 2, .. })));
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let store = MemoryStore::new();
        let other = TableRef::new("public", "drafts");
        store.upsert(&table(), doc_row("doc-1", "a"), Some("name")).await.unwrap();
        assert_eq!(store.row_count(&other).await, 0);
        assert_eq!(store.rows(&table()).await, vec![doc_row("doc-1", "a")]);
    }
}
