//! Persistence bridge between the document and the row store.
//!
//! One row per document: `{name column: name, content column: base64
//! full state}`. Reads happen once per connection; writes happen on every
//! debounced flush that contains local edits, once the connection's read
//! has been merged.

use std::sync::Arc;

use thiserror::Error;

use crate::codec::{decode_payload, encode_payload};
use crate::config::SharedConfig;
use crate::storage::{Filter, Row, RowStore, StoreError, StoreResponse};

/// Persist failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// The store answered with a status other than 200/201
    #[error("document not stored: status {0}")]
    Rejected(u16),
    #[error("document not stored: {0}")]
    Store(#[from] StoreError),
}

/// Reads and writes the document row.
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn RowStore>,
    config: SharedConfig,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn RowStore>, config: SharedConfig) -> Self {
        Self { store, config }
    }

    /// Load the persisted document state, if any.
    ///
    /// Absence and every failure (store error, missing column, bad
    /// encoding) yield `None`; failures are logged.
    pub async fn fetch_initial(&self) -> Option<Vec<u8>> {
        let config = self.config.snapshot();
        let details = &config.database;
        let table = details.table_ref();
        let content_column = details.update_columns.content.as_str();
        let filter = Filter::eq(&details.update_columns.name, &config.name);

        let row = match self.store.select_one(&table, content_column, &filter).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                log::debug!("no stored row for {} in {table}", config.name);
                return None;
            }
            Err(e) => {
                log::warn!("fetching {} from {table} failed: {e}", config.name);
                return None;
            }
        };

        let Some(encoded) = row.get(content_column).filter(|c| !c.is_empty()) else {
            log::warn!("row for {} has no `{content_column}` content", config.name);
            return None;
        };
        match decode_payload(encoded) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("stored content for {} is not valid: {e}", config.name);
                None
            }
        }
    }

    /// Upsert the full document state.
    pub async fn persist(&self, state: &[u8]) -> Result<StoreResponse, PersistError> {
        let config = self.config.snapshot();
        let details = &config.database;
        let row = Row::from([
            (details.update_columns.name.clone(), config.name.clone()),
            (details.update_columns.content.clone(), encode_payload(state)),
        ]);

        let response = self
            .store
            .upsert(&details.table_ref(), row, details.conflict_columns.as_deref())
            .await?;
        if response.is_success() {
            log::debug!("persisted {} ({} bytes, status {})", config.name, state.len(), response.status);
            Ok(response)
        } else {
            Err(PersistError::Rejected(response.status))
        }
    }
}
