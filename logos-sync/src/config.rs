//! Provider configuration.
//!
//! The document name doubles as the broadcast topic and the storage row
//! key. Configuration is shared by reference between the persistence and
//! broadcast bridges through [`SharedConfig`]; replacing it never
//! reconnects an active session.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::TableRef;

/// Default quiescence window for the change batcher.
pub const DEFAULT_QUIESCENCE_MS: u64 = 1000;

/// Columns written on every persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateColumns {
    /// Column holding the document name
    pub name: String,
    /// Column holding the base64 document state
    pub content: String,
}

impl Default for UpdateColumns {
    fn default() -> Self {
        Self {
            name: "name".to_string(),
            content: "content".to_string(),
        }
    }
}

/// Where documents live in the row store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseDetails {
    pub schema: String,
    pub table: String,
    pub update_columns: UpdateColumns,
    /// Comma-separated conflict target for upserts (None = plain insert)
    pub conflict_columns: Option<String>,
}

impl Default for DatabaseDetails {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "documents".to_string(),
            update_columns: UpdateColumns::default(),
            conflict_columns: Some("name".to_string()),
        }
    }
}

impl DatabaseDetails {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }
}

/// Full provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Logical document name (channel topic + row key)
    pub name: String,
    pub database: DatabaseDetails,
    /// Debounce window in milliseconds
    pub quiescence_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            database: DatabaseDetails::default(),
            quiescence_ms: DEFAULT_QUIESCENCE_MS,
        }
    }
}

impl ProviderConfig {
    /// Config for a named document with default storage location.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    /// Check the invariants required before connecting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.database.table.is_empty() {
            return Err(ConfigError::MissingTable);
        }
        if self.database.update_columns.name.is_empty() {
            return Err(ConfigError::MissingColumn("name"));
        }
        if self.database.update_columns.content.is_empty() {
            return Err(ConfigError::MissingColumn("content"));
        }
        Ok(())
    }

    /// Merge a partial update into this configuration.
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(database) = update.database {
            self.database = database;
        }
        if let Some(ms) = update.quiescence_ms {
            self.quiescence_ms = ms;
        }
    }
}

/// Partial configuration for [`ProviderConfig::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub name: Option<String>,
    pub database: Option<DatabaseDetails>,
    pub quiescence_ms: Option<u64>,
}

/// Configuration handle shared by the provider and both bridges.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ProviderConfig>>,
}

impl SharedConfig {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> ProviderConfig {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update(&self, update: ConfigUpdate) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(update);
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("document name must not be empty")]
    EmptyName,
    #[error("storage table must not be empty")]
    MissingTable,
    #[error("{0} column must not be empty")]
    MissingColumn(&'static str),
    #[error("config parse error: {0}")]
    Parse(String),
}
