//! RocksDB-backed row store.
//!
//! Column families:
//! - `rows`: one entry per row, LZ4-compressed bincode
//!
//! Key format: `<schema.table> 0x00 <sequence:8 bytes big-endian>`. All rows
//! of a table share the prefix, so lookups are a bounded prefix scan. The
//! sequence is global and recovered on open from the highest key suffix.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};

use super::{
    check_conflict_columns, conflict_columns, project, same_key, Filter, Row, RowStore, StoreError,
    StoreResponse, TableRef,
};

const CF_ROWS: &str = "rows";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable [`RowStore`] on RocksDB.
///
/// Upserts are serialized through a write lock so the read-match-write
/// sequence cannot interleave between two writers of the same table.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    sequence: AtomicU64,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf = ColumnFamilyDescriptor::new(CF_ROWS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![cf],
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::debug!(
            "opened row store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    /// Highest stored sequence + 1, or 0 for an empty store.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let Some(cf) = db.cf_handle(CF_ROWS) else {
            return Ok(0);
        };
        let mut next = 0;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = key_sequence(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Next sequence number to be assigned.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Force a memtable flush.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Rows ─────────────────────────────────────────────────────────

    /// Every `(key, row)` of a table, in sequence order.
    pub fn scan(&self, table: &TableRef) -> Result<Vec<(Vec<u8>, Row)>, StoreError> {
        let cf = self.cf()?;
        let prefix = table_prefix(table);
        let mut rows = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push((key.to_vec(), decode_row(&value)?));
        }
        Ok(rows)
    }

    fn put_row(&self, key: &[u8], row: &Row) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key, encode_row(row)?, &write_opts)?;
        Ok(())
    }

    fn cf(&self) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_ROWS)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_ROWS}' not found")))
    }
}

#[async_trait]
impl RowStore for RocksStore {
    async fn upsert(
        &self,
        table: &TableRef,
        row: Row,
        on_conflict: Option<&str>,
    ) -> Result<StoreResponse, StoreError> {
        let columns = conflict_columns(on_conflict);
        check_conflict_columns(&row, &columns)?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let existing = self
            .scan(table)?
            .into_iter()
            .find(|(_, existing)| same_key(existing, &row, &columns));

        match existing {
            Some((key, mut merged)) => {
                merged.extend(row);
                self.put_row(&key, &merged)?;
                Ok(StoreResponse::OK)
            }
            None => {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                self.put_row(&row_key(table, seq), &row)?;
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
        let matches: Vec<Row> = self
            .scan(table)?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| filter.matches(row))
            .collect();

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

fn table_prefix(table: &TableRef) -> Vec<u8> {
    let mut prefix = table.qualified().into_bytes();
    prefix.push(0);
    prefix
}

fn row_key(table: &TableRef, seq: u64) -> Vec<u8> {
    let mut key = table_prefix(table);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn key_sequence(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8).map(|start| &key[start..])?;
    let buf: [u8; 8] = tail.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

fn encode_row(row: &Row) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_row(value: &[u8]) -> Result<Row, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(value)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (row, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn doc_row(name: &str, content: &str) -> Row {
        Row::from([
            ("name".to_string(), name.to_string()),
            ("content".to_string(), content.to_string()),
        ])
    }

    fn documents() -> TableRef {
        TableRef::new("public", "documents")
    }

    #[tokio::test]
    async fn test_upsert_created_then_ok() {
        let (_dir, store) = open_temp();
        let created = store
            .upsert(&documents(), doc_row("doc-1", "AAA="), Some("name"))
            .await
            .unwrap();
        assert_eq!(created.status, 201);

        let updated = store
            .upsert(&documents(), doc_row("doc-1", "AQI="), Some("name"))
            .await
            .unwrap();
        assert_eq!(updated.status, 200);

        let rows = store.scan(&documents()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get("content").map(String::as_str), Some("AQI="));
    }

    #[tokio::test]
    async fn test_select_one_projects_column() {
        let (_dir, store) = open_temp();
        store
            .upsert(&documents(), doc_row("doc-1", "payload"), Some("name"))
            .await
            .unwrap();

        let row = store
            .select_one(&documents(), "content", &Filter::eq("name", "doc-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, Row::from([("content".to_string(), "payload".to_string())]));

        let missing = store
            .select_one(&documents(), "content", &Filter::eq("name", "doc-2"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_table_prefixes_do_not_overlap() {
        let (_dir, store) = open_temp();
        let docs = TableRef::new("public", "doc");
        let documents = documents();
        store.upsert(&docs, doc_row("a", "1"), Some("name")).await.unwrap();
        store.upsert(&documents, doc_row("a", "2"), Some("name")).await.unwrap();

        assert_eq!(store.scan(&docs).unwrap().len(), 1);
        assert_eq!(store.scan(&documents).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_rows_rejected() {
        let (_dir, store) = open_temp();
        store.upsert(&documents(), doc_row("dup", "1"), None).await.unwrap();
        store.upsert(&documents(), doc_row("dup", "2"), None).await.unwrap();

        let result = store
            .select_one(&documents(), "content", &Filter::eq("name", "dup"))
            .await;
        assert!(matches!(result, Err(StoreError::MultipleRows { count: 2, .. })));
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());

        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.upsert(&documents(), doc_row("a", "1"), Some("name")).await.unwrap();
            store.upsert(&documents(), doc_row("b", "2"), Some("name")).await.unwrap();
            assert_eq!(store.sequence(), 2);
        }

        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.sequence(), 2);
        let row = store
            .select_one(&documents(), "content", &Filter::eq("name", "b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("content").map(String::as_str), Some("2"));

        let status = store
            .upsert(&documents(), doc_row("c", "3"), Some("name"))
            .await
            .unwrap();
        assert_eq!(status, StoreResponse::CREATED);
        assert_eq!(store.sequence(), 3);
    }

    #[test]
    fn test_row_encoding_compresses_large_content() {
        let content = "AQID".repeat(10_000);
        let row = doc_row("big", &content);
        let encoded = encode_row(&row).unwrap();
        assert!(encoded.len() < content.len() / 4);
        assert_eq!(decode_row(&encoded).unwrap(), row);
    }

    #[test]
    fn test_key_sequence_roundtrip() {
        let key = row_key(&documents(), 42);
        assert!(key.starts_with(b"public.documents\0"));
        assert_eq!(key_sequence(&key), Some(42));
        assert_eq!(key_sequence(b"short"), None);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
