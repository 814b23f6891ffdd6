//! RocksDB-backed persistent document storage.
//!
//! Column families:
//! - `docs` — one record per document (LZ4 compressed), keyed `collection\0docId`
//! - `meta` — per-collection document counts, keyed by collection name
//!
//! Record layout (bincode, then LZ4 with prepended size):
//! ```text
//! ┌────────┬──────────────┬─────────────┬──────────┬────────────┐
//! │ id     │ state (JSON) │ ops (JSON)  │ version  │ updated_at │
//! └────────┴──────────────┴─────────────┴──────────┴────────────┘
//! ```
//! Document values are arbitrary JSON, so they travel as JSON text inside
//! the bincode frame.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Op, VersionVector};
use tokio::sync::Mutex;

use super::query::{DbQueries, JsonQueries};
use super::{QueryResult, Storage, StoreError, StoredDoc};

/// Column family names.
const CF_DOCS: &str = "docs";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCS, CF_META];

const KEY_SEPARATOR: u8 = 0;

/// RocksDB configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
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

/// On-disk document record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    state: Option<String>,
    ops: String,
    version: String,
    updated_at: u64,
}

impl StoredRecord {
    fn from_doc(doc: &StoredDoc) -> Result<Self, StoreError> {
        let state = match &doc.state {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))?,
            ),
            None => None,
        };
        let ops = serde_json::to_string(&doc.ops)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Ok(Self {
            id: doc.id.clone(),
            state,
            ops,
            version: doc.version.to_string(),
            updated_at,
        })
    }

    fn into_doc(self) -> Result<StoredDoc, StoreError> {
        let state = match self.state {
            Some(text) => Some(
                serde_json::from_str::<Value>(&text)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
            ),
            None => None,
        };
        let ops: Vec<Op> = serde_json::from_str(&self.ops)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let version: VersionVector = self
            .version
            .parse()
            .map_err(|e: tandem_core::VersionParseError| {
                StoreError::DeserializationError(e.to_string())
            })?;
        Ok(StoredDoc {
            id: self.id,
            state,
            ops,
            version,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Database handle and the synchronous record operations on it.
struct RocksDb {
    /// RocksDB instance, single-threaded mode
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    bytes_written: AtomicU64,
}

/// RocksDB-backed storage.
///
/// Provides durable storage with:
/// - LZ4-compressed records
/// - Bloom filters for fast point lookups
/// - Atomic write batches (record + collection count)
/// - Compare-and-set saves serialized by a write lock
///
/// Every database call runs on tokio's blocking pool.
pub struct RocksStorage {
    inner: Arc<RocksDb>,
    /// Serializes read-compare-write in `save_doc`
    write_lock: Mutex<()>,
    queries: JsonQueries,
}

impl RocksStorage {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened RocksDB storage at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksDb {
                db,
                config,
                bytes_written: AtomicU64::new(0),
            }),
            write_lock: Mutex::new(()),
            queries: JsonQueries,
        })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCS => {
                // Records are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksDb) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StoreError::DatabaseError(format!("storage task failed: {e}")))?
    }

    /// Number of documents ever created in a collection.
    pub fn collection_count(&self, collection: &str) -> Result<u64, StoreError> {
        self.inner.collection_count(collection)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner
            .db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Compressed bytes written since open.
    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

impl RocksDb {
    // ─── Reads ────────────────────────────────────────────────────────

    fn load(&self, collection: &str, doc_id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let cf = self.cf(CF_DOCS)?;
        match self.db.get_cf(cf, Self::doc_key(collection, doc_id))? {
            Some(bytes) => Ok(Some(StoredRecord::decode(&bytes)?.into_doc()?)),
            None => Ok(None),
        }
    }

    /// Every document of a collection, by key order.
    fn scan(&self, collection: &str) -> Result<Vec<StoredDoc>, StoreError> {
        let cf = self.cf(CF_DOCS)?;
        let prefix = Self::collection_prefix(collection);
        let mut docs = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            docs.push(StoredRecord::decode(&value)?.into_doc()?);
        }
        Ok(docs)
    }

    fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Write `doc` if the stored version still equals `prev_version`.
    fn compare_and_write(
        &self,
        collection: &str,
        doc: &StoredDoc,
        prev_version: Option<&VersionVector>,
    ) -> Result<(), StoreError> {
        let stored = self.load(collection, &doc.id)?;
        if stored.as_ref().map(|d| &d.version) != prev_version {
            return Err(StoreError::VersionConflict {
                collection: collection.to_string(),
                doc_id: doc.id.clone(),
            });
        }
        self.write(collection, doc, stored.is_none())
    }

    fn write(&self, collection: &str, doc: &StoredDoc, is_new: bool) -> Result<(), StoreError> {
        let record = StoredRecord::from_doc(doc)?.encode()?;
        let size = record.len() as u64;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCS)?, Self::doc_key(collection, &doc.id), &record);
        if is_new {
            let count = self.collection_count(collection)? + 1;
            batch.put_cf(self.cf(CF_META)?, collection.as_bytes(), count.to_be_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.bytes_written.fetch_add(size, Ordering::Relaxed);
        log::debug!("Saved {collection}/{} ({size} bytes compressed)", doc.id);
        Ok(())
    }

    fn collection_count(&self, collection: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, collection.as_bytes())? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(_) => Err(StoreError::DeserializationError(format!(
                "bad count for collection {collection}"
            ))),
            None => Ok(0),
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn collection_prefix(collection: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(collection.len() + 1);
        key.extend_from_slice(collection.as_bytes());
        key.push(KEY_SEPARATOR);
        key
    }

    /// `collection \0 doc_id`
    fn doc_key(collection: &str, doc_id: &str) -> Vec<u8> {
        let mut key = Self::collection_prefix(collection);
        key.extend_from_slice(doc_id.as_bytes());
        key
    }
}

impl Storage for RocksStorage {
    fn init(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let names = self.blocking(|db| db.collection_names()).await?;
            log::info!(
                "RocksDB storage ready: {} collection(s) at {}",
                names.len(),
                self.path().display()
            );
            Ok(())
        })
    }

    fn get_doc_by_id<'a>(
        &'a self,
        collection: &'a str,
        doc_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredDoc>, StoreError>> {
        let (collection, doc_id) = (collection.to_string(), doc_id.to_string());
        Box::pin(async move { self.blocking(move |db| db.load(&collection, &doc_id)).await })
    }

    fn get_docs_by_query<'a>(
        &'a self,
        collection: &'a str,
        expression: &'a Value,
    ) -> BoxFuture<'a, Result<QueryResult, StoreError>> {
        let owned = collection.to_string();
        Box::pin(async move {
            let docs = self.blocking(move |db| db.scan(&owned)).await?;
            Ok(self.queries.evaluate(expression, docs))
        })
    }

    fn save_doc<'a>(
        &'a self,
        collection: &'a str,
        doc: StoredDoc,
        prev_version: Option<VersionVector>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            self.blocking(move |db| db.compare_and_write(&collection, &doc, prev_version.as_ref()))
                .await
        })
    }

    fn get_collection_names(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        Box::pin(async move { self.blocking(|db| db.collection_names()).await })
    }

    fn db_queries(&self) -> &dyn DbQueries {
        &self.queries
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::OpKind;

    fn open(dir: &tempfile::TempDir) -> RocksStorage {
        RocksStorage::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn stored(id: &str, state: Option<Value>, date: u64) -> StoredDoc {
        let op = Op {
            id: format!("{id}-op{date}"),
            source: "alice".into(),
            date,
            collection_name: "notes".into(),
            doc_id: id.into(),
            field: None,
            kind: OpKind::Add { value: json!({"_id": id}) },
        };
        let mut version = VersionVector::new();
        version.observe("alice", date);
        StoredDoc {
            id: id.into(),
            state,
            ops: vec![op],
            version,
        }
    }

    #[tokio::test]
    async fn test_store_open_and_init() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        storage.init().await.unwrap();
        assert!(storage.get_collection_names().await.unwrap().is_empty());
        assert_eq!(storage.path(), dir.path().join("db"));
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let doc = stored("n1", Some(json!({"_id": "n1", "title": "héllo", "n": 1.5})), 1);
        storage.save_doc("notes", doc.clone(), None).await.unwrap();
        assert_eq!(storage.get_doc_by_id("notes", "n1").await.unwrap(), Some(doc));
        assert_eq!(storage.get_doc_by_id("notes", "n2").await.unwrap(), None);
        assert!(storage.bytes_written() > 0);
    }

    #[tokio::test]
    async fn test_deleted_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let doc = stored("n1", None, 3);
        storage.save_doc("notes", doc.clone(), None).await.unwrap();
        let loaded = storage.get_doc_by_id("notes", "n1").await.unwrap().unwrap();
        assert_eq!(loaded.state, None);
        assert_eq!(loaded.version, doc.version);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let first = stored("n1", Some(json!({"v": 1})), 1);
        storage.save_doc("notes", first.clone(), None).await.unwrap();

        let err = storage
            .save_doc("notes", stored("n1", Some(json!({"v": 2})), 2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        storage
            .save_doc("notes", stored("n1", Some(json!({"v": 2})), 2), Some(first.version))
            .await
            .unwrap();
        assert_eq!(storage.collection_count("notes").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        storage
            .save_doc("notes", stored("a", Some(json!({"k": 1})), 1), None)
            .await
            .unwrap();
        storage
            .save_doc("notes2", stored("b", Some(json!({"k": 1})), 1), None)
            .await
            .unwrap();

        let notes = storage.get_docs_by_query("notes", &json!({"k": 1})).await.unwrap();
        assert_eq!(notes.ids(), vec!["a"]);
        assert_eq!(
            storage.get_collection_names().await.unwrap(),
            vec!["notes", "notes2"]
        );
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = stored("n1", Some(json!({"_id": "n1"})), 1);
        {
            let storage = open(&dir);
            storage.save_doc("notes", doc.clone(), None).await.unwrap();
            storage.sync().unwrap();
        }
        let storage = open(&dir);
        assert_eq!(storage.get_doc_by_id("notes", "n1").await.unwrap(), Some(doc));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_across_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open(&dir));

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let id = format!("n{i}");
                storage
                    .save_doc("notes", stored(&id, Some(json!({"_id": id, "k": 1})), i + 1), None)
                    .await
                    .unwrap();
                storage.get_doc_by_id("notes", &id).await.unwrap().is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        // Racing creates of one id: the write lock lets exactly one through.
        let mut racers = Vec::new();
        for date in 1..=8u64 {
            let storage = Arc::clone(&storage);
            racers.push(tokio::spawn(async move {
                storage
                    .save_doc("notes", stored("shared", Some(json!({"d": date})), date), None)
                    .await
            }));
        }
        let mut created = 0;
        for racer in racers {
            match racer.await.unwrap() {
                Ok(()) => created += 1,
                Err(err) => assert!(matches!(err, StoreError::VersionConflict { .. })),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(storage.collection_count("notes").unwrap(), 17);
        let all = storage.get_docs_by_query("notes", &json!({})).await.unwrap();
        assert_eq!(all.ids().len(), 17);
    }

    #[test]
    fn test_corrupt_record() {
        assert!(matches!(
            StoredRecord::decode(&[1, 2, 3]),
            Err(StoreError::CompressionError(_)) | Err(StoreError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_rocks_config_default() {
        let config = RocksConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(RocksConfig::for_testing("/tmp/x").max_open_files, 64);
    }
}
