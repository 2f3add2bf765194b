//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: full document snapshots (LZ4 compressed)
//! - `deltas`: committed updates (LZ4 compressed, keyed by name:version)
//! - `metadata`: per-document metadata (bincode)
//!
//! Keys start with the document name as `<len:u32 BE><utf-8 bytes>`, so one
//! name is never a prefix of another. Delta keys append `<version:u64 BE>`,
//! which keeps a document's deltas contiguous and in version order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::{replay, snapshot, Persistence, PersistenceError};
use crate::actor::DocumentActor;

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
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

/// Bookkeeping stored next to each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    /// Highest delta version written
    pub version: u64,
    /// Delta version covered by the current snapshot
    pub snapshot_version: u64,
    /// Deltas written since the document was created
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = now_secs();
        Self {
            name: name.to_string(),
            version: 0,
            snapshot_version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("document not found: {0}")]
    NotFound(String),

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

/// RocksDB-backed document store, shareable across hubs behind an `Arc`.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
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
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small writes, range-scanned per document.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full snapshot covering every delta up to `version`.
    pub fn save_snapshot(
        &self,
        name: &str,
        snapshot: &[u8],
        version: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata_or_new(name)?;
        meta.snapshot_version = version;
        meta.version = meta.version.max(version);
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = doc_key(name);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_key(name))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    pub fn document_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_key(name))?.is_some())
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Store one update under `version`. Returns the compressed size.
    pub fn store_delta(&self, name: &str, version: u64, delta: &[u8]) -> Result<u64, StoreError> {
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(delta);
        let compressed_len = compressed.len() as u64;

        let mut meta = self.metadata_or_new(name)?;
        meta.version = meta.version.max(version);
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, delta_key(name, version), &compressed);
        batch.put_cf(&cf_meta, doc_key(name), meta.encode()?);
        self.write(batch)?;

        Ok(compressed_len)
    }

    /// Deltas with version `>= since_version`, in version order.
    pub fn load_deltas_since(
        &self,
        name: &str,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = doc_key(name);
        let start_key = delta_key(name, since_version);

        let mut deltas = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(version) = delta_version(&prefix, &key) else {
                break;
            };
            let delta = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            deltas.push((version, delta));
        }

        Ok(deltas)
    }

    pub fn load_all_deltas(&self, name: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_deltas_since(name, 0)
    }

    /// Delete deltas with version `<= up_to_version`. Returns how many were removed.
    pub fn compact_deltas(&self, name: &str, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = doc_key(name);
        let start_key = delta_key(name, 0);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match delta_version(&prefix, &key) {
                Some(version) if version <= up_to_version => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, name: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_key(name))? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    /// Names of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            names.push(DocumentMetadata::decode(&value)?.name);
        }
        Ok(names)
    }

    /// Delete a document with its deltas and metadata.
    pub fn delete_document(&self, name: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let key = doc_key(name);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, &key);
        batch.delete_cf(&cf_meta, &key);

        let start_key = delta_key(name, 0);
        let iter = self
            .db
            .iterator_cf(&cf_deltas, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (delta, _) = item?;
            if delta_version(&key, &delta).is_none() {
                break;
            }
            batch.delete_cf(&cf_deltas, &delta);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn metadata_or_new(&self, name: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(name) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(name)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

/// `<len:u32 BE><name>`
fn doc_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + name.len());
    key.extend_from_slice(&(name.len() as u32).to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// `<len:u32 BE><name><version:u64 BE>`
fn delta_key(name: &str, version: u64) -> Vec<u8> {
    let mut key = doc_key(name);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Version encoded in `key` if it is a delta key of the document `prefix`.
fn delta_version(prefix: &[u8], key: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

// ───────────────────────────────────────────────────────────────────
// Persistence adapter
// ───────────────────────────────────────────────────────────────────

/// [`Persistence`] over a shared [`DocumentStore`].
///
/// Each committed update becomes a versioned delta. On unbind the document is
/// snapshotted and the deltas the snapshot covers are compacted away.
///
/// Until `bind` succeeds the adapter does not know the latest delta version,
/// so it refuses to write or compact anything.
pub struct RocksPersistence {
    store: Arc<DocumentStore>,
    version: Option<u64>,
}

impl RocksPersistence {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store, version: None }
    }

    fn loaded_version(&self, doc_name: &str) -> Result<u64, PersistenceError> {
        self.version.ok_or_else(|| {
            PersistenceError::Backend(format!("{doc_name} was never loaded from the store"))
        })
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

impl Persistence for RocksPersistence {
    fn bind(&mut self, doc_name: &str, doc: &DocumentActor) -> Result<(), PersistenceError> {
        self.version = None;
        let meta = match self.store.load_metadata(doc_name) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => {
                self.version = Some(0);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut updates = Vec::new();
        match self.store.load_snapshot(doc_name) {
            Ok(snapshot) => updates.push(snapshot),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let deltas = self.store.load_deltas_since(doc_name, meta.snapshot_version + 1)?;
        log::debug!(
            "loading {doc_name}: snapshot v{} + {} deltas",
            meta.snapshot_version,
            deltas.len()
        );
        updates.extend(deltas.into_iter().map(|(_, delta)| delta));

        let skipped = replay(doc, doc_name, updates)?;
        if skipped > 0 {
            log::warn!("{doc_name}: {skipped} stored records could not be applied");
        }
        self.version = Some(meta.version);
        Ok(())
    }

    fn persist_update(
        &mut self,
        doc_name: &str,
        _doc: &DocumentActor,
        update: &[u8],
    ) -> Result<(), PersistenceError> {
        let version = self.loaded_version(doc_name)? + 1;
        self.store.store_delta(doc_name, version, update)?;
        self.version = Some(version);
        Ok(())
    }

    fn unbind(&mut self, doc_name: &str, doc: &DocumentActor) -> Result<(), PersistenceError> {
        let version = self.loaded_version(doc_name)?;
        let state = snapshot(doc)?;
        let meta = self.store.save_snapshot(doc_name, &state, version)?;
        let removed = self.store.compact_deltas(doc_name, version)?;
        log::debug!(
            "snapshot of {doc_name} at v{}: {} -> {} bytes, {removed} deltas compacted",
            meta.snapshot_version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}
