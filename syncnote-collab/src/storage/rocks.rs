//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: full-state snapshots (LZ4 compressed, keyed by doc id)
//! - `metadata` : per-document metadata (bincode: version, sizes, timestamps)
//!
//! A snapshot and its metadata are always written in one batch, so a reader
//! never sees metadata describing a snapshot that is not there.
//!
//! Reference: Kleppmann: DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true; snapshots are infrequent)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("syncnote_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
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

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Number of snapshots written so far
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            version: 0,
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

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("document {0} not found")]
    NotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed snapshot store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

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

        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        if name == CF_DOCUMENTS {
            // Values are already LZ4 frames.
            opts.set_compression_type(DBCompressionType::None);
        } else {
            opts.set_compression_type(DBCompressionType::Lz4);
        }

        opts
    }

    // ─── Document Snapshots ───────────────────────────────────────────

    /// Save a full-state snapshot (LZ4 compressed) with updated metadata.
    pub fn save_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        let key = doc_id.as_bytes();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot v{} for {doc_id} ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load and decompress a snapshot.
    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// All document ids with a stored snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization(format!("invalid document key of {} bytes", key.len())))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }

        Ok(doc_ids)
    }

    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
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

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncnote_core::{Doc, ReplicaId};

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();

        let mut doc = Doc::with_replica(ReplicaId(1));
        doc.insert(0, "persist me, persist me, persist me").unwrap();
        let snapshot = doc.encode_state_as_update().unwrap();

        let meta = store.save_snapshot(doc_id, &snapshot).unwrap();
        assert_eq!(meta.doc_id, doc_id);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, snapshot.len() as u64);

        let loaded = store.load_snapshot(doc_id).unwrap();
        let restored = Doc::from_snapshot(ReplicaId(2), &loaded).unwrap();
        assert_eq!(restored.text(), doc.text());
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        assert_eq!(store.load_snapshot(id), Err(StoreError::NotFound(id)));
        assert!(!store.document_exists(id).unwrap());
    }

    #[test]
    fn test_metadata_tracks_versions() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        store.save_snapshot(doc_id, b"first").unwrap();
        store.save_snapshot(doc_id, b"second, longer").unwrap();

        let meta = store.load_metadata(doc_id).unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.snapshot_size, 14);
        assert!(meta.updated_at >= meta.created_at);
        assert_eq!(store.load_snapshot(doc_id).unwrap(), b"second, longer");
    }

    #[test]
    fn test_list_and_delete_documents() {
        let (_dir, store) = open_temp();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.save_snapshot(*id, b"test").unwrap();
        }

        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 5);
        assert!(ids.iter().all(|id| listed.contains(id)));

        store.delete_document(ids[0]).unwrap();
        assert!(!store.document_exists(ids[0]).unwrap());
        assert!(store.load_snapshot(ids[0]).is_err());
        assert_eq!(store.list_documents().unwrap().len(), 4);
    }

    #[test]
    fn test_reopen_keeps_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let doc_id = Uuid::new_v4();
        {
            let store = DocumentStore::open(config.clone()).unwrap();
            store.save_snapshot(doc_id, b"durable").unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(config).unwrap();
        assert_eq!(store.load_snapshot(doc_id).unwrap(), b"durable");
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let data = vec![42u8; 1_000_000];

        let meta = store.save_snapshot(doc_id, &data).unwrap();
        assert!(meta.compressed_size < 100_000);
        assert_eq!(store.load_snapshot(doc_id).unwrap(), data);
    }
}
