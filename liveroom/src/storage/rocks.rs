//! RocksDB-backed persistence driver.
//!
//! Column families:
//! - `nodes`          : node rows (bincode, crdt data embedded as JSON)
//! - `metadata`       : per-room metadata (JSON: actor counter, storage version)
//! - `blobs`          : binary documents (LZ4 compressed)
//! - `leased_sessions`: leased session rows (JSON)
//!
//! Every key starts with `<room>\0`, so one database serves many rooms and a
//! room's rows are read with a single prefix scan.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::driver::{meta_counter, Driver, NodeBatch, StoreError, META_ACTOR_COUNTER, META_STORAGE_VERSION};
use crate::leased::LeasedSession;
use crate::protocol::{ActorId, CrdtType, SerializedCrdt};

/// Column family names.
const CF_NODES: &str = "nodes";
const CF_METADATA: &str = "metadata";
const CF_BLOBS: &str = "blobs";
const CF_LEASED: &str = "leased_sessions";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_NODES, CF_METADATA, CF_BLOBS, CF_LEASED];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
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

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("liveroom_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// On-disk form of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRow {
    crdt_type: u8,
    parent_id: Option<String>,
    parent_key: Option<String>,
    /// JSON text; bincode cannot carry `serde_json::Value` directly.
    data_json: Option<String>,
}

impl NodeRow {
    fn encode(crdt: &SerializedCrdt) -> Result<Vec<u8>, StoreError> {
        let row = NodeRow {
            crdt_type: crdt.crdt_type.into(),
            parent_id: crdt.parent_id.clone(),
            parent_key: crdt.parent_key.clone(),
            data_json: crdt.data.as_ref().map(Value::to_string),
        };
        bincode::serde::encode_to_vec(&row, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<SerializedCrdt, StoreError> {
        let (row, _): (NodeRow, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let crdt_type = CrdtType::try_from(row.crdt_type).map_err(StoreError::Deserialization)?;
        let data = row
            .data_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(SerializedCrdt {
            crdt_type,
            parent_id: row.parent_id,
            parent_key: row.parent_key,
            data,
        })
    }
}

/// RocksDB-backed driver.
pub struct RocksDriver {
    /// RocksDB instance (single-threaded mode, shared through Arc)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of metadata counters
    counter_lock: Mutex<()>,
}

impl RocksDriver {
    /// Open the store at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
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
        log::info!("Opened room store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            counter_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_NODES => {
                // Many small rows, prefix-scanned at load
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BLOBS => {
                // Already LZ4 compressed by us
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_LEASED => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Every `(suffix, value)` under `room` in one column family.
    fn scan_room(&self, cf_name: &str, room: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = room_prefix(room);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push((key[prefix.len()..].to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn bump_counter(&self, room: &str, key: &str) -> Result<u64, StoreError> {
        let _guard = self.counter_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let current = meta_counter(self.get_meta(room, key)?);
        self.put_meta(room, key, &Value::from(current + 1))?;
        Ok(current)
    }
}

impl Driver for RocksDriver {
    /// Rows that cannot be decoded are logged, skipped and deleted, so one
    /// bad row never keeps a room from loading.
    fn load_nodes(&self, room: &str) -> Result<Vec<(String, SerializedCrdt)>, StoreError> {
        let mut rows = Vec::new();
        let mut corrupt = Vec::new();
        for (suffix, bytes) in self.scan_room(CF_NODES, room)? {
            let id = match String::from_utf8(suffix) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("Room {room}: dropping node row with a non-UTF-8 id: {e}");
                    corrupt.push(e.into_bytes());
                    continue;
                }
            };
            match NodeRow::decode(&bytes) {
                Ok(crdt) => rows.push((id, crdt)),
                Err(e) => {
                    log::warn!("Room {room}: dropping undecodable node row {id}: {e}");
                    corrupt.push(id.into_bytes());
                }
            }
        }

        if !corrupt.is_empty() {
            let cf = self.cf(CF_NODES)?;
            let mut wb = WriteBatch::default();
            for suffix in &corrupt {
                let mut key = room_prefix(room);
                key.extend_from_slice(suffix);
                wb.delete_cf(cf, key);
            }
            self.db.write_opt(wb, &self.write_opts())?;
            log::warn!("Room {room}: deleted {} corrupt node rows", corrupt.len());
        }
        Ok(rows)
    }

    fn write_nodes(&self, room: &str, batch: &NodeBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_NODES)?;
        let mut wb = WriteBatch::default();
        for id in &batch.deletes {
            wb.delete_cf(cf, room_key(room, id));
        }
        for (id, crdt) in &batch.puts {
            wb.put_cf(cf, room_key(room, id), NodeRow::encode(crdt)?);
        }
        self.db.write_opt(wb, &self.write_opts())?;
        Ok(())
    }

    fn get_meta(&self, room: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room_key(room, key))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put_meta(&self, room: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let bytes = serde_json::to_vec(value)?;
        self.db
            .put_cf_opt(cf, room_key(room, key), bytes, &self.write_opts())?;
        Ok(())
    }

    fn next_actor(&self, room: &str) -> Result<ActorId, StoreError> {
        Ok(self.bump_counter(room, META_ACTOR_COUNTER)? as ActorId)
    }

    fn bump_storage_version(&self, room: &str) -> Result<u64, StoreError> {
        Ok(self.bump_counter(room, META_STORAGE_VERSION)? + 1)
    }

    fn get_blob(&self, room: &str, doc_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        match self.db.get_cf(cf, blob_key(room, doc_id, key))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn put_blob(&self, room: &str, doc_id: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        let compressed = lz4_flex::compress_prepend_size(bytes);
        self.db
            .put_cf_opt(cf, blob_key(room, doc_id, key), compressed, &self.write_opts())?;
        Ok(())
    }

    fn get_leased_session(&self, room: &str, session_id: &str) -> Result<Option<LeasedSession>, StoreError> {
        let cf = self.cf(CF_LEASED)?;
        match self.db.get_cf(cf, room_key(room, session_id))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put_leased_session(&self, room: &str, session: &LeasedSession) -> Result<(), StoreError> {
        let cf = self.cf(CF_LEASED)?;
        let bytes = serde_json::to_vec(session)?;
        self.db
            .put_cf_opt(cf, room_key(room, &session.session_id), bytes, &self.write_opts())?;
        Ok(())
    }

    fn delete_leased_session(&self, room: &str, session_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_LEASED)?;
        let key = room_key(room, session_id);
        let existed = self.db.get_cf(cf, &key)?.is_some();
        if existed {
            self.db.delete_cf_opt(cf, key, &self.write_opts())?;
        }
        Ok(existed)
    }

    fn list_leased_sessions(&self, room: &str) -> Result<Vec<LeasedSession>, StoreError> {
        self.scan_room(CF_LEASED, room)?
            .into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect()
    }
}

fn room_prefix(room: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(room.len() + 1);
    prefix.extend_from_slice(room.as_bytes());
    prefix.push(0);
    prefix
}

/// `<room>\0<id>`
fn room_key(room: &str, id: &str) -> Vec<u8> {
    let mut key = room_prefix(room);
    key.extend_from_slice(id.as_bytes());
    key
}

/// `<room>\0<doc_id>\0<key>`
fn blob_key(room: &str, doc_id: &str, key: &str) -> Vec<u8> {
    let mut out = room_key(room, doc_id);
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
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
    use crate::storage::LoadedParts;
    use serde_json::json;
    use std::sync::Arc;

    fn open(dir: &tempfile::TempDir) -> RocksDriver {
        RocksDriver::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open(&dir);
        assert!(driver.path().exists());
    }

    #[test]
    fn test_node_rows_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open(&dir);
        let root = SerializedCrdt::root();
        let reg = SerializedCrdt::child(CrdtType::Register, "l", "!", Some(json!({"deep": [1, 2]})));
        let batch = NodeBatch {
            puts: vec![("root".into(), root.clone()), ("r".into(), reg.clone())],
            deletes: vec![],
        };
        driver.write_nodes("room", &batch).unwrap();

        let mut rows = driver.load_nodes("room").unwrap();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(rows, vec![("r".to_string(), reg), ("root".to_string(), root)]);
    }

    #[test]
    fn test_undecodable_rows_are_skipped_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(open(&dir));
        let good = SerializedCrdt::child(CrdtType::Map, "root", "k", None);
        driver
            .write_nodes(
                "r",
                &NodeBatch {
                    puts: vec![("root".into(), SerializedCrdt::root()), ("m".into(), good)],
                    deletes: vec![],
                },
            )
            .unwrap();
        let cf = driver.cf(CF_NODES).unwrap();
        driver.db.put_cf(cf, room_key("r", "garbage"), [0xff, 0xff, 0xff]).unwrap();
        let mut bad_id = room_prefix("r");
        bad_id.extend_from_slice(&[0xc3, 0x28]);
        driver.db.put_cf(cf, bad_id, NodeRow::encode(&SerializedCrdt::root()).unwrap()).unwrap();
        assert_eq!(driver.scan_room(CF_NODES, "r").unwrap().len(), 4);

        // The room loads with the good rows only
        let parts = LoadedParts::load("r", driver.clone()).unwrap();
        assert_eq!(parts.tree.tree().len(), 2);
        assert_eq!(parts.tree.child_at("root", "k"), Some("m"));
        assert!(parts.tree.repair_report().is_clean());

        // ...and the bad rows are gone from disk
        assert_eq!(driver.scan_room(CF_NODES, "r").unwrap().len(), 2);
    }

    #[test]
    fn test_room_prefix_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open(&dir);
        let crdt = SerializedCrdt::child(CrdtType::Map, "root", "k", None);
        // "ab" must not leak into a scan of "a"
        for room in ["a", "ab", "b"] {
            let batch = NodeBatch {
                puts: vec![(format!("{room}-node"), crdt.clone())],
                deletes: vec![],
            };
            driver.write_nodes(room, &batch).unwrap();
        }
        let rows = driver.load_nodes("a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "a-node");
    }

    #[test]
    fn test_actor_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = open(&dir);
            assert_eq!(driver.next_actor("r").unwrap(), 0);
            assert_eq!(driver.next_actor("r").unwrap(), 1);
        }
        let driver = open(&dir);
        assert_eq!(driver.next_actor("r").unwrap(), 2);
        assert_eq!(driver.bump_storage_version("r").unwrap(), 1);
    }

    #[test]
    fn test_blob_compression_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open(&dir);
        let data = vec![42u8; 100_000];
        driver.put_blob("r", "ydoc", "root", &data).unwrap();
        assert_eq!(driver.get_blob("r", "ydoc", "root").unwrap(), Some(data));
        assert_eq!(driver.get_blob("r", "ydoc", "other").unwrap(), None);
    }

    #[test]
    fn test_leased_rows() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open(&dir);
        let session = LeasedSession {
            session_id: "bot".into(),
            presence: json!({"x": 1}).as_object().cloned().unwrap(),
            updated_at: 10,
            info: json!(null),
            ttl: 100,
            actor: 4,
        };
        driver.put_leased_session("r", &session).unwrap();
        assert_eq!(driver.get_leased_session("r", "bot").unwrap(), Some(session.clone()));
        assert_eq!(driver.list_leased_sessions("r").unwrap(), vec![session]);
        assert!(driver.delete_leased_session("r", "bot").unwrap());
        assert!(!driver.delete_leased_session("r", "bot").unwrap());
        assert!(driver.list_leased_sessions("r").unwrap().is_empty());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
