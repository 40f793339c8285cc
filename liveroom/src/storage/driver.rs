//! Persistence driver: the raw durable store behind every room.
//!
//! A driver is shared by all rooms of a process. Every call names the room,
//! and backends keep room key spaces disjoint. Calls are synchronous; async
//! callers that may block on disk go through `spawn_blocking`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;

use crate::leased::LeasedSession;
use crate::protocol::{ActorId, SerializedCrdt};

/// Metadata key of the durable actor counter.
pub const META_ACTOR_COUNTER: &str = "actor_counter";
/// Metadata key of the storage version marker.
pub const META_STORAGE_VERSION: &str = "storage_version";

/// Node rows to write and delete atomically.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeBatch {
    pub puts: Vec<(String, SerializedCrdt)>,
    pub deletes: Vec<String>,
}

impl NodeBatch {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub trait Driver: Send + Sync {
    /// Every node row of the room, in no particular order.
    fn load_nodes(&self, room: &str) -> Result<Vec<(String, SerializedCrdt)>, StoreError>;

    /// Apply `batch` atomically.
    fn write_nodes(&self, room: &str, batch: &NodeBatch) -> Result<(), StoreError>;

    fn get_meta(&self, room: &str, key: &str) -> Result<Option<Value>, StoreError>;

    fn put_meta(&self, room: &str, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Allocate the next actor id. Never hands out the same id twice, across
    /// restarts included.
    fn next_actor(&self, room: &str) -> Result<ActorId, StoreError>;

    /// Increment and return the storage version marker.
    fn bump_storage_version(&self, room: &str) -> Result<u64, StoreError>;

    fn get_blob(&self, room: &str, doc_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put_blob(&self, room: &str, doc_id: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn get_leased_session(&self, room: &str, session_id: &str) -> Result<Option<LeasedSession>, StoreError>;

    fn put_leased_session(&self, room: &str, session: &LeasedSession) -> Result<(), StoreError>;

    /// Returns whether a row existed.
    fn delete_leased_session(&self, room: &str, session_id: &str) -> Result<bool, StoreError>;

    /// All leased rows of the room, expired ones included.
    fn list_leased_sessions(&self, room: &str) -> Result<Vec<LeasedSession>, StoreError>;
}

/// Read a numeric metadata counter.
pub(crate) fn meta_counter(value: Option<Value>) -> u64 {
    value.and_then(|v| v.as_u64()).unwrap_or(0)
}

// ─── In-memory backend ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryRoom {
    nodes: BTreeMap<String, SerializedCrdt>,
    meta: HashMap<String, Value>,
    blobs: HashMap<(String, String), Vec<u8>>,
    leased: BTreeMap<String, LeasedSession>,
}

/// Driver keeping everything in process memory. Used in tests and for
/// ephemeral servers.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    rooms: Mutex<HashMap<String, MemoryRoom>>,
    /// When set, node writes fail as a broken disk would.
    failing_writes: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `write_nodes` fail (or succeed again).
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryRoom>>, StoreError> {
        self.rooms.lock().map_err(|_| StoreError::Poisoned)
    }

    fn with_room<T>(&self, room: &str, f: impl FnOnce(&mut MemoryRoom) -> T) -> Result<T, StoreError> {
        let mut rooms = self.lock()?;
        Ok(f(rooms.entry(room.to_string()).or_default()))
    }
}

impl Driver for MemoryDriver {
    fn load_nodes(&self, room: &str) -> Result<Vec<(String, SerializedCrdt)>, StoreError> {
        self.with_room(room, |r| {
            r.nodes.iter().map(|(id, crdt)| (id.clone(), crdt.clone())).collect()
        })
    }

    fn write_nodes(&self, room: &str, batch: &NodeBatch) -> Result<(), StoreError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("node writes are failing".into()));
        }
        self.with_room(room, |r| {
            for id in &batch.deletes {
                r.nodes.remove(id);
            }
            for (id, crdt) in &batch.puts {
                r.nodes.insert(id.clone(), crdt.clone());
            }
        })
    }

    fn get_meta(&self, room: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_room(room, |r| r.meta.get(key).cloned())
    }

    fn put_meta(&self, room: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        self.with_room(room, |r| {
            r.meta.insert(key.to_string(), value.clone());
        })
    }

    fn next_actor(&self, room: &str) -> Result<ActorId, StoreError> {
        self.with_room(room, |r| {
            let next = meta_counter(r.meta.get(META_ACTOR_COUNTER).cloned());
            r.meta.insert(META_ACTOR_COUNTER.to_string(), Value::from(next + 1));
            next as ActorId
        })
    }

    fn bump_storage_version(&self, room: &str) -> Result<u64, StoreError> {
        self.with_room(room, |r| {
            let next = meta_counter(r.meta.get(META_STORAGE_VERSION).cloned()) + 1;
            r.meta.insert(META_STORAGE_VERSION.to_string(), Value::from(next));
            next
        })
    }

    fn get_blob(&self, room: &str, doc_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_room(room, |r| r.blobs.get(&(doc_id.to_string(), key.to_string())).cloned())
    }

    fn put_blob(&self, room: &str, doc_id: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.with_room(room, |r| {
            r.blobs.insert((doc_id.to_string(), key.to_string()), bytes.to_vec());
        })
    }

    fn get_leased_session(&self, room: &str, session_id: &str) -> Result<Option<LeasedSession>, StoreError> {
        self.with_room(room, |r| r.leased.get(session_id).cloned())
    }

    fn put_leased_session(&self, room: &str, session: &LeasedSession) -> Result<(), StoreError> {
        self.with_room(room, |r| {
            r.leased.insert(session.session_id.clone(), session.clone());
        })
    }

    fn delete_leased_session(&self, room: &str, session_id: &str) -> Result<bool, StoreError> {
        self.with_room(room, |r| r.leased.remove(session_id).is_some())
    }

    fn list_leased_sessions(&self, room: &str) -> Result<Vec<LeasedSession>, StoreError> {
        self.with_room(room, |r| r.leased.values().cloned().collect())
    }
}
