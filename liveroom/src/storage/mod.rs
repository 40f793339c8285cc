//! Storage layer for room documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   ops    ┌──────────────┐  write-through  ┌──────────────┐
//! │ Room        │ ───────► │ Storage      │ ──────────────► │ dyn Driver   │
//! │ (locked)    │ ◄─────── │ (engine)     │                 │ Memory/Rocks │
//! └─────────────┘ outcome  └──────┬───────┘                 └──────┬───────┘
//!                                 │ owns                           │ at load
//!                                 ▼                                ▼
//!                    ┌─────────────────────────┐        ┌────────────────────┐
//!                    │ LoadedTree  (NodeTree)  │ ◄───── │ repair(raw rows)   │
//!                    │ YDocStore   (yrs::Doc)  │        │ heals, then writes │
//!                    └─────────────────────────┘        │ fixes in one batch │
//!                                                       └────────────────────┘
//! ```

pub mod driver;
pub mod engine;
pub mod loaded;
pub mod position;
pub mod repair;
pub mod rocks;
pub mod tree;
pub mod ydoc;

use thiserror::Error;

pub use driver::{Driver, MemoryDriver, NodeBatch, StoreError};
pub use engine::{ApplyOutcome, LoadedParts, Storage};
pub use loaded::{LoadedTree, Snapshot};
pub use repair::{repair, DropReason, RepairReport};
pub use rocks::{RocksDriver, StoreConfig};
pub use tree::{Node, NodeData, NodeTree, TreeDelta, TreeError, ROOT_ID};
pub use ydoc::{YDocError, YDocStore};

/// Errors from the loaded storage of a room.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Storage is not loaded")]
    NotLoaded,
}
