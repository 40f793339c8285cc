//! The room's secondary binary document (Yjs, via yrs).
//!
//! The full document state lives in the blob store under `("ydoc", "root")`.
//! Updates are merged in memory and the whole state is written back after
//! each accepted update.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::driver::{Driver, StoreError};

pub const YDOC_ID: &str = "ydoc";
pub const YDOC_KEY: &str = "root";

/// Errors decoding or applying a binary update.
#[derive(Debug, thiserror::Error)]
pub enum YDocError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Update could not be applied: {0}")]
    Apply(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct YDocStore {
    room_id: String,
    driver: Arc<dyn Driver>,
    doc: Doc,
}

impl YDocStore {
    /// Restore the document from the blob store (empty if none is stored).
    pub fn load(room_id: &str, driver: Arc<dyn Driver>) -> Result<Self, StoreError> {
        let doc = Doc::new();
        if let Some(snapshot) = driver.get_blob(room_id, YDOC_ID, YDOC_KEY)? {
            match Update::decode_v1(&snapshot) {
                Ok(update) => {
                    let mut txn = doc.transact_mut();
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("Room {room_id}: stored ydoc could not be applied: {e}");
                    }
                }
                Err(e) => log::warn!("Room {room_id}: stored ydoc is corrupt: {e}"),
            }
        }
        Ok(Self {
            room_id: room_id.to_string(),
            driver,
            doc,
        })
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `remote_vector` is missing. An empty or
    /// undecodable vector yields the full state.
    pub fn encode_diff(&self, remote_vector: &[u8]) -> Vec<u8> {
        let remote = if remote_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(remote_vector).unwrap_or_default()
        };
        self.doc.transact().encode_diff_v1(&remote)
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge `update` and persist the new full state.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), YDocError> {
        let update = Update::decode_v1(update).map_err(|e| YDocError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| YDocError::Apply(e.to_string()))?;
        }
        self.persist()?;
        Ok(())
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        self.driver
            .put_blob(&self.room_id, YDOC_ID, YDOC_KEY, &self.encode_state())
    }
}
