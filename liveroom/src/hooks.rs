//! Policy and lifecycle hooks a room calls out to.
//!
//! Synchronous hooks run inside the room's critical section and can veto.
//! Asynchronous hooks return a future that the room collects while locked
//! and runs after the lock is released. Each one runs on its own task, so
//! an error or panic in one never reaches the others.

use futures_util::future::{join_all, BoxFuture};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ActorId, Op};

/// Scope required to mutate storage under the default policy.
pub const SCOPE_ROOM_WRITE: &str = "room:write";

pub type HookFuture = BoxFuture<'static, Result<(), HookError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("Hook failed: {0}")]
    Failed(String),
    #[error("Vetoed: {0}")]
    Vetoed(String),
}

/// Pending-message pressure on a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureLevel {
    Soft,
    Hard,
}

/// What hooks get to see of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub actor: ActorId,
    pub user_id: Option<String>,
    pub info: Value,
    pub scopes: Vec<String>,
}

pub trait RoomHooks: Send + Sync {
    /// Decide whether `actor` may apply `op`. `Err` carries the reason sent
    /// back with the rejection.
    fn authorize_op(&self, _room_id: &str, _actor: ActorId, scopes: &[String], _op: &Op) -> Result<(), String> {
        if scopes.iter().any(|s| s == SCOPE_ROOM_WRITE) {
            Ok(())
        } else {
            Err("Not allowed to write storage".to_string())
        }
    }

    /// Runs before a room drops its in-memory state. `Err` keeps it loaded.
    fn before_unload(&self, _room_id: &str) -> Result<(), HookError> {
        Ok(())
    }

    fn on_session_started(&self, _room_id: &str, _session: &SessionSummary) -> Option<HookFuture> {
        None
    }

    fn on_session_ended(&self, _room_id: &str, _session: &SessionSummary) -> Option<HookFuture> {
        None
    }

    fn on_storage_updated(&self, _room_id: &str) -> Option<HookFuture> {
        None
    }

    /// Called when the pending counter crosses a threshold.
    fn on_backpressure(&self, room_id: &str, level: BackpressureLevel, pending: usize) {
        match level {
            BackpressureLevel::Soft => {
                log::warn!("Room {room_id}: {pending} pending messages (soft limit)")
            }
            BackpressureLevel::Hard => {
                log::error!("Room {room_id}: {pending} pending messages (hard limit)")
            }
        }
    }
}

/// Default policy: writes need [`SCOPE_ROOM_WRITE`], no lifecycle hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl RoomHooks for DefaultHooks {}

/// A deferred hook call, labelled for logging.
pub struct Deferred {
    pub name: &'static str,
    pub future: HookFuture,
}

/// Run every deferred hook to completion, each isolated on its own task.
/// Returns how many failed.
pub async fn run_deferred(room_id: &str, effects: Vec<Deferred>) -> usize {
    if effects.is_empty() {
        return 0;
    }
    let (names, handles): (Vec<_>, Vec<_>) = effects
        .into_iter()
        .map(|d| (d.name, tokio::spawn(d.future)))
        .unzip();

    let mut failed = 0;
    for (name, result) in names.into_iter().zip(join_all(handles).await) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                log::error!("Room {room_id}: {name} hook failed: {e}");
            }
            Err(e) => {
                failed += 1;
                log::error!("Room {room_id}: {name} hook panicked: {e}");
            }
        }
    }
    failed
}
