//! A collaboration room: sessions, presence, storage ops and leased
//! sessions, all serialized behind one lock.
//!
//! ```text
//!   handle_data(key, raw)
//!          │ decode frame ("ping" → "pong", bad JSON → close 4000)
//!          ▼
//!   process_client_msgs ── pending += 1 ──► lock(RoomState) ─────────────┐
//!                                            │ presence / events fan-out │
//!                                            │ storage ops → Storage     │
//!                                            │ send failures → reaped    │
//!                                            │ hook futures collected    │
//!                                          unlock ◄──────────────────────┘
//!          │ pending -= 1
//!          ▼
//!   run deferred hooks (each on its own task)
//! ```
//!
//! Every mutation of the tree or the session registry happens under the
//! lock, one batch at a time. Transports never block, so sending while
//! locked is fine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::hooks::{run_deferred, BackpressureLevel, DefaultHooks, Deferred, HookError, RoomHooks, SessionSummary, SCOPE_ROOM_WRITE};
use crate::leased::LeasedSession;
use crate::protocol::{
    decode_frame, ActorId, ClientMsg, Frame, JsonObject, Op, SerializedCrdt, ServerMsg, UserEntry, PONG,
    STREAMING_STORAGE_VERSION, TARGET_EVERYONE,
};
use crate::session::{CloseReason, Session, SessionKind, SessionRegistry, Ticket, TicketOptions, Transport};
use crate::storage::driver::{meta_counter, META_ACTOR_COUNTER};
use crate::storage::{ApplyOutcome, Driver, LoadedParts, Storage, StorageError, StoreError};

/// Scope shown for leased sessions in the roster.
pub const LEASED_SESSION_SCOPE: &str = "room:presence:write";

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Nodes per STORAGE_CHUNK message (default: 250)
    pub storage_chunk_size: usize,
    /// Pending batches that trigger a soft backpressure warning
    pub soft_pending_limit: usize,
    /// Pending batches that trigger a hard backpressure warning
    pub hard_pending_limit: usize,
    /// Scopes granted to tickets that do not name their own
    pub default_scopes: Vec<String>,
    /// Serialize storage snapshots lazily, chunk by chunk
    pub low_memory_snapshots: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            storage_chunk_size: 250,
            soft_pending_limit: 1_000,
            hard_pending_limit: 10_000,
            default_scopes: vec![SCOPE_ROOM_WRITE.to_string()],
            low_memory_snapshots: false,
        }
    }
}

impl RoomConfig {
    /// Small limits so tests can reach them.
    pub fn for_testing() -> Self {
        Self {
            soft_pending_limit: 4,
            hard_pending_limit: 8,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Unknown session")]
    UnknownSession,
    #[error("Room is not loaded")]
    NotLoaded,
    #[error("Unload vetoed: {0}")]
    UnloadVetoed(HookError),
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Everything a room shares with its locked state.
#[derive(Clone)]
struct RoomContext {
    id: String,
    config: RoomConfig,
    driver: Arc<dyn Driver>,
    hooks: Arc<dyn RoomHooks>,
    clock: Arc<dyn Clock>,
}

pub struct Room {
    ctx: RoomContext,
    state: Mutex<RoomState>,
    /// Held for the whole of a load or unload, so concurrent loads share one.
    load_lock: Mutex<()>,
    loaded: AtomicBool,
    pending: AtomicUsize,
}

impl Room {
    pub fn new(id: impl Into<String>, driver: Arc<dyn Driver>, config: RoomConfig) -> Self {
        Self::with_parts(id, driver, config, Arc::new(DefaultHooks), Arc::new(SystemClock))
    }

    pub fn with_parts(
        id: impl Into<String>,
        driver: Arc<dyn Driver>,
        config: RoomConfig,
        hooks: Arc<dyn RoomHooks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ctx = RoomContext {
            id: id.into(),
            config,
            driver,
            hooks,
            clock,
        };
        Self {
            state: Mutex::new(RoomState {
                ctx: ctx.clone(),
                storage: Storage::new(),
                sessions: SessionRegistry::new(),
                failed: Vec::new(),
                effects: Vec::new(),
            }),
            ctx,
            load_lock: Mutex::new(()),
            loaded: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.ctx.config
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Batches waiting for or holding the lock.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Load storage if needed. Concurrent callers wait for the same load.
    pub async fn load(&self) -> Result<(), RoomError> {
        let _guard = self.load_lock.lock().await;
        if self.is_loaded() {
            return Ok(());
        }
        let id = self.ctx.id.clone();
        let driver = self.ctx.driver.clone();
        let parts = tokio::task::spawn_blocking(move || LoadedParts::load(&id, driver))
            .await
            .map_err(|e| RoomError::Task(e.to_string()))??;

        self.state.lock().await.storage.install(parts);
        self.loaded.store(true, Ordering::SeqCst);
        log::info!("Room {} loaded", self.ctx.id);
        Ok(())
    }

    /// Release in-memory storage, unless `before_unload` objects.
    pub async fn unload(&self) -> Result<(), RoomError> {
        let _guard = self.load_lock.lock().await;
        self.ctx
            .hooks
            .before_unload(&self.ctx.id)
            .map_err(RoomError::UnloadVetoed)?;
        self.state.lock().await.storage.unload();
        self.loaded.store(false, Ordering::SeqCst);
        log::info!("Room {} unloaded", self.ctx.id);
        Ok(())
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Issue a ticket. Touches no session state.
    ///
    /// A requested actor (a reconnect) is honored only if the allocator
    /// already handed it out and no leased session holds it. Anything else
    /// gets a fresh actor.
    pub fn create_ticket(&self, options: TicketOptions) -> Result<Ticket, RoomError> {
        let actor = match options.actor {
            Some(actor) if self.is_reclaimable(actor)? => actor,
            Some(actor) => {
                log::debug!("Room {}: actor {actor} was never issued here, allocating", self.ctx.id);
                self.ctx.driver.next_actor(&self.ctx.id)?
            }
            None => self.ctx.driver.next_actor(&self.ctx.id)?,
        };
        let scopes = options
            .scopes
            .unwrap_or_else(|| self.ctx.config.default_scopes.clone());
        Ok(Ticket::new(actor, options.version, options.user, scopes, options.public_meta))
    }

    fn is_reclaimable(&self, actor: ActorId) -> Result<bool, RoomError> {
        let Ok(requested) = u64::try_from(actor) else {
            return Ok(false);
        };
        let issued = meta_counter(self.ctx.driver.get_meta(&self.ctx.id, META_ACTOR_COUNTER)?);
        if requested >= issued {
            return Ok(false);
        }
        let leased = self.ctx.driver.list_leased_sessions(&self.ctx.id)?;
        Ok(!leased.iter().any(|l| l.actor == actor))
    }

    pub async fn start_browser_session(&self, ticket: Ticket, transport: Arc<dyn Transport>) -> Result<(), RoomError> {
        self.start_session(ticket, SessionKind::Browser(transport)).await?;
        Ok(())
    }

    /// Start a session without a transport. Returns its key; replies are
    /// read with [`take_backend_replies`](Self::take_backend_replies).
    pub async fn start_backend_session(&self, ticket: Ticket) -> Result<String, RoomError> {
        self.start_session(ticket, SessionKind::Backend(Vec::new())).await
    }

    pub async fn take_backend_replies(&self, key: &str) -> Result<Vec<ServerMsg>, RoomError> {
        let mut state = self.state.lock().await;
        let session = state.sessions.get_mut(key).ok_or(RoomError::UnknownSession)?;
        Ok(session.take_buffered())
    }

    /// Close one session. Returns whether it existed.
    pub async fn end_browser_session(&self, key: &str, reason: CloseReason) -> bool {
        self.locked(|state| state.end_session(key, &reason)).await
    }

    /// Close every session matching `predicate`. Returns how many closed.
    pub async fn end_session_by<F>(&self, predicate: F, reason: CloseReason) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        self.locked(|state| {
            let keys: Vec<String> = state
                .sessions
                .iter()
                .filter(|s| predicate(s))
                .map(|s| s.key().to_string())
                .collect();
            keys.iter().filter(|k| state.end_session(k, &reason)).count()
        })
        .await
    }

    async fn start_session(&self, ticket: Ticket, kind: SessionKind) -> Result<String, RoomError> {
        self.locked(|state| state.start_session(ticket, kind)).await
    }

    /// Run `f` under the room lock, close sessions whose sends failed, then
    /// run the hooks it deferred once the lock is released.
    async fn locked<T>(&self, f: impl FnOnce(&mut RoomState) -> T) -> T {
        let (out, effects) = {
            let mut state = self.state.lock().await;
            let out = f(&mut *state);
            state.reap_failed();
            (out, state.take_effects())
        };
        run_deferred(&self.ctx.id, effects).await;
        out
    }

    // ─── Messages ─────────────────────────────────────────────────────

    /// Handle one raw inbound frame from session `key`.
    pub async fn handle_data(&self, key: &str, raw: &str) -> Result<(), RoomError> {
        match decode_frame(raw) {
            Ok(Frame::Ping) => {
                let now = self.ctx.clock.now_ms();
                self.locked(|state| -> Result<(), RoomError> {
                    let session = state.sessions.get_mut(key).ok_or(RoomError::UnknownSession)?;
                    session.last_active_at = now;
                    if session.deliver_raw(PONG).is_err() {
                        state.failed.push(key.to_string());
                    }
                    Ok(())
                })
                .await
            }
            Ok(Frame::Messages(msgs)) => self.process_client_msgs(key, msgs).await,
            Err(e) => {
                log::debug!("Room {}: closing session on bad frame: {e}", self.ctx.id);
                self.end_browser_session(key, CloseReason::InvalidFormat).await;
                Ok(())
            }
        }
    }

    /// Apply a batch of messages from session `key` atomically.
    pub async fn process_client_msgs(&self, key: &str, msgs: Vec<ClientMsg>) -> Result<(), RoomError> {
        if !self.is_loaded() {
            self.load().await?;
        }
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending == self.ctx.config.hard_pending_limit {
            self.ctx.hooks.on_backpressure(&self.ctx.id, BackpressureLevel::Hard, pending);
        } else if pending == self.ctx.config.soft_pending_limit {
            self.ctx.hooks.on_backpressure(&self.ctx.id, BackpressureLevel::Soft, pending);
        }

        let (result, effects) = {
            let mut state = self.state.lock().await;
            let result = state.process_batch(key, msgs);
            state.reap_failed();
            (result, state.take_effects())
        };
        self.pending.fetch_sub(1, Ordering::SeqCst);

        run_deferred(&self.ctx.id, effects).await;
        result
    }

    // ─── Leased sessions ──────────────────────────────────────────────

    /// Create or refresh a leased session and announce its presence.
    pub async fn upsert_leased_session(
        &self,
        session_id: &str,
        presence: JsonObject,
        ttl_ms: u64,
        info: Value,
    ) -> Result<LeasedSession, RoomError> {
        self.locked(|state| state.upsert_leased(session_id, presence, ttl_ms, info))
            .await
    }

    /// Live leased sessions. Expired ones are deleted on the way, each with
    /// one USER_LEFT.
    pub async fn list_leased_sessions(&self) -> Result<Vec<LeasedSession>, RoomError> {
        self.locked(RoomState::scan_leased).await
    }

    /// Remove a leased session. Returns whether it existed.
    pub async fn delete_leased_session(&self, session_id: &str) -> Result<bool, RoomError> {
        self.locked(|state| -> Result<bool, RoomError> {
            let Some(existing) = state.ctx.driver.get_leased_session(&state.ctx.id, session_id)? else {
                return Ok(false);
            };
            state.ctx.driver.delete_leased_session(&state.ctx.id, session_id)?;
            log::info!("Room {}: leased session {session_id} removed", state.ctx.id);
            state.broadcast(None, &ServerMsg::UserLeft { actor: existing.actor });
            Ok(true)
        })
        .await
    }

    // ─── Inspection ───────────────────────────────────────────────────

    /// Current storage rows in root-first order.
    pub async fn storage_rows(&self) -> Result<Vec<(String, SerializedCrdt)>, RoomError> {
        let state = self.state.lock().await;
        let tree = state.storage.tree()?;
        Ok(tree.snapshot(false).to_vec())
    }

    /// Full state of the binary document.
    pub async fn ydoc_state(&self) -> Result<Vec<u8>, RoomError> {
        let state = self.state.lock().await;
        Ok(state.storage.ydoc()?.encode_state())
    }
}

/// State guarded by the room lock.
struct RoomState {
    ctx: RoomContext,
    storage: Storage,
    sessions: SessionRegistry,
    /// Sessions whose transport failed; closed at the end of the section.
    failed: Vec<String>,
    /// Hook futures to run after the lock is released.
    effects: Vec<Deferred>,
}

impl RoomState {
    fn take_effects(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.effects)
    }

    fn defer(&mut self, name: &'static str, future: Option<crate::hooks::HookFuture>) {
        if let Some(future) = future {
            self.effects.push(Deferred { name, future });
        }
    }

    // ─── Delivery ─────────────────────────────────────────────────────

    fn deliver(&mut self, key: &str, msg: &ServerMsg) {
        if self.failed.iter().any(|k| k == key) {
            return;
        }
        if let Some(session) = self.sessions.get_mut(key) {
            if let Err(e) = session.deliver(msg) {
                log::warn!("Room {}: send to actor {} failed: {e}", self.ctx.id, session.actor);
                self.failed.push(key.to_string());
            }
        }
    }

    fn deliver_to_actor(&mut self, actor: ActorId, msg: &ServerMsg) {
        if let Some(key) = self.sessions.by_actor(actor).map(|s| s.key().to_string()) {
            self.deliver(&key, msg);
        }
    }

    /// Send to every live session except `except`.
    fn broadcast(&mut self, except: Option<&str>, msg: &ServerMsg) {
        let mut failed = Vec::new();
        for session in self.sessions.iter_mut() {
            if except == Some(session.key()) || self.failed.iter().any(|k| k == session.key()) {
                continue;
            }
            if let Err(e) = session.deliver(msg) {
                log::warn!("Room {}: send to actor {} failed: {e}", self.ctx.id, session.actor);
                failed.push(session.key().to_string());
            }
        }
        self.failed.extend(failed);
    }

    /// Close sessions whose sends failed. Announcing one departure can fail
    /// another send, so this runs until nothing is left.
    fn reap_failed(&mut self) {
        while let Some(key) = self.failed.pop() {
            self.end_session(&key, &CloseReason::SendFailed);
        }
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    fn start_session(&mut self, ticket: Ticket, kind: SessionKind) -> Result<String, RoomError> {
        let now = self.ctx.clock.now_ms();
        if let Some(stale) = self.sessions.by_actor(ticket.actor).map(|s| s.key().to_string()) {
            log::info!("Room {}: actor {} reconnected, evicting old session", self.ctx.id, ticket.actor);
            self.end_session(&stale, &CloseReason::StaleConnection);
        }
        let leased = self.scan_leased()?;

        let session = Session::from_ticket(ticket, kind, now);
        let key = session.key().to_string();
        let actor = session.actor;

        let mut users: std::collections::BTreeMap<ActorId, UserEntry> = self
            .sessions
            .iter()
            .map(|s| {
                (
                    s.actor,
                    UserEntry {
                        id: s.user.id.clone(),
                        info: s.user.info.clone(),
                        scopes: s.scopes.clone(),
                    },
                )
            })
            .collect();
        for l in &leased {
            users.insert(
                l.actor,
                UserEntry {
                    id: Some(l.session_id.clone()),
                    info: l.info.clone(),
                    scopes: vec![LEASED_SESSION_SCOPE.to_string()],
                },
            );
        }
        let room_state = ServerMsg::RoomState {
            actor,
            nonce: key.clone(),
            scopes: session.scopes.clone(),
            users,
            meta: session.public_meta.clone(),
        };
        let joined = ServerMsg::UserJoined {
            actor,
            id: session.user.id.clone(),
            info: session.user.info.clone(),
            scopes: session.scopes.clone(),
        };
        let summary = summarize(&session);
        let backend = session.is_backend();
        self.sessions.insert(session);

        self.deliver(&key, &room_state);
        for l in leased {
            self.deliver(
                &key,
                &ServerMsg::UpdatePresence {
                    actor: l.actor,
                    data: l.presence,
                    target_actor: Some(actor),
                },
            );
        }
        self.broadcast(Some(&key), &joined);

        log::info!(
            "Room {}: actor {actor} joined ({} session, {} total)",
            self.ctx.id,
            if backend { "backend" } else { "browser" },
            self.sessions.len()
        );
        let started = self.ctx.hooks.on_session_started(&self.ctx.id, &summary);
        self.defer("on_session_started", started);
        Ok(key)
    }

    fn end_session(&mut self, key: &str, reason: &CloseReason) -> bool {
        let Some(session) = self.sessions.remove(key) else {
            return false;
        };
        session.close(reason);
        log::info!(
            "Room {}: actor {} left ({} {})",
            self.ctx.id,
            session.actor,
            reason.code(),
            reason.reason()
        );
        self.broadcast(None, &ServerMsg::UserLeft { actor: session.actor });
        let ended = self.ctx.hooks.on_session_ended(&self.ctx.id, &summarize(&session));
        self.defer("on_session_ended", ended);
        true
    }

    // ─── Messages ─────────────────────────────────────────────────────

    fn process_batch(&mut self, key: &str, msgs: Vec<ClientMsg>) -> Result<(), RoomError> {
        let now = self.ctx.clock.now_ms();
        let (actor, version, scopes) = {
            let session = self.sessions.get_mut(key).ok_or(RoomError::UnknownSession)?;
            session.last_active_at = now;
            (session.actor, session.version, session.scopes.clone())
        };
        log::debug!("Room {}: actor {actor} sent {} messages", self.ctx.id, msgs.len());

        let mut storage_updated = false;
        for msg in msgs {
            match msg {
                ClientMsg::UpdatePresence { data, target_actor } => {
                    self.relay_presence(key, actor, data, target_actor)
                }
                ClientMsg::BroadcastEvent { event } => {
                    self.broadcast(Some(key), &ServerMsg::BroadcastEvent { actor, event })
                }
                ClientMsg::FetchStorage => self.send_storage(key, version),
                ClientMsg::UpdateStorage { ops } => {
                    storage_updated |= self.apply_ops(key, actor, &scopes, ops);
                }
                ClientMsg::FetchYdoc { vector } => self.send_ydoc_diff(key, &vector),
                ClientMsg::UpdateYdoc { update } => self.apply_ydoc_update(key, update),
            }
        }

        if storage_updated {
            if let Err(e) = self.ctx.driver.bump_storage_version(&self.ctx.id) {
                log::error!("Room {}: failed to bump storage version: {e}", self.ctx.id);
            }
            let updated = self.ctx.hooks.on_storage_updated(&self.ctx.id);
            self.defer("on_storage_updated", updated);
        }
        Ok(())
    }

    fn relay_presence(&mut self, key: &str, actor: ActorId, data: JsonObject, target_actor: Option<ActorId>) {
        log::trace!("Room {}: presence from actor {actor}", self.ctx.id);
        match target_actor {
            Some(target) if target >= 0 => self.deliver_to_actor(
                target,
                &ServerMsg::UpdatePresence {
                    actor,
                    data,
                    target_actor: Some(target),
                },
            ),
            Some(_) => self.broadcast(
                Some(key),
                &ServerMsg::UpdatePresence {
                    actor,
                    data,
                    target_actor: Some(TARGET_EVERYONE),
                },
            ),
            None => self.broadcast(
                Some(key),
                &ServerMsg::UpdatePresence {
                    actor,
                    data,
                    target_actor: None,
                },
            ),
        }
    }

    fn send_storage(&mut self, key: &str, version: u32) {
        let tree = match self.storage.tree() {
            Ok(tree) => tree,
            Err(e) => {
                log::warn!("Room {}: cannot serve storage: {e}", self.ctx.id);
                return;
            }
        };
        if self.failed.iter().any(|k| k == key) {
            return;
        }
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let snapshot = tree.snapshot(self.ctx.config.low_memory_snapshots);
        let sent = if version >= STREAMING_STORAGE_VERSION {
            snapshot
                .chunks(self.ctx.config.storage_chunk_size)
                .try_for_each(|nodes| session.deliver(&ServerMsg::StorageChunk { nodes }))
                .and_then(|()| session.deliver(&ServerMsg::StorageStreamEnd))
        } else {
            session.deliver(&ServerMsg::InitialStorageState {
                items: snapshot.to_vec(),
            })
        };
        if let Err(e) = sent {
            log::warn!("Room {}: storage send to actor {} failed: {e}", self.ctx.id, session.actor);
            self.failed.push(key.to_string());
        }
    }

    /// Returns whether any op was accepted.
    fn apply_ops(&mut self, key: &str, actor: ActorId, scopes: &[String], ops: Vec<Op>) -> bool {
        let mut for_others = Vec::new();
        let mut for_sender = Vec::new();
        let mut rejects: Vec<(String, Vec<String>)> = Vec::new();

        for op in ops {
            let outcome = match self.ctx.hooks.authorize_op(&self.ctx.id, actor, scopes, &op) {
                Ok(()) => self.storage.apply_op(&op),
                Err(reason) => ApplyOutcome::Rejected {
                    op_id: op.op_id.clone(),
                    reason,
                },
            };
            match outcome {
                ApplyOutcome::Accepted { op, fix } => {
                    for_others.push(op.without_op_id());
                    for_sender.push(op);
                    if let Some(fix) = fix {
                        for_others.push(fix.without_op_id());
                        for_sender.push(fix);
                    }
                }
                ApplyOutcome::Ignored { op_id } => {
                    if let Some(op_id) = op_id {
                        for_sender.push(Op::ack(op_id));
                    }
                }
                ApplyOutcome::Rejected { op_id, reason } => {
                    log::debug!("Room {}: rejected op {op_id:?} from actor {actor}: {reason}", self.ctx.id);
                    match rejects.iter_mut().find(|entry| entry.0 == reason) {
                        Some(entry) => entry.1.extend(op_id),
                        None => rejects.push((reason, op_id.into_iter().collect())),
                    }
                }
            }
        }

        let accepted = !for_others.is_empty();
        if accepted {
            self.broadcast(Some(key), &ServerMsg::UpdateStorage { ops: for_others });
        }
        if !for_sender.is_empty() {
            self.deliver(key, &ServerMsg::UpdateStorage { ops: for_sender });
        }
        for (reason, op_ids) in rejects {
            self.deliver(key, &ServerMsg::RejectStorageOp { op_ids, reason });
        }
        accepted
    }

    fn send_ydoc_diff(&mut self, key: &str, vector: &str) {
        let vector = BASE64.decode(vector).unwrap_or_else(|e| {
            log::debug!("Room {}: bad state vector, sending full document: {e}", self.ctx.id);
            Vec::new()
        });
        let msg = match self.storage.ydoc() {
            Ok(ydoc) => ServerMsg::UpdateYdoc {
                update: BASE64.encode(ydoc.encode_diff(&vector)),
                is_sync: true,
                state_vector: Some(BASE64.encode(ydoc.state_vector())),
            },
            Err(e) => {
                log::warn!("Room {}: cannot serve ydoc: {e}", self.ctx.id);
                return;
            }
        };
        self.deliver(key, &msg);
    }

    fn apply_ydoc_update(&mut self, key: &str, update: String) {
        let bytes = match BASE64.decode(&update) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("Room {}: ydoc update is not base64: {e}", self.ctx.id);
                return;
            }
        };
        let applied = self
            .storage
            .ydoc_mut()
            .map_err(|e| e.to_string())
            .and_then(|ydoc| ydoc.apply_update(&bytes).map_err(|e| e.to_string()));
        match applied {
            Ok(()) => self.broadcast(
                Some(key),
                &ServerMsg::UpdateYdoc {
                    update,
                    is_sync: false,
                    state_vector: None,
                },
            ),
            Err(e) => log::debug!("Room {}: ydoc update dropped: {e}", self.ctx.id),
        }
    }

    // ─── Leased sessions ──────────────────────────────────────────────

    /// Live leased rows; expired ones are deleted and announced as left.
    fn scan_leased(&mut self) -> Result<Vec<LeasedSession>, RoomError> {
        let now = self.ctx.clock.now_ms();
        let rows = self.ctx.driver.list_leased_sessions(&self.ctx.id)?;
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            if row.is_expired(now) {
                log::info!("Room {}: leased session {} expired", self.ctx.id, row.session_id);
                if self.ctx.driver.delete_leased_session(&self.ctx.id, &row.session_id)? {
                    self.broadcast(None, &ServerMsg::UserLeft { actor: row.actor });
                }
            } else {
                live.push(row);
            }
        }
        Ok(live)
    }

    fn upsert_leased(
        &mut self,
        session_id: &str,
        presence: JsonObject,
        ttl_ms: u64,
        info: Value,
    ) -> Result<LeasedSession, RoomError> {
        let now = self.ctx.clock.now_ms();
        let driver = self.ctx.driver.clone();
        let room_id = self.ctx.id.clone();

        match driver.get_leased_session(&room_id, session_id)? {
            Some(mut live) if !live.is_expired(now) => {
                live.merge_presence(&presence);
                live.updated_at = now;
                live.ttl = ttl_ms;
                live.info = info;
                driver.put_leased_session(&room_id, &live)?;
                self.broadcast(
                    None,
                    &ServerMsg::UpdatePresence {
                        actor: live.actor,
                        data: presence,
                        target_actor: None,
                    },
                );
                Ok(live)
            }
            existing => {
                if let Some(expired) = existing {
                    driver.delete_leased_session(&room_id, session_id)?;
                    self.broadcast(None, &ServerMsg::UserLeft { actor: expired.actor });
                }
                let session = LeasedSession {
                    session_id: session_id.to_string(),
                    presence,
                    updated_at: now,
                    info,
                    ttl: ttl_ms,
                    actor: driver.next_actor(&room_id)?,
                };
                driver.put_leased_session(&room_id, &session)?;
                log::info!("Room {room_id}: leased session {session_id} joined as actor {}", session.actor);
                self.broadcast(
                    None,
                    &ServerMsg::UserJoined {
                        actor: session.actor,
                        id: Some(session.session_id.clone()),
                        info: session.info.clone(),
                        scopes: vec![LEASED_SESSION_SCOPE.to_string()],
                    },
                );
                self.broadcast(
                    None,
                    &ServerMsg::UpdatePresence {
                        actor: session.actor,
                        data: session.presence.clone(),
                        target_actor: Some(TARGET_EVERYONE),
                    },
                );
                Ok(session)
            }
        }
    }
}

fn summarize(session: &Session) -> SessionSummary {
    SessionSummary {
        actor: session.actor,
        user_id: session.user.id.clone(),
        info: session.user.info.clone(),
        scopes: session.scopes.clone(),
    }
}
