//! Tickets, sessions and the per-room session registry.
//!
//! ```text
//! create_ticket ──► Ticket ──► start_*_session ──► Session ──► end / evict / send failure
//!                     │                                            │
//!                     └── dropped unused: no side effect           └── USER_LEFT broadcast
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ActorId, JsonObject, ServerMsg};

/// Why a session's transport is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    InvalidFormat,
    StaleConnection,
    SendFailed,
    Custom { code: u16, reason: String },
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::InvalidFormat => 4000,
            CloseReason::StaleConnection => 4011,
            CloseReason::SendFailed => 1011,
            CloseReason::Custom { code, .. } => *code,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            CloseReason::Normal => "",
            CloseReason::InvalidFormat => "Invalid message format",
            CloseReason::StaleConnection => "Closed stale connection",
            CloseReason::SendFailed => "Send failed",
            CloseReason::Custom { reason, .. } => reason,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
}

/// Outbound half of a browser connection. Sends must not block; an adapter
/// queues the frame and writes it from its own task.
pub trait Transport: Send + Sync {
    fn send(&self, msg: &ServerMsg) -> Result<(), TransportError>;

    /// A non-JSON frame (the heartbeat reply).
    fn send_raw(&self, text: &str) -> Result<(), TransportError>;

    fn close(&self, reason: &CloseReason);
}

/// Who a participant is, as shown to others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserIdentity {
    pub id: Option<String>,
    pub info: Value,
}

/// Request for a ticket.
#[derive(Debug, Clone, Default)]
pub struct TicketOptions {
    /// Reuse this actor (reconnect) instead of allocating a new one.
    pub actor: Option<ActorId>,
    pub version: u32,
    pub user: UserIdentity,
    /// `None` grants the room's default scopes.
    pub scopes: Option<Vec<String>>,
    pub public_meta: JsonObject,
}

/// Single-use credential for starting a session.
#[derive(Debug, Clone)]
pub struct Ticket {
    session_key: String,
    pub actor: ActorId,
    pub version: u32,
    pub user: UserIdentity,
    pub scopes: Vec<String>,
    pub public_meta: JsonObject,
}

impl Ticket {
    pub(crate) fn new(
        actor: ActorId,
        version: u32,
        user: UserIdentity,
        scopes: Vec<String>,
        public_meta: JsonObject,
    ) -> Self {
        Self {
            session_key: Uuid::new_v4().to_string(),
            actor,
            version,
            user,
            scopes,
            public_meta,
        }
    }

    /// Private nonce identifying the session. Never shown to other users.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

pub enum SessionKind {
    Browser(Arc<dyn Transport>),
    /// Replies pile up until the owner drains them.
    Backend(Vec<ServerMsg>),
}

pub struct Session {
    key: String,
    pub actor: ActorId,
    pub version: u32,
    pub user: UserIdentity,
    pub scopes: Vec<String>,
    pub public_meta: JsonObject,
    pub created_at: u64,
    pub last_active_at: u64,
    pub kind: SessionKind,
}

impl Session {
    pub fn from_ticket(ticket: Ticket, kind: SessionKind, now_ms: u64) -> Self {
        Self {
            key: ticket.session_key,
            actor: ticket.actor,
            version: ticket.version,
            user: ticket.user,
            scopes: ticket.scopes,
            public_meta: ticket.public_meta,
            created_at: now_ms,
            last_active_at: now_ms,
            kind,
        }
    }

    /// The session's nonce. Only the room and the session's owner see it.
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub fn is_backend(&self) -> bool {
        matches!(self.kind, SessionKind::Backend(_))
    }

    pub fn deliver(&mut self, msg: &ServerMsg) -> Result<(), TransportError> {
        match &mut self.kind {
            SessionKind::Browser(transport) => transport.send(msg),
            SessionKind::Backend(buffer) => {
                buffer.push(msg.clone());
                Ok(())
            }
        }
    }

    pub fn deliver_raw(&mut self, text: &str) -> Result<(), TransportError> {
        match &self.kind {
            SessionKind::Browser(transport) => transport.send_raw(text),
            SessionKind::Backend(_) => Ok(()),
        }
    }

    pub fn close(&self, reason: &CloseReason) {
        if let SessionKind::Browser(transport) = &self.kind {
            transport.close(reason);
        }
    }

    pub fn take_buffered(&mut self) -> Vec<ServerMsg> {
        match &mut self.kind {
            SessionKind::Backend(buffer) => std::mem::take(buffer),
            SessionKind::Browser(_) => Vec::new(),
        }
    }
}

/// Live sessions of a room, by key and by actor. Iteration is in actor order.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<ActorId, Session>,
    actors: FxHashMap<String, ActorId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register `session`. The caller evicts any holder of the actor first.
    pub fn insert(&mut self, session: Session) {
        self.actors.insert(session.key.clone(), session.actor);
        self.sessions.insert(session.actor, session);
    }

    pub fn get(&self, key: &str) -> Option<&Session> {
        self.actors.get(key).and_then(|a| self.sessions.get(a))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Session> {
        let actor = *self.actors.get(key)?;
        self.sessions.get_mut(&actor)
    }

    pub fn by_actor(&self, actor: ActorId) -> Option<&Session> {
        self.sessions.get(&actor)
    }

    pub fn remove(&mut self, key: &str) -> Option<Session> {
        let actor = self.actors.remove(key)?;
        self.sessions.remove(&actor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }
}

// ─── Recording transport ──────────────────────────────────────────────

/// Process-wide order of recorded events, so tests can compare what
/// different transports saw and when.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMsg),
    Raw(String),
    Close { code: u16, reason: String },
}

#[derive(Default)]
struct Recording {
    events: Vec<(u64, TransportEvent)>,
    closed: bool,
    failing: bool,
}

/// Transport that records everything sent to it. Used by tests and by
/// embedders that poll instead of pushing.
#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recording>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later send fail.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Events with their global sequence numbers.
    pub fn events(&self) -> Vec<(u64, TransportEvent)> {
        self.lock().events.clone()
    }

    pub fn messages(&self) -> Vec<ServerMsg> {
        self.lock()
            .events
            .iter()
            .filter_map(|(_, e)| match e {
                TransportEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Take and clear the recorded messages.
    pub fn drain(&self) -> Vec<ServerMsg> {
        let events = std::mem::take(&mut self.lock().events);
        events
            .into_iter()
            .filter_map(|(_, e)| match e {
                TransportEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn close_event(&self) -> Option<(u64, u16, String)> {
        self.lock().events.iter().find_map(|(seq, e)| match e {
            TransportEvent::Close { code, reason } => Some((*seq, *code, reason.clone())),
            _ => None,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: TransportEvent) -> Result<(), TransportError> {
        let mut rec = self.lock();
        if rec.closed {
            return Err(TransportError::Closed);
        }
        if rec.failing {
            return Err(TransportError::Send("simulated failure".into()));
        }
        rec.events.push((EVENT_SEQ.fetch_add(1, Ordering::SeqCst), event));
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, msg: &ServerMsg) -> Result<(), TransportError> {
        self.record(TransportEvent::Message(msg.clone()))
    }

    fn send_raw(&self, text: &str) -> Result<(), TransportError> {
        self.record(TransportEvent::Raw(text.to_string()))
    }

    fn close(&self, reason: &CloseReason) {
        let mut rec = self.lock();
        if rec.closed {
            return;
        }
        rec.closed = true;
        rec.events.push((
            EVENT_SEQ.fetch_add(1, Ordering::SeqCst),
            TransportEvent::Close {
                code: reason.code(),
                reason: reason.reason().to_string(),
            },
        ));
    }
}
