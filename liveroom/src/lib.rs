//! # liveroom - Real-time collaboration room engine
//!
//! Hosts rooms where many users edit one shared document tree, see each
//! other's presence, and exchange events over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    JSON frames     ┌─────────────┐
//! │ Browser     │ ◄────────────────► │ RoomServer  │
//! │ (per user)  │     WebSocket      │ (per conn)  │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                    ┌──────┴──────┐
//!                                    │ RoomManager │
//!                                    └──────┬──────┘
//!                                           ▼
//!                    ┌─────────────────────────────────────────┐
//!                    │ Room (one lock)                         │
//!                    │   sessions ── presence / event fan-out  │
//!                    │   Storage  ── node tree + Yjs document  │
//!                    │   leased sessions (TTL presence)        │
//!                    └──────────────────┬──────────────────────┘
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │ dyn Driver      │
//!                              │ RocksDB / memory│
//!                              └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Client/server JSON messages and storage ops
//! - [`room`]: The per-room orchestrator
//! - [`rooms`]: Room lookup and unloading
//! - [`session`]: Tickets, sessions, transports
//! - [`leased`]: Server-held sessions with a TTL
//! - [`hooks`]: Authorization and lifecycle callbacks
//! - [`storage`]: Node tree, self-healing load, drivers
//! - [`server`]: WebSocket adapter

pub mod clock;
pub mod hooks;
pub mod leased;
pub mod protocol;
pub mod room;
pub mod rooms;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use hooks::{BackpressureLevel, DefaultHooks, HookError, RoomHooks, SessionSummary};
pub use leased::LeasedSession;
pub use protocol::{ActorId, ClientMsg, CrdtType, Op, OpKind, ProtocolError, SerializedCrdt, ServerMsg};
pub use room::{Room, RoomConfig, RoomError};
pub use rooms::RoomManager;
pub use server::{ConnectParams, RoomServer, ServerConfig, ServerStats};
pub use session::{CloseReason, RecordingTransport, Ticket, TicketOptions, Transport, UserIdentity};
pub use storage::{Driver, MemoryDriver, RocksDriver, StoreConfig, StoreError};
