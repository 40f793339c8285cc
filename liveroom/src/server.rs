//! WebSocket server: one task per connection, one room per URL path.
//!
//! Architecture:
//! ```text
//! ws://host/{room}?name=&actor=&version=
//!        │
//!        ▼
//! ┌──────────────┐  handle_data(text)  ┌──────────┐
//! │ connection   │ ──────────────────► │ Room     │
//! │ task         │                     │ (locked) │
//! │   select! {  │ ◄─── mpsc ───────── │          │
//! │     read     │   ChannelTransport  └────┬─────┘
//! │     write    │                          │
//! │   }          │                          ▼
//! └──────────────┘                   ┌──────────────┐
//!                                    │ dyn Driver   │
//!                                    │ RocksDB/mem  │
//!                                    └──────────────┘
//! ```
//!
//! The room never awaits a socket: its transport only pushes onto an
//! unbounded channel that the connection task drains.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ActorId, ServerMsg, STREAMING_STORAGE_VERSION};
use crate::room::RoomConfig;
use crate::rooms::RoomManager;
use crate::session::{CloseReason, TicketOptions, Transport, TransportError, UserIdentity};
use crate::storage::{Driver, MemoryDriver, RocksDriver, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Settings for every room
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            room: RoomConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// What a client asked for in its connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: String,
    pub name: Option<String>,
    /// Actor to reclaim when reconnecting.
    pub actor: Option<ActorId>,
    pub version: u32,
}

impl ConnectParams {
    /// Parse `/{room_id}?name=...&actor=...&version=...`. Values are taken
    /// verbatim; unknown parameters are ignored.
    pub fn parse(path_and_query: &str) -> Result<Self, String> {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        let room_id = path.trim_matches('/');
        if room_id.is_empty() {
            return Err("missing room id".to_string());
        }

        let mut params = Self {
            room_id: room_id.to_string(),
            name: None,
            actor: None,
            version: STREAMING_STORAGE_VERSION,
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "name" => params.name = Some(value.to_string()),
                "actor" => {
                    params.actor = Some(value.parse().map_err(|_| format!("invalid actor `{value}`"))?)
                }
                "version" => {
                    params.version = value.parse().map_err(|_| format!("invalid version `{value}`"))?
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

/// Frames queued for a connection's writer.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close(CloseReason),
}

/// Room-facing half of a connection.
struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Transport for ChannelTransport {
    fn send(&self, msg: &ServerMsg) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(msg.encode()))
            .map_err(|_| TransportError::Closed)
    }

    fn send_raw(&self, text: &str) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, reason: &CloseReason) {
        let _ = self.tx.send(Outbound::Close(reason.clone()));
    }
}

/// The room server.
pub struct RoomServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RoomServer {
    /// Create a server, opening RocksDB when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let driver: Arc<dyn Driver> = match &config.storage_path {
            Some(path) => Arc::new(RocksDriver::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryDriver::new()),
        };
        Ok(Self::with_driver(config, driver))
    }

    pub fn with_driver(config: ServerConfig, driver: Arc<dyn Driver>) -> Self {
        let rooms = Arc::new(RoomManager::new(driver, config.room.clone()));
        Self::with_rooms(config, rooms)
    }

    /// Serve rooms from an existing manager (custom hooks or clock).
    pub fn with_rooms(config: ServerConfig, rooms: Arc<RoomManager>) -> Self {
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Room server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let mut target = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_default();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let params = match ConnectParams::parse(&target) {
            Ok(params) => params,
            Err(reason) => {
                log::warn!("Rejecting connection from {addr}: {reason}");
                ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: reason.into(),
                    })))
                    .await?;
                return Ok(());
            }
        };
        log::info!("WebSocket connection from {addr} for room {}", params.room_id);

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::run_session(&params, &mut ws_sender, &mut ws_receiver, &rooms, &stats).await;

        rooms.remove_if_empty(&params.room_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }
        result
    }

    async fn run_session<W, R>(
        params: &ConnectParams,
        ws_sender: &mut W,
        ws_receiver: &mut R,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError>
    where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let room = rooms.get_or_create(&params.room_id).await;
        room.load().await?;
        stats.write().await.active_rooms = rooms.room_count().await;

        let ticket = room.create_ticket(TicketOptions {
            actor: params.actor,
            version: params.version,
            user: UserIdentity {
                id: params.name.clone(),
                info: params
                    .name
                    .as_ref()
                    .map(|name| json!({ "name": name }))
                    .unwrap_or_else(|| json!({})),
            },
            ..TicketOptions::default()
        })?;
        let key = ticket.session_key().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        room.start_browser_session(ticket, Arc::new(ChannelTransport { tx }))
            .await?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            if let Err(e) = room.handle_data(&key, text.as_str()).await {
                                log::debug!("Room {}: {e}", params.room_id);
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            room.end_browser_session(&key, CloseReason::InvalidFormat).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed for room {}", params.room_id);
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error in room {}: {e}", params.room_id);
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing frames queued by the room
                out = rx.recv() => {
                    match out {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                                log::error!("Send failed in room {}: {e}", params.room_id);
                                break;
                            }
                        }
                        Some(Outbound::Close(reason)) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(reason.code()),
                                reason: reason.reason().to_string().into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(frame))).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // Dropping the receiver makes any later room send fail fast.
        drop(rx);
        room.end_browser_session(&key, CloseReason::Normal).await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get room manager reference.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
