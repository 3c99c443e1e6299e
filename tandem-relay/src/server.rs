//! WebSocket relay server: upgrade routing, connection lifecycle, and the
//! bridge between sockets and room sessions.
//!
//! Architecture:
//! ```text
//!                    ┌── /documents/… ───► RoomRegistry ─► DocRoom
//! TcpListener ── ws ─┤   /whiteboards/…
//!                    └── /signaling ─────► SignalingState
//! ```
//!
//! Each accepted connection gets a reader loop and a writer task joined by
//! an unbounded queue; room handlers enqueue without blocking and a dead
//! writer surfaces as a send failure on the next fan-out. A heartbeat ping
//! probes half-open sockets; a connection that misses a whole interval is
//! torn down through the same cleanup path as an explicit close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{ConnId, Outbound};
use crate::protocol::Frame;
use crate::room::{query_param, resolve_room, RoomId, RoomRegistry};
use crate::signaling::{ClientEvent, SignalingState};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Heartbeat probe interval in seconds
    pub heartbeat_interval_secs: u64,
    /// How long an empty document room may linger before eviction
    pub idle_room_grace_secs: u64,
    /// Whether connections without a resolvable room id fall back to the
    /// fixed default room. Multi-tenant deployments should turn this off.
    pub allow_default_room: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            idle_room_grace_secs: 300,
            allow_default_room: true,
        }
    }
}

/// Authorization hook consulted before any room state is touched: at
/// upgrade time for document rooms and at join time for signaling rooms.
pub trait RoomAuthorizer: Send + Sync {
    fn authorize(&self, room: &str, token: Option<&str>) -> bool;
}

/// Default authorizer: any holder of a room id may connect.
pub struct AllowAll;

impl RoomAuthorizer for AllowAll {
    fn authorize(&self, _room: &str, _token: Option<&str>) -> bool {
        true
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-wide counters; atomics so the message path never locks.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Point-in-time view of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

impl ServerStats {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_message(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Where an upgraded connection is headed.
#[derive(Debug, Clone, PartialEq)]
enum Endpoint {
    Document { room: RoomId, token: Option<String> },
    Signaling { token: Option<String> },
}

fn resolve_endpoint(uri: &Uri, allow_default: bool) -> Option<Endpoint> {
    let path = uri.path();
    let query = uri.query();
    let token = query
        .and_then(|q| query_param(q, "token"))
        .map(str::to_string);

    if path == "/signaling" || path.starts_with("/signaling/") {
        return Some(Endpoint::Signaling { token });
    }
    resolve_room(path, query, allow_default).map(|room| Endpoint::Document { room, token })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    signaling: Arc<Mutex<SignalingState>>,
    authorizer: Arc<dyn RoomAuthorizer>,
    stats: Arc<ServerStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RoomRegistry::new()),
            signaling: Arc::new(Mutex::new(SignalingState::new())),
            authorizer: Arc::new(AllowAll),
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Replace the authorization hook.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn RoomAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Accept connections until the task is dropped.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        self.spawn_eviction_sweep();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let signaling = self.signaling.clone();
            let authorizer = self.authorizer.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, registry, signaling, authorizer, config, stats,
                )
                .await
                {
                    log::debug!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    fn spawn_eviction_sweep(&self) {
        let registry = self.registry.clone();
        let grace = Duration::from_secs(self.config.idle_room_grace_secs);
        let period = (grace / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(period);
            sweep.tick().await;
            loop {
                sweep.tick().await;
                let evicted = registry.evict_idle(grace).await;
                if evicted > 0 {
                    log::info!("Evicted {evicted} idle rooms");
                }
            }
        });
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: std::net::SocketAddr,
        registry: Arc<RoomRegistry>,
        signaling: Arc<Mutex<SignalingState>>,
        authorizer: Arc<dyn RoomAuthorizer>,
        config: RelayConfig,
        stats: Arc<ServerStats>,
    ) -> Result<(), RelayError> {
        // Route (and possibly refuse) during the upgrade, before any room
        // state exists for this connection.
        let mut endpoint: Option<Endpoint> = None;
        let allow_default = config.allow_default_room;
        let auth = authorizer.clone();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| match resolve_endpoint(req.uri(), allow_default) {
                Some(ep) => {
                    if let Endpoint::Document { room, token } = &ep {
                        if !auth.authorize(&room.to_string(), token.as_deref()) {
                            log::warn!("Rejecting unauthorized connection to {room} from {addr}");
                            return Err(reject(StatusCode::UNAUTHORIZED, "not authorized"));
                        }
                    }
                    endpoint = Some(ep);
                    Ok(resp)
                }
                None => {
                    log::warn!("Rejecting unrecognized relay path from {addr}");
                    Err(reject(StatusCode::BAD_REQUEST, "unrecognized relay path"))
                }
            },
        )
        .await?;

        let Some(endpoint) = endpoint else {
            return Ok(());
        };

        stats.connection_opened();
        let result = match endpoint {
            Endpoint::Document { room, .. } => {
                Self::run_document_connection(ws_stream, addr, room, registry, &config, &stats)
                    .await
            }
            Endpoint::Signaling { token } => {
                Self::run_signaling_connection(
                    ws_stream, addr, token, signaling, authorizer, &config, &stats,
                )
                .await
            }
        };
        stats.connection_closed();
        result
    }

    async fn run_document_connection(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: std::net::SocketAddr,
        room_id: RoomId,
        registry: Arc<RoomRegistry>,
        config: &RelayConfig,
        stats: &ServerStats,
    ) -> Result<(), RelayError> {
        let conn_id = ConnId::new();
        log::info!("Document connection {conn_id} from {addr} for {room_id}");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound, mut out_rx) = Outbound::channel();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let room = registry.get_or_create(&room_id).await;
        room.lock().await.connect(conn_id, outbound.clone());

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
        heartbeat.tick().await;
        let mut alive = true;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        alive = true;
                        stats.record_message(data.len());
                        match Frame::decode(&data) {
                            Ok(Frame::Sync(payload)) => {
                                room.lock().await.handle_sync(conn_id, payload);
                            }
                            Ok(Frame::Awareness(update)) => {
                                room.lock().await.handle_awareness(conn_id, &update);
                            }
                            Err(e) => {
                                log::warn!("Dropping malformed frame from {conn_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        alive = true;
                        outbound.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Close(_))) | None => break,
                    // Text frames are not part of the document protocol
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {conn_id}: {e}");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if !alive {
                        log::info!("Connection {conn_id} missed heartbeat, closing");
                        break;
                    }
                    alive = false;
                    if !outbound.send(Message::Ping(Vec::new().into())) {
                        break;
                    }
                }
            }
        }

        room.lock().await.disconnect(conn_id);
        drop(outbound);
        let _ = writer.await;
        Ok(())
    }

    async fn run_signaling_connection(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: std::net::SocketAddr,
        token: Option<String>,
        signaling: Arc<Mutex<SignalingState>>,
        authorizer: Arc<dyn RoomAuthorizer>,
        config: &RelayConfig,
        stats: &ServerStats,
    ) -> Result<(), RelayError> {
        let conn_id = ConnId::new();
        log::info!("Signaling connection {conn_id} from {addr}");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound, mut out_rx) = Outbound::channel();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        signaling.lock().await.register(conn_id, outbound.clone());

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
        heartbeat.tick().await;
        let mut alive = true;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        alive = true;
                        stats.record_message(text.len());
                        match serde_json::from_str::<ClientEvent>(text.as_str()) {
                            Ok(ClientEvent::JoinRoom { room_name, .. })
                                if !authorizer.authorize(&room_name, token.as_deref()) =>
                            {
                                log::warn!(
                                    "Dropping unauthorized join to {room_name} from {conn_id}"
                                );
                            }
                            Ok(event) => {
                                signaling.lock().await.handle_event(conn_id, event);
                            }
                            Err(e) => {
                                log::warn!("Dropping malformed signaling event from {conn_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        alive = true;
                        outbound.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Close(_))) | None => break,
                    // Binary frames are not part of the signaling protocol
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {conn_id}: {e}");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if !alive {
                        log::info!("Connection {conn_id} missed heartbeat, closing");
                        break;
                    }
                    alive = false;
                    if !outbound.send(Message::Ping(Vec::new().into())) {
                        break;
                    }
                }
            }
        }

        signaling.lock().await.disconnect(conn_id);
        drop(outbound);
        let _ = writer.await;
        Ok(())
    }
}
