//! WebSocket Game Server
//!
//! Accepts connections, authenticates them during the upgrade, and runs
//! one receive loop plus one writer task per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::game::state::PlayerId;
use crate::network::auth::{authenticate_user, AuthConfig, AuthError, Principal};
use crate::network::protocol::{ClientMessage, DecodeError, ServerMessage};
use crate::network::registry::{Connection, ConnectionId, EvictionPolicy, SessionRegistry};

/// Path the WebSocket endpoint is served on.
pub const WS_PATH: &str = "/ws";

/// Query parameter carrying a raw token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound messages buffered per connection before it counts as stalled.
    pub outbound_queue_capacity: usize,
    /// Game eviction rules.
    pub eviction: EvictionPolicy,
    /// How often the reaper runs.
    pub reaper_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_queue_capacity: 64,
            eviction: EvictionPolicy::default(),
            reaper_interval: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Shortest reaper period; `tokio::time::interval` rejects zero.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

impl ServerConfig {
    /// Create config from environment variables, defaulting what is unset.
    pub fn from_env() -> Result<Self, GameServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from a key lookup, defaulting what is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GameServerError> {
        let defaults = Self::default();
        let reaper_interval =
            parse_secs_or(&lookup, "REAPER_INTERVAL_SECS", defaults.reaper_interval)?;
        if reaper_interval.is_zero() {
            return Err(GameServerError::Config(
                "REAPER_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections)?,
            outbound_queue_capacity: parse_or(
                &lookup,
                "OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            )?
            .max(1),
            eviction: EvictionPolicy {
                finished_game_ttl: parse_secs_or(
                    &lookup,
                    "FINISHED_GAME_TTL_SECS",
                    defaults.eviction.finished_game_ttl,
                )?,
                abandoned_game_ttl: parse_secs_or(
                    &lookup,
                    "ABANDONED_GAME_TTL_SECS",
                    defaults.eviction.abandoned_game_ttl,
                )?,
            },
            reaper_interval,
            version: defaults.version,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, GameServerError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GameServerError::Config(format!("{} has invalid value {:?}", key, raw))),
        None => Ok(default),
    }
}

fn parse_secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, GameServerError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Why a receive loop stopped.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    /// Frame was not a JSON envelope.
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// Binary frame with non-UTF-8 content.
    #[error("binary frame is not UTF-8")]
    NotUtf8,

    /// Writer task is gone.
    #[error("outbound queue closed")]
    OutboundClosed,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Token verification settings.
    auth: Arc<AuthConfig>,
    /// Connections and games.
    registry: Arc<SessionRegistry>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, auth: AuthConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            auth: Arc::new(auth),
            registry: Arc::new(SessionRegistry::new()),
            shutdown_tx,
        }
    }

    /// Shared registry handle.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections on `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let reaper_registry = self.registry.clone();
        let policy = self.config.eviction.clone();
        let reaper_interval = self.config.reaper_interval;

        let reaper_handle = tokio::spawn(async move {
            Self::run_reaper_loop(reaper_registry, policy, reaper_interval).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.registry.connection_count().await;
                            if count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        reaper_handle.abort();
        Ok(())
    }

    /// Handle a new TCP connection: upgrade, authenticate, run.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let auth = self.auth.clone();
        let capacity = self.config.outbound_queue_capacity;
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut principal = None;
            let callback = |req: &Request, resp: Response| {
                authorize_upgrade(req, &auth, addr).map(|p| {
                    principal = Some(p);
                    resp
                })
            };

            let ws_stream = match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("WebSocket upgrade refused for {}: {}", addr, e);
                    return;
                }
            };
            let Some(principal) = principal else {
                return;
            };

            let (ws_sender, ws_receiver) = ws_stream.split();
            let (msg_tx, msg_rx) = mpsc::channel::<ServerMessage>(capacity);

            let conn = Connection::new(principal.player_id(), msg_tx.clone());
            let session = ClientSession {
                player_id: conn.player_id.clone(),
                conn_id: conn.id,
                sender: msg_tx,
                registry: registry.clone(),
            };
            let closed = conn.closed_signal();
            info!(
                player_id = %session.player_id,
                conn_id = %session.conn_id,
                connected_at = %conn.connected_at,
                remote_addr = %addr,
                "WebSocket connection authenticated"
            );
            registry.register_connection(conn).await;

            tokio::spawn(run_writer(ws_sender, msg_rx, session.player_id.clone()));

            session.run(ws_receiver, closed, shutdown_rx).await;
            registry
                .unregister_connection(&session.player_id, session.conn_id)
                .await;
        });
    }

    /// Periodically drop finished and abandoned games.
    async fn run_reaper_loop(
        registry: Arc<SessionRegistry>,
        policy: EvictionPolicy,
        period: Duration,
    ) {
        let mut interval = interval(period.max(MIN_REAPER_INTERVAL));

        loop {
            interval.tick().await;
            registry.evict_stale_games(Instant::now(), &policy).await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    /// Get in-memory game count.
    pub async fn game_count(&self) -> usize {
        self.registry.game_count().await
    }
}

// =============================================================================
// UPGRADE AUTHENTICATION
// =============================================================================

/// Credential from the `Authorization` header, else from `?token=`.
fn extract_credential(req: &Request) -> Option<String> {
    if let Some(header) = req.headers().get(AUTHORIZATION) {
        return header.to_str().ok().map(str::to_string);
    }

    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| *key == TOKEN_QUERY_PARAM)
        .map(|(_, token)| format!("Bearer {}", token))
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Decide an upgrade request before any connection state exists.
fn authorize_upgrade(
    req: &Request,
    auth: &AuthConfig,
    addr: SocketAddr,
) -> Result<Principal, ErrorResponse> {
    if req.uri().path() != WS_PATH {
        debug!("Upgrade on unknown path {} from {}", req.uri().path(), addr);
        return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
    }

    extract_credential(req)
        .ok_or(AuthError::MissingCredentials)
        .and_then(|credential| authenticate_user(&credential, auth))
        .map_err(|e| {
            warn!(remote_addr = %addr, error = %e, "Failed to authenticate WebSocket connection");
            reject(StatusCode::UNAUTHORIZED, "Unauthorized")
        })
}

// =============================================================================
// PER-CONNECTION TASKS
// =============================================================================

/// Single writer for a connection's transport.
async fn run_writer(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut msg_rx: mpsc::Receiver<ServerMessage>,
    player_id: PlayerId,
) {
    while let Some(msg) = msg_rx.recv().await {
        let text = match msg.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };
        if let Err(e) = ws_sender.send(Message::Text(text)).await {
            debug!(player_id = %player_id, error = %e, "Write failed, stopping writer");
            return;
        }
    }

    // All senders gone: the connection is finished
    let _ = ws_sender.close().await;
}

/// Receive side of one authenticated connection.
struct ClientSession {
    player_id: PlayerId,
    conn_id: ConnectionId,
    /// Clone of the outbound queue, for replies to this connection only.
    sender: mpsc::Sender<ServerMessage>,
    registry: Arc<SessionRegistry>,
}

impl ClientSession {
    /// Read frames until close, transport error, eviction or shutdown.
    async fn run(
        &self,
        mut ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
        closed: Arc<Notify>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    let result = match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => self.handle_text(&text).await,
                            Err(_) => Err(ConnectionError::NotUtf8),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            info!(player_id = %self.player_id, "WebSocket connection closed normally");
                            break;
                        }
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => {
                            error!(player_id = %self.player_id, error = %e, "Unexpected WebSocket closure");
                            break;
                        }
                    };

                    if let Err(e) = result {
                        warn!(player_id = %self.player_id, error = %e, "Dropping connection");
                        break;
                    }
                }
                _ = closed.notified() => {
                    info!(player_id = %self.player_id, conn_id = %self.conn_id, "Connection dropped by registry");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    }

    /// Decode one frame and act on it.
    async fn handle_text(&self, text: &str) -> Result<(), ConnectionError> {
        match ClientMessage::from_json(text) {
            Ok(msg) => {
                debug!(
                    player_id = %self.player_id,
                    game_id = msg.game_id(),
                    message_type = msg.kind(),
                    "Received message"
                );
                self.dispatch(msg).await
            }
            Err(DecodeError::Malformed(e)) => Err(ConnectionError::Decode(e)),
            Err(rejected) => {
                warn!(player_id = %self.player_id, error = %rejected, "Rejected message");
                match rejected.reply() {
                    Some(reply) => self.reply(reply).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Run a decoded message against the registry.
    async fn dispatch(&self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg {
            ClientMessage::CreateGame { game_id } => {
                let symbol = self.registry.create_game(&game_id, &self.player_id).await;
                self.registry
                    .associate_game(&self.player_id, self.conn_id, &game_id, symbol)
                    .await;
                self.registry.broadcast_game_state(&game_id).await;
            }
            ClientMessage::JoinGame { game_id } => {
                match self.registry.join_game(&game_id, &self.player_id).await {
                    Ok(symbol) => {
                        self.registry
                            .associate_game(&self.player_id, self.conn_id, &game_id, symbol)
                            .await;
                        self.registry.broadcast_game_state(&game_id).await;
                    }
                    Err(e) => return self.reply(ServerMessage::game_error(game_id, &e)).await,
                }
            }
            ClientMessage::MakeMove { game_id, data } => {
                match self
                    .registry
                    .make_move(&game_id, &self.player_id, data.position)
                    .await
                {
                    Ok(_) => {
                        self.registry.broadcast_game_state(&game_id).await;
                    }
                    Err(e) => return self.reply(ServerMessage::game_error(game_id, &e)).await,
                }
            }
        }
        Ok(())
    }

    async fn reply(&self, msg: ServerMessage) -> Result<(), ConnectionError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| ConnectionError::OutboundClosed)
    }
}
