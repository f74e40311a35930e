//! WebSocket Sync Server
//!
//! Accepts WebSocket connections, authenticates them from the upgrade
//! request, and runs one read task plus one write task per connection. All
//! interpretation of frames happens in the coordinator; this module only
//! moves text between sockets and channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::new_connection_id;
use crate::network::coordinator::SyncCoordinator;
use crate::session::manager::{SessionManager, SyncConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Declare sessions on first join instead of requiring a prior
    /// declaration. Meant for development setups without a lobby service.
    pub auto_create_sessions: bool,
    /// Session and sync tuning.
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            auto_create_sessions: false,
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration from `TABLETOP_SYNC_*` environment variables, with
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("TABLETOP_SYNC_BIND") {
            if let Ok(addr) = value.parse() {
                config.bind_addr = addr;
            }
        }
        if let Ok(value) = std::env::var("TABLETOP_SYNC_MAX_CONNECTIONS") {
            if let Ok(limit) = value.parse() {
                config.max_connections = limit;
            }
        }
        if let Ok(value) = std::env::var("TABLETOP_SYNC_AUTO_CREATE") {
            config.auto_create_sessions = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var("TABLETOP_SYNC_HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse() {
                config.sync.heartbeat_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(value) = std::env::var("TABLETOP_SYNC_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse() {
                config.sync.session_idle_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(value) = std::env::var("TABLETOP_SYNC_REPLAY_CAPACITY") {
            if let Ok(capacity) = value.parse() {
                config.sync.replay_capacity = capacity;
            }
        }
        config
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listen address.
    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

// =============================================================================
// AUTHENTICATION
// =============================================================================

/// Identity a connection proved during the upgrade.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Verified user.
    pub user_id: String,
    /// Session the user is joining.
    pub session_id: String,
}

/// Resolves the upgrade request's query string to an identity.
///
/// This is the seam for real credential checks; deployments plug in a
/// verifier for their tokens. Returning `None` rejects the upgrade with
/// a 401 before the WebSocket is established.
pub trait Authenticator: Send + Sync {
    /// Identity for this query string, or `None` to reject.
    fn authenticate(&self, query: Option<&str>) -> Option<ClientIdentity>;
}

/// Trusts `user` and `session` query parameters as-is.
///
/// Also accepts the wire-style spellings `userId` and `sessionId`. Suitable
/// for development and tests only.
#[derive(Debug, Default)]
pub struct QueryAuthenticator;

impl Authenticator for QueryAuthenticator {
    fn authenticate(&self, query: Option<&str>) -> Option<ClientIdentity> {
        let query = query?;
        let mut user_id = None;
        let mut session_id = None;
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "user" | "userId" => user_id = Some(value.to_string()),
                "session" | "sessionId" => session_id = Some(value.to_string()),
                _ => {}
            }
        }
        Some(ClientIdentity {
            user_id: user_id?,
            session_id: session_id?,
        })
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    coordinator: Arc<SyncCoordinator>,
    auth: Arc<dyn Authenticator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Server with a permissive action applier and query-string auth.
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(config.sync.clone()));
        Self::with_sessions(config, sessions)
    }

    /// Server over a caller-built session manager (custom applier, shared
    /// ownership with other components).
    pub fn with_sessions(config: ServerConfig, sessions: Arc<SessionManager>) -> Self {
        let coordinator = Arc::new(SyncCoordinator::new(Arc::clone(&sessions)));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sessions,
            coordinator,
            auth: Arc::new(QueryAuthenticator),
            shutdown_tx,
        }
    }

    /// Replace the authenticator.
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// The session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Registered connection count.
    pub async fn connection_count(&self) -> usize {
        self.coordinator.connection_count().await
    }

    /// Declared session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.declared_count().await
    }

    /// Run the accept loop until shutdown.
    #[instrument(skip_all, fields(bind_addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("sync server listening on {}", self.config.bind_addr);

        let maintenance = tokio::spawn(
            Arc::clone(&self.coordinator).run_maintenance(self.shutdown_tx.subscribe()),
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.coordinator.connection_count().await >= self.config.max_connections {
                                warn!(%addr, "connection limit reached, rejecting");
                                continue;
                            }
                            debug!(%addr, "incoming connection");
                            self.handle_connection(stream, addr);
                        }
                        Err(err) => {
                            error!(error = %err, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        maintenance.abort();
        Ok(())
    }

    /// Drive one connection: authenticate during the upgrade, register with
    /// the coordinator, then pump frames both ways until close or shutdown.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let coordinator = Arc::clone(&self.coordinator);
        let sessions = Arc::clone(&self.sessions);
        let auth = Arc::clone(&self.auth);
        let auto_create = self.config.auto_create_sessions;
        let outbound_buffer = self.config.sync.outbound_buffer;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut identity_slot = None;
            let callback = |request: &Request, response: Response| {
                match auth.authenticate(request.uri().query()) {
                    Some(identity) => {
                        identity_slot = Some(identity);
                        Ok(response)
                    }
                    None => {
                        let mut rejection =
                            ErrorResponse::new(Some("missing or invalid credentials".to_string()));
                        *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                        Err(rejection)
                    }
                }
            };
            let mut ws_stream = match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(err) => {
                    debug!(%addr, error = %err, "handshake failed");
                    return;
                }
            };
            let Some(identity) = identity_slot else {
                return;
            };

            if auto_create {
                sessions.create_session(&identity.session_id).await;
            }

            let connection_id = new_connection_id();
            let (out_tx, mut out_rx) = mpsc::channel::<String>(outbound_buffer);
            if let Err(err) = coordinator
                .register_connection(connection_id, &identity.user_id, &identity.session_id, out_tx)
                .await
            {
                warn!(%addr, user_id = %identity.user_id, error = %err, "registration refused");
                let _ = ws_stream.close(None).await;
                return;
            }

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let writer = tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                coordinator.handle_message(connection_id, &text).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                // Some clients ship JSON in binary frames.
                                match String::from_utf8(data) {
                                    Ok(text) => {
                                        coordinator.handle_message(connection_id, &text).await;
                                    }
                                    Err(_) => {
                                        debug!(%addr, "non-utf8 binary frame dropped");
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                coordinator.registry().touch(connection_id).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(%addr, "client closed");
                                break;
                            }
                            Some(Err(err)) => {
                                debug!(%addr, error = %err, "read error");
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(%addr, "closing for shutdown");
                        break;
                    }
                }
            }

            coordinator.disconnect(connection_id).await;
            writer.abort();
        });
    }

    /// Ask the accept loop, connection tasks, and maintenance loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
