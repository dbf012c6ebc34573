//! WebSocket server implementation
//!
//! Listens for terminal clients, routes their requests to the session registry
//! and forwards room events back to each connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{
    ClientEnvelope, ClientMessage, ServerMessage, SessionSummary, DEFAULT_HISTORY_LINES,
};
use crate::bridge::{
    self, room_session, session_room, Bridge, BridgeEvent, ConnectionId, ScrollTimings,
    DEFAULT_CONNECTION_CAPACITY,
};
use crate::pty::TerminalSize;
use crate::registry::{RegistryError, RegistryResult, SessionRegistry};
use crate::session::{SessionDescriptor, SessionOptions};

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Size used when a create request omits dimensions
    pub default_size: TerminalSize,
    /// Working directory used when a create request omits one
    pub default_cwd: PathBuf,
    /// Capacity of each connection's event channel
    pub connection_capacity: usize,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            default_size: TerminalSize::default(),
            default_cwd: std::env::temp_dir(),
            connection_capacity: DEFAULT_CONNECTION_CAPACITY,
        }
    }

    pub fn with_default_size(mut self, cols: u16, rows: u16) -> Self {
        self.default_size = TerminalSize { cols, rows };
        self
    }

    pub fn with_default_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.default_cwd = cwd.into();
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// State shared by every connection
pub struct ServerContext {
    registry: Arc<SessionRegistry>,
    bridge: Arc<Bridge>,
    config: ServerConfig,
    scroll: ScrollTimings,
}

impl ServerContext {
    pub fn new(registry: Arc<SessionRegistry>, bridge: Arc<Bridge>, config: ServerConfig) -> Self {
        Self {
            registry,
            bridge,
            config,
            scroll: ScrollTimings::default(),
        }
    }

    fn session_options(&self, cwd: Option<&str>, cols: Option<u16>, rows: Option<u16>) -> SessionOptions {
        let cwd = cwd
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.default_cwd.clone());
        SessionOptions::new(cwd).with_size(
            cols.unwrap_or(self.config.default_size.cols),
            rows.unwrap_or(self.config.default_size.rows),
        )
    }

    /// tmux name of a session, whether or not a handle exists for it
    async fn external_name(&self, session_id: &str) -> RegistryResult<String> {
        if let Some(handle) = self.registry.get(session_id).await {
            return Ok(handle.external_name().to_string());
        }
        let report = self.registry.status(session_id).await;
        match report.external_name {
            Some(name) if report.external_exists => Ok(name),
            _ => Err(RegistryError::NotFound(session_id.to_string())),
        }
    }
}

/// One client connection's identity and event channel
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub events: mpsc::Sender<BridgeEvent>,
}

/// WebSocket server for terminal clients
pub struct WebSocketServer {
    context: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(context: ServerContext) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            context: Arc::new(context),
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver (for external components to listen for shutdown)
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.context.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener` and handle them concurrently.
    ///
    /// Returns once a shutdown signal is received.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let context = Arc::clone(&self.context);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, context, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.context.registry.len().await;
        if session_count > 0 {
            info!("{} sessions still attached", session_count);
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ServerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    // Upgrade to WebSocket
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (events_tx, mut events_rx) = mpsc::channel(context.config.connection_capacity);
    let connection = Connection {
        id: Uuid::new_v4(),
        events: events_tx,
    };

    // Send welcome message
    let welcome = ServerMessage::welcome_with_id(connection.id.to_string());
    ws_sender
        .send(Message::Text(serde_json::to_string(&welcome)?))
        .await?;
    debug!("Sent welcome message to {}", peer_addr);

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                // Receive messages from client
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {} bytes", peer_addr, text.len());
                            if let Some(response) = handle_message(&text, &connection, &context).await {
                                ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await?;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Connection closed by {}", peer_addr);
                            break;
                        }
                    }
                }
                // Forward room events
                Some(event) = events_rx.recv() => {
                    let message = ServerMessage::from(event);
                    ws_sender.send(Message::Text(serde_json::to_string(&message)?)).await?;
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    // Sessions outlive their viewers; only room membership ends here
    let left = context.bridge.rooms().leave_all(connection.id).await;
    debug!(connection = %connection.id, "Left {} rooms", left.len());
    info!("Connection from {} closed", peer_addr);
    result
}

/// Handle a client message and return the response, if any.
///
/// Successful terminal input has no response; its effect shows up as output.
pub async fn handle_message(
    text: &str,
    connection: &Connection,
    context: &ServerContext,
) -> Option<ServerMessage> {
    let envelope = match ClientEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(connection = %connection.id, "Rejected message: {}", e);
            return Some(ServerMessage::from(e));
        }
    };

    let registry = &context.registry;
    let response = match envelope.message {
        ClientMessage::Ping { seq } => {
            debug!("Received ping with seq {}", seq);
            ServerMessage::pong(seq)
        }

        ClientMessage::CreateSession {
            session_id,
            cwd,
            cols,
            rows,
        } => {
            let options = context.session_options(cwd.as_deref(), cols, rows);
            match registry.create_or_attach(&session_id, options).await {
                Ok(descriptor) => join_session(context, connection, descriptor).await,
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::CreateNewSession {
            project_id,
            cwd,
            cols,
            rows,
        } => {
            let options = context.session_options(cwd.as_deref(), cols, rows);
            match registry.create_new(&project_id, options).await {
                Ok(descriptor) => join_session(context, connection, descriptor).await,
                Err(e) => ServerMessage::registry_error(&project_id, &e),
            }
        }

        ClientMessage::CreateManagedSession {
            project_id,
            project_path,
            cols,
            rows,
        } => {
            let options = context.session_options(Some(&project_path), cols, rows);
            match registry
                .create_managed(&project_id, Path::new(&project_path), options)
                .await
            {
                Ok(descriptor) => join_session(context, connection, descriptor).await,
                Err(e) => ServerMessage::registry_error(&project_id, &e),
            }
        }

        ClientMessage::TerminalInput { session_id, input } => {
            match registry.write(&session_id, input.as_bytes()).await {
                Ok(()) => return None,
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::ResizeTerminal {
            session_id,
            cols,
            rows,
        } => match registry.resize(&session_id, cols, rows).await {
            Ok(size) => ServerMessage::Resized {
                session_id,
                cols: size.cols,
                rows: size.rows,
            },
            Err(e) => ServerMessage::registry_error(&session_id, &e),
        },

        ClientMessage::DetachSession { session_id } => {
            context.bridge.unbind(&session_id).await;
            match registry.detach(&session_id).await {
                Ok(()) => ServerMessage::ack("detach_session", Some(&session_id)),
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::DestroySession { session_id } => {
            let result = registry.destroy(&session_id).await;
            context.bridge.unbind(&session_id).await;
            match result {
                Ok(()) => ServerMessage::ack("destroy_session", Some(&session_id)),
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::ForceRestart { session_id } => {
            registry.force_restart(&session_id).await;
            context.bridge.unbind(&session_id).await;
            ServerMessage::ack("force_restart", Some(&session_id))
        }

        ClientMessage::MarkForTeardown { session_id } => {
            match registry.mark_for_teardown(&session_id).await {
                Ok(()) => ServerMessage::ack("mark_for_teardown", Some(&session_id)),
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::GetStatus { session_id } => {
            let report = registry.status(&session_id).await;
            ServerMessage::Status {
                session: SessionSummary::from(&report),
            }
        }

        ClientMessage::ListSessions => {
            let sessions = registry
                .list_all()
                .await
                .values()
                .map(SessionSummary::from)
                .collect();
            ServerMessage::SessionList { sessions }
        }

        ClientMessage::GetOutputHistory { session_id, lines } => {
            match registry.output_history(&session_id, lines).await {
                Ok(chunks) => ServerMessage::output_history(session_id, &chunks),
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::Scroll {
            session_id,
            direction,
            amount,
        } => {
            let result = async {
                let name = context.external_name(&session_id).await?;
                let outcome = bridge::scroll(
                    registry.multiplexer().as_ref(),
                    &name,
                    direction,
                    amount,
                    context.scroll,
                )
                .await?;
                Ok::<_, RegistryError>(outcome)
            }
            .await;
            match result {
                Ok(outcome) => ServerMessage::ack_with_detail("scroll", &session_id, outcome.as_str()),
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::GoToBottom { session_id } => {
            let result = async {
                let name = context.external_name(&session_id).await?;
                let moved =
                    bridge::go_to_bottom(registry.multiplexer().as_ref(), &name, context.scroll)
                        .await?;
                Ok::<_, RegistryError>(moved)
            }
            .await;
            match result {
                Ok(true) => ServerMessage::ack("go_to_bottom", Some(&session_id)),
                Ok(false) => {
                    ServerMessage::ack_with_detail("go_to_bottom", &session_id, "already_live")
                }
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::CopyMode {
            session_id,
            enabled,
        } => {
            let result = async {
                let name = context.external_name(&session_id).await?;
                bridge::set_copy_mode(registry.multiplexer().as_ref(), &name, enabled).await?;
                Ok::<_, RegistryError>(())
            }
            .await;
            match result {
                Ok(()) => ServerMessage::ack("copy_mode", Some(&session_id)),
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::GetCursor { session_id } => {
            let result = async {
                let name = context.external_name(&session_id).await?;
                Ok::<_, RegistryError>(registry.multiplexer().cursor_position(&name).await?)
            }
            .await;
            match result {
                Ok(cursor) => ServerMessage::Cursor {
                    session_id,
                    x: cursor.x,
                    y: cursor.y,
                },
                Err(e) => ServerMessage::registry_error(&session_id, &e),
            }
        }

        ClientMessage::SetEchoSuppression {
            session_id,
            enabled,
        } => match registry.get(&session_id).await {
            Some(handle) => {
                handle.set_echo_suppression(enabled).await;
                ServerMessage::ack("set_echo_suppression", Some(&session_id))
            }
            None => ServerMessage::registry_error(
                &session_id,
                &RegistryError::NotFound(session_id.clone()),
            ),
        },

        ClientMessage::JoinRoom { room } => {
            let handle = match room_session(&room) {
                Some(session_id) => registry.get(session_id).await,
                None => None,
            };
            match handle {
                Some(handle) => {
                    context
                        .bridge
                        .join(
                            &handle,
                            connection.id,
                            connection.events.clone(),
                            DEFAULT_HISTORY_LINES,
                        )
                        .await
                }
                None => {
                    context
                        .bridge
                        .rooms()
                        .join(&room, connection.id, connection.events.clone())
                        .await;
                }
            }
            ServerMessage::Ack {
                action: "join_room".to_string(),
                session_id: None,
                detail: Some(room),
            }
        }

        ClientMessage::LeaveRoom { room } => {
            context.bridge.rooms().leave(&room, connection.id).await;
            ServerMessage::Ack {
                action: "leave_room".to_string(),
                session_id: None,
                detail: Some(room),
            }
        }
    };

    Some(response)
}

/// Put the caller in the session's room, replaying recent output first
async fn join_session(
    context: &ServerContext,
    connection: &Connection,
    descriptor: SessionDescriptor,
) -> ServerMessage {
    let room = session_room(&descriptor.session_id);
    match context.registry.get(&descriptor.session_id).await {
        Some(handle) => {
            context
                .bridge
                .join(
                    &handle,
                    connection.id,
                    connection.events.clone(),
                    DEFAULT_HISTORY_LINES,
                )
                .await
        }
        None => {
            context
                .bridge
                .rooms()
                .join(&room, connection.id, connection.events.clone())
                .await;
        }
    }
    ServerMessage::session_created(descriptor, room)
}
