// src/server/mod.rs
pub mod auth;
pub mod client;
pub mod handler;
pub mod health;
pub mod hub;
pub mod message;
pub mod middleware;
pub mod room;
pub mod stream;

pub use auth::{bearer_token, Authenticator, StaticTokenAuthenticator};
pub use client::{ClientObserver, ClientSettings, ServerClient};
pub use handler::handle_connection;
pub use health::{HealthLevel, HealthMetrics, HealthStatus, ServerMetrics};
pub use hub::Hub;
pub use message::{ClientMessage, ServerMessage};
pub use middleware::rate_limit::ConnectionRateLimiter;
pub use room::{Room, RoomOptions};

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tokio::{net::TcpListener, task::JoinHandle, time};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;

use crate::{
    config::ServerConfig,
    message::{Message, MessageType},
    server::middleware::{validate_inbound, validate_room_name},
    utils::{
        error::{Result, WebSocketError},
        rate_limit::RateLimiter,
    },
};

pub type ConnectHandler = Arc<dyn Fn(Arc<ServerClient>) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Arc<ServerClient>, Message) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(Arc<ServerClient>, Option<WebSocketError>) + Send + Sync>;
pub type RoomHandler = Arc<dyn Fn(Arc<ServerClient>, String) + Send + Sync>;

#[derive(Default, Clone)]
struct Handlers {
    on_connect: Option<ConnectHandler>,
    on_message: Option<MessageHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_room_join: Option<RoomHandler>,
    on_room_leave: Option<RoomHandler>,
}

/// Everything a connection task needs from its server.
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub hub: Arc<Hub>,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub metrics: HealthMetrics,
    pub rate_limiter: ConnectionRateLimiter,
    pub message_limiter: Arc<dyn RateLimiter>,
    authenticator: RwLock<Option<Arc<dyn Authenticator>>>,
    handlers: RwLock<Handlers>,
    started_at: Instant,
}

impl ServerState {
    fn new(config: ServerConfig) -> Result<Self> {
        let tls_acceptor = config.create_tls_acceptor()?;
        let message_limiter = config.message_limit().into_limiter()?;
        let hub = Hub::with_room_defaults(config.hub_queue_size, RoomOptions::default());
        Ok(Self {
            rate_limiter: ConnectionRateLimiter::new(config.connection_rate_limit),
            metrics: HealthMetrics::new()?,
            config: Arc::new(config),
            hub,
            tls_acceptor,
            message_limiter,
            authenticator: RwLock::new(None),
            handlers: RwLock::new(Handlers::default()),
            started_at: Instant::now(),
        })
    }

    pub(crate) fn notify_connect(&self, client: &Arc<ServerClient>) {
        if let Some(handler) = self.handlers.read().on_connect.clone() {
            let client = client.clone();
            tokio::spawn(async move { handler(client) });
        }
    }

    fn spawn_room_handler(&self, handler: Option<RoomHandler>, client: &Arc<ServerClient>, room: &str) {
        if let Some(handler) = handler {
            let client = client.clone();
            let room = room.to_owned();
            tokio::spawn(async move { handler(client, room) });
        }
    }

    /// Replies to the sender with a JSON error frame. Best-effort.
    fn reply_error(&self, client: &Arc<ServerClient>, error: &WebSocketError) {
        if let Err(e) = client.send_json(&ServerMessage::error(error)) {
            debug!(client_id = client.id(), error = %e, "could not deliver error reply");
        }
    }

    fn check_inbound(&self, client: &ServerClient, message: &Message) -> Result<()> {
        validate_inbound(message, self.config.max_message_size)?;
        if !self.message_limiter.allow(client.id()) {
            return Err(WebSocketError::RateLimitExceeded);
        }
        Ok(())
    }

    fn handle_room_command(&self, client: &Arc<ServerClient>, command: ClientMessage) {
        let result = validate_room_name(command.room()).and_then(|_| match command {
            ClientMessage::JoinRoom { room } => {
                client.join_room(&room)?;
                client.send_json(&ServerMessage::RoomJoined { room })
            }
            ClientMessage::LeaveRoom { room } => {
                client.leave_room(&room)?;
                client.send_json(&ServerMessage::RoomLeft { room })
            }
            ClientMessage::RoomMessage { room, content } => {
                if !client.in_room(&room) {
                    return Err(WebSocketError::RoomNotFound(room));
                }
                let target = self
                    .hub
                    .get_room(&room)
                    .ok_or_else(|| WebSocketError::RoomNotFound(room.clone()))?;
                let relay = Message::json(&ServerMessage::RoomMessage {
                    room,
                    from: client.id().to_owned(),
                    content,
                })?
                .with_origin(client.id());
                target.publish(relay, Some(client.id())).map(|_| ())
            }
        });

        if let Err(e) = result {
            debug!(client_id = client.id(), error = %e, "room command failed");
            self.reply_error(client, &e);
        }
    }
}

impl ClientObserver for ServerState {
    fn on_message(&self, client: &Arc<ServerClient>, message: Message) {
        self.metrics.messages_received.inc();
        self.metrics.bytes_received.inc_by(message.len() as u64);

        if let Err(e) = self.check_inbound(client, &message) {
            debug!(client_id = client.id(), error = %e, "inbound message rejected");
            client.record_error();
            self.metrics.errors.inc();
            self.reply_error(client, &e);
            return;
        }

        if self.config.room_commands_enabled && message.kind() == MessageType::Text {
            if let Some(command) = message.as_text().and_then(ClientMessage::parse) {
                self.handle_room_command(client, command);
                return;
            }
        }

        if let Some(handler) = self.handlers.read().on_message.clone() {
            let client = client.clone();
            tokio::spawn(async move { handler(client, message) });
        }
    }

    fn on_sent(&self, _client: &Arc<ServerClient>, bytes: usize) {
        self.metrics.messages_sent.inc();
        self.metrics.bytes_sent.inc_by(bytes as u64);
    }

    fn on_room_join(&self, client: &Arc<ServerClient>, room: &str) {
        let handler = self.handlers.read().on_room_join.clone();
        self.spawn_room_handler(handler, client, room);
    }

    fn on_room_leave(&self, client: &Arc<ServerClient>, room: &str) {
        let handler = self.handlers.read().on_room_leave.clone();
        self.spawn_room_handler(handler, client, room);
    }

    fn on_disconnect(&self, client: &Arc<ServerClient>, error: Option<WebSocketError>) {
        if error.is_some() {
            self.metrics.errors.inc();
        }
        self.metrics.connections.dec();
        self.message_limiter.reset(client.id());
        info!(client_id = client.id(), error = ?error, "client disconnected");

        let hub = self.hub.clone();
        let handler = self.handlers.read().on_disconnect.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.unregister_client(client.id()).await {
                debug!(client_id = client.id(), error = %e, "unregister skipped");
            }
            if let Some(handler) = handler {
                handler(client, error);
            }
        });
    }
}

/// A WebSocket server: accepts connections, authenticates them during the
/// handshake and registers each one with its [`Hub`].
pub struct Server {
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(ServerState::new(config)?),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    pub fn set_authenticator(&self, authenticator: impl Authenticator + 'static) {
        *self.state.authenticator.write() = Some(Arc::new(authenticator));
    }

    pub fn on_connect(&self, handler: impl Fn(Arc<ServerClient>) + Send + Sync + 'static) {
        self.state.handlers.write().on_connect = Some(Arc::new(handler));
    }

    pub fn on_message(&self, handler: impl Fn(Arc<ServerClient>, Message) + Send + Sync + 'static) {
        self.state.handlers.write().on_message = Some(Arc::new(handler));
    }

    pub fn on_disconnect(
        &self,
        handler: impl Fn(Arc<ServerClient>, Option<WebSocketError>) + Send + Sync + 'static,
    ) {
        self.state.handlers.write().on_disconnect = Some(Arc::new(handler));
    }

    pub fn on_room_join(&self, handler: impl Fn(Arc<ServerClient>, String) + Send + Sync + 'static) {
        self.state.handlers.write().on_room_join = Some(Arc::new(handler));
    }

    pub fn on_room_leave(&self, handler: impl Fn(Arc<ServerClient>, String) + Send + Sync + 'static) {
        self.state.handlers.write().on_room_leave = Some(Arc::new(handler));
    }

    /// Binds the listener, starts the hub and spawns the accept loop plus the
    /// housekeeping tasks. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let config = self.state.config.clone();
        if config.auth_required && self.state.authenticator.read().is_none() {
            return Err(WebSocketError::ConfigurationError(
                "auth_required is set but no authenticator was provided".into(),
            ));
        }

        let listener = TcpListener::bind(config.bind_address()).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        self.state.hub.start().await;
        info!(%addr, path = %config.path, tls = config.enable_tls, "server listening");

        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            self.state.clone(),
            self.shutdown.clone(),
        ))];

        tasks.push(tokio::spawn(cleanup_loop(self.state.clone(), self.shutdown.clone())));

        if config.metrics_enabled {
            let metrics_addr = SocketAddr::new(addr.ip(), config.metrics_port);
            tasks.push(tokio::spawn(health::serve_metrics_http(
                self.state.clone(),
                metrics_addr,
                self.shutdown.clone(),
            )));
        }

        self.tasks.lock().extend(tasks);
        Ok(addr)
    }

    /// Stops accepting, stops the hub (closing every room) and closes the
    /// remaining clients with a going-away code, bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        info!("server shutting down");

        let state = self.state.clone();
        let drain = async move {
            let clients = state.hub.clients();
            state.hub.stop().await;
            futures_util::future::join_all(
                clients
                    .iter()
                    .map(|client| client.close_with_code(CloseCode::Away, "server shutting down")),
            )
            .await;
        };
        if time::timeout(self.state.config.shutdown_timeout(), drain).await.is_err() {
            warn!("shutdown timed out with connections still open");
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "server task ended abnormally");
            }
        }
        info!("server stopped");
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn metrics(&self) -> ServerMetrics {
        self.state.metrics.rooms.set(self.state.hub.room_count() as i64);
        self.state.metrics.snapshot()
    }

    pub fn health(&self) -> HealthStatus {
        health::evaluate_health(&self.state)
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => {
                    if let Err(e) = tcp.set_nodelay(true) {
                        debug!(%addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    tokio::spawn(handle_connection(tcp, addr, state.clone()));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

async fn cleanup_loop(state: Arc<ServerState>, shutdown: CancellationToken) {
    let period = state.config.limiter_cleanup_interval();
    if period.is_zero() {
        return;
    }
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                state.message_limiter.cleanup();
                state.rate_limiter.cleanup();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::client::test_client;
    use crate::state::AuthInfo;

    fn test_state() -> Arc<ServerState> {
        let config = ServerConfig {
            message_rate_limit: 2,
            message_rate_burst: 2,
            max_message_size: 64,
            ..ServerConfig::default()
        };
        Arc::new(ServerState::new(config).unwrap())
    }

    async fn registered(state: &Arc<ServerState>, id: &str) -> (Arc<ServerClient>, tokio::sync::mpsc::Receiver<Message>) {
        let (client, rx) = test_client(id, Some(AuthInfo::new(id)));
        state.hub.register_client(client.clone()).await.unwrap();
        (client, rx)
    }

    fn reply(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> serde_json::Value {
        let message = rx.try_recv().expect("a reply");
        serde_json::from_slice(message.payload()).unwrap()
    }

    #[tokio::test]
    async fn room_commands_round_trip() {
        let state = test_state();
        state.hub.start().await;
        let (alice, mut rx_a) = registered(&state, "alice").await;
        let (bob, mut rx_b) = registered(&state, "bob").await;

        state.on_message(&alice, Message::text(r#"{"type":"join_room","room":"r"}"#));
        state.on_message(&bob, Message::text(r#"{"type":"join_room","room":"r"}"#));
        assert_eq!(reply(&mut rx_a)["type"], "room_joined");
        assert_eq!(reply(&mut rx_b)["type"], "room_joined");
        assert!(alice.in_room("r"));

        state.on_message(&alice, Message::text(r#"{"type":"room_message","room":"r","content":"hey"}"#));
        let relayed = reply(&mut rx_b);
        assert_eq!(relayed["type"], "room_message");
        assert_eq!(relayed["from"], "alice");
        assert_eq!(relayed["content"], "hey");
        assert!(rx_a.try_recv().is_err());

        state.on_message(&alice, Message::text(r#"{"type":"leave_room","room":"r"}"#));
        assert_eq!(reply(&mut rx_a)["type"], "room_left");
        assert!(!alice.in_room("r"));
    }

    #[tokio::test]
    async fn inbound_limits_reply_with_errors() {
        let state = test_state();
        state.hub.start().await;
        let (client, mut rx) = registered(&state, "c").await;

        state.on_message(&client, Message::text("x".repeat(65)));
        assert_eq!(reply(&mut rx)["type"], "error");

        // The oversized message did not consume a token; two more fit the burst.
        state.on_message(&client, Message::text("a"));
        state.on_message(&client, Message::text("b"));
        assert!(rx.try_recv().is_err());
        state.on_message(&client, Message::text("c"));
        assert_eq!(reply(&mut rx)["message"], "rate limit exceeded");
        assert_eq!(client.metrics().errors, 2);
    }

    #[tokio::test]
    async fn messaging_a_room_without_joining_fails() {
        let state = test_state();
        state.hub.start().await;
        let (client, mut rx) = registered(&state, "c").await;
        state.on_message(&client, Message::text(r#"{"type":"room_message","room":"r","content":1}"#));
        assert_eq!(reply(&mut rx)["type"], "error");
    }

    #[tokio::test]
    async fn start_requires_authenticator_when_auth_is_mandatory() {
        let server = Server::new(ServerConfig {
            port: 0,
            auth_required: true,
            metrics_enabled: false,
            ..ServerConfig::default()
        })
        .unwrap();
        assert!(matches!(
            server.start().await,
            Err(WebSocketError::ConfigurationError(_))
        ));
    }
}
