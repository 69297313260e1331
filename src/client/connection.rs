use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_tungstenite::{
    client_async_tls_with_config, connect_async_with_config, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tungstenite::{
    client::IntoClientRequest,
    handshake::client::Request,
    http::{header, HeaderName, HeaderValue, StatusCode},
    protocol::WebSocketConfig,
};
use url::Url;
use uuid::Uuid;

use crate::{
    client::proxy,
    config::ClientConfig,
    message::{Message, MessageType},
    state::{AtomicConnectionState, ConnectionMetrics, ConnectionState, MetricsSnapshot},
    utils::{
        error::{Result, WebSocketError},
        rate_limit::RateLimiter,
    },
};

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub type TextHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type BinaryHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(Option<WebSocketError>) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(WebSocketError) + Send + Sync>;
/// Produces a fresh token for every handshake, including reconnects.
pub type AuthCallback = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Reconnect attempts beyond this count stop growing the delay.
const MAX_BACKOFF_STEPS: u32 = 10;

/// Upper bound on the closing handshake once the client is shutting down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before reconnect attempt number `attempt` (zero-based).
pub fn reconnect_delay(base: Duration, unit: Duration, attempt: u32) -> Duration {
    base + unit * attempt.min(MAX_BACKOFF_STEPS)
}

#[derive(Default, Clone)]
struct Handlers {
    on_message: Option<MessageHandler>,
    on_text: Option<TextHandler>,
    on_binary: Option<BinaryHandler>,
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_error: Option<ErrorHandler>,
}

/// Resources belonging to one established connection.
struct Session {
    generation: u64,
    sender: mpsc::Sender<Message>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    id: String,
    config: ClientConfig,
    state: AtomicConnectionState,
    session: Mutex<Option<Session>>,
    handlers: RwLock<Handlers>,
    auth_callback: RwLock<Option<AuthCallback>>,
    limiter: Arc<dyn RateLimiter>,
    metrics: ConnectionMetrics,
    attempts: AtomicU32,
    generation: AtomicU64,
    last_pong: Mutex<Instant>,
    shutdown: CancellationToken,
}

/// Client side of a WebSocket connection with heartbeat and automatic reconnection.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("id", &self.inner.id)
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl WsClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let limiter = config.send_limit().into_limiter()?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                config,
                state: AtomicConnectionState::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                handlers: RwLock::new(Handlers::default()),
                auth_callback: RwLock::new(None),
                limiter,
                metrics: ConnectionMetrics::default(),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                last_pong: Mutex::new(Instant::now()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Failed reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub fn on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.inner.handlers.write().on_message = Some(Arc::new(handler));
    }

    pub fn on_text(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.inner.handlers.write().on_text = Some(Arc::new(handler));
    }

    pub fn on_binary(&self, handler: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.inner.handlers.write().on_binary = Some(Arc::new(handler));
    }

    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.write().on_connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn(Option<WebSocketError>) + Send + Sync + 'static) {
        self.inner.handlers.write().on_disconnect = Some(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(WebSocketError) + Send + Sync + 'static) {
        self.inner.handlers.write().on_error = Some(Arc::new(handler));
    }

    /// Overrides `auth_token`; called before every handshake.
    pub fn set_auth_callback(&self, callback: impl Fn() -> Result<String> + Send + Sync + 'static) {
        *self.inner.auth_callback.write() = Some(Arc::new(callback));
    }

    /// Dials the server and starts the read, write and heartbeat loops.
    ///
    /// Fails with [`WebSocketError::AlreadyConnected`] unless the client is
    /// disconnected, and with [`WebSocketError::ClientClosed`] after [`WsClient::close`].
    #[instrument(skip(self), fields(client_id = %self.inner.id, url = %self.inner.config.url))]
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(WebSocketError::ClientClosed);
        }
        if !self
            .inner
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(WebSocketError::AlreadyConnected);
        }

        let result = match self.inner.dial().await {
            Ok(ws) => self.inner.establish(ws),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.inner
                .state
                .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
            warn!(error = %e, "connect failed");
        }
        result
    }

    /// Queues a message for the write loop. Never waits for queue space.
    pub fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Message::binary(data))
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.send(Message::json(value)?)
    }

    /// Closes the connection for good. Pending reconnects are cancelled and
    /// later calls to [`WsClient::connect`] fail.
    pub async fn close(&self) {
        let previous = self.inner.state.swap(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        self.inner.shutdown.cancel();

        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            for task in session.tasks {
                let _ = task.await;
            }
        }
        info!(client_id = %self.inner.id, "client closed");
        if previous == ConnectionState::Connected {
            self.inner.fire_disconnect(None);
        }
    }

    #[cfg(test)]
    async fn attach<S>(&self, ws: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        assert!(self
            .inner
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        self.inner.establish(ws)
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn handshake_error(error: tungstenite::Error) -> WebSocketError {
    match error {
        tungstenite::Error::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            WebSocketError::AuthenticationError(format!("handshake rejected with {}", response.status()))
        }
        tungstenite::Error::Http(response) => {
            WebSocketError::ConnectionError(format!("handshake rejected with {}", response.status()))
        }
        tungstenite::Error::Url(e) => WebSocketError::InvalidUrl(e.to_string()),
        other => WebSocketError::ConnectionError(other.to_string()),
    }
}

impl Inner {
    fn websocket_config(&self) -> WebSocketConfig {
        let limit = (self.config.max_message_size > 0).then_some(self.config.max_message_size);
        WebSocketConfig {
            max_message_size: limit,
            max_frame_size: limit,
            ..Default::default()
        }
    }

    fn build_request(&self) -> Result<Request> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WebSocketError::ConfigurationError(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WebSocketError::ConfigurationError(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        if !self.config.subprotocols.is_empty() {
            let protocols = HeaderValue::from_str(&self.config.subprotocols.join(", "))
                .map_err(|e| WebSocketError::ConfigurationError(format!("subprotocols: {e}")))?;
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocols);
        }

        let callback = self.auth_callback.read().clone();
        let token = match callback {
            Some(callback) => Some(callback()?),
            None => self.config.auth_token.clone(),
        };
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let name = HeaderName::from_bytes(self.config.auth_header.as_bytes())
                .map_err(|e| WebSocketError::ConfigurationError(format!("auth_header: {e}")))?;
            let value = if name == header::AUTHORIZATION {
                format!("Bearer {token}")
            } else {
                token
            };
            let value = HeaderValue::from_str(&value)
                .map_err(|e| WebSocketError::AuthenticationError(format!("token: {e}")))?;
            headers.insert(name, value);
        }

        Ok(request)
    }

    async fn dial(&self) -> Result<ClientStream> {
        let request = self.build_request()?;
        let config = Some(self.websocket_config());

        let handshake = async {
            match &self.config.proxy_url {
                None => connect_async_with_config(request, config, true)
                    .await
                    .map(|(ws, _)| ws)
                    .map_err(handshake_error),
                Some(proxy_url) => {
                    let target = Url::parse(&self.config.url)?;
                    let tunnel = proxy::connect_via_proxy(proxy_url, &target).await?;
                    client_async_tls_with_config(request, tunnel, config, None)
                        .await
                        .map(|(ws, _)| ws)
                        .map_err(handshake_error)
                }
            }
        };

        time::timeout(self.config.handshake_timeout(), handshake)
            .await
            .map_err(|_| WebSocketError::Timeout("handshake"))?
    }

    /// Moves `Connecting` to `Connected` and spawns the loops for `ws`.
    fn establish<S>(self: &Arc<Self>, ws: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (sender, receiver) = mpsc::channel(self.config.queue_size.max(1));
        let cancel = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        {
            let mut session = self.session.lock();
            if !self
                .state
                .transition(ConnectionState::Connecting, ConnectionState::Connected)
            {
                return Err(WebSocketError::ClientClosed);
            }
            *self.last_pong.lock() = Instant::now();

            let tasks = vec![
                tokio::spawn(self.clone().write_loop(sink, receiver, cancel.clone(), generation)),
                tokio::spawn(self.clone().read_loop(stream, cancel.clone(), generation)),
                tokio::spawn(self.clone().heartbeat_loop(cancel.clone(), generation)),
            ];
            *session = Some(Session {
                generation,
                sender,
                cancel,
                tasks,
            });
        }

        self.attempts.store(0, Ordering::Release);
        info!(client_id = %self.id, generation, "connected");
        if let Some(handler) = self.handlers.read().on_connect.clone() {
            tokio::spawn(async move { handler() });
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(WebSocketError::NotConnected);
        }
        if !self.limiter.allow(&self.id) {
            return Err(WebSocketError::RateLimitExceeded);
        }
        let max = self.config.max_message_size;
        if max > 0 && message.len() > max {
            return Err(WebSocketError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }

        let sender = self
            .session
            .lock()
            .as_ref()
            .map(|session| session.sender.clone())
            .ok_or(WebSocketError::NotConnected)?;
        sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WebSocketError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WebSocketError::NotConnected,
        })
    }

    fn fire_disconnect(&self, error: Option<WebSocketError>) {
        if let Some(handler) = self.handlers.read().on_disconnect.clone() {
            tokio::spawn(async move { handler(error) });
        }
    }

    fn fire_error(&self, error: WebSocketError) {
        if let Some(handler) = self.handlers.read().on_error.clone() {
            tokio::spawn(async move { handler(error) });
        }
    }

    /// Tears down session `generation` after a transport failure, a peer close or
    /// a heartbeat timeout. Stale generations and repeated calls are ignored.
    fn handle_disconnect(self: &Arc<Self>, generation: u64, error: Option<WebSocketError>) {
        let session = {
            let mut guard = self.session.lock();
            if guard.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            if !self
                .state
                .transition(ConnectionState::Connected, ConnectionState::Disconnected)
            {
                return;
            }
            guard.take()
        };
        if let Some(session) = session {
            session.cancel.cancel();
        }

        warn!(client_id = %self.id, error = ?error, "disconnected");
        self.fire_disconnect(error);

        if self.config.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Reconnecting)
        {
            return;
        }
        tokio::spawn(self.clone().reconnect_loop());
    }

    // Boxed so the loops that schedule reconnects do not form a recursive future type.
    fn reconnect_loop(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let base = self.config.reconnect_interval();
            let unit = self.config.reconnect_backoff();
            let max = self.config.max_reconnect_attempts;

            loop {
                let attempt = self.attempts.load(Ordering::Acquire);
                if max > 0 && attempt >= max {
                    if self
                        .state
                        .transition(ConnectionState::Reconnecting, ConnectionState::Disconnected)
                    {
                        warn!(client_id = %self.id, attempts = attempt, "giving up reconnecting");
                        self.fire_error(WebSocketError::ConnectionError(format!(
                            "reconnect abandoned after {attempt} attempts"
                        )));
                    }
                    return;
                }

                let delay = reconnect_delay(base, unit, attempt);
                debug!(client_id = %self.id, attempt = attempt + 1, ?delay, "reconnect scheduled");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = time::sleep(delay) => {}
                }

                self.attempts.fetch_add(1, Ordering::AcqRel);
                if !self
                    .state
                    .transition(ConnectionState::Reconnecting, ConnectionState::Connecting)
                {
                    return;
                }

                let result = match self.dial().await {
                    Ok(ws) => self.establish(ws),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => return,
                    // Closed while the dial was in flight.
                    Err(WebSocketError::ClientClosed) => return,
                    Err(e @ WebSocketError::AuthenticationError(_)) => {
                        // Credentials will not improve by retrying.
                        self.state
                            .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                        warn!(client_id = %self.id, error = %e, "reconnect rejected");
                        self.fire_error(e);
                        return;
                    }
                    Err(e) => {
                        debug!(client_id = %self.id, error = %e, "reconnect attempt failed");
                        self.fire_error(e);
                        if !self
                            .state
                            .transition(ConnectionState::Connecting, ConnectionState::Reconnecting)
                        {
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut sink: W,
        mut receiver: mpsc::Receiver<Message>,
        cancel: CancellationToken,
        generation: u64,
    ) where
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    {
        let interval = self.config.ping_interval();
        let write_timeout = self.config.write_timeout();
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let error = loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                queued = receiver.recv() => {
                    let Some(message) = queued else { break None };
                    match message.to_frame(self.config.enable_compression) {
                        Ok(frame) => (frame, message.len()),
                        Err(e) => {
                            warn!(client_id = %self.id, error = %e, "dropping unencodable message");
                            self.metrics.record_error();
                            continue;
                        }
                    }
                }
                _ = ticker.tick() => (tungstenite::Message::Ping(Vec::new()), 0),
            };

            let (frame, bytes) = frame;
            let is_ping = matches!(frame, tungstenite::Message::Ping(_));
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                written = time::timeout(write_timeout, sink.send(frame)) => written,
            };
            match written {
                Ok(Ok(())) if is_ping => {}
                Ok(Ok(())) => self.metrics.record_sent(bytes),
                Ok(Err(e)) => break Some(WebSocketError::from(e)),
                Err(_) => break Some(WebSocketError::Timeout("write")),
            }
        };

        match error {
            Some(e) => {
                self.metrics.record_error();
                self.handle_disconnect(generation, Some(e));
            }
            None => {
                let goodbye = async {
                    sink.send(tungstenite::Message::Close(None)).await?;
                    sink.close().await
                };
                let _ = time::timeout(CLOSE_TIMEOUT, goodbye).await;
            }
        }
    }

    async fn read_loop<R>(self: Arc<Self>, mut stream: R, cancel: CancellationToken, generation: u64)
    where
        R: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        let read_timeout = self.config.read_timeout();
        let error = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = async {
                    match read_timeout {
                        Some(limit) => time::timeout(limit, stream.next()).await.ok(),
                        None => Some(stream.next().await),
                    }
                } => next,
            };

            let frame = match next {
                None => break Some(WebSocketError::Timeout("read")),
                Some(None) => break None,
                Some(Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))) => break None,
                Some(Some(Err(e))) => break Some(WebSocketError::from(e)),
                Some(Some(Ok(frame))) => frame,
            };

            match frame {
                tungstenite::Message::Pong(_) => {
                    *self.last_pong.lock() = Instant::now();
                    self.metrics.touch();
                }
                tungstenite::Message::Ping(_) => self.metrics.touch(),
                tungstenite::Message::Close(frame) => {
                    debug!(client_id = %self.id, ?frame, "server closed connection");
                    break None;
                }
                tungstenite::Message::Frame(_) => {}
                data => match Message::from_frame(
                    data,
                    self.config.enable_compression,
                    self.config.max_message_size,
                ) {
                    Ok(Some(message)) => {
                        self.metrics.record_received(message.len());
                        self.dispatch(message);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(client_id = %self.id, error = %e, "discarding undecodable frame");
                        self.metrics.record_error();
                        self.fire_error(e.into());
                    }
                },
            }
        };

        if error.is_some() {
            self.metrics.record_error();
        }
        self.handle_disconnect(generation, error);
    }

    /// Hands an inbound message to the registered handlers, each on its own task.
    fn dispatch(&self, message: Message) {
        let handlers = self.handlers.read().clone();
        match message.kind() {
            MessageType::Text => {
                if let (Some(handler), Some(text)) = (handlers.on_text, message.as_text()) {
                    let text = text.to_owned();
                    tokio::spawn(async move { handler(text) });
                }
            }
            MessageType::Binary => {
                if let Some(handler) = handlers.on_binary {
                    let data = message.payload().to_vec();
                    tokio::spawn(async move { handler(data) });
                }
            }
            _ => {}
        }
        if let Some(handler) = handlers.on_message {
            tokio::spawn(async move { handler(message) });
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken, generation: u64) {
        let timeout = self.config.pong_timeout();
        let period = self.config.ping_interval();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let silent_for = self.last_pong.lock().elapsed();
                    if silent_for > timeout {
                        warn!(client_id = %self.id, ?silent_for, "no pong within timeout");
                        self.handle_disconnect(generation, Some(WebSocketError::HeartbeatTimeout));
                        return;
                    }
                }
            }
        }
    }
}
