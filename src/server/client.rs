use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex as TokioMutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use tungstenite::protocol::frame::coding::CloseCode;

use crate::{
    config::ServerConfig,
    message::{Message, MessageType},
    server::hub::Hub,
    state::{AtomicConnectionState, AuthInfo, ClientInfo, ConnectionMetrics, ConnectionState, MetricsSnapshot},
    utils::error::{Result, WebSocketError},
};

/// Receives the events a [`ServerClient`] produces while it runs.
///
/// Implementations are called from the client's own loops and must not block.
pub trait ClientObserver: Send + Sync {
    /// A complete data message arrived.
    fn on_message(&self, client: &Arc<ServerClient>, message: Message);

    /// A queued message was written to the transport.
    fn on_sent(&self, _client: &Arc<ServerClient>, _bytes: usize) {}

    fn on_room_join(&self, _client: &Arc<ServerClient>, _room: &str) {}

    fn on_room_leave(&self, _client: &Arc<ServerClient>, _room: &str) {}

    /// Called exactly once when the connection ends, with the error that ended it.
    fn on_disconnect(&self, client: &Arc<ServerClient>, error: Option<WebSocketError>);
}

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub queue_size: usize,
    pub max_message_size: usize,
    pub ping_interval: Duration,
    /// Read deadline, renewed by every inbound frame.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub compression: bool,
}

impl From<&ServerConfig> for ClientSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            queue_size: config.queue_size,
            max_message_size: config.max_message_size,
            ping_interval: config.ping_interval(),
            read_timeout: config.pong_timeout(),
            write_timeout: config.write_timeout(),
            compression: config.enable_compression,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Server-side handle for one accepted connection.
///
/// Owns a bounded send queue drained by a single write loop, so messages reach the
/// peer in the order they were queued.
pub struct ServerClient {
    id: String,
    auth: Option<AuthInfo>,
    info: RwLock<ClientInfo>,
    state: AtomicConnectionState,
    sender: mpsc::Sender<Message>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    metrics: ConnectionMetrics,
    store: DashMap<String, serde_json::Value>,
    settings: ClientSettings,
    cancel: CancellationToken,
    close_frame: Mutex<Option<Message>>,
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
    hub: RwLock<Weak<Hub>>,
    observer: RwLock<Option<Arc<dyn ClientObserver>>>,
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl ServerClient {
    /// Creates a connected client. Nothing is read or written until [`ServerClient::start`].
    pub fn new(mut info: ClientInfo, auth: Option<AuthInfo>, settings: ClientSettings) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
        if let Some(auth) = auth.as_ref().filter(|a| a.is_authenticated()) {
            info.user_id = Some(auth.user_id.clone());
        }
        Arc::new(Self {
            id: info.id.clone(),
            auth,
            info: RwLock::new(info),
            state: AtomicConnectionState::new(ConnectionState::Connected),
            sender,
            receiver: Mutex::new(Some(receiver)),
            metrics: ConnectionMetrics::default(),
            store: DashMap::new(),
            settings,
            cancel: CancellationToken::new(),
            close_frame: Mutex::new(None),
            tasks: TokioMutex::new(Vec::new()),
            hub: RwLock::new(Weak::new()),
            observer: RwLock::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A copy of the connection details, including current room membership.
    pub fn info(&self) -> ClientInfo {
        self.info.read().clone()
    }

    pub fn auth(&self) -> Option<&AuthInfo> {
        self.auth.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.as_ref().map_or(false, AuthInfo::is_authenticated)
    }

    /// Whether the client holds at least one of `roles`.
    pub fn has_any_role(&self, roles: &HashSet<String>) -> bool {
        self.auth
            .as_ref()
            .map_or(false, |auth| auth.roles.iter().any(|role| roles.contains(role)))
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn record_error(&self) {
        self.metrics.record_error();
    }

    /// Queues `message` without waiting for capacity.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(WebSocketError::NotConnected);
        }
        let max = self.settings.max_message_size;
        if max > 0 && message.len() > max {
            return Err(WebSocketError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WebSocketError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WebSocketError::NotConnected,
        })
    }

    pub fn send_with_type(&self, kind: MessageType, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Message::new(kind, payload))
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

    /// Attaches session-scoped data to the connection.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.store.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, key: &str) -> Option<serde_json::Value> {
        self.store.remove(key).map(|(_, value)| value)
    }

    pub fn rooms(&self) -> BTreeSet<String> {
        self.info.read().rooms.clone()
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.info.read().rooms.contains(room)
    }

    pub(crate) fn add_room(&self, room: &str) {
        self.info.write().rooms.insert(room.to_owned());
    }

    pub(crate) fn remove_room(&self, room: &str) -> bool {
        self.info.write().rooms.remove(room)
    }

    pub(crate) fn attach_hub(&self, hub: Weak<Hub>) {
        *self.hub.write() = hub;
    }

    fn hub(&self) -> Result<Arc<Hub>> {
        self.hub.read().upgrade().ok_or(WebSocketError::HubNotRunning)
    }

    /// Joins `room` through the hub, creating it with default options if needed.
    pub fn join_room(self: &Arc<Self>, room: &str) -> Result<()> {
        self.hub()?.join_room(&self.id, room)?;
        if let Some(observer) = self.observer.read().clone() {
            observer.on_room_join(self, room);
        }
        Ok(())
    }

    pub fn leave_room(self: &Arc<Self>, room: &str) -> Result<()> {
        self.hub()?.leave_room(&self.id, room)?;
        if let Some(observer) = self.observer.read().clone() {
            observer.on_room_leave(self, room);
        }
        Ok(())
    }

    /// Spawns the read and write loops over `transport`.
    pub async fn start<T>(self: &Arc<Self>, transport: T, observer: Arc<dyn ClientObserver>)
    where
        T: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>>
            + Sink<tungstenite::Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!(client_id = %self.id, "client already started");
            return;
        };
        *self.observer.write() = Some(observer.clone());

        let (sink, stream) = transport.split();
        let writer = tokio::spawn(self.clone().write_loop(sink, receiver, observer.clone()));
        let reader = tokio::spawn(self.clone().read_loop(stream, observer));
        self.tasks.lock().await.extend([writer, reader]);
    }

    /// Closes with a normal-closure code.
    pub async fn close(self: &Arc<Self>) {
        self.close_with_code(CloseCode::Normal, "").await;
    }

    /// Tears the connection down: sends a close frame best-effort, closes the
    /// transport, and waits for both loops to exit. Safe to call more than once.
    ///
    /// Must not be awaited from inside the client's own loops.
    #[instrument(skip(self), fields(client_id = %self.id))]
    pub async fn close_with_code(self: &Arc<Self>, code: CloseCode, reason: &str) {
        if self.state.get() != ConnectionState::Closed {
            *self.close_frame.lock() = Some(Message::close(code, reason));
        }
        self.finish(None);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Single transition to `Closed`; notifies the observer the first time only.
    fn finish(self: &Arc<Self>, error: Option<WebSocketError>) {
        if self.state.swap(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.cancel.cancel();
        if error.is_some() {
            self.metrics.record_error();
        }
        debug!(client_id = %self.id, error = ?error, "client connection finished");
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_disconnect(self, error);
        }
    }

    async fn write_frame<W>(&self, sink: &mut W, frame: tungstenite::Message) -> Result<()>
    where
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    {
        match time::timeout(self.settings.write_timeout, sink.send(frame)).await {
            Ok(result) => result.map_err(WebSocketError::from),
            Err(_) => Err(WebSocketError::Timeout("write")),
        }
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut sink: W,
        mut receiver: mpsc::Receiver<Message>,
        observer: Arc<dyn ClientObserver>,
    ) where
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    {
        let interval = self.settings.ping_interval;
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let error = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                queued = receiver.recv() => {
                    let Some(message) = queued else { break None };
                    let frame = match message.to_frame(self.settings.compression) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(client_id = %self.id, error = %e, "dropping unencodable message");
                            self.metrics.record_error();
                            continue;
                        }
                    };
                    if let Err(e) = self.write_frame(&mut sink, frame).await {
                        break Some(e);
                    }
                    self.metrics.record_sent(message.len());
                    observer.on_sent(&self, message.len());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.write_frame(&mut sink, tungstenite::Message::Ping(Vec::new())).await {
                        break Some(e);
                    }
                    self.info.write().last_ping_at = Some(Utc::now());
                }
            }
        };

        if error.is_none() {
            let close = self
                .close_frame
                .lock()
                .take()
                .unwrap_or_else(|| Message::close(CloseCode::Normal, ""));
            if let Ok(frame) = close.to_frame(false) {
                let _ = self.write_frame(&mut sink, frame).await;
            }
        }
        let _ = time::timeout(self.settings.write_timeout, sink.close()).await;
        self.finish(error);
    }

    async fn read_loop<R>(self: Arc<Self>, mut stream: R, observer: Arc<dyn ClientObserver>)
    where
        R: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        let error = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                next = time::timeout(self.settings.read_timeout, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => break Some(WebSocketError::Timeout("read")),
                Ok(None) => break None,
                Ok(Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))) => {
                    break None
                }
                Ok(Some(Err(e))) => break Some(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => self.metrics.touch(),
                tungstenite::Message::Close(frame) => {
                    debug!(client_id = %self.id, ?frame, "peer closed connection");
                    break None;
                }
                tungstenite::Message::Frame(_) => {}
                data => match Message::from_frame(
                    data,
                    self.settings.compression,
                    self.settings.max_message_size,
                ) {
                    Ok(Some(message)) => {
                        self.metrics.record_received(message.len());
                        observer.on_message(&self, message.with_origin(self.id.clone()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(client_id = %self.id, error = %e, "discarding undecodable frame");
                        self.metrics.record_error();
                    }
                },
            }
        };
        self.finish(error);
    }
}

#[cfg(test)]
pub(crate) fn test_client(id: &str, auth: Option<AuthInfo>) -> (Arc<ServerClient>, mpsc::Receiver<Message>) {
    test_client_with(id, auth, ClientSettings::default())
}

#[cfg(test)]
pub(crate) fn test_client_with(
    id: &str,
    auth: Option<AuthInfo>,
    settings: ClientSettings,
) -> (Arc<ServerClient>, mpsc::Receiver<Message>) {
    let client = ServerClient::new(ClientInfo::new(id), auth, settings);
    let receiver = client
        .receiver
        .lock()
        .take()
        .expect("fresh client has a receiver");
    (client, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::WebSocketStream;
    use tungstenite::protocol::Role;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        disconnects: AtomicUsize,
    }

    impl ClientObserver for Recorder {
        fn on_message(&self, _client: &Arc<ServerClient>, message: Message) {
            self.messages.lock().push(message);
        }

        fn on_disconnect(&self, _client: &Arc<ServerClient>, _error: Option<WebSocketError>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn socket_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn send_rejects_when_queue_full() {
        let settings = ClientSettings {
            queue_size: 2,
            ..Default::default()
        };
        let (client, _rx) = test_client_with("c1", None, settings);
        client.send_text("a").unwrap();
        client.send_text("b").unwrap();
        assert!(matches!(client.send_text("c"), Err(WebSocketError::QueueFull)));
    }

    #[test]
    fn send_rejects_oversized_payload() {
        let settings = ClientSettings {
            max_message_size: 4,
            ..Default::default()
        };
        let (client, _rx) = test_client_with("c1", None, settings);
        assert!(matches!(
            client.send_binary(vec![0u8; 5]),
            Err(WebSocketError::MessageTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn key_value_store() {
        let (client, _rx) = test_client("c1", None);
        client.set("nick", serde_json::json!("ada"));
        assert_eq!(client.get("nick"), Some(serde_json::json!("ada")));
        assert_eq!(client.delete("nick"), Some(serde_json::json!("ada")));
        assert!(client.get("nick").is_none());
    }

    #[test]
    fn roles_come_from_auth() {
        let auth = AuthInfo::new("u1").with_role("mod");
        let (client, _rx) = test_client("c1", Some(auth));
        assert!(client.is_authenticated());
        assert_eq!(client.info().user_id.as_deref(), Some("u1"));
        let wanted: HashSet<String> = ["mod".to_string()].into();
        assert!(client.has_any_role(&wanted));
        let other: HashSet<String> = ["admin".to_string()].into();
        assert!(!client.has_any_role(&other));
    }

    #[tokio::test]
    async fn join_without_hub_fails() {
        let (client, _rx) = test_client("c1", None);
        assert!(matches!(client.join_room("r"), Err(WebSocketError::HubNotRunning)));
    }

    #[tokio::test]
    async fn loops_relay_both_directions_and_close_once() {
        let (server_ws, mut peer) = socket_pair().await;
        let client = ServerClient::new(ClientInfo::new("c1"), None, ClientSettings::default());
        let recorder = Arc::new(Recorder::default());
        client.start(server_ws, recorder.clone()).await;

        client.send_text("first").unwrap();
        client.send_text("second").unwrap();
        assert_eq!(peer.next().await.unwrap().unwrap(), tungstenite::Message::Text("first".into()));
        assert_eq!(peer.next().await.unwrap().unwrap(), tungstenite::Message::Text("second".into()));

        peer.send(tungstenite::Message::Text("from peer".into())).await.unwrap();
        time::timeout(Duration::from_secs(2), async {
            while recorder.messages.lock().is_empty() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let received = recorder.messages.lock()[0].clone();
        assert_eq!(received.as_text(), Some("from peer"));
        assert_eq!(received.client_id(), Some("c1"));

        client.close_with_code(CloseCode::Away, "bye").await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(client.send_text("late"), Err(WebSocketError::NotConnected)));

        match peer.next().await.unwrap().unwrap() {
            tungstenite::Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_notifies_observer() {
        let (server_ws, mut peer) = socket_pair().await;
        let client = ServerClient::new(ClientInfo::new("c2"), None, ClientSettings::default());
        let recorder = Arc::new(Recorder::default());
        client.start(server_ws, recorder.clone()).await;

        peer.close(None).await.unwrap();
        time::timeout(Duration::from_secs(2), async {
            while recorder.disconnects.load(Ordering::SeqCst) == 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
