//! Process-wide registry of server connections and rooms.
//!
//! Registration, unregistration and both kinds of broadcast travel through one
//! bounded queue consumed by a single dispatch loop, so they apply in arrival
//! order. Callers wait for queue capacity instead of bypassing the loop. Register
//! and unregister also wait for the loop's acknowledgement, so the registry already
//! reflects the change when they return.
//!
//! The hub never holds its own locks while calling into a room or a client; it
//! snapshots what it needs and then acts.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    message::Message,
    server::{
        client::ServerClient,
        room::{Room, RoomOptions},
    },
    utils::error::{Result, WebSocketError},
};

enum HubEvent {
    Register {
        client: Arc<ServerClient>,
        ack: oneshot::Sender<Result<()>>,
    },
    Unregister {
        client_id: String,
        ack: oneshot::Sender<Option<Arc<ServerClient>>>,
    },
    Broadcast {
        message: Message,
    },
    BroadcastToRoom {
        room: String,
        message: Message,
        exclude: Option<String>,
    },
}

pub struct Hub {
    me: Weak<Hub>,
    clients: RwLock<HashMap<String, Arc<ServerClient>>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    events: RwLock<Option<mpsc::Sender<HubEvent>>>,
    pending: Mutex<Option<mpsc::Receiver<HubEvent>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    default_room_options: RoomOptions,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .field("rooms", &self.room_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Hub {
    /// Creates a stopped hub whose event queue holds `queue_size` events.
    pub fn new(queue_size: usize) -> Arc<Self> {
        Self::with_room_defaults(queue_size, RoomOptions::default())
    }

    /// Like [`Hub::new`], with the options used for rooms created on first join.
    pub fn with_room_defaults(queue_size: usize, default_room_options: RoomOptions) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            clients: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            events: RwLock::new(Some(sender)),
            pending: Mutex::new(Some(receiver)),
            dispatcher: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            default_room_options,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the dispatch loop. Later calls do nothing.
    pub async fn start(&self) {
        let Some(receiver) = self.pending.lock().take() else {
            return;
        };
        let Some(hub) = self.me.upgrade() else {
            return;
        };
        self.running.store(true, Ordering::Release);
        *self.dispatcher.lock().await = Some(tokio::spawn(hub.run(receiver)));
        info!("hub started");
    }

    /// Drains queued events, stops the loop, then closes every room.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.events.write().take();
        self.pending.lock().take();

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "hub dispatch loop ended abnormally");
            }
        }

        let rooms: Vec<Arc<Room>> = self.rooms.write().drain().map(|(_, room)| room).collect();
        for room in &rooms {
            room.close().await;
        }
        self.clients.write().clear();
        info!(rooms = rooms.len(), "hub stopped");
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<HubEvent>) {
        while let Some(event) = receiver.recv().await {
            self.dispatch(event);
        }
        debug!("hub dispatch loop drained");
    }

    fn dispatch(&self, event: HubEvent) {
        match event {
            HubEvent::Register { client, ack } => {
                let _ = ack.send(self.apply_register(client));
            }
            HubEvent::Unregister { client_id, ack } => {
                let _ = ack.send(self.apply_unregister(&client_id));
            }
            HubEvent::Broadcast { message } => {
                let targets = self.clients();
                let delivered = targets
                    .iter()
                    .filter(|client| client.is_connected() && client.send(message.clone()).is_ok())
                    .count();
                debug!(delivered, targets = targets.len(), "hub broadcast");
            }
            HubEvent::BroadcastToRoom { room, message, exclude } => match self.get_room(&room) {
                Some(target) => {
                    if let Err(e) = target.publish(message, exclude.as_deref()) {
                        debug!(room = %room, error = %e, "room broadcast skipped");
                    }
                }
                None => debug!(room = %room, "broadcast to vanished room dropped"),
            },
        }
    }

    fn apply_register(&self, client: Arc<ServerClient>) -> Result<()> {
        let mut clients = self.clients.write();
        if clients.contains_key(client.id()) {
            return Err(WebSocketError::DuplicateClient(client.id().to_owned()));
        }
        client.attach_hub(self.me.clone());
        debug!(client_id = client.id(), total = clients.len() + 1, "client registered");
        clients.insert(client.id().to_owned(), client);
        Ok(())
    }

    fn apply_unregister(&self, client_id: &str) -> Option<Arc<ServerClient>> {
        let client = self.clients.write().remove(client_id)?;
        for room_name in client.rooms() {
            if let Some(room) = self.get_room(&room_name) {
                room.remove_client(client_id);
            }
            client.remove_room(&room_name);
        }
        debug!(client_id, "client unregistered");
        Some(client)
    }

    fn sender(&self) -> Result<mpsc::Sender<HubEvent>> {
        if !self.is_running() {
            return Err(WebSocketError::HubNotRunning);
        }
        self.events.read().clone().ok_or(WebSocketError::HubNotRunning)
    }

    async fn enqueue(&self, event: HubEvent) -> Result<()> {
        self.sender()?
            .send(event)
            .await
            .map_err(|_| WebSocketError::HubNotRunning)
    }

    /// Adds a client to the registry. Ids must be unique among live clients.
    pub async fn register_client(&self, client: Arc<ServerClient>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.enqueue(HubEvent::Register { client, ack }).await?;
        done.await.map_err(|_| WebSocketError::HubNotRunning)?
    }

    /// Removes a client from the registry and from every room it joined.
    pub async fn unregister_client(&self, client_id: &str) -> Result<Option<Arc<ServerClient>>> {
        let (ack, done) = oneshot::channel();
        self.enqueue(HubEvent::Unregister {
            client_id: client_id.to_owned(),
            ack,
        })
        .await?;
        done.await.map_err(|_| WebSocketError::HubNotRunning)
    }

    /// Queues `message` for every connected client. Individual failures are ignored.
    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.enqueue(HubEvent::Broadcast { message }).await
    }

    /// Queues `message` for the members of `room`, optionally skipping one client.
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        message: Message,
        exclude: Option<&str>,
    ) -> Result<()> {
        if self.get_room(room).is_none() {
            return Err(WebSocketError::RoomNotFound(room.to_owned()));
        }
        self.enqueue(HubEvent::BroadcastToRoom {
            room: room.to_owned(),
            message,
            exclude: exclude.map(str::to_owned),
        })
        .await
    }

    pub fn get_client(&self, client_id: &str) -> Option<Arc<ServerClient>> {
        self.clients.read().get(client_id).cloned()
    }

    /// Snapshot of all registered clients.
    pub fn clients(&self) -> Vec<Arc<ServerClient>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(name).cloned()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Creates a room explicitly.
    pub fn create_room(&self, name: &str, options: RoomOptions) -> Result<Arc<Room>> {
        let room = {
            let mut rooms = self.rooms.write();
            if rooms.contains_key(name) {
                return Err(WebSocketError::RoomExists(name.to_owned()));
            }
            let room = Arc::new(Room::new(name, options));
            rooms.insert(name.to_owned(), room.clone());
            room
        };
        self.install_ttl(&room);
        info!(room = name, "room created");
        Ok(room)
    }

    fn get_or_create_room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.get_room(name) {
            return room;
        }
        let (room, created) = {
            let mut rooms = self.rooms.write();
            match rooms.get(name) {
                Some(room) => (room.clone(), false),
                None => {
                    let room = Arc::new(Room::new(name, self.default_room_options.clone()));
                    rooms.insert(name.to_owned(), room.clone());
                    (room, true)
                }
            }
        };
        if created {
            self.install_ttl(&room);
            info!(room = name, "room created on first join");
        }
        room
    }

    /// Deletes empty rooms with a TTL once they have stayed empty for that long.
    fn install_ttl(&self, room: &Arc<Room>) {
        let Some(ttl) = room.options().ttl else {
            return;
        };
        let hub = self.me.clone();
        let target = Arc::downgrade(room);
        room.set_empty_handler(Arc::new(move |name| {
            let hub = hub.clone();
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let (Some(hub), Some(target)) = (hub.upgrade(), target.upgrade()) else {
                    return;
                };
                let still_registered = hub
                    .get_room(&name)
                    .map_or(false, |current| Arc::ptr_eq(&current, &target));
                // A later emptying restarts the clock and has its own timer.
                let expired = target
                    .idle_since()
                    .map_or(false, |since| since.elapsed() >= ttl);
                if still_registered && expired {
                    info!(room = %name, "removing idle room");
                    let _ = hub.delete_room(&name);
                }
            });
        }));
    }

    /// Removes a room. Members stay connected but lose their membership.
    pub fn delete_room(&self, name: &str) -> Result<()> {
        let room = self
            .rooms
            .write()
            .remove(name)
            .ok_or_else(|| WebSocketError::RoomNotFound(name.to_owned()))?;
        for client in room.retire() {
            client.remove_room(name);
        }
        info!(room = name, "room deleted");
        Ok(())
    }

    /// Adds a registered client to `room`, creating the room with default options
    /// if it does not exist. Membership is mirrored on the client.
    pub fn join_room(&self, client_id: &str, room_name: &str) -> Result<Arc<Room>> {
        let client = self
            .get_client(client_id)
            .ok_or_else(|| WebSocketError::ClientNotFound(client_id.to_owned()))?;
        let room = self.get_or_create_room(room_name);
        room.add_client(client.clone())?;
        client.add_room(room_name);

        if self.get_client(client_id).is_none() {
            // Unregistered while joining; undo so both sides stay in sync.
            room.remove_client(client_id);
            client.remove_room(room_name);
            return Err(WebSocketError::ClientNotFound(client_id.to_owned()));
        }
        Ok(room)
    }

    pub fn leave_room(&self, client_id: &str, room_name: &str) -> Result<()> {
        let room = self
            .get_room(room_name)
            .ok_or_else(|| WebSocketError::RoomNotFound(room_name.to_owned()))?;
        let removed = room.remove_client(client_id);
        if let Some(client) = removed.or_else(|| self.get_client(client_id)) {
            client.remove_room(room_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::server::client::test_client;
    use std::time::Duration;

    async fn running_hub() -> Arc<Hub> {
        let hub = Hub::new(16);
        hub.start().await;
        hub
    }

    #[tokio::test]
    async fn register_then_unregister_removes_from_rooms() {
        let hub = running_hub().await;
        let (client, _rx) = test_client("c1", None);
        hub.register_client(client.clone()).await.unwrap();
        assert!(hub.get_client("c1").is_some());

        hub.join_room("c1", "a").unwrap();
        hub.join_room("c1", "b").unwrap();
        assert_eq!(client.rooms().len(), 2);

        let removed = hub.unregister_client("c1").await.unwrap();
        assert!(removed.is_some());
        assert!(hub.get_client("c1").is_none());
        assert!(!hub.get_room("a").unwrap().contains("c1"));
        assert!(!hub.get_room("b").unwrap().contains("c1"));
        assert!(client.rooms().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let hub = running_hub().await;
        let (first, _rx1) = test_client("same", None);
        let (second, _rx2) = test_client("same", None);
        hub.register_client(first).await.unwrap();
        assert!(matches!(
            hub.register_client(second).await,
            Err(WebSocketError::DuplicateClient(_))
        ));
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn join_then_leave_restores_both_sides() {
        let hub = running_hub().await;
        let (client, _rx) = test_client("c1", None);
        hub.register_client(client.clone()).await.unwrap();
        hub.create_room("r", RoomOptions::default()).unwrap();

        let rooms_before = client.rooms();
        let members_before = hub.get_room("r").unwrap().client_ids();

        hub.join_room("c1", "r").unwrap();
        assert!(client.in_room("r"));
        hub.leave_room("c1", "r").unwrap();

        assert_eq!(client.rooms(), rooms_before);
        assert_eq!(hub.get_room("r").unwrap().client_ids(), members_before);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connected_client() {
        let hub = running_hub().await;
        let (a, mut rx_a) = test_client("a", None);
        let (b, mut rx_b) = test_client("b", None);
        let (gone, mut rx_gone) = test_client("gone", None);
        hub.register_client(a).await.unwrap();
        hub.register_client(b).await.unwrap();
        hub.register_client(gone.clone()).await.unwrap();
        gone.close().await;

        hub.broadcast(Message::text("all")).await.unwrap();
        // Register round-trips through the loop, so it orders after the broadcast.
        let (probe, _rx) = test_client("probe", None);
        hub.register_client(probe).await.unwrap();

        assert_eq!(rx_a.try_recv().unwrap().as_text(), Some("all"));
        assert_eq!(rx_b.try_recv().unwrap().as_text(), Some("all"));
        assert!(rx_gone.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_room_respects_membership_and_exclusion() {
        let hub = running_hub().await;
        let (a, mut rx_a) = test_client("a", None);
        let (b, mut rx_b) = test_client("b", None);
        let (outsider, mut rx_o) = test_client("o", None);
        for client in [a, b, outsider] {
            hub.register_client(client).await.unwrap();
        }
        hub.join_room("a", "r").unwrap();
        hub.join_room("b", "r").unwrap();

        hub.broadcast_to_room("r", Message::new(MessageType::Text, "x"), Some("a"))
            .await
            .unwrap();
        let (probe, _rx) = test_client("probe", None);
        hub.register_client(probe).await.unwrap();

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().room(), Some("r"));
        assert!(rx_o.try_recv().is_err());

        assert!(matches!(
            hub.broadcast_to_room("missing", Message::text("x"), None).await,
            Err(WebSocketError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn operations_fail_when_not_running() {
        let hub = Hub::new(4);
        let (client, _rx) = test_client("c", None);
        assert!(matches!(
            hub.register_client(client).await,
            Err(WebSocketError::HubNotRunning)
        ));
    }

    #[tokio::test]
    async fn create_and_delete_rooms() {
        let hub = running_hub().await;
        hub.create_room("r", RoomOptions::default()).unwrap();
        assert!(matches!(
            hub.create_room("r", RoomOptions::default()),
            Err(WebSocketError::RoomExists(_))
        ));

        let (client, _rx) = test_client("c", None);
        hub.register_client(client.clone()).await.unwrap();
        hub.join_room("c", "r").unwrap();
        hub.delete_room("r").unwrap();
        assert!(hub.get_room("r").is_none());
        assert!(!client.in_room("r"));
        assert!(client.is_connected());
        assert!(matches!(hub.delete_room("r"), Err(WebSocketError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn room_with_ttl_disappears_after_emptying() {
        let hub = running_hub().await;
        hub.create_room("tmp", RoomOptions::default().with_ttl(Duration::from_millis(50)))
            .unwrap();
        let (client, _rx) = test_client("c", None);
        hub.register_client(client).await.unwrap();
        hub.join_room("c", "tmp").unwrap();
        hub.leave_room("c", "tmp").unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(hub.get_room("tmp").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoining_restarts_the_ttl_clock() {
        let ttl = Duration::from_millis(400);
        let hub = running_hub().await;
        hub.create_room("tmp", RoomOptions::default().with_ttl(ttl)).unwrap();
        let (client, _rx) = test_client("c", None);
        hub.register_client(client).await.unwrap();

        hub.join_room("c", "tmp").unwrap();
        hub.leave_room("c", "tmp").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        hub.join_room("c", "tmp").unwrap();
        hub.leave_room("c", "tmp").unwrap();

        // The first timer fires here, 100ms into the second idle period.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(hub.get_room("tmp").is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(hub.get_room("tmp").is_none());
    }

    #[tokio::test]
    async fn stop_closes_rooms_and_their_members() {
        let hub = running_hub().await;
        let (client, _rx) = test_client("c", None);
        hub.register_client(client.clone()).await.unwrap();
        hub.join_room("c", "r").unwrap();

        hub.stop().await;
        assert!(!hub.is_running());
        assert_eq!(hub.room_count(), 0);
        assert_eq!(hub.client_count(), 0);
        assert!(!client.is_connected());
        assert!(matches!(
            hub.broadcast(Message::text("late")).await,
            Err(WebSocketError::HubNotRunning)
        ));
    }
}
