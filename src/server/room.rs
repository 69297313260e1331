//! Named groups of connections sharing broadcasts and a bounded history.
//!
//! Lock order inside a room is always members, then history, then the replay
//! buffers. Admission snapshots history and registers a replay buffer under the
//! member lock; broadcasting appends to history under the same lock (shared).
//! Broadcasts that reach a member still being replayed to are parked in its
//! buffer, so a joining client sees every message exactly once and in order.
//! No lock is held while messages are handed to a client.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use tungstenite::protocol::frame::coding::CloseCode;

use crate::{
    message::{Message, MessageType},
    server::client::ServerClient,
    utils::error::{Result, WebSocketError},
};

/// Admission and retention policy for a room.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Member limit. `0` means unlimited.
    pub max_clients: usize,
    pub require_auth: bool,
    /// When non-empty, members need at least one of these roles.
    pub allowed_roles: HashSet<String>,
    /// Messages kept for replay to new members. `0` keeps none.
    pub history_length: usize,
    /// Delete the room once it has been empty this long.
    pub ttl: Option<Duration>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            max_clients: 0,
            require_auth: false,
            allowed_roles: HashSet::new(),
            history_length: 100,
            ttl: None,
        }
    }
}

impl RoomOptions {
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_history(mut self, history_length: usize) -> Self {
        self.history_length = history_length;
        self
    }

    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.allowed_roles.insert(role.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Invoked with the room name when the last member leaves.
pub type EmptyHandler = Arc<dyn Fn(String) + Send + Sync>;

pub struct Room {
    name: String,
    options: RoomOptions,
    members: RwLock<HashMap<String, Arc<ServerClient>>>,
    history: RwLock<VecDeque<Message>>,
    /// Live broadcasts held back for members whose history replay is running.
    replaying: Mutex<HashMap<String, Vec<Message>>>,
    closed: AtomicBool,
    on_empty: RwLock<Option<EmptyHandler>>,
    idle_since: Mutex<Option<Instant>>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("members", &self.client_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Room {
    pub fn new(name: impl Into<String>, options: RoomOptions) -> Self {
        Self {
            name: name.into(),
            options,
            members: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            replaying: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            on_empty: RwLock::new(None),
            idle_since: Mutex::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &RoomOptions {
        &self.options
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.members.read().contains_key(client_id)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.members.read().keys().cloned().collect()
    }

    pub fn clients(&self) -> Vec<Arc<ServerClient>> {
        self.members.read().values().cloned().collect()
    }

    /// Buffered messages, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.history.read().iter().cloned().collect()
    }

    /// When the last member left, or `None` if the room has members or never had any.
    pub fn idle_since(&self) -> Option<Instant> {
        *self.idle_since.lock()
    }

    pub fn set_empty_handler(&self, handler: EmptyHandler) {
        *self.on_empty.write() = Some(handler);
    }

    /// Admits `client` after replaying the history to it.
    ///
    /// Checks run in order: closed, capacity, authentication, roles. Adding a
    /// current member again is a no-op.
    pub fn add_client(&self, client: Arc<ServerClient>) -> Result<()> {
        let backlog: Vec<Message> = {
            let mut members = self.members.write();
            if self.is_closed() {
                return Err(WebSocketError::RoomClosed);
            }
            if members.contains_key(client.id()) {
                return Ok(());
            }
            if self.options.max_clients > 0 && members.len() >= self.options.max_clients {
                return Err(WebSocketError::RoomFull);
            }
            if self.options.require_auth && !client.is_authenticated() {
                return Err(WebSocketError::Unauthorized);
            }
            if !self.options.allowed_roles.is_empty()
                && !client.has_any_role(&self.options.allowed_roles)
            {
                return Err(WebSocketError::Unauthorized);
            }

            let backlog = self.history.read().iter().cloned().collect();
            self.replaying.lock().insert(client.id().to_owned(), Vec::new());
            members.insert(client.id().to_owned(), client.clone());
            *self.idle_since.lock() = None;
            debug!(room = %self.name, client_id = client.id(), members = members.len(), "client joined room");
            backlog
        };

        self.replay(&client, backlog);
        Ok(())
    }

    /// Hands history to a new member, then whatever was parked for it meanwhile,
    /// and finally switches it over to live delivery.
    fn replay(&self, client: &ServerClient, mut backlog: Vec<Message>) {
        let mut delivering = true;
        loop {
            for message in backlog.drain(..) {
                if !delivering {
                    break;
                }
                if let Err(e) = client.send(message) {
                    debug!(room = %self.name, client_id = client.id(), error = %e, "history replay cut short");
                    delivering = false;
                }
            }
            let mut replaying = self.replaying.lock();
            match replaying.get_mut(client.id()) {
                Some(parked) if !parked.is_empty() => backlog = std::mem::take(parked),
                _ => {
                    replaying.remove(client.id());
                    return;
                }
            }
        }
    }

    /// Removes a member; fires the empty handler if it was the last one.
    pub fn remove_client(&self, client_id: &str) -> Option<Arc<ServerClient>> {
        let (removed, now_empty) = {
            let mut members = self.members.write();
            let removed = members.remove(client_id);
            let now_empty = removed.is_some() && members.is_empty();
            if now_empty {
                *self.idle_since.lock() = Some(Instant::now());
            }
            (removed, now_empty)
        };

        if removed.is_some() {
            debug!(room = %self.name, client_id, "client left room");
            if now_empty {
                self.fire_empty();
            }
        }
        removed
    }

    fn fire_empty(&self) {
        let Some(handler) = self.on_empty.read().clone() else {
            return;
        };
        let name = self.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handler(name) });
            }
            Err(_) => handler(name),
        }
    }

    /// Sends to every connected member and records the message in history.
    /// Returns how many members accepted it.
    pub fn broadcast(&self, kind: MessageType, payload: impl Into<Vec<u8>>) -> Result<usize> {
        self.publish(Message::new(kind, payload), None)
    }

    /// Like [`Room::broadcast`], skipping `exclude_id`.
    pub fn broadcast_except(
        &self,
        kind: MessageType,
        payload: impl Into<Vec<u8>>,
        exclude_id: &str,
    ) -> Result<usize> {
        self.publish(Message::new(kind, payload), Some(exclude_id))
    }

    /// Publishes an already built message, tagging it with this room.
    pub fn publish(&self, message: Message, exclude_id: Option<&str>) -> Result<usize> {
        if self.is_closed() {
            return Err(WebSocketError::RoomClosed);
        }
        let message = message.with_room(self.name.clone());

        let targets: Vec<Arc<ServerClient>> = {
            let members = self.members.read();
            if self.options.history_length > 0 {
                let mut history = self.history.write();
                history.push_back(message.clone());
                while history.len() > self.options.history_length {
                    history.pop_front();
                }
            }
            members
                .values()
                .filter(|client| Some(client.id()) != exclude_id)
                .cloned()
                .collect()
        };

        let target_count = targets.len();
        let live: Vec<Arc<ServerClient>> = {
            let mut replaying = self.replaying.lock();
            if replaying.is_empty() {
                targets
            } else {
                targets
                    .into_iter()
                    .filter(|client| match replaying.get_mut(client.id()) {
                        Some(parked) => {
                            parked.push(message.clone());
                            false
                        }
                        None => true,
                    })
                    .collect()
            }
        };
        let parked = target_count - live.len();

        let delivered = parked
            + live
                .iter()
                .filter(|client| client.is_connected() && client.send(message.clone()).is_ok())
                .count();
        debug!(room = %self.name, delivered, targets = target_count, "room broadcast");
        Ok(delivered)
    }

    /// Marks the room closed and detaches every member without disconnecting them.
    pub(crate) fn retire(&self) -> Vec<Arc<ServerClient>> {
        self.closed.store(true, Ordering::Release);
        let members: Vec<_> = self.members.write().drain().map(|(_, client)| client).collect();
        self.history.write().clear();
        members
    }

    /// Closes the room and every member connection with a normal-closure code.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let members = self.retire();
        info!(room = %self.name, members = members.len(), "closing room");
        join_all(members.iter().map(|client| {
            client.remove_room(&self.name);
            client.close_with_code(CloseCode::Normal, "room closed")
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::client::test_client;
    use crate::state::{AuthInfo, ConnectionState};

    #[test]
    fn lobby_scenario() {
        let room = Room::new("lobby", RoomOptions::default().with_max_clients(2));
        let (a, mut rx_a) = test_client("a", None);
        let (b, mut rx_b) = test_client("b", None);
        let (c, mut rx_c) = test_client("c", None);

        room.add_client(a.clone()).unwrap();
        room.add_client(b.clone()).unwrap();
        assert!(matches!(room.add_client(c.clone()), Err(WebSocketError::RoomFull)));

        assert_eq!(room.broadcast(MessageType::Text, "hi").unwrap(), 2);
        assert_eq!(rx_a.try_recv().unwrap().as_text(), Some("hi"));
        assert_eq!(rx_b.try_recv().unwrap().as_text(), Some("hi"));
        assert!(rx_c.try_recv().is_err());
        assert_eq!(room.history().len(), 1);

        room.remove_client("a");
        room.add_client(c).unwrap();
        assert_eq!(rx_c.try_recv().unwrap().as_text(), Some("hi"));
        assert_eq!(room.client_count(), 2);
    }

    #[test]
    fn removed_member_misses_later_broadcasts() {
        let room = Room::new("r", RoomOptions::default());
        let (a, mut rx_a) = test_client("a", None);
        let (b, mut rx_b) = test_client("b", None);
        room.add_client(a).unwrap();
        room.add_client(b).unwrap();
        room.remove_client("b");

        assert_eq!(room.broadcast(MessageType::Text, "after").unwrap(), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn history_is_a_ring_buffer_replayed_in_order() {
        let room = Room::new("r", RoomOptions::default().with_history(3));
        for i in 0..5 {
            room.broadcast(MessageType::Text, format!("m{i}")).unwrap();
        }
        let texts: Vec<_> = room
            .history()
            .iter()
            .map(|m| m.as_text().unwrap().to_owned())
            .collect();
        assert_eq!(texts, ["m2", "m3", "m4"]);

        let (late, mut rx) = test_client("late", None);
        room.add_client(late).unwrap();
        for expected in ["m2", "m3", "m4"] {
            let message = rx.try_recv().unwrap();
            assert_eq!(message.as_text(), Some(expected));
            assert_eq!(message.room(), Some("r"));
        }
    }

    #[test]
    fn broadcasts_during_replay_wait_behind_history() {
        let room = Room::new("r", RoomOptions::default());
        room.broadcast(MessageType::Text, "old").unwrap();
        let backlog = room.history();

        // Admission has registered the member but not replayed yet.
        let (late, mut rx) = test_client("late", None);
        room.replaying.lock().insert("late".into(), Vec::new());
        room.members.write().insert("late".into(), late.clone());

        assert_eq!(room.broadcast(MessageType::Text, "new").unwrap(), 1);
        assert!(rx.try_recv().is_err());

        room.replay(&late, backlog);
        assert_eq!(rx.try_recv().unwrap().as_text(), Some("old"));
        assert_eq!(rx.try_recv().unwrap().as_text(), Some("new"));
        assert!(room.replaying.lock().is_empty());

        room.broadcast(MessageType::Text, "live").unwrap();
        assert_eq!(rx.try_recv().unwrap().as_text(), Some("live"));
    }

    #[test]
    fn idle_since_tracks_the_last_departure() {
        let room = Room::new("r", RoomOptions::default());
        assert!(room.idle_since().is_none());
        let (a, _rx) = test_client("a", None);

        room.add_client(a.clone()).unwrap();
        room.remove_client("a");
        let first = room.idle_since().expect("idle after last leave");

        room.add_client(a).unwrap();
        assert!(room.idle_since().is_none());
        room.remove_client("a");
        assert!(room.idle_since().unwrap() >= first);
        assert!(room.remove_client("a").is_none());
    }

    #[test]
    fn broadcast_except_skips_sender() {
        let room = Room::new("r", RoomOptions::default().with_history(0));
        let (a, mut rx_a) = test_client("a", None);
        let (b, mut rx_b) = test_client("b", None);
        room.add_client(a).unwrap();
        room.add_client(b).unwrap();

        assert_eq!(room.broadcast_except(MessageType::Text, "x", "a").unwrap(), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(room.history().is_empty());
    }

    #[test]
    fn auth_and_role_checks() {
        let room = Room::new("staff", RoomOptions::default().require_auth().with_role("admin"));
        let (anon, _rx1) = test_client("anon", None);
        let (user, _rx2) = test_client("user", Some(AuthInfo::new("u").with_role("member")));
        let (admin, _rx3) = test_client("admin", Some(AuthInfo::new("x").with_role("admin")));

        assert!(matches!(room.add_client(anon), Err(WebSocketError::Unauthorized)));
        assert!(matches!(room.add_client(user), Err(WebSocketError::Unauthorized)));
        room.add_client(admin).unwrap();
    }

    #[tokio::test]
    async fn empty_handler_fires_when_last_member_leaves() {
        let room = Room::new("r", RoomOptions::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        room.set_empty_handler(Arc::new(move |name| {
            let _ = tx.send(name);
        }));
        let (a, _rx_a) = test_client("a", None);
        let (b, _rx_b) = test_client("b", None);
        room.add_client(a).unwrap();
        room.add_client(b).unwrap();

        room.remove_client("a");
        room.remove_client("b");
        assert_eq!(rx.recv().await.as_deref(), Some("r"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_disconnects_members_and_rejects_new_ones() {
        let room = Room::new("r", RoomOptions::default());
        let (a, _rx) = test_client("a", None);
        room.add_client(a.clone()).unwrap();
        room.broadcast(MessageType::Text, "x").unwrap();

        room.close().await;
        room.close().await;
        assert!(room.is_empty());
        assert!(room.history().is_empty());
        assert_eq!(a.state(), ConnectionState::Closed);

        let (b, _rx_b) = test_client("b", None);
        assert!(matches!(room.add_client(b), Err(WebSocketError::RoomClosed)));
        assert!(matches!(
            room.broadcast(MessageType::Text, "y"),
            Err(WebSocketError::RoomClosed)
        ));
    }
}
