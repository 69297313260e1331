//! Connection state, per-connection counters and the identity records shared by
//! the client and server halves.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The single authoritative state field of a connection.
///
/// Transitions go through [`AtomicConnectionState::transition`], so when two tasks
/// race on the same transition exactly one of them wins.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`; returns `false` if the current state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally stores `to`, returning the previous state.
    pub fn swap(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }
}

/// Monotonic per-connection counters.
///
/// Only the connection's own loops write them; anyone may read a snapshot.
#[derive(Debug)]
pub struct ConnectionMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

impl ConnectionMetrics {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: Utc.timestamp_millis_opt(last_ms).single().unwrap_or_else(Utc::now),
        }
    }
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_activity: DateTime<Utc>,
}

/// Identity produced by an authenticator and attached to a connection for its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user_id: String,
    pub username: String,
    pub roles: HashSet<String>,
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl AuthInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// An empty identity counts as anonymous.
    pub fn is_authenticated(&self) -> bool {
        !self.user_id.is_empty()
    }
}

/// Snapshot of what the server knows about one accepted connection.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub user_id: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
    pub rooms: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_ping_at: Option<DateTime<Utc>>,
}

impl ClientInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            remote_addr: None,
            user_agent: None,
            headers: HashMap::new(),
            rooms: BTreeSet::new(),
            connected_at: Utc::now(),
            last_ping_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_transition_wins() {
        let state = AtomicConnectionState::new(ConnectionState::Disconnected);
        assert!(state.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!state.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(state.get(), ConnectionState::Connecting);
        assert_eq!(state.swap(ConnectionState::Closed), ConnectionState::Connecting);
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[test]
    fn metrics_accumulate() {
        let metrics = ConnectionMetrics::default();
        metrics.record_sent(10);
        metrics.record_sent(5);
        metrics.record_received(3);
        metrics.record_error();
        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 3);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn auth_info_roles() {
        let auth = AuthInfo::new("u1").with_role("admin");
        assert!(auth.is_authenticated());
        assert!(auth.has_role("admin"));
        assert!(!AuthInfo::default().is_authenticated());
    }
}
