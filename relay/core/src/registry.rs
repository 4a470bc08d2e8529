//! Session Registry - Connection and Request Directory
//!
//! Tracks live client connections and which connection owns each in-flight
//! request, so stream events can be delivered to the right channel.
//!
//! # Architecture
//!
//! ```text
//!                           SessionRegistry
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ connections: DashMap<ConnectionId, SessionHandle>            │
//!   │ requests:    DashMap<RequestId, ConnectionId>                │
//!   │ users:       DashMap<UserKey, HashSet<ConnectionId>>         │
//!   └──────────────────────────────────────────────────────────────┘
//!         ▲ bind / resolve / unbind          ▲ register / unregister
//!         │                                  │
//!    StreamRouter (per request)         Server (per connection)
//! ```
//!
//! # Thread Safety
//!
//! All three maps are sharded, so unrelated connections and requests never
//! contend on one lock. Callers never hold a map guard across an `.await`:
//! lookups hand back copies (`ConnectionId`) or clones (`mpsc::Sender`).
//!
//! After [`SessionRegistry::unregister`] returns, no request binding points at
//! the removed connection. A `bind` racing with `unregister` withdraws itself.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::{RequestId, StreamFrame};

/// Unique identifier for a client connection
///
/// Each connection is assigned a unique ID when it connects.
/// This ID is stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Logical user a connection belongs to
///
/// Used for bookkeeping only, never for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    /// Key used when a client does not identify itself
    pub const ANONYMOUS: &'static str = "anonymous";

    /// Create a user key; blank input maps to the anonymous user
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            Self::anonymous()
        } else {
            Self(trimmed.to_string())
        }
    }

    /// The anonymous user
    #[must_use]
    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserKey {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl From<&str> for UserKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a connected client
///
/// Stored in the [`SessionRegistry`] for each active connection.
#[derive(Debug)]
pub struct SessionHandle {
    /// Unique connection identifier
    pub id: ConnectionId,
    /// Channel feeding the connection's writer
    pub tx: mpsc::Sender<StreamFrame>,
    /// User the connection belongs to
    pub user: UserKey,
    /// When the client connected
    pub connected_at: Instant,
}

impl SessionHandle {
    /// Create a new session handle
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::Sender<StreamFrame>, user: UserKey) -> Self {
        Self {
            id,
            tx,
            user,
            connected_at: Instant::now(),
        }
    }

    /// Send a frame to this connection
    ///
    /// Returns true if the frame was queued.
    pub async fn send(&self, frame: StreamFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Try to send a frame without waiting
    #[must_use]
    pub fn try_send(&self, frame: StreamFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Check if the connection's writer is still receiving
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Get the connection uptime in seconds
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

/// Outcome of binding a request to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Binding {
    /// The request now belongs to the connection
    Bound,
    /// Another in-flight request already uses this ID
    Taken,
    /// The connection is not registered (or was unregistered concurrently)
    ConnectionGone,
}

impl Binding {
    /// Whether the binding took effect
    #[must_use]
    pub fn is_bound(self) -> bool {
        self == Self::Bound
    }
}

/// Registry of live connections and their in-flight requests
///
/// Cheap to clone; clones share the same maps.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    connections: Arc<DashMap<ConnectionId, SessionHandle>>,
    requests: Arc<DashMap<RequestId, ConnectionId>>,
    users: Arc<DashMap<UserKey, HashSet<ConnectionId>>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    ///
    /// Returns the connection's ID.
    pub fn register(&self, handle: SessionHandle) -> ConnectionId {
        let id = handle.id;
        let user = handle.user.clone();

        self.connections.insert(id, handle);
        self.users.entry(user.clone()).or_default().insert(id);

        tracing::info!(
            connection_id = %id,
            user = %user,
            "Connection registered"
        );
        id
    }

    /// Record that `connection` owns `request_id`, replacing any previous owner
    pub fn bind(&self, request_id: RequestId, connection: ConnectionId) -> Binding {
        if !self.connections.contains_key(&connection) {
            tracing::warn!(
                connection_id = %connection,
                request_id = %request_id,
                "Refusing to bind request to unknown connection"
            );
            return Binding::ConnectionGone;
        }

        self.requests.insert(request_id.clone(), connection);
        self.withdraw_if_gone(&request_id, connection)
    }

    /// Like [`bind`](Self::bind), but only if `request_id` is not already in flight
    pub fn try_bind(&self, request_id: RequestId, connection: ConnectionId) -> Binding {
        if !self.connections.contains_key(&connection) {
            return Binding::ConnectionGone;
        }

        match self.requests.entry(request_id.clone()) {
            Entry::Occupied(_) => return Binding::Taken,
            Entry::Vacant(slot) => {
                slot.insert(connection);
            }
        }
        self.withdraw_if_gone(&request_id, connection)
    }

    /// Undo a binding made while `connection` was being unregistered
    fn withdraw_if_gone(&self, request_id: &RequestId, connection: ConnectionId) -> Binding {
        if self.connections.contains_key(&connection) {
            tracing::debug!(
                connection_id = %connection,
                request_id = %request_id,
                "Request bound"
            );
            Binding::Bound
        } else {
            self.requests.remove_if(request_id, |_, owner| *owner == connection);
            Binding::ConnectionGone
        }
    }

    /// Connection currently owning a request
    #[must_use]
    pub fn resolve(&self, request_id: &RequestId) -> Option<ConnectionId> {
        self.requests.get(request_id).map(|owner| *owner)
    }

    /// Output channel of a connection
    #[must_use]
    pub fn channel_for(&self, connection: &ConnectionId) -> Option<mpsc::Sender<StreamFrame>> {
        self.connections.get(connection).map(|h| h.tx.clone())
    }

    /// Output channel of the connection owning a request
    #[must_use]
    pub fn route(&self, request_id: &RequestId) -> Option<(ConnectionId, mpsc::Sender<StreamFrame>)> {
        let connection = self.resolve(request_id)?;
        self.channel_for(&connection).map(|tx| (connection, tx))
    }

    /// Release a request binding
    ///
    /// Returns true if a binding was removed. Safe to call repeatedly.
    pub fn unbind(&self, request_id: &RequestId) -> bool {
        let removed = self.requests.remove(request_id).is_some();
        if removed {
            tracing::debug!(request_id = %request_id, "Request unbound");
        }
        removed
    }

    /// Release a request binding only while `connection` still owns it
    ///
    /// A request ID freed by a closed connection can be bound again by
    /// another one; the old owner must not release the new binding.
    pub fn unbind_owned(&self, request_id: &RequestId, connection: ConnectionId) -> bool {
        let removed = self
            .requests
            .remove_if(request_id, |_, owner| *owner == connection)
            .is_some();
        if removed {
            tracing::debug!(
                connection_id = %connection,
                request_id = %request_id,
                "Request unbound"
            );
        }
        removed
    }

    /// Remove a connection and every request bound to it
    ///
    /// Returns the released request IDs. Safe to call repeatedly.
    pub fn unregister(&self, connection: &ConnectionId) -> Vec<RequestId> {
        // Channel first, so a concurrent bind sees the connection as gone
        let handle = self.connections.remove(connection).map(|(_, h)| h);

        let mut released = Vec::new();
        self.requests.retain(|request_id, owner| {
            if *owner == *connection {
                released.push(request_id.clone());
                false
            } else {
                true
            }
        });

        if let Some(handle) = handle {
            self.forget_user_connection(&handle.user, connection);
            tracing::info!(
                connection_id = %connection,
                user = %handle.user,
                released = released.len(),
                uptime_secs = handle.uptime_secs(),
                "Connection unregistered"
            );
        }

        released
    }

    fn forget_user_connection(&self, user: &UserKey, connection: &ConnectionId) {
        let now_empty = match self.users.get_mut(user) {
            Some(mut set) => {
                set.remove(connection);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.users.remove_if(user, |_, set| set.is_empty());
        }
    }

    /// Get the number of registered connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of in-flight request bindings
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.connections.contains_key(connection)
    }

    /// Connections belonging to a user
    #[must_use]
    pub fn connections_for_user(&self, user: &UserKey) -> Vec<ConnectionId> {
        self.users
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Requests currently bound to a connection
    #[must_use]
    pub fn requests_for(&self, connection: &ConnectionId) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|entry| entry.value() == connection)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get a summary of registry contents
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            total_connections: self.connections.len(),
            in_flight_requests: self.requests.len(),
            users: self.users.len(),
        }
    }

    /// Remove connections whose writer has gone away
    ///
    /// Returns the number of connections removed.
    pub fn cleanup_closed(&self) -> usize {
        let closed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_open())
            .map(|entry| *entry.key())
            .collect();

        for id in &closed {
            tracing::info!(connection_id = %id, "Removing closed connection");
            self.unregister(id);
        }

        if !closed.is_empty() {
            tracing::info!(
                removed = closed.len(),
                remaining = self.connections.len(),
                "Cleaned up closed connections"
            );
        }
        closed.len()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("connection_count", &self.connections.len())
            .field("request_count", &self.requests.len())
            .field("user_count", &self.users.len())
            .finish()
    }
}

/// Summary of registry contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    /// Registered connections
    pub total_connections: usize,
    /// Requests currently bound to a connection
    pub in_flight_requests: usize,
    /// Users with at least one connection
    pub users: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle(user: &str) -> (SessionHandle, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(32);
        (SessionHandle::new(ConnectionId::new(), tx, UserKey::new(user)), rx)
    }

    fn rid(raw: &str) -> RequestId {
        RequestId::from(raw)
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::from_raw(42);
        assert_eq!(format!("{id}"), "conn-42");
    }

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_user_key_blank_is_anonymous() {
        assert_eq!(UserKey::new("  "), UserKey::anonymous());
        assert_eq!(UserKey::default().as_str(), "anonymous");
        assert_eq!(UserKey::new(" alice ").as_str(), "alice");
    }

    #[test]
    fn test_registry_register_unregister() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = create_test_handle("alice");
        let id = registry.register(handle);

        assert_eq!(registry.connection_count(), 1);
        assert!(registry.contains(&id));
        assert!(registry.channel_for(&id).is_some());
        assert_eq!(registry.connections_for_user(&UserKey::new("alice")), vec![id]);

        assert!(registry.unregister(&id).is_empty());
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.channel_for(&id).is_none());
        assert!(registry.connections_for_user(&UserKey::new("alice")).is_empty());
        assert_eq!(registry.summary().users, 0);
    }

    #[test]
    fn test_user_set_survives_while_other_connection_remains() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = create_test_handle("bob");
        let (b, _rx_b) = create_test_handle("bob");
        let a = registry.register(a);
        let b = registry.register(b);

        registry.unregister(&a);
        assert_eq!(registry.connections_for_user(&UserKey::new("bob")), vec![b]);
    }

    #[test]
    fn test_bind_resolve_unbind() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = create_test_handle("alice");
        let conn = registry.register(handle);

        assert!(registry.bind(rid("r1"), conn).is_bound());
        assert_eq!(registry.resolve(&rid("r1")), Some(conn));
        assert_eq!(registry.route(&rid("r1")).map(|(c, _)| c), Some(conn));

        assert!(registry.unbind(&rid("r1")));
        assert!(!registry.unbind(&rid("r1")));
        assert_eq!(registry.resolve(&rid("r1")), None);
    }

    #[test]
    fn test_bind_last_write_wins() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = create_test_handle("alice");
        let (b, _rx_b) = create_test_handle("alice");
        let a = registry.register(a);
        let b = registry.register(b);

        assert_eq!(registry.bind(rid("r1"), a), Binding::Bound);
        assert_eq!(registry.bind(rid("r1"), b), Binding::Bound);
        assert_eq!(registry.resolve(&rid("r1")), Some(b));
    }

    #[test]
    fn test_try_bind_refuses_in_flight_id() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = create_test_handle("alice");
        let conn = registry.register(handle);

        assert_eq!(registry.try_bind(rid("r1"), conn), Binding::Bound);
        assert_eq!(registry.try_bind(rid("r1"), conn), Binding::Taken);

        registry.unbind(&rid("r1"));
        assert_eq!(registry.try_bind(rid("r1"), conn), Binding::Bound);
    }

    #[test]
    fn test_unbind_owned_leaves_rebound_request() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = create_test_handle("alice");
        let (b, _rx_b) = create_test_handle("alice");
        let a = registry.register(a);
        let b = registry.register(b);

        assert!(registry.try_bind(rid("r1"), a).is_bound());
        registry.unregister(&a);
        assert!(registry.try_bind(rid("r1"), b).is_bound());

        // The closed connection's stream finishing late releases nothing
        assert!(!registry.unbind_owned(&rid("r1"), a));
        assert_eq!(registry.resolve(&rid("r1")), Some(b));

        assert!(registry.unbind_owned(&rid("r1"), b));
        assert_eq!(registry.resolve(&rid("r1")), None);
    }

    #[test]
    fn test_bind_to_unknown_connection() {
        let registry = SessionRegistry::new();
        let ghost = ConnectionId::new();
        assert_eq!(registry.bind(rid("r1"), ghost), Binding::ConnectionGone);
        assert_eq!(registry.try_bind(rid("r1"), ghost), Binding::ConnectionGone);
        assert_eq!(registry.request_count(), 0);
    }

    #[test]
    fn test_unregister_releases_every_binding() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = create_test_handle("alice");
        let (b, _rx_b) = create_test_handle("bob");
        let a = registry.register(a);
        let b = registry.register(b);

        let _ = registry.bind(rid("r1"), a);
        let _ = registry.bind(rid("r2"), a);
        let _ = registry.bind(rid("r3"), b);
        assert_eq!(registry.requests_for(&a).len(), 2);

        let mut released = registry.unregister(&a);
        released.sort();
        assert_eq!(released, vec![rid("r1"), rid("r2")]);
        assert_eq!(registry.resolve(&rid("r1")), None);
        assert_eq!(registry.resolve(&rid("r2")), None);
        assert_eq!(registry.resolve(&rid("r3")), Some(b));

        // Idempotent
        assert!(registry.unregister(&a).is_empty());
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.request_count(), 1);
    }

    #[test]
    fn test_cleanup_closed() {
        let registry = SessionRegistry::new();
        let (handle, rx) = create_test_handle("alice");
        let conn = registry.register(handle);
        let _ = registry.bind(rid("r1"), conn);
        let (live, _live_rx) = create_test_handle("bob");
        registry.register(live);

        drop(rx);

        assert_eq!(registry.cleanup_closed(), 1);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.resolve(&rid("r1")), None);
    }

    #[tokio::test]
    async fn test_handle_send() {
        let (handle, mut rx) = create_test_handle("alice");
        assert!(handle.is_open());
        assert!(handle.send(StreamFrame::token(rid("r1"), "He")).await);
        assert!(handle.try_send(StreamFrame::done(rid("r1"), "He")));
        assert_eq!(rx.recv().await.unwrap().data, "He");

        drop(rx);
        assert!(!handle.is_open());
        assert!(!handle.try_send(StreamFrame::token(rid("r1"), "x")));
    }

    #[test]
    fn test_concurrent_bind_and_unregister_leave_no_dangling_bindings() {
        let registry = SessionRegistry::new();

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let registry = registry.clone();
                scope.spawn(move || {
                    for round in 0..200 {
                        let (handle, _rx) = create_test_handle(&format!("user-{}", worker % 3));
                        let conn = registry.register(handle);

                        let binder = {
                            let registry = registry.clone();
                            std::thread::spawn(move || {
                                for n in 0..4 {
                                    let _ = registry.bind(rid(&format!("w{worker}-r{round}-{n}")), conn);
                                }
                            })
                        };
                        registry.unregister(&conn);
                        binder.join().unwrap();

                        for n in 0..4 {
                            let id = rid(&format!("w{worker}-r{round}-{n}"));
                            assert_ne!(registry.resolve(&id), Some(conn));
                        }
                    }
                });
            }
        });

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.request_count(), 0);
        assert_eq!(registry.summary().users, 0);
    }
}
