//! Stream Router
//!
//! Connects duplex client connections to the [`StreamBridge`]. Each chat
//! payload becomes one streaming operation whose events are framed and
//! delivered to whichever connection owns the request at that moment.
//!
//! # Request Lifecycle
//!
//! ```text
//!   Unbound ──bind──► Bound ──token──► Bound ──done/error──► Unbound
//!                       │
//!                       └──connection closed──► Unbound (no terminal frame)
//! ```
//!
//! A connection that goes away while its request streams simply stops
//! receiving: lookups miss and events are dropped with a log line. When
//! `cancel_on_disconnect` is set the orphaned streams are also cancelled.
//!
//! Once released, a request ID may be bound again by another connection while
//! the detached stream is still running. Every stream remembers the connection
//! that started it and only ever delivers to, or releases, that owner's binding.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeError, StreamBridge, StreamSink};
use crate::messages::{RequestId, StreamEvent, StreamFrame};
use crate::registry::{Binding, ConnectionId, SessionHandle, SessionRegistry, UserKey};
use crate::request::ClientChatMessage;

/// Router settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    /// Model used when a payload names none
    pub default_model: String,
    /// Cancel a connection's streams when it closes
    pub cancel_on_disconnect: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model: "meditron:7b".to_string(),
            cancel_on_disconnect: false,
        }
    }
}

/// Routes chat payloads from connections into the bridge and frames back out
///
/// Cheap to clone; clones share the registry, bridge, and in-flight table.
#[derive(Clone)]
pub struct StreamRouter {
    registry: SessionRegistry,
    bridge: StreamBridge,
    config: Arc<RouterConfig>,
    inflight: Arc<DashMap<InFlightKey, CancellationToken>>,
}

/// A running operation: the request ID and the connection that started it
type InFlightKey = (RequestId, ConnectionId);

impl StreamRouter {
    /// Create a router over a registry and bridge
    #[must_use]
    pub fn new(registry: SessionRegistry, bridge: StreamBridge, config: RouterConfig) -> Self {
        Self {
            registry,
            bridge,
            config: Arc::new(config),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// The registry this router delivers through
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The bridge this router streams from
    #[must_use]
    pub fn bridge(&self) -> &StreamBridge {
        &self.bridge
    }

    /// Number of operations started and not yet terminated
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// A connection opened
    pub fn on_open(
        &self,
        connection: ConnectionId,
        tx: mpsc::Sender<StreamFrame>,
        user: UserKey,
    ) -> ConnectionId {
        self.registry
            .register(SessionHandle::new(connection, tx, user))
    }

    /// A connection sent a chat payload
    ///
    /// Returns the request ID the operation streams under, or `None` if no
    /// operation was started.
    pub async fn on_message(&self, connection: ConnectionId, text: &str) -> Option<RequestId> {
        if !self.registry.contains(&connection) {
            tracing::warn!(
                connection_id = %connection,
                "Dropping message from unknown connection"
            );
            return None;
        }

        let mut message = match ClientChatMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection,
                    error = %e,
                    "Rejecting malformed chat payload"
                );
                self.send_direct(
                    connection,
                    StreamFrame::error(None, format!("Invalid chat message: {e}")),
                );
                return None;
            }
        };

        let request_id = self.claim_request_id(message.request_id.take(), connection)?;
        let request = message.into_request(&self.config.default_model);

        let cancel = CancellationToken::new();
        let key = (request_id.clone(), connection);
        self.inflight.insert(key.clone(), cancel.clone());

        // Closed while we were binding
        if !self.registry.contains(&connection) {
            self.inflight.remove(&key);
            self.registry.unbind_owned(&request_id, connection);
            return None;
        }

        tracing::info!(
            connection_id = %connection,
            request_id = %request_id,
            model = %request.model,
            messages = request.messages.len(),
            "Starting chat stream"
        );

        let sink = RouterSink {
            registry: self.registry.clone(),
            inflight: Arc::clone(&self.inflight),
            request_id: request_id.clone(),
            owner: connection,
            tokens: 0,
            finished: false,
        };
        self.bridge.stream_with_cancel(request, sink, cancel).await;

        Some(request_id)
    }

    /// Bind a request ID to the connection, replacing missing or in-flight IDs
    fn claim_request_id(
        &self,
        requested: Option<RequestId>,
        connection: ConnectionId,
    ) -> Option<RequestId> {
        let mut candidate = requested;
        if candidate.is_none() {
            tracing::warn!(
                connection_id = %connection,
                "Chat payload has no requestId; generating one"
            );
        }

        loop {
            let request_id = candidate.take().unwrap_or_else(RequestId::generate);
            match self.registry.try_bind(request_id.clone(), connection) {
                Binding::Bound => return Some(request_id),
                Binding::Taken => {
                    tracing::warn!(
                        connection_id = %connection,
                        request_id = %request_id,
                        "requestId already in flight; generating a new one"
                    );
                }
                Binding::ConnectionGone => return None,
            }
        }
    }

    /// Send a frame straight to a connection, outside any request
    fn send_direct(&self, connection: ConnectionId, frame: StreamFrame) {
        match self.registry.channel_for(&connection) {
            Some(tx) => offer(tx, frame, connection),
            None => tracing::debug!(connection_id = %connection, "No channel for error frame"),
        }
    }

    /// A connection closed
    pub fn on_close(&self, connection: ConnectionId, reason: &str) {
        tracing::info!(connection_id = %connection, reason = reason, "Connection closed");
        self.release(connection);
    }

    /// A connection failed
    pub fn on_error(&self, connection: ConnectionId, error: &str) {
        tracing::warn!(connection_id = %connection, error = error, "Connection error");
        self.release(connection);
    }

    fn release(&self, connection: ConnectionId) {
        let released = self.registry.unregister(&connection);
        if released.is_empty() {
            return;
        }

        if self.config.cancel_on_disconnect {
            for request_id in released {
                self.cancel_owned(&(request_id, connection));
            }
        } else {
            tracing::debug!(
                connection_id = %connection,
                detached = released.len(),
                "Detached streams from closed connection"
            );
        }
    }

    /// Cancel an in-flight operation
    ///
    /// Cancels the operation of the connection currently owning the request,
    /// or every detached operation under that ID when no connection owns it.
    /// Returns true if anything was still running.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        if let Some(owner) = self.registry.resolve(request_id) {
            return self.cancel_owned(&(request_id.clone(), owner));
        }

        let detached: Vec<InFlightKey> = self
            .inflight
            .iter()
            .filter(|entry| entry.key().0 == *request_id)
            .map(|entry| entry.key().clone())
            .collect();
        detached
            .iter()
            .fold(false, |cancelled, key| self.cancel_owned(key) || cancelled)
    }

    fn cancel_owned(&self, key: &InFlightKey) -> bool {
        match self.inflight.remove(key) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(
                    request_id = %key.0,
                    connection_id = %key.1,
                    "Chat stream cancelled"
                );
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

/// Queue a frame without making the caller wait for channel capacity
///
/// A full channel hands the frame to a task that waits for room, so a
/// connection's reader never blocks on its own writer.
fn offer(tx: mpsc::Sender<StreamFrame>, frame: StreamFrame, connection: ConnectionId) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) => {
            tokio::spawn(async move {
                if tx.send(frame).await.is_err() {
                    tracing::debug!(connection_id = %connection, "Connection closed before queued frame");
                }
            });
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(connection_id = %connection, "Connection closed; dropping frame");
        }
    }
}

/// Delivers one request's events to the connection that started it
struct RouterSink {
    registry: SessionRegistry,
    inflight: Arc<DashMap<InFlightKey, CancellationToken>>,
    request_id: RequestId,
    owner: ConnectionId,
    tokens: usize,
    finished: bool,
}

impl RouterSink {
    /// The owner's channel, while the owner still holds the request
    fn channel(&self) -> Option<mpsc::Sender<StreamFrame>> {
        match self.registry.route(&self.request_id) {
            Some((connection, tx)) if connection == self.owner => {
                if tx.is_closed() {
                    tracing::debug!(
                        connection_id = %connection,
                        request_id = %self.request_id,
                        "Connection channel closed; dropping event"
                    );
                    None
                } else {
                    Some(tx)
                }
            }
            Some((connection, _)) => {
                tracing::debug!(
                    connection_id = %self.owner,
                    request_id = %self.request_id,
                    bound_to = %connection,
                    "Request bound to another connection; dropping event"
                );
                None
            }
            None => {
                tracing::debug!(
                    request_id = %self.request_id,
                    "Request no longer routed; dropping event"
                );
                None
            }
        }
    }

    /// Tokens wait for channel room; terminal frames never do
    async fn deliver(&self, event: StreamEvent) {
        let Some(tx) = self.channel() else {
            return;
        };

        if event.is_terminal() {
            offer(tx, event.into_frame(self.request_id.clone()), self.owner);
        } else if tx.send(event.into_frame(self.request_id.clone())).await.is_err() {
            tracing::debug!(
                connection_id = %self.owner,
                request_id = %self.request_id,
                "Connection closed during delivery"
            );
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.registry.unbind_owned(&self.request_id, self.owner);
        self.inflight.remove(&(self.request_id.clone(), self.owner));
    }
}

#[async_trait]
impl StreamSink for RouterSink {
    async fn on_token(&mut self, token: String) {
        self.tokens += 1;
        self.deliver(StreamEvent::Token { text: token }).await;
    }

    async fn on_complete(&mut self, final_text: String) {
        tracing::info!(
            request_id = %self.request_id,
            tokens = self.tokens,
            "Chat stream complete"
        );
        self.deliver(StreamEvent::Done { final_text }).await;
        self.finish();
    }

    async fn on_error(&mut self, error: BridgeError) {
        tracing::warn!(
            request_id = %self.request_id,
            error = %error,
            "Chat stream failed"
        );
        self.deliver(StreamEvent::Error {
            message: error.to_string(),
        })
        .await;
        self.finish();
    }
}

impl Drop for RouterSink {
    fn drop(&mut self) {
        // Operation dropped without a terminal callback (runtime shutting down)
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Script, ScriptedBackend};
    use crate::bridge::BridgeConfig;
    use crate::messages::FrameKind;
    use crate::pool::PoolConfig;
    use std::time::Duration;

    fn router(script: Script) -> (StreamRouter, ScriptedBackend) {
        let backend = ScriptedBackend::new(script);
        let bridge = StreamBridge::new(Arc::new(backend.clone()), BridgeConfig::default());
        bridge.start(PoolConfig::default()).unwrap();
        let router = StreamRouter::new(SessionRegistry::new(), bridge, RouterConfig::default());
        (router, backend)
    }

    fn open(router: &StreamRouter) -> (ConnectionId, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = router.on_open(ConnectionId::new(), tx, UserKey::anonymous());
        (conn, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<StreamFrame>) -> StreamFrame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_malformed_payload_gets_error_frame_without_request_id() {
        let (router, backend) = router(Script::echo(&["x"]));
        let (conn, mut rx) = open(&router);

        assert_eq!(router.on_message(conn, "{not json").await, None);

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.kind, FrameKind::Error);
        assert_eq!(frame.request_id, None);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_ignored() {
        let (router, backend) = router(Script::echo(&["x"]));
        let started = router
            .on_message(ConnectionId::new(), r#"{"requestId":"r1","messages":[]}"#)
            .await;
        assert_eq!(started, None);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_replaced() {
        let (router, _) = router(Script::Hang { tokens: vec![] });
        let (conn, _rx) = open(&router);
        let payload = r#"{"requestId":"r1","messages":[{"type":"USER","text":"hi"}]}"#;

        let first = router.on_message(conn, payload).await.unwrap();
        let second = router.on_message(conn, payload).await.unwrap();

        assert_eq!(first.as_str(), "r1");
        assert_ne!(second, first);
        assert_eq!(router.registry().resolve(&first), Some(conn));
        assert_eq!(router.registry().resolve(&second), Some(conn));
        assert_eq!(router.in_flight(), 2);

        assert!(router.cancel(&first));
        assert!(router.cancel(&second));
    }

    #[tokio::test]
    async fn test_cancel_targets_current_owner_of_reused_id() {
        let (router, _) = router(Script::Hang { tokens: vec![] });
        let payload = r#"{"requestId":"r1","messages":[{"type":"USER","text":"hi"}]}"#;
        let r1 = RequestId::from("r1");

        let (old_conn, _old_rx) = open(&router);
        router.on_message(old_conn, payload).await.unwrap();
        router.on_close(old_conn, "client went away");

        let (new_conn, _new_rx) = open(&router);
        assert_eq!(router.on_message(new_conn, payload).await, Some(r1.clone()));
        assert_eq!(router.in_flight(), 2);

        assert!(router.cancel(&r1));
        assert_eq!(router.in_flight(), 1);
        assert!(router.inflight.contains_key(&(r1.clone(), old_conn)));
        assert_eq!(router.registry().resolve(&r1), Some(new_conn));
    }

    #[tokio::test]
    async fn test_completion_releases_request() {
        let (router, _) = router(Script::echo(&["ok"]));
        let (conn, mut rx) = open(&router);

        let id = router
            .on_message(conn, r#"{"requestId":"r9","messages":[]}"#)
            .await
            .unwrap();

        assert_eq!(next_frame(&mut rx).await, StreamFrame::token(id.clone(), "ok"));
        assert_eq!(next_frame(&mut rx).await, StreamFrame::done(id.clone(), "ok"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while router.in_flight() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(router.registry().resolve(&id), None);
    }

    #[tokio::test]
    async fn test_cancel_on_disconnect_stops_stream() {
        let backend = ScriptedBackend::new(Script::Hang { tokens: vec![] });
        let bridge = StreamBridge::new(Arc::new(backend.clone()), BridgeConfig::default());
        bridge.start(PoolConfig::default()).unwrap();
        let router = StreamRouter::new(
            SessionRegistry::new(),
            bridge,
            RouterConfig {
                cancel_on_disconnect: true,
                ..Default::default()
            },
        );
        let (conn, _rx) = open(&router);

        router
            .on_message(conn, r#"{"messages":[{"type":"USER","text":"hi"}]}"#)
            .await
            .unwrap();
        router.on_close(conn, "client went away");

        assert_eq!(router.in_flight(), 0);
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.live_streams() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("producer should stop after cancellation");
    }
}
