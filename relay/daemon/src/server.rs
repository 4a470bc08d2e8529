//! Daemon Server Implementation
//!
//! This module provides the WebSocket entry point for the relay:
//! - Accepts connections on a TCP listener and upgrades them to WebSocket
//! - Reads the caller's `userId` from the handshake query string
//! - Spawns a handler task per connection that feeds the [`StreamRouter`]
//! - Sweeps closed connections out of the registry periodically
//! - Supports graceful shutdown
//!
//! # Multi-Connection Architecture
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!     ws://…?userId=a  ws://…?userId=a  ws://… (anonymous)
//!       (conn-1)         (conn-2)         (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                    StreamRouter
//!               (with SessionRegistry)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::{
    ChatBackend, ConnectionId, RelayConfig, RouterConfig, ServerSettings, SessionRegistry,
    StreamBridge, StreamFrame, StreamRouter, UserKey,
};

/// How often closed connections are swept from the registry
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Connection state tracking (internal to server, separate from `SessionHandle`)
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Caller identity from the handshake
    user: UserKey,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Build the bridge and router a [`RelayConfig`] describes
///
/// Must be called from within a Tokio runtime; the bridge's worker pool is
/// started on the current one.
pub fn build_router(config: &RelayConfig, backend: Arc<dyn ChatBackend>) -> Result<StreamRouter> {
    let bridge = StreamBridge::new(backend, config.bridge.clone());
    bridge
        .start(config.pool.clone())
        .context("Failed to start stream bridge")?;

    Ok(StreamRouter::new(
        SessionRegistry::new(),
        bridge,
        RouterConfig {
            default_model: config.backend.model.clone(),
            cancel_on_disconnect: config.cancel_on_disconnect,
        },
    ))
}

/// Extract the caller identity from a handshake query string
///
/// Anything other than a non-blank `userId` parameter is anonymous. The value
/// is percent-decoded; a value that does not decode to UTF-8 is used as sent.
pub fn user_from_query(query: Option<&str>) -> UserKey {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "userId")
        .map_or_else(UserKey::anonymous, |(_, value)| {
            let value = value.replace('+', " ");
            match urlencoding::decode(&value) {
                Ok(decoded) => UserKey::new(decoded),
                Err(_) => UserKey::new(value),
            }
        })
}

/// The WebSocket daemon server
pub struct DaemonServer {
    /// Listener settings
    settings: ServerSettings,
    /// Router every connection feeds
    router: StreamRouter,
    /// Active connection state (task handles, identity)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(settings: ServerSettings, router: StreamRouter) -> Self {
        Self {
            settings,
            router,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.settings.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.settings.listen_addr))?;
        info!(addr = %self.settings.listen_addr, "Listening for connections");
        Ok(listener)
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown` is cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        // Spawn task to periodically cleanup closed connections
        let registry = self.router.registry().clone();
        let cleanup_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cleanup_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_closed();
                        if removed > 0 {
                            debug!(removed, "Swept closed connections");
                        }
                    }
                }
            }
        });

        // Main accept loop
        loop {
            let (stream, addr) = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            // Check connection limit
            if self.connection_states.len() >= self.settings.max_connections {
                warn!(peer = %addr, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            let router = self.router.clone();
            let connection_states = Arc::clone(&self.connection_states);
            let capacity = self.settings.channel_capacity;
            let conn_shutdown = shutdown.clone();

            // Hold the state lock until the entry exists so a fast-failing
            // handshake cannot remove it before it is inserted.
            let entry = self.connection_states.entry(conn_id);
            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    capacity,
                    router,
                    connection_states,
                    conn_shutdown,
                )
                .instrument(tracing::info_span!("connection", %conn_id, peer = %addr)),
            );
            entry.or_insert(ConnectionState {
                connected_at: Instant::now(),
                user: UserKey::anonymous(),
                abort_handle: task_handle.abort_handle(),
            });
        }

        // Graceful shutdown
        self.shutdown().await;
        Ok(())
    }

    /// Handle a single client connection
    ///
    /// Chat payloads read from the socket go to the router; frames the router
    /// queues for this connection are written back as text messages.
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: TcpStream,
        capacity: usize,
        router: StreamRouter,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
        shutdown: CancellationToken,
    ) {
        let mut user = UserKey::anonymous();
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                user = user_from_query(request.uri().query());
                Ok(response)
            },
        )
        .await;

        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                connection_states.remove(&conn_id);
                return;
            }
        };

        if let Some(mut state) = connection_states.get_mut(&conn_id) {
            state.user = user.clone();
        }

        let (frame_tx, mut frame_rx) = mpsc::channel::<StreamFrame>(capacity);
        router.on_open(conn_id, frame_tx, user.clone());
        info!(user = %user, "Connection opened");

        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    router.on_close(conn_id, "server shutting down");
                    break;
                }

                // Read from client
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            debug!(bytes = text.len(), "Received chat payload");
                            router.on_message(conn_id, &text).await;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            match String::from_utf8(bytes) {
                                Ok(text) => {
                                    router.on_message(conn_id, &text).await;
                                }
                                Err(_) => warn!("Ignoring non-UTF-8 binary message"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "client closed".to_string());
                            router.on_close(conn_id, &reason);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            router.on_error(conn_id, &e.to_string());
                            break;
                        }
                        None => {
                            router.on_close(conn_id, "stream ended");
                            break;
                        }
                    }
                }

                // Write frames to this specific client
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        router.on_close(conn_id, "frame channel closed");
                        break;
                    };
                    match frame.to_json() {
                        Ok(json) => {
                            if let Err(e) = sink.send(Message::Text(json)).await {
                                router.on_error(conn_id, &e.to_string());
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode frame"),
                    }
                }
            }
        }

        connection_states.remove(&conn_id);

        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Graceful shutdown
    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        // Give handlers a moment to send close frames, then abort stragglers
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
                self.router.on_close(conn_id, "server shutting down");
            }
        }

        self.router.bridge().shutdown();
        info!("Shutdown complete");
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        connected_at: conn_state.connected_at,
                        user: conn_state.user.clone(),
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was established
    pub connected_at: Instant,
    /// Caller identity
    pub user: UserKey,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Script, ScriptedBackend};
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_user_from_query() {
        assert_eq!(user_from_query(Some("userId=alice")).as_str(), "alice");
        assert_eq!(
            user_from_query(Some("token=x&userId=bob&y=1")).as_str(),
            "bob"
        );
        assert_eq!(user_from_query(Some("userId=")), UserKey::anonymous());
        assert_eq!(user_from_query(Some("user=alice")), UserKey::anonymous());
        assert_eq!(user_from_query(None), UserKey::anonymous());
    }

    #[test]
    fn test_user_from_query_percent_decodes() {
        assert_eq!(user_from_query(Some("userId=a%40b")).as_str(), "a@b");
        assert_eq!(user_from_query(Some("userId=J%C3%BCrgen")).as_str(), "Jürgen");
        assert_eq!(user_from_query(Some("userId=Ann+Lee")).as_str(), "Ann Lee");
        assert_eq!(user_from_query(Some("userId=%20%20")), UserKey::anonymous());
    }

    #[test]
    fn test_server_settings_default() {
        let settings = ServerSettings::default();
        assert_eq!(settings.max_connections, 100);
        assert_eq!(settings.channel_capacity, 256);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_websocket_round_trip() {
        let mut config = RelayConfig::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        let backend = Arc::new(ScriptedBackend::new(Script::echo(&["Hel", "lo"])));
        let router = build_router(&config, backend).expect("router");

        let server = Arc::new(DaemonServer::new(config.server.clone(), router));
        let listener = server.bind().await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();

        let serving = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };

        let (mut ws, _) = connect_async(format!("ws://{addr}/chat?userId=alice"))
            .await
            .expect("connect");
        ws.send(Message::Text(
            r#"{"requestId":"r1","messages":[{"type":"USER","text":"hi"}]}"#.to_string(),
        ))
        .await
        .expect("send");

        let mut kinds = Vec::new();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let frame: Value = serde_json::from_str(&text).expect("json");
            assert_eq!(frame["requestId"], "r1");
            let kind = frame["type"].as_str().unwrap_or_default().to_string();
            let done = kind == "done";
            kinds.push(kind);
            if done {
                assert_eq!(frame["data"], "Hello");
                break;
            }
        }
        assert_eq!(kinds, vec!["token", "token", "done"]);

        let stats = server.connection_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.values().next().map(|s| s.user.as_str()), Some("alice"));

        ws.close(None).await.expect("close");
        shutdown.cancel();
        serving.await.expect("join").expect("serve");
        assert_eq!(server.connection_count(), 0);
    }
}
