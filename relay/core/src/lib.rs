//! Relay Core - Streaming Chat Bridge and Session Multiplexer
//!
//! This crate turns a token-streaming language-model backend into two
//! consumer-facing shapes:
//!
//! - a blocking request/response call with deadline semantics, and
//! - many concurrent duplex connections that each receive the tokens of their
//!   own in-flight requests, survive connection churn, and clean up
//!   deterministically.
//!
//! It has no transport of its own; the daemon crate serves it over WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Duplex Connections                          │
//! │   conn-1 (alice)        conn-2 (alice)        conn-3 (anonymous)  │
//! └───────┬──────────────────────┬──────────────────────┬────────────┘
//!         │ chat payload   ▲     │ frames          ▲    │
//!         ▼                │     ▼                 │    ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  StreamRouter ──bind/resolve──► SessionRegistry                   │
//! │       │                          (connections, requests, users)   │
//! │       ▼ stream(request, sink)                                     │
//! │  StreamBridge ──jobs──► WorkerPool (core/max workers, backlog)    │
//! │       │                                                           │
//! │       ▼ send_streaming                                            │
//! │  ChatBackend (Ollama /api/chat, scripted)                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamBridge`]: streaming and blocking chat over a [`ChatBackend`]
//! - [`SessionRegistry`]: connection, request, and user directory
//! - [`StreamRouter`]: connection lifecycle and per-request event delivery
//! - [`WorkerPool`]: bounded executor the bridge runs operations on
//! - [`RelayConfig`]: layered configuration (file, environment, CLI)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     BridgeConfig, ConnectionId, OllamaBackend, PoolConfig, RouterConfig, SessionRegistry,
//!     StreamBridge, StreamRouter, UserKey,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bridge = StreamBridge::new(Arc::new(OllamaBackend::default()), BridgeConfig::default());
//!     bridge.start(PoolConfig::default())?;
//!
//!     let router = StreamRouter::new(SessionRegistry::new(), bridge, RouterConfig::default());
//!
//!     let (tx, mut rx) = mpsc::channel(256);
//!     let conn = router.on_open(ConnectionId::new(), tx, UserKey::anonymous());
//!     router
//!         .on_message(conn, r#"{"requestId":"r1","messages":[{"type":"USER","text":"hello"}]}"#)
//!         .await;
//!
//!     while let Some(frame) = rx.recv().await {
//!         println!("{}", frame.to_json()?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Chat backend abstraction (Ollama, scripted)
//! - [`bridge`]: Streaming and blocking chat calls
//! - [`config`]: TOML, environment, and CLI configuration
//! - [`messages`]: Request IDs, stream events, and wire frames
//! - [`pool`]: Bounded worker pool
//! - [`registry`]: Connection and request directory
//! - [`request`]: Chat requests and client payload parsing
//! - [`router`]: Connection lifecycle and event delivery

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod bridge;
pub mod config;
pub mod messages;
pub mod pool;
pub mod registry;
pub mod request;
pub mod router;

// Re-exports for convenience
pub use backend::{
    BackendConfig, ChatBackend, ModelInfo, OllamaBackend, Script, ScriptedBackend, StreamingToken,
};
pub use bridge::{BridgeConfig, BridgeError, CallbackSink, StreamBridge, StreamSink};
pub use messages::{FrameKind, RequestId, StreamEvent, StreamFrame};
pub use pool::{PoolConfig, PoolError, Reservation, WorkerPool};
pub use registry::{
    Binding, ConnectionId, RegistrySummary, SessionHandle, SessionRegistry, UserKey,
};
pub use request::{ChatOptions, ChatRequest, ClientChatMessage, Message, MessageRole, ParseError};
pub use router::{RouterConfig, StreamRouter};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_env,
    ConfigError, ConfigOverrides, ConfigSource, RelayConfig, RelayToml, ServerSettings,
};
