//! Chat Backend Integration
//!
//! This module provides abstracted access to token-streaming chat backends
//! through a common trait interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server (default)
//! - **Scripted**: In-memory replay for headless runs and tests
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{BackendConfig, ChatBackend, OllamaBackend};
//! use relay_core::request::{ChatRequest, Message};
//!
//! let backend = OllamaBackend::new(BackendConfig::default());
//! let request = ChatRequest::new("llama3.2").with_message(Message::user("Hello!"));
//! let rx = backend.send_streaming(&request).await?;
//! ```

mod ollama;
mod scripted;
mod traits;

pub use ollama::OllamaBackend;
pub use scripted::{Script, ScriptedBackend};
pub use traits::{BackendConfig, ChatBackend, ModelInfo, StreamingToken};
