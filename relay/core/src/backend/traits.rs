//! Chat Backend Traits
//!
//! Trait definitions for token-streaming chat backends. The bridge only ever
//! talks to a backend through [`ChatBackend`], so the provider (Ollama, a test
//! script, something else) can change without touching routing logic.
//!
//! # Contract
//!
//! `send_streaming` hands back a channel of [`StreamingToken`]s: zero or more
//! `Token`s followed by exactly one `Complete` or `Error`. Implementations stop
//! producing once the receiver is dropped.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::request::ChatRequest;

/// Token stream events from chat backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A fragment of the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message (may differ from concatenated tokens)
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

/// Information about an available model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,
    /// Model size in bytes (if known)
    pub size: Option<u64>,
    /// Parameter count (if known)
    pub parameters: Option<String>,
    /// Quantization level (if known)
    pub quantization: Option<String>,
}

/// Chat backend trait
///
/// Implement this trait to plug a different token producer into the bridge.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Send a request and get a streaming response
    ///
    /// Returns a channel receiver that will receive tokens as they arrive.
    /// The last item is always `Complete` or `Error`.
    async fn send_streaming(
        &self,
        request: &ChatRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// List available models
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// Check if a specific model is available
    async fn has_model(&self, model: &str) -> anyhow::Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.name == model))
    }
}

/// Backend connection configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the Ollama server
    pub base_url: String,
    /// Model used when a request names none
    pub model: String,
    /// Temperature used when a request sets none
    pub temperature: f64,
    /// Whether to ask the model to emit its reasoning
    pub think: bool,
    /// HTTP timeout for a single backend call
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "meditron:7b".to_string(),
            temperature: 0.7,
            think: false,
            request_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl BackendConfig {
    /// Create a configuration for a base URL and default model
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the default temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the thinking flag
    #[must_use]
    pub fn with_think(mut self, think: bool) -> Self {
        self.think = think;
        self
    }
}
