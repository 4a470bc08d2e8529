//! Scripted Backend
//!
//! An in-memory [`ChatBackend`] that replays a fixed script. Used for headless
//! runs and tests where a real model server is not available.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::{ChatBackend, ModelInfo, StreamingToken};
use crate::request::ChatRequest;

/// What a scripted backend does for every request
#[derive(Clone, Debug)]
pub enum Script {
    /// Emit the tokens, then complete with `final_text`
    Complete {
        /// Fragments to emit
        tokens: Vec<String>,
        /// Aggregate text reported on completion
        final_text: String,
    },
    /// Emit the tokens, then report `error`
    Fail {
        /// Fragments to emit before failing
        tokens: Vec<String>,
        /// Error reported to the consumer
        error: String,
    },
    /// Emit the tokens, then never terminate
    Hang {
        /// Fragments to emit before hanging
        tokens: Vec<String>,
    },
    /// Emit the tokens, then close the stream without a terminal
    Truncated {
        /// Fragments to emit before closing
        tokens: Vec<String>,
    },
    /// Emit `<prompt>1` through `<prompt>N`, where the prompt is the last
    /// message's text, then complete with their concatenation
    Numbered {
        /// Number of tokens
        count: usize,
    },
    /// Refuse the request before any stream exists
    Refuse(String),
}

impl Script {
    /// Complete with the concatenation of `tokens`
    #[must_use]
    pub fn echo(tokens: &[&str]) -> Self {
        Self::Complete {
            tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
            final_text: tokens.concat(),
        }
    }
}

/// Backend that replays a [`Script`]
#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    script: Script,
    token_delay: Duration,
    calls: Arc<AtomicUsize>,
    live_streams: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Create a backend replaying `script`
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            token_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pause between emitted tokens
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Number of `send_streaming` calls so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of producer tasks still running
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }
}

/// Decrements the live stream count when the producer task ends
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send_streaming(
        &self,
        request: &ChatRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (tokens, terminal) = match &self.script {
            Script::Refuse(reason) => anyhow::bail!("{reason}"),
            Script::Complete { tokens, final_text } => (
                tokens.clone(),
                Some(StreamingToken::Complete {
                    message: final_text.clone(),
                }),
            ),
            Script::Fail { tokens, error } => {
                (tokens.clone(), Some(StreamingToken::Error(error.clone())))
            }
            Script::Hang { tokens } => (tokens.clone(), None),
            Script::Numbered { count } => {
                let prompt = request.messages.last().map_or("", |m| m.text.as_str());
                let tokens: Vec<String> = (1..=*count).map(|n| format!("{prompt}{n}")).collect();
                let message = tokens.concat();
                (tokens, Some(StreamingToken::Complete { message }))
            }
            Script::Truncated { tokens } => {
                let (tx, rx) = mpsc::channel(16);
                let tokens = tokens.clone();
                tokio::spawn(async move {
                    for token in tokens {
                        if tx.send(StreamingToken::Token(token)).await.is_err() {
                            return;
                        }
                    }
                });
                return Ok(rx);
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let delay = self.token_delay;
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live_streams));

        tokio::spawn(async move {
            let _guard = guard;
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(StreamingToken::Token(token)).await.is_err() {
                    return;
                }
            }
            match terminal {
                Some(terminal) => {
                    let _ = tx.send(terminal).await;
                }
                // Hold the stream open until the consumer goes away
                None => tx.closed().await,
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            name: "scripted".to_string(),
            size: None,
            parameters: None,
            quantization: None,
        }])
    }
}
