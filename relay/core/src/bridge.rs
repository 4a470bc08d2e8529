//! Stream Bridge
//!
//! Adapts a token-streaming [`ChatBackend`] into the two shapes consumers need:
//!
//! - a fire-and-forget streaming call that reports through a [`StreamSink`]
//!   (tokens in emission order, then exactly one terminal callback)
//! - a blocking call with a deadline that aggregates the stream into one
//!   final text
//!
//! Operations run as jobs on a bounded [`WorkerPool`]. A bridge has no pool
//! until it is started; calls made before that (or after [`StreamBridge::shutdown`])
//! fail fast with [`BridgeError::Configuration`].
//!
//! # Example
//!
//! ```ignore
//! let bridge = StreamBridge::new(Arc::new(OllamaBackend::default()), BridgeConfig::default());
//! bridge.start(PoolConfig::default())?;
//!
//! let answer = bridge.chat(request, Duration::from_secs(30)).await?;
//! ```

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatBackend, StreamingToken};
use crate::pool::{PoolConfig, PoolError, WorkerPool};
use crate::request::ChatRequest;

/// Errors reported by bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No execution context (not started, or shut down)
    #[error("Chat bridge unavailable: {0}")]
    Configuration(String),

    /// No terminal event arrived before the deadline
    #[error("Chat response timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The backend failed
    #[error("Chat streaming failed: {0}")]
    Stream(#[source] anyhow::Error),

    /// The worker pool rejected the operation
    #[error("Chat service busy: {workers} operations running, {queued} queued")]
    Saturated {
        /// Busy workers at the time of rejection
        workers: usize,
        /// Backlog length at the time of rejection
        queued: usize,
    },

    /// The operation's cancellation token fired
    #[error("Chat operation cancelled")]
    Cancelled,
}

impl From<PoolError> for BridgeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Saturated { workers, queued } => Self::Saturated { workers, queued },
            PoolError::Shutdown => Self::Configuration("worker pool is shut down".to_string()),
        }
    }
}

/// Bridge settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Deadline used by [`StreamBridge::blocking_chat`]
    pub response_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Receiver of one streaming operation's events
///
/// The bridge calls `on_token` zero or more times, in emission order and never
/// concurrently, then exactly one of `on_complete` or `on_error`. Nothing is
/// called after the terminal callback.
#[async_trait]
pub trait StreamSink: Send + 'static {
    /// A fragment of generated text
    async fn on_token(&mut self, token: String);

    /// The operation completed with its aggregate text
    async fn on_complete(&mut self, final_text: String);

    /// The operation failed
    async fn on_error(&mut self, error: BridgeError);
}

/// [`StreamSink`] built from three closures
pub struct CallbackSink<T, C, E> {
    on_token: T,
    on_complete: Option<C>,
    on_error: Option<E>,
}

impl<T, C, E> CallbackSink<T, C, E>
where
    T: FnMut(String) + Send + 'static,
    C: FnOnce(String) + Send + 'static,
    E: FnOnce(BridgeError) + Send + 'static,
{
    /// Wrap the closures
    pub fn new(on_token: T, on_complete: C, on_error: E) -> Self {
        Self {
            on_token,
            on_complete: Some(on_complete),
            on_error: Some(on_error),
        }
    }
}

#[async_trait]
impl<T, C, E> StreamSink for CallbackSink<T, C, E>
where
    T: FnMut(String) + Send + 'static,
    C: FnOnce(String) + Send + 'static,
    E: FnOnce(BridgeError) + Send + 'static,
{
    async fn on_token(&mut self, token: String) {
        (self.on_token)(token);
    }

    async fn on_complete(&mut self, final_text: String) {
        self.on_error = None;
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(final_text);
        }
    }

    async fn on_error(&mut self, error: BridgeError) {
        self.on_complete = None;
        if let Some(on_error) = self.on_error.take() {
            on_error(error);
        }
    }
}

/// Where a waiter receives the terminal result
enum Reply {
    Async(oneshot::Sender<Result<String, BridgeError>>),
    Blocking(std_mpsc::SyncSender<Result<String, BridgeError>>),
}

/// Sink that discards tokens and hands the terminal result to a waiter
struct ResultSink {
    reply: Option<Reply>,
}

impl ResultSink {
    fn new(reply: Reply) -> Self {
        Self { reply: Some(reply) }
    }

    fn finish(&mut self, result: Result<String, BridgeError>) {
        // A waiter that already timed out has dropped its receiver
        match self.reply.take() {
            Some(Reply::Async(tx)) => {
                let _ = tx.send(result);
            }
            Some(Reply::Blocking(tx)) => {
                let _ = tx.try_send(result);
            }
            None => {}
        }
    }
}

#[async_trait]
impl StreamSink for ResultSink {
    async fn on_token(&mut self, _token: String) {}

    async fn on_complete(&mut self, final_text: String) {
        self.finish(Ok(final_text));
    }

    async fn on_error(&mut self, error: BridgeError) {
        self.finish(Err(error));
    }
}

struct BridgeInner {
    backend: Arc<dyn ChatBackend>,
    pool: RwLock<Option<WorkerPool>>,
    config: BridgeConfig,
}

/// Turns a token-streaming backend into streaming and blocking chat calls
///
/// Cheap to clone; clones share the backend and worker pool.
#[derive(Clone)]
pub struct StreamBridge {
    inner: Arc<BridgeInner>,
}

impl StreamBridge {
    /// Create an inactive bridge
    ///
    /// Call [`start`](Self::start) or [`attach`](Self::attach) before use.
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                backend,
                pool: RwLock::new(None),
                config,
            }),
        }
    }

    /// Start a worker pool on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Configuration`] when called outside a runtime.
    pub fn start(&self, pool_config: PoolConfig) -> Result<(), BridgeError> {
        let runtime = Handle::try_current()
            .map_err(|e| BridgeError::Configuration(format!("no tokio runtime: {e}")))?;
        self.attach(WorkerPool::new(pool_config, runtime));
        Ok(())
    }

    /// Use an existing worker pool, replacing any previous one
    pub fn attach(&self, pool: WorkerPool) {
        tracing::info!(
            backend = self.inner.backend.name(),
            core_size = pool.config().core_size,
            max_size = pool.config().max_size,
            "Chat bridge activated"
        );
        if let Some(previous) = self.inner.pool.write().replace(pool) {
            previous.shutdown();
        }
    }

    /// Stop accepting operations
    ///
    /// Operations already running finish normally.
    pub fn shutdown(&self) {
        if let Some(pool) = self.inner.pool.write().take() {
            pool.shutdown();
            tracing::info!("Chat bridge shut down");
        }
    }

    /// Whether the bridge currently accepts operations
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.pool.read().is_some()
    }

    /// The backend this bridge streams from
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.inner.backend
    }

    /// Bridge settings
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    fn active_pool(&self) -> Result<WorkerPool, BridgeError> {
        self.inner
            .pool
            .read()
            .clone()
            .ok_or_else(|| BridgeError::Configuration("bridge has not been started".to_string()))
    }

    /// Stream a chat operation into `sink`
    ///
    /// Returns the operation's cancellation token. Never waits for the
    /// backend; rejections are reported through `sink.on_error`.
    pub async fn stream<S: StreamSink>(&self, request: ChatRequest, sink: S) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.stream_with_cancel(request, sink, cancel.clone()).await;
        cancel
    }

    /// Stream a chat operation into three callbacks
    pub async fn stream_with_callbacks<T, C, E>(
        &self,
        request: ChatRequest,
        on_token: T,
        on_complete: C,
        on_error: E,
    ) -> CancellationToken
    where
        T: FnMut(String) + Send + 'static,
        C: FnOnce(String) + Send + 'static,
        E: FnOnce(BridgeError) + Send + 'static,
    {
        self.stream(request, CallbackSink::new(on_token, on_complete, on_error))
            .await
    }

    /// Stream a chat operation governed by a caller-owned cancellation token
    pub async fn stream_with_cancel<S: StreamSink>(
        &self,
        request: ChatRequest,
        mut sink: S,
        cancel: CancellationToken,
    ) {
        let pool = match self.active_pool() {
            Ok(pool) => pool,
            Err(err) => {
                tracing::error!(error = %err, "Rejecting chat operation");
                sink.on_error(err).await;
                return;
            }
        };

        let reservation = match pool.try_reserve() {
            Ok(reservation) => reservation,
            Err(err) => {
                tracing::warn!(error = %err, "Rejecting chat operation");
                sink.on_error(err.into()).await;
                return;
            }
        };

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            immediate = reservation.is_immediate(),
            "Submitting chat operation"
        );
        let backend = Arc::clone(&self.inner.backend);
        reservation.submit(Box::pin(run_stream(backend, request, sink, cancel)));
    }

    /// Run a chat operation to completion, waiting at most `timeout`
    ///
    /// On timeout the operation is cancelled.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Timeout`] if the deadline elapses first, otherwise the
    /// error the operation terminated with.
    pub async fn chat(&self, request: ChatRequest, timeout: Duration) -> Result<String, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        self.stream_with_cancel(request, ResultSink::new(Reply::Async(tx)), cancel.clone())
            .await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(abandoned()),
            Err(_) => {
                cancel.cancel();
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "Chat response timed out");
                Err(BridgeError::Timeout { timeout })
            }
        }
    }

    /// Blocking chat with the configured response timeout
    ///
    /// # Errors
    ///
    /// See [`blocking_chat_with_timeout`](Self::blocking_chat_with_timeout).
    pub fn blocking_chat(&self, request: ChatRequest) -> Result<String, BridgeError> {
        self.blocking_chat_with_timeout(request, self.inner.config.response_timeout)
    }

    /// Run a chat operation, blocking the calling thread for at most `timeout`
    ///
    /// Must not be called from an async runtime worker thread; use
    /// `spawn_blocking` or a plain thread.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Configuration`] if the bridge is not active,
    /// [`BridgeError::Timeout`] if the deadline elapses first, otherwise the
    /// error the operation terminated with.
    pub fn blocking_chat_with_timeout(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let pool = self.active_pool()?;
        let (tx, rx) = std_mpsc::sync_channel(1);
        let cancel = CancellationToken::new();

        let bridge = self.clone();
        let token = cancel.clone();
        pool.runtime().spawn(async move {
            bridge
                .stream_with_cancel(request, ResultSink::new(Reply::Blocking(tx)), token)
                .await;
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                cancel.cancel();
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "Chat response timed out");
                Err(BridgeError::Timeout { timeout })
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(abandoned()),
        }
    }
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("backend", &self.inner.backend.name())
            .field("config", &self.inner.config)
            .field("active", &self.is_active())
            .finish()
    }
}

fn abandoned() -> BridgeError {
    BridgeError::Stream(anyhow::anyhow!("operation dropped before a terminal event"))
}

async fn run_stream<S: StreamSink>(
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
    mut sink: S,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(BridgeError::Cancelled),
        result = forward_tokens(backend.as_ref(), &request, &mut sink) => result,
    };

    match outcome {
        Ok(final_text) => {
            tracing::debug!(chars = final_text.len(), "Chat operation complete");
            sink.on_complete(final_text).await;
        }
        Err(err) => {
            tracing::debug!(error = %err, "Chat operation failed");
            sink.on_error(err).await;
        }
    }
}

async fn forward_tokens<S: StreamSink>(
    backend: &dyn ChatBackend,
    request: &ChatRequest,
    sink: &mut S,
) -> Result<String, BridgeError> {
    let mut rx = backend
        .send_streaming(request)
        .await
        .map_err(BridgeError::Stream)?;

    while let Some(token) = rx.recv().await {
        match token {
            StreamingToken::Token(text) => sink.on_token(text).await,
            StreamingToken::Complete { message } => return Ok(message),
            StreamingToken::Error(message) => {
                return Err(BridgeError::Stream(anyhow::anyhow!(message)))
            }
        }
    }

    Err(BridgeError::Stream(anyhow::anyhow!(
        "stream ended without a terminal event"
    )))
}
