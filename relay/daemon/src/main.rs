//! Relay Daemon - WebSocket Entry Point and CLI for the Streaming Chat Bridge
//!
//! Serves the relay over WebSocket so many clients can stream chat responses
//! concurrently, and offers one-shot commands against the same backend.
//!
//! # Usage
//!
//! ```bash
//! # Serve with defaults (ws://127.0.0.1:8765)
//! relay-daemon serve
//!
//! # Custom listen address and config file
//! relay-daemon --config /etc/chat-relay/relay.toml serve --listen 0.0.0.0:9000
//!
//! # One blocking question with a 2 minute deadline
//! relay-daemon --timeout-minutes 2 ask "What is a fever?"
//!
//! # List backend models
//! relay-daemon models
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relay_core::{
    load_config_from_path, ChatBackend, ChatRequest, ConfigOverrides, Message, OllamaBackend,
    RelayConfig, StreamBridge,
};
use server::{build_router, DaemonServer};

/// Relay Daemon - streaming chat bridge for WebSocket clients
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Response timeout for blocking calls, in minutes
    #[arg(long, value_name = "MINUTES", global = true)]
    timeout_minutes: Option<u64>,

    /// Default model for requests that name none
    #[arg(short = 'm', long, global = true)]
    model: Option<String>,

    /// Ollama base URL
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the WebSocket endpoint
    Serve {
        /// Address to listen on
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Maximum simultaneous connections
        #[arg(long)]
        max_connections: Option<usize>,

        /// Cancel a connection's streams when it closes
        #[arg(long)]
        cancel_on_disconnect: bool,
    },
    /// Ask one question and print the full answer
    Ask {
        /// The question
        prompt: String,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,
    },
    /// List models the backend offers
    Models,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        overrides.response_timeout_minutes = self.timeout_minutes;
        overrides.model.clone_from(&self.model);
        overrides.base_url.clone_from(&self.base_url);
        if let Command::Serve {
            listen,
            max_connections,
            cancel_on_disconnect,
        } = &self.command
        {
            overrides.listen_addr.clone_from(listen);
            overrides.max_connections = *max_connections;
            if *cancel_on_disconnect {
                overrides.cancel_on_disconnect = Some(true);
            }
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load file and environment configuration, then apply CLI overrides
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;
    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        model = %config.backend.model,
        "Configuration loaded"
    );
    Ok(config)
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
            }
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, initiating shutdown");
        }
        shutdown.cancel();
    });

    Ok(())
}

async fn serve(config: RelayConfig) -> Result<()> {
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaBackend::new(config.backend.clone()));
    if !backend.health_check().await {
        tracing::warn!(url = %config.backend.base_url, "Backend is not reachable yet");
    }

    let router = build_router(&config, backend)?;
    let server = DaemonServer::new(config.server.clone(), router);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    server.run(shutdown).await
}

async fn ask(config: RelayConfig, prompt: String, system: Option<String>) -> Result<()> {
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaBackend::new(config.backend.clone()));
    let bridge = StreamBridge::new(backend, config.bridge.clone());
    bridge.start(config.pool.clone())?;

    let mut request = ChatRequest::new(config.backend.model.clone());
    if let Some(system) = system {
        request = request.with_message(Message::system(system));
    }
    request = request.with_message(Message::user(prompt));

    let blocking = bridge.clone();
    let answer = tokio::task::spawn_blocking(move || blocking.blocking_chat(request))
        .await
        .context("Chat task panicked")?;
    bridge.shutdown();

    println!("{}", answer?);
    Ok(())
}

async fn models(config: RelayConfig) -> Result<()> {
    let backend = OllamaBackend::new(config.backend);
    let models = backend
        .list_models()
        .await
        .context("Failed to list backend models")?;
    for model in models {
        match model.parameters {
            Some(parameters) => println!("{}\t{parameters}", model.name),
            None => println!("{}", model.name),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Relay daemon starting");

    let config = resolve_config(&args)?;

    let result = match args.command {
        Command::Serve { .. } => serve(config).await,
        Command::Ask { prompt, system } => ask(config, prompt, system).await,
        Command::Models => models(config).await,
    };

    if let Err(ref e) = result {
        error!(error = %e, "Relay daemon stopped with error");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_flags_become_overrides() {
        let args = Args::parse_from([
            "relay-daemon",
            "--timeout-minutes",
            "3",
            "serve",
            "--listen",
            "0.0.0.0:9000",
            "--cancel-on-disconnect",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.response_timeout_minutes, Some(3));
        assert_eq!(overrides.listen_addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(overrides.cancel_on_disconnect, Some(true));
        assert_eq!(overrides.max_connections, None);
    }

    #[test]
    fn test_ask_without_flags_has_no_overrides() {
        let args = Args::parse_from(["relay-daemon", "ask", "hello"]);
        let overrides = args.overrides();
        assert!(overrides.response_timeout_minutes.is_none());
        assert!(overrides.cancel_on_disconnect.is_none());
        assert!(overrides.listen_addr.is_none());
        assert!(matches!(args.command, Command::Ask { ref prompt, .. } if prompt == "hello"));
    }
}
