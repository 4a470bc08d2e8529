//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, supporting a TOML file at
//! `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows XDG Base Directory specification:
//! - `$XDG_CONFIG_HOME/chat-relay/relay.toml` (typically `~/.config/chat-relay/relay.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [bridge]
//! response_timeout_minutes = 15
//! cancel_on_disconnect = false
//!
//! [pool]
//! core_size = 2
//! max_size = 4
//! keep_alive_secs = 90
//! queue_capacity = 50
//!
//! [backend]
//! base_url = "http://localhost:11434"
//! model = "meditron:7b"
//! temperature = 0.7
//! think = false
//!
//! [server]
//! listen_addr = "127.0.0.1:8765"
//! max_connections = 100
//! channel_capacity = 256
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `RELAY_TIMEOUT_MINUTES` | `bridge.response_timeout_minutes` |
//! | `RELAY_CANCEL_ON_DISCONNECT` | `bridge.cancel_on_disconnect` |
//! | `RELAY_CORE_POOL_SIZE` | `pool.core_size` |
//! | `RELAY_MAX_POOL_SIZE` | `pool.max_size` |
//! | `RELAY_KEEP_ALIVE_SECS` | `pool.keep_alive_secs` |
//! | `RELAY_QUEUE_CAPACITY` | `pool.queue_capacity` |
//! | `OLLAMA_BASE_URL` | `backend.base_url` |
//! | `OLLAMA_CHAT_MODEL` | `backend.model` |
//! | `MODEL_TEMPERATURE` | `backend.temperature` |
//! | `ENABLE_THINKING` | `backend.think` |
//! | `RELAY_LISTEN_ADDR` | `server.listen_addr` |
//! | `RELAY_MAX_CONNECTIONS` | `server.max_connections` |
//! | `RELAY_CHANNEL_CAPACITY` | `server.channel_capacity` |
//!
//! Values that fail to parse are logged and ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendConfig;
use crate::bridge::BridgeConfig;
use crate::pool::PoolConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Bridge section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Deadline for blocking chat calls, in minutes
    pub response_timeout_minutes: Option<u64>,

    /// Cancel a connection's streams when it closes
    pub cancel_on_disconnect: Option<bool>,
}

/// Worker pool section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Workers kept alive while idle
    pub core_size: Option<usize>,

    /// Upper bound on live workers
    pub max_size: Option<usize>,

    /// Idle seconds before a surplus worker retires
    pub keep_alive_secs: Option<u64>,

    /// Operations that may wait for a worker
    pub queue_capacity: Option<usize>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama base URL
    pub base_url: Option<String>,

    /// Model used when a request names none
    pub model: Option<String>,

    /// Default sampling temperature
    pub temperature: Option<f64>,

    /// Ask the model to emit its reasoning
    pub think: Option<bool>,
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// WebSocket listen address
    pub listen_addr: Option<String>,

    /// Maximum simultaneous connections
    pub max_connections: Option<usize>,

    /// Frames buffered per connection
    pub channel_capacity: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Bridge configuration section
    pub bridge: BridgeToml,

    /// Worker pool configuration section
    pub pool: PoolToml,

    /// Backend configuration section
    pub backend: BackendToml,

    /// Server configuration section
    pub server: ServerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Settings for the WebSocket entry point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum simultaneous connections
    pub max_connections: usize,
    /// Frames buffered per connection before senders wait
    pub channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            max_connections: 100,
            channel_capacity: 256,
        }
    }
}

/// Centralized configuration for the relay
///
/// Consolidates configuration from multiple sources and tracks where the
/// winning values came from. Use [`load_config`] to load configuration with
/// proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Bridge settings
    pub bridge: BridgeConfig,

    /// Cancel a connection's streams when it closes
    pub cancel_on_disconnect: bool,

    /// Worker pool sizing
    pub pool: PoolConfig,

    /// Backend connection settings
    pub backend: BackendConfig,

    /// WebSocket server settings
    pub server: ServerSettings,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            cancel_on_disconnect: false,
            pool: PoolConfig::default(),
            backend: BackendConfig::default(),
            server: ServerSettings::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that contributed to this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check that the values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.response_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "bridge.response_timeout_minutes must be at least 1".to_string(),
            ));
        }
        if self.pool.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backend.base_url must not be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "backend.temperature {} is outside 0.0..=2.0",
                self.backend.temperature
            )));
        }
        if self.server.max_connections == 0 || self.server.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_connections and server.channel_capacity must be at least 1"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// merged values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from a specific path and an environment lookup
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, lookup: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Start with defaults
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Environment overrides file values
    apply_env_config(&mut config, lookup);

    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    // Bridge settings
    if let Some(minutes) = toml.bridge.response_timeout_minutes {
        config.bridge.response_timeout = minutes_to_duration(minutes);
    }
    if let Some(cancel) = toml.bridge.cancel_on_disconnect {
        config.cancel_on_disconnect = cancel;
    }

    // Pool settings
    if let Some(size) = toml.pool.core_size {
        config.pool.core_size = size;
    }
    if let Some(size) = toml.pool.max_size {
        config.pool.max_size = size;
    }
    if let Some(secs) = toml.pool.keep_alive_secs {
        config.pool.keep_alive = Duration::from_secs(secs);
    }
    if let Some(capacity) = toml.pool.queue_capacity {
        config.pool.queue_capacity = capacity;
    }

    // Backend settings
    if let Some(ref url) = toml.backend.base_url {
        config.backend.base_url.clone_from(url);
    }
    if let Some(ref model) = toml.backend.model {
        config.backend.model.clone_from(model);
    }
    if let Some(temperature) = toml.backend.temperature {
        config.backend.temperature = temperature;
    }
    if let Some(think) = toml.backend.think {
        config.backend.think = think;
    }

    // Server settings
    if let Some(ref addr) = toml.server.listen_addr {
        config.server.listen_addr.clone_from(addr);
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(capacity) = toml.server.channel_capacity {
        config.server.channel_capacity = capacity;
    }
}

/// Read and parse one environment value, logging values that do not parse
fn env_value<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

fn env_flag<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(variable = key, value = %raw, "Ignoring unparseable environment flag");
            None
        }
    }
}

fn env_text<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    // Bridge settings from environment
    // TIMEOUT_DURATION is the name older deployments set
    let timeout_minutes = env_value::<u64, _>(&lookup, "RELAY_TIMEOUT_MINUTES")
        .or_else(|| env_value::<u64, _>(&lookup, "TIMEOUT_DURATION"));
    if let Some(minutes) = timeout_minutes {
        config.bridge.response_timeout = minutes_to_duration(minutes);
        touched = true;
    }
    if let Some(cancel) = env_flag(&lookup, "RELAY_CANCEL_ON_DISCONNECT") {
        config.cancel_on_disconnect = cancel;
        touched = true;
    }

    // Pool settings from environment
    if let Some(size) = env_value(&lookup, "RELAY_CORE_POOL_SIZE") {
        config.pool.core_size = size;
        touched = true;
    }
    if let Some(size) = env_value(&lookup, "RELAY_MAX_POOL_SIZE") {
        config.pool.max_size = size;
        touched = true;
    }
    if let Some(secs) = env_value(&lookup, "RELAY_KEEP_ALIVE_SECS") {
        config.pool.keep_alive = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(capacity) = env_value(&lookup, "RELAY_QUEUE_CAPACITY") {
        config.pool.queue_capacity = capacity;
        touched = true;
    }

    // Backend settings from environment
    if let Some(url) = env_text(&lookup, "OLLAMA_BASE_URL") {
        config.backend.base_url = url;
        touched = true;
    }
    if let Some(model) = env_text(&lookup, "OLLAMA_CHAT_MODEL") {
        config.backend.model = model;
        touched = true;
    }
    if let Some(temperature) = env_value(&lookup, "MODEL_TEMPERATURE") {
        config.backend.temperature = temperature;
        touched = true;
    }
    if let Some(think) = env_flag(&lookup, "ENABLE_THINKING") {
        config.backend.think = think;
        touched = true;
    }

    // Server settings from environment
    if let Some(addr) = env_text(&lookup, "RELAY_LISTEN_ADDR") {
        config.server.listen_addr = addr;
        touched = true;
    }
    if let Some(max) = env_value(&lookup, "RELAY_MAX_CONNECTIONS") {
        config.server.max_connections = max;
        touched = true;
    }
    if let Some(capacity) = env_value(&lookup, "RELAY_CHANNEL_CAPACITY") {
        config.server.channel_capacity = capacity;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

fn minutes_to_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Response timeout override (minutes)
    pub response_timeout_minutes: Option<u64>,

    /// Cancel-on-disconnect override
    pub cancel_on_disconnect: Option<bool>,

    /// Listen address override
    pub listen_addr: Option<String>,

    /// Default model override
    pub model: Option<String>,

    /// Backend URL override
    pub base_url: Option<String>,

    /// Max connections override
    pub max_connections: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set response timeout override
    #[must_use]
    pub fn with_response_timeout_minutes(mut self, minutes: u64) -> Self {
        self.response_timeout_minutes = Some(minutes);
        self
    }

    /// Set cancel-on-disconnect override
    #[must_use]
    pub fn with_cancel_on_disconnect(mut self, cancel: bool) -> Self {
        self.cancel_on_disconnect = Some(cancel);
        self
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: String) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set backend URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set max connections override
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    fn is_empty(&self) -> bool {
        self.response_timeout_minutes.is_none()
            && self.cancel_on_disconnect.is_none()
            && self.listen_addr.is_none()
            && self.model.is_none()
            && self.base_url.is_none()
            && self.max_connections.is_none()
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the result is invalid.
    pub fn apply(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        config.source = ConfigSource::Cli;

        if let Some(minutes) = self.response_timeout_minutes {
            config.bridge.response_timeout = minutes_to_duration(minutes);
        }
        if let Some(cancel) = self.cancel_on_disconnect {
            config.cancel_on_disconnect = cancel;
        }
        if let Some(ref addr) = self.listen_addr {
            config.server.listen_addr.clone_from(addr);
        }
        if let Some(ref model) = self.model {
            config.backend.model.clone_from(model);
        }
        if let Some(ref url) = self.base_url {
            config.backend.base_url.clone_from(url);
        }
        if let Some(max) = self.max_connections {
            config.server.max_connections = max;
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.bridge.response_timeout, Duration::from_secs(15 * 60));
        assert!(!config.cancel_on_disconnect);
        assert_eq!(config.pool.core_size, 2);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.keep_alive, Duration::from_secs(90));
        assert_eq!(config.pool.queue_capacity, 50);
        assert_eq!(config.backend.base_url, "http://localhost:11434");
        assert_eq!(config.backend.model, "meditron:7b");
        assert!(!config.backend.think);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8765");
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.server.channel_capacity, 256);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("chat-relay"));
            assert!(p.to_string_lossy().ends_with("relay.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = toml_file(
            r#"
[bridge]
response_timeout_minutes = 5
cancel_on_disconnect = true

[pool]
core_size = 1
max_size = 8
keep_alive_secs = 30
queue_capacity = 10

[backend]
base_url = "http://gpu-box:11434"
model = "llama3.2"
temperature = 0.2
think = true

[server]
listen_addr = "0.0.0.0:9000"
max_connections = 10
channel_capacity = 64
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.bridge.response_timeout, Duration::from_secs(300));
        assert!(config.cancel_on_disconnect);
        assert_eq!(config.pool.core_size, 1);
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.pool.keep_alive, Duration::from_secs(30));
        assert_eq!(config.pool.queue_capacity, 10);
        assert_eq!(config.backend.base_url, "http://gpu-box:11434");
        assert_eq!(config.backend.model, "llama3.2");
        assert!((config.backend.temperature - 0.2).abs() < f64::EPSILON);
        assert!(config.backend.think);
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.server.max_connections, 10);
        assert_eq!(config.server.channel_capacity, 64);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = toml_file(
            r#"
[backend]
model = "partial-model"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.backend.model, "partial-model");
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.server.channel_capacity, 256);
    }

    // =========================================================================
    // Missing File Handling Tests
    // =========================================================================

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/path/relay.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();

        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = toml_file(
            r#"
[pool
core_size = "not a number"
"#,
        );

        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = toml_file(
            r#"
[pool]
max_size = 0
"#,
        );

        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = toml_file(
            r#"
[bridge]
response_timeout_minutes = 5

[backend]
model = "file-model"
"#,
        );
        let env = env_of(&[
            ("OLLAMA_CHAT_MODEL", "env-model"),
            ("RELAY_CANCEL_ON_DISCONNECT", "true"),
            ("RELAY_MAX_POOL_SIZE", "6"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.backend.model, "env-model");
        assert!(config.cancel_on_disconnect);
        assert_eq!(config.pool.max_size, 6);
        // Not in env, so the file value holds
        assert_eq!(config.bridge.response_timeout, Duration::from_secs(300));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_unparseable_env_ignored() {
        let env = env_of(&[
            ("RELAY_TIMEOUT_MINUTES", "soon"),
            ("ENABLE_THINKING", "maybe"),
            ("OLLAMA_CHAT_MODEL", "   "),
        ]);

        let config = load_config_with_env(None, env).unwrap();

        assert_eq!(config.bridge.response_timeout, Duration::from_secs(15 * 60));
        assert!(!config.backend.think);
        assert_eq!(config.backend.model, "meditron:7b");
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_timeout_duration_env_alias() {
        let config = load_config_with_env(None, env_of(&[("TIMEOUT_DURATION", "4")])).unwrap();
        assert_eq!(config.bridge.response_timeout, Duration::from_secs(240));
        assert_eq!(config.source(), ConfigSource::Env);

        // The relay-specific name wins when both are set
        let env = env_of(&[("TIMEOUT_DURATION", "4"), ("RELAY_TIMEOUT_MINUTES", "2")]);
        let config = load_config_with_env(None, env).unwrap();
        assert_eq!(config.bridge.response_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let file = toml_file(
            r#"
[server]
listen_addr = "0.0.0.0:1111"
"#,
        );
        let env = env_of(&[("RELAY_LISTEN_ADDR", "0.0.0.0:2222"), ("RELAY_TIMEOUT_MINUTES", "3")]);

        let mut config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:2222");

        ConfigOverrides::new()
            .with_listen_addr("0.0.0.0:3333".to_string())
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:3333");
        assert_eq!(config.bridge.response_timeout, Duration::from_secs(180));
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_override_validation() {
        let mut config = RelayConfig::default();
        let result = ConfigOverrides::new()
            .with_response_timeout_minutes(0)
            .apply(&mut config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
