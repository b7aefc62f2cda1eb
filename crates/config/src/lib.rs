//! Configuration loading, validation, and management for nosrelay.
//!
//! Loads configuration from `~/.nosrelay/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use nosrelay_core::context::DEFAULT_PRICE_TRIGGERS;
use nosrelay_core::planner::DEFAULT_RESERVED_TOKENS;
use nosrelay_core::upstream::DEFAULT_MAX_COMPLETION_TOKENS;

/// The assistant persona sent as the system prompt unless overridden.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. You work for Nosana, a decentralized computing network, and your job is to informatively answer questions about Nosana. You will get questions accompanied with pages of context. Only use the context you are given when it is informative to answer the question. If you don't know the answer, be honest about it.";

/// The root configuration structure.
///
/// Maps directly to `~/.nosrelay/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Prompt assembly and upstream streaming
    #[serde(default)]
    pub relay: RelayConfig,

    /// Live price context
    #[serde(default)]
    pub price: PriceConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Maximum accepted request body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Browser origin allowed by CORS (none = same-origin only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_origin: Option<String>,
}

fn default_port() -> u16 {
    3000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            body_limit_bytes: default_body_limit(),
            allowed_origin: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Overrides the default assistant persona
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Used when a request carries no temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Headroom left for the completion when planning
    #[serde(default = "default_reserved_tokens")]
    pub reserved_tokens: usize,

    /// `max_tokens` sent upstream
    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: u32,

    /// Chunks buffered between the relay and the response body
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Hard deadline for one streamed answer (0 = none)
    #[serde(default)]
    pub stream_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Deadline for the upstream's response headers and first text
    #[serde(default = "default_first_byte_timeout")]
    pub first_byte_timeout_secs: u64,

    /// Used when a request carries no url
    #[serde(default = "default_upstream_url")]
    pub default_upstream_url: String,

    /// Used when a request carries no key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_reserved_tokens() -> usize {
    DEFAULT_RESERVED_TOKENS
}
fn default_max_completion_tokens() -> u32 {
    DEFAULT_MAX_COMPLETION_TOKENS
}
fn default_stream_buffer() -> usize {
    1
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_first_byte_timeout() -> u64 {
    30
}
fn default_upstream_url() -> String {
    "https://api.openai.com/v1/chat/completions".into()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            default_temperature: default_temperature(),
            reserved_tokens: default_reserved_tokens(),
            max_completion_tokens: default_max_completion_tokens(),
            stream_buffer: default_stream_buffer(),
            stream_timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout(),
            first_byte_timeout_secs: default_first_byte_timeout(),
            default_upstream_url: default_upstream_url(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("system_prompt", &self.system_prompt)
            .field("default_temperature", &self.default_temperature)
            .field("reserved_tokens", &self.reserved_tokens)
            .field("max_completion_tokens", &self.max_completion_tokens)
            .field("stream_buffer", &self.stream_buffer)
            .field("stream_timeout_secs", &self.stream_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("first_byte_timeout_secs", &self.first_byte_timeout_secs)
            .field("default_upstream_url", &self.default_upstream_url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_price_endpoint")]
    pub endpoint: String,

    /// Token mint address queried at the endpoint
    #[serde(default = "default_token_address")]
    pub token_address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_price_timeout")]
    pub timeout_secs: u64,

    /// Lowercase phrases that route a question to the price branch
    #[serde(default = "default_trigger_phrases")]
    pub trigger_phrases: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_price_endpoint() -> String {
    "https://public-api.birdeye.so/defi/price".into()
}
fn default_token_address() -> String {
    "nosXBVoaCTtYdLvKY6Csb4AC8JCdQKKAaWYtx2ZMoo7".into()
}
fn default_price_timeout() -> u64 {
    5
}
fn default_trigger_phrases() -> Vec<String> {
    DEFAULT_PRICE_TRIGGERS.iter().map(|t| t.to_string()).collect()
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_price_endpoint(),
            token_address: default_token_address(),
            api_key: None,
            timeout_secs: default_price_timeout(),
            trigger_phrases: default_trigger_phrases(),
        }
    }
}

impl std::fmt::Debug for PriceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceConfig")
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("token_address", &self.token_address)
            .field("api_key", &redact(&self.api_key))
            .field("timeout_secs", &self.timeout_secs)
            .field("trigger_phrases", &self.trigger_phrases)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.nosrelay/config.toml).
    ///
    /// Environment variables override the file:
    /// - `NOSRELAY_API_KEY`, then `OPENAI_API_KEY` → `relay.api_key`
    /// - `BIRDEYE_API_KEY` → `price.api_key`
    /// - `NOSRELAY_PORT` → `gateway.port`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(key) = lookup("NOSRELAY_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.relay.api_key = Some(key);
        }

        if let Some(key) = lookup("BIRDEYE_API_KEY") {
            self.price.api_key = Some(key);
        }

        if let Some(port) = lookup("NOSRELAY_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("NOSRELAY_PORT is not a port: {port}"))
            })?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".nosrelay")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.relay.default_temperature) {
            return Err(ConfigError::ValidationError(
                "relay.default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.relay.reserved_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "relay.reserved_tokens must be > 0".into(),
            ));
        }

        if self.relay.stream_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "relay.stream_buffer must be > 0".into(),
            ));
        }

        if self.relay.first_byte_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "relay.first_byte_timeout_secs must be > 0".into(),
            ));
        }

        if self.price.trigger_phrases.is_empty() {
            return Err(ConfigError::ValidationError(
                "price.trigger_phrases must contain at least one phrase".into(),
            ));
        }

        if self.price.trigger_phrases.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "price.trigger_phrases must not contain blank phrases".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
