//! Configuration Management
//!
//! Loads synchronizer configuration from TOML files.
//! Configuration includes:
//! - CRUD endpoint and credentials
//! - Notification channel URL (derived from the endpoint when absent)
//! - Retry, reconnect and backstop refetch timing
//! - Logging output

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::errors::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Explicit WebSocket URL; derived from `endpoint` when unset
    #[serde(default)]
    pub channel_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub refetch: RefetchSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Retry budget for idempotent requests (list, delete)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_delay(),
            max_delay_ms: default_retry_max_delay(),
        }
    }
}

/// Notification channel reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub max_delay_ms: u64,
    /// Reconnects scheduled before giving up (0 = never reconnect)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_delay(),
            max_delay_ms: default_reconnect_max_delay(),
            max_attempts: default_max_attempts(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Debounced backstop refetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefetchSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_refetch_delay")]
    pub delay_ms: u64,
}

impl Default for RefetchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_refetch_delay(),
        }
    }
}

impl RefetchSettings {
    /// Delay before the backstop refetch, or `None` when disabled.
    pub fn delay(&self) -> Option<Duration> {
        self.enabled.then(|| Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            channel_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            retry: RetrySettings::default(),
            reconnect: ReconnectSettings::default(),
            refetch: RefetchSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:3000".to_string()
}
fn default_request_timeout() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    500
}
fn default_retry_max_delay() -> u64 {
    4000
}
fn default_reconnect_base_delay() -> u64 {
    1000
}
fn default_reconnect_max_delay() -> u64 {
    30000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_refetch_delay() -> u64 {
    1000
}
fn default_log_filter() -> String {
    "warn".to_string()
}
fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                toml::from_str(&content).context("Failed to parse config")?
            }
            None => {
                let mut default_paths = vec![std::path::PathBuf::from("content-sync.toml")];
                if let Some(home) = dirs::home_dir() {
                    default_paths.push(home.join(".config/content-sync/config.toml"));
                }

                let mut loaded = None;
                for p in &default_paths {
                    if let Ok(content) = std::fs::read_to_string(p) {
                        loaded = Some(toml::from_str(&content).with_context(|| {
                            format!("Failed to parse config {}", p.display())
                        })?);
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override with environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("CONTENT_SYNC_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(channel_url) = std::env::var("CONTENT_SYNC_CHANNEL_URL") {
            self.channel_url = Some(channel_url);
        }
        if let Ok(api_key) = std::env::var("CONTENT_SYNC_API_KEY") {
            self.api_key = Some(api_key);
        }
        if let Ok(timeout) = std::env::var("CONTENT_SYNC_TIMEOUT") {
            if let Ok(t) = timeout.parse::<u64>() {
                self.request_timeout_secs = t;
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), SyncError> {
        let endpoint = Url::parse(&self.endpoint)
            .map_err(|e| SyncError::Config(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "endpoint must be http or https, got '{}'",
                endpoint.scheme()
            )));
        }

        let channel = self.channel_url()?;
        if !matches!(channel.scheme(), "ws" | "wss") {
            return Err(SyncError::Config(format!(
                "channel_url must be ws or wss, got '{}'",
                channel.scheme()
            )));
        }

        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(SyncError::Config(
                "reconnect.base_delay_ms must be positive".to_string(),
            ));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(SyncError::Config(
                "retry.base_delay_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The notification channel URL: explicit, or the endpoint's host with
    /// `ws`/`wss` and path `/ws`.
    pub fn channel_url(&self) -> std::result::Result<Url, SyncError> {
        if let Some(explicit) = &self.channel_url {
            return Url::parse(explicit)
                .map_err(|e| SyncError::Config(format!("invalid channel_url '{}': {}", explicit, e)));
        }

        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| SyncError::Config(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Config(format!("cannot derive channel URL from {}", self.endpoint)))?;
        url.set_path("/ws");
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}
