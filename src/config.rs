//! Configuration.
//!
//! Loaded from a TOML file (path from `--config` or `$CATCHBOX_CONFIG`). Every section has
//! defaults, and credentials can be supplied through the environment instead:
//! `CATCHBOX_IMAP_HOST`, `CATCHBOX_IMAP_USER` and `CATCHBOX_IMAP_PASSWORD` override the file.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retention::Retention;
use crate::types::ExampleInbox;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: Option<String>,
    pub imap: ImapConfig,
    pub sync: SyncConfig,
    pub retention: Retention,
    pub example: ExampleInbox,
    pub cache: CacheConfig,
    pub locks: LocksConfig,
}

/// How the connection to the server is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// TLS from the first byte.
    Tls,
    /// Plain TCP upgraded with `STARTTLS`.
    StartTls,
    /// No encryption at all.
    Plain,
}

/// Remote mailbox connection settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub user: String,
    pub password: String,
    pub folder: String,
    /// Bound on TCP connect, TLS handshake and login.
    pub auth_timeout_secs: u64,
    /// Bound on every command once logged in.
    pub command_timeout_secs: u64,
    /// Delay before the second connection attempt; doubled for every further attempt.
    pub retry_backoff_ms: u64,
}

/// Polling and fetching.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between polling passes, and between purge passes.
    pub refresh_interval_secs: u64,
    pub fetch_chunk_size: usize,
    pub fetch_concurrency: usize,
    /// Interval between checks for server push notifications.
    pub push_check_secs: u64,
}

/// Full-message read cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

/// Locked inboxes for deployments without an external lock store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub addresses: Vec<String>,
}

impl Default for ImapConfig {
    fn default() -> Self {
        ImapConfig {
            host: String::new(),
            port: 993,
            security: Security::Tls,
            user: String::new(),
            password: String::new(),
            folder: "INBOX".to_string(),
            auth_timeout_secs: 10,
            command_timeout_secs: 60,
            retry_backoff_ms: 1000,
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("folder", &self.folder)
            .field("auth_timeout_secs", &self.auth_timeout_secs)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

impl ImapConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            refresh_interval_secs: 60,
            fetch_chunk_size: 100,
            fetch_concurrency: 6,
            push_check_secs: 15,
        }
    }
}

impl SyncConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn push_check(&self) -> Duration {
        Duration::from_secs(self.push_check_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: 600,
            capacity: 512,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    /// Read the configuration file at `path`, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let config = Config::from_toml(&text)?;
                tracing::info!(path = %path.display(), "loaded config");
                config
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override connection settings from environment variables, looked up through `var`.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("CATCHBOX_IMAP_HOST") {
            self.imap.host = host;
        }
        if let Some(user) = var("CATCHBOX_IMAP_USER") {
            self.imap.user = user;
        }
        if let Some(password) = var("CATCHBOX_IMAP_PASSWORD") {
            self.imap.password = password;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.imap.host.is_empty() {
            return Err(Error::Config("imap.host is not set".to_string()));
        }
        if self.sync.fetch_chunk_size == 0 {
            return Err(Error::Config("sync.fetch_chunk_size must be positive".to_string()));
        }
        if self.sync.fetch_concurrency == 0 {
            return Err(Error::Config("sync.fetch_concurrency must be positive".to_string()));
        }
        if self.sync.refresh_interval_secs == 0 {
            return Err(Error::Config(
                "sync.refresh_interval_secs must be positive".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be positive".to_string()));
        }
        self.retention.cutoff()?;
        Ok(())
    }
}
