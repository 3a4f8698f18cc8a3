//! Configuration for the closing core

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Closing core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Lock manager configuration
    pub lock: LockConfig,

    /// Duplicate detection configuration
    pub fingerprint: FingerprintConfig,

    /// Orchestrator configuration
    pub operation: OperationConfig,

    /// Backing store configuration
    pub store: StoreConfig,

    /// Notification sink configuration
    pub notification: NotificationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "cash-closing".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            lock: LockConfig::default(),
            fingerprint: FingerprintConfig::default(),
            operation: OperationConfig::default(),
            store: StoreConfig::default(),
            notification: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock time-to-live in seconds; the outer timeout of a closing operation
    pub ttl_secs: u64,

    /// Expired-lock sweep interval in seconds (must be well below the TTL)
    pub sweep_interval_secs: u64,

    /// Fall back to the in-process store when the distributed store fails.
    /// Mutual exclusion is then only guaranteed within this process.
    pub fallback_enabled: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            sweep_interval_secs: 5,
            fallback_enabled: true,
        }
    }
}

/// Duplicate detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Window during which an identical submission is rejected (seconds)
    pub dedupe_window_secs: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            dedupe_window_secs: 30 * 60,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Grace period after which any operation leaves the active registry (seconds)
    pub grace_period_secs: u64,

    /// Active registry eviction sweep interval (seconds)
    pub eviction_interval_secs: u64,

    /// History retention window (hours)
    pub history_retention_hours: u64,

    /// History retention sweep interval (seconds)
    pub history_sweep_interval_secs: u64,

    /// Maximum page size for history queries
    pub history_max_page_size: usize,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5 * 60,
            eviction_interval_secs: 60,
            history_retention_hours: 24,
            history_sweep_interval_secs: 60 * 60,
            history_max_page_size: 100,
        }
    }
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL; `None` runs on the in-process store only
    pub redis_url: Option<String>,

    /// Namespace prepended to every Redis key
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "cash_closing".to_string(),
        }
    }
}

/// Notification sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Monitoring endpoint; `None` discards notifications
    pub endpoint: Option<String>,

    /// `source` field stamped on every notification
    pub source: String,

    /// Bounded channel capacity between producers and the dispatcher
    pub channel_capacity: usize,

    /// HTTP timeout per delivery attempt (milliseconds)
    pub timeout_ms: u64,

    /// Delivery attempts per notification
    pub max_retry_attempts: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            source: "cash-closing".to_string(),
            channel_capacity: 1024,
            timeout_ms: 5_000,
            max_retry_attempts: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines
    pub json: bool,

    /// Default filter directive when `RUST_LOG` is unset
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_directive: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("CLOSING_REDIS_URL") {
            config.store.redis_url = Some(url);
        }

        if let Ok(endpoint) = std::env::var("CLOSING_NOTIFY_ENDPOINT") {
            config.notification.endpoint = Some(endpoint);
        }

        if let Ok(ttl) = std::env::var("CLOSING_LOCK_TTL_SECS") {
            config.lock.ttl_secs = parse_env("CLOSING_LOCK_TTL_SECS", &ttl)?;
        }

        if let Ok(fallback) = std::env::var("CLOSING_LOCK_FALLBACK") {
            config.lock.fallback_enabled = parse_env("CLOSING_LOCK_FALLBACK", &fallback)?;
        }

        if let Ok(window) = std::env::var("CLOSING_DEDUPE_WINDOW_SECS") {
            config.fingerprint.dedupe_window_secs = parse_env("CLOSING_DEDUPE_WINDOW_SECS", &window)?;
        }

        if let Ok(json) = std::env::var("CLOSING_LOG_JSON") {
            config.logging.json = parse_env("CLOSING_LOG_JSON", &json)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that break the timing invariants
    pub fn validate(&self) -> crate::Result<()> {
        if self.lock.ttl_secs == 0 {
            return Err(crate::Error::Config("lock.ttl_secs must be > 0".to_string()));
        }
        if self.lock.sweep_interval_secs == 0 || self.lock.sweep_interval_secs >= self.lock.ttl_secs {
            return Err(crate::Error::Config(format!(
                "lock.sweep_interval_secs ({}) must be > 0 and below lock.ttl_secs ({})",
                self.lock.sweep_interval_secs, self.lock.ttl_secs
            )));
        }
        if self.fingerprint.dedupe_window_secs == 0 {
            return Err(crate::Error::Config(
                "fingerprint.dedupe_window_secs must be > 0".to_string(),
            ));
        }
        if self.operation.eviction_interval_secs == 0 || self.operation.history_sweep_interval_secs == 0 {
            return Err(crate::Error::Config("sweep intervals must be > 0".to_string()));
        }
        if self.operation.history_max_page_size == 0 {
            return Err(crate::Error::Config(
                "operation.history_max_page_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock TTL
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_secs)
    }

    /// Dedupe window
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.fingerprint.dedupe_window_secs)
    }

    /// Active registry grace period
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.operation.grace_period_secs)
    }

    /// History retention window
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.operation.history_retention_hours * 3600)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}='{}': {}", name, value, e)))
}
