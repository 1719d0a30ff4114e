use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::transport::ChannelId;

/// Channel numbering and sizing.
///
/// Well-known actors each own one fixed channel. Everything at or above
/// `first_dynamic` is handed out by the port registry as response channels.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum number of buffered messages per channel
    pub capacity: usize,
    /// Request channel of the port registry
    pub registry: ChannelId,
    /// Feed channel kept topped up with unused channel ids
    pub port_feed: ChannelId,
    /// Request channel of the database actor
    pub database: ChannelId,
    /// Request channel of the scheduler actor
    pub scheduler: ChannelId,
    /// First channel id the registry may mint
    pub first_dynamic: ChannelId,
    /// Number of ids the registry keeps buffered in the feed
    pub feed_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            registry: 1,
            port_feed: 2,
            database: 3,
            scheduler: 4,
            first_dynamic: 100,
            feed_size: 16,
        }
    }
}

/// Retry policy for blocking channel writes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    /// Multiplier applied to the delay after every failed attempt
    pub growth: f64,
    pub max_ms: u64,
    /// Upper bound of the random jitter added to each delay
    pub jitter_ms: u64,
    /// Attempts after which each further failure is logged as an error
    pub error_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 5,
            growth: 1.5,
            max_ms: 1_000,
            jitter_ms: 10,
            error_after: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// The only host the database actor may run on
    pub home_host: String,
    /// Where the shared document is persisted. `None` keeps it in memory.
    pub state_path: Option<PathBuf>,
    pub lock_check_interval_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            home_host: "home".to_string(),
            state_path: None,
            lock_check_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Memory kept free on the root node for interactive use
    pub root_reserved_mem: f64,
    pub task_watch_interval_ms: u64,
    pub service_review_interval_ms: u64,
    /// JSON list of supervised services, read on every reload
    pub services_path: Option<PathBuf>,
    /// How long the scheduler waits for the database lock. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            root_reserved_mem: 32.0,
            task_watch_interval_ms: 2_000,
            service_review_interval_ms: 5_000,
            services_path: None,
            lock_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Host the kernel actors run on
    pub hostname: String,
    pub rpc_timeout_ms: u64,
    /// Longest stretch an actor loop runs before yielding
    pub time_slice_ms: u64,
    pub channels: ChannelConfig,
    pub backoff: BackoffConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hostname: "home".to_string(),
            rpc_timeout_ms: 5_000,
            time_slice_ms: 50,
            channels: ChannelConfig::default(),
            backoff: BackoffConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            database: DatabaseConfig {
                home_host: hostname.clone(),
                ..Default::default()
            },
            hostname,
            ..Default::default()
        }
    }

    /// Config for a kernel on `hostname`, read from `file` if given.
    ///
    /// The database follows the kernel's host unless the file pins
    /// `database.home_host` itself.
    pub fn for_host(file: Option<&Path>, hostname: impl Into<String>) -> Result<Self> {
        let hostname = hostname.into();
        let Some(path) = file else {
            return Ok(Self::new(hostname));
        };

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let pinned_home = raw
            .get("database")
            .and_then(|database| database.get("home_host"))
            .is_some();
        let mut config: Self = serde_json::from_value(raw)?;
        if !pinned_home {
            config.database.home_host = hostname.clone();
        }
        config.hostname = hostname;
        Ok(config)
    }

    pub fn with_state_path(mut self, path: PathBuf) -> Self {
        self.database.state_path = Some(path);
        self
    }

    pub fn with_services_path(mut self, path: PathBuf) -> Self {
        self.scheduler.services_path = Some(path);
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn time_slice(&self) -> Duration {
        Duration::from_millis(self.time_slice_ms)
    }

}
