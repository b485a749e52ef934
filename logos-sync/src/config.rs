//! Server and client configuration.
//!
//! Every field has a default, so a TOML file only needs the values it
//! overrides:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/logos-sync"
//!
//! [sync]
//! max_batch_size = 200
//!
//! [compaction]
//! every_n_operations = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per workspace room
    pub max_peers_per_room: usize,
    /// Outbound frames buffered per connection before it is evicted
    pub outbound_queue_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub compaction: CompactionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            outbound_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            sync: SyncConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Ephemeral port, in-memory store, short intervals.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_secs: 5,
            compaction: CompactionConfig {
                every_n_operations: 0,
                interval_secs: 0,
                retained_snapshots: 2,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers_per_room == 0 {
            return Err(ConfigError::Invalid {
                field: "max_peers_per_room",
                reason: "must be at least 1".into(),
            });
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "outbound_queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.sync.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.max_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.sync.catch_up_page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.catch_up_page_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.compaction.retained_snapshots == 0 {
            return Err(ConfigError::Invalid {
                field: "compaction.retained_snapshots",
                reason: "must keep at least one snapshot".into(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Catch-up and submission limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Items per submitted batch; larger batches are refused.
    pub max_batch_size: usize,
    /// A client further behind than this many timestamps gets a snapshot.
    pub delta_threshold: u64,
    /// Operations per sync response page.
    pub catch_up_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            delta_threshold: 1000,
            catch_up_page_size: 5000,
        }
    }
}

/// Snapshot triggers and retention. A zero trigger disables it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Checkpoint after this many accepted operations.
    pub every_n_operations: u64,
    /// Checkpoint every active workspace on this interval.
    pub interval_secs: u64,
    /// Snapshots kept; older history is pruned.
    pub retained_snapshots: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            every_n_operations: 500,
            interval_secs: 300,
            retained_snapshots: 3,
        }
    }
}

/// Client-side batching and retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub debounce_ms: u64,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_batch_size: 50,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl BufferConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// WebSocket client settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait for `joined` and for the first catch-up.
    pub join_timeout_ms: u64,
    /// How long a submitted batch waits for its ack.
    pub ack_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub buffer: BufferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 5_000,
            ack_timeout_ms: 10_000,
            max_reconnect_attempts: 10,
            buffer: BufferConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}
