//! Configuration types for KVGrid
//!
//! Every component receives an explicit configuration value object at
//! construction; nothing reads global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the control plane
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store client configuration
    pub store: StoreConfig,
    /// Metadata cache tuning
    pub cache: CacheConfig,
    /// Maintenance job intervals and windows
    pub jobs: JobConfig,
    /// Input limits enforced by the storage manager
    pub limits: LimitConfig,
    /// Value backend endpoint
    pub value_backend: ValueBackendConfig,
}

/// Document store client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store endpoints, rotated per request
    pub endpoints: Vec<String>,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Full request timeout (milliseconds)
    pub request_timeout_ms: u64,
    /// Index holding storage registry documents
    pub registry_index: String,
    /// Index holding lock documents
    pub lock_index: String,
    /// Per-storage value index name prefix
    pub data_index_prefix: String,
    /// Per-storage history index name prefix
    pub history_index_prefix: String,
    /// Scroll cursor keep-alive (milliseconds), renewed on every page
    pub scroll_keep_alive_ms: u64,
    /// Page size for scroll traversals
    pub scroll_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            connect_timeout_ms: 2_000,
            request_timeout_ms: 5_000,
            registry_index: "kvgrid-registry".to_string(),
            lock_index: "kvgrid-lock".to_string(),
            data_index_prefix: "kvgrid-data-".to_string(),
            history_index_prefix: "kvgrid-history-".to_string(),
            scroll_keep_alive_ms: 60_000,
            scroll_page_size: 1_000,
        }
    }
}

impl StoreConfig {
    /// Connect timeout as a `Duration`
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a `Duration`
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Scroll keep-alive as a `Duration`
    #[must_use]
    pub const fn scroll_keep_alive(&self) -> Duration {
        Duration::from_millis(self.scroll_keep_alive_ms)
    }

    /// Name of the per-storage value index
    #[must_use]
    pub fn data_index(&self, storage_id: &str) -> String {
        format!("{}{storage_id}", self.data_index_prefix)
    }

    /// Name of the per-storage history index
    #[must_use]
    pub fn history_index(&self, storage_id: &str) -> String {
        format!("{}{storage_id}", self.history_index_prefix)
    }
}

/// Metadata cache tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached entries; least-recently-used entries are
    /// evicted once the table grows past this
    pub max_entries: usize,
    /// Entries idle longer than this are dropped (seconds)
    pub expire_after_access_secs: u64,
    /// Entries older than this are reloaded by the sweep (seconds)
    pub refresh_after_write_secs: u64,
    /// Sweep period (seconds)
    pub sweep_interval_secs: u64,
    /// Changed-document scan period for the invalidation updater (seconds)
    pub invalidation_period_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            expire_after_access_secs: 600,
            refresh_after_write_secs: 60,
            sweep_interval_secs: 30,
            invalidation_period_secs: 60,
        }
    }
}

impl CacheConfig {
    /// Idle expiry as a `Duration`
    #[must_use]
    pub const fn expire_after_access(&self) -> Duration {
        Duration::from_secs(self.expire_after_access_secs)
    }

    /// Refresh age as a `Duration`
    #[must_use]
    pub const fn refresh_after_write(&self) -> Duration {
        Duration::from_secs(self.refresh_after_write_secs)
    }

    /// Sweep period as a `Duration`
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Invalidation scan period as a `Duration`
    #[must_use]
    pub const fn invalidation_period(&self) -> Duration {
        Duration::from_secs(self.invalidation_period_secs)
    }
}

/// Maintenance job intervals and grace windows
///
/// Each interval doubles as the staleness bound for that job's lock lease:
/// a lease older than the interval is presumed abandoned.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// TEMP storage expiry sweep interval (seconds)
    pub temp_expiry_interval_secs: u64,
    /// Soft-deleted storage purge interval (seconds)
    pub storage_cleanup_interval_secs: u64,
    /// Vanished-VM sweep interval (seconds)
    pub vm_cleanup_interval_secs: u64,
    /// Removed-account sweep interval (seconds)
    pub account_cleanup_interval_secs: u64,
    /// How long a soft-deleted storage lingers before the purge job may
    /// remove it (seconds)
    pub cleanup_grace_secs: u64,
    /// Lookback window for the removed-account sweep (seconds); independent
    /// of `cleanup_grace_secs`
    pub account_removed_window_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            temp_expiry_interval_secs: 60,
            storage_cleanup_interval_secs: 300,
            vm_cleanup_interval_secs: 300,
            account_cleanup_interval_secs: 300,
            cleanup_grace_secs: 3_600,
            account_removed_window_secs: 86_400,
        }
    }
}

impl JobConfig {
    /// Purge grace window as a `Duration`
    #[must_use]
    pub const fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    /// Removed-account lookback as a `Duration`
    #[must_use]
    pub const fn account_removed_window(&self) -> Duration {
        Duration::from_secs(self.account_removed_window_secs)
    }
}

/// Input limits enforced by the storage manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Maximum storage name length
    pub max_name_len: usize,
    /// Maximum storage description length
    pub max_description_len: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_name_len: 255,
            max_description_len: 1_024,
        }
    }
}

/// Value backend endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueBackendConfig {
    /// Base URL of the value backend
    pub base_url: String,
    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Full request timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for ValueBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl ValueBackendConfig {
    /// Connect timeout as a `Duration`
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a `Duration`
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
