//! Store configuration: database, batching, retention, backups, sessions
//!
//! Each section has a runtime struct (used by the store) and a `File*`
//! struct with all-optional fields (deserialized from TOML). `from_file`
//! merges the two over the defaults.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Database
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite connection and performance settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Journal mode: WAL (default), DELETE, TRUNCATE, PERSIST, MEMORY
    pub journal_mode: String,
    /// Durability mode: OFF, NORMAL (default), FULL, EXTRA
    pub synchronous: String,
    /// Page cache size in KiB (applied as a negative `cache_size`)
    pub cache_size_kb: u32,
    /// How long a writer waits on a locked database (milliseconds)
    pub busy_timeout_ms: u64,
    /// Maximum pooled connections shared by workers and readers
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/pipeline_metrics.db"),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size_kb: 64_000, // 64MB cache
            busy_timeout_ms: 5_000,
            pool_size: 4,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// PRAGMA block applied to every connection the store opens
    pub fn pragmas(&self) -> String {
        format!(
            "PRAGMA journal_mode={};\nPRAGMA synchronous={};\nPRAGMA busy_timeout={};\nPRAGMA cache_size=-{};",
            self.journal_mode.to_uppercase(),
            self.synchronous.to_uppercase(),
            self.busy_timeout_ms,
            self.cache_size_kb,
        )
    }
}

/// Database settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileStoreConfig {
    pub db_path: Option<String>,
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
    pub cache_size_kb: Option<u32>,
    pub busy_timeout_ms: Option<u64>,
    pub pool_size: Option<u32>,
}

impl StoreConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileStoreConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            db_path: file.db_path.map(PathBuf::from).unwrap_or(defaults.db_path),
            journal_mode: file.journal_mode.unwrap_or(defaults.journal_mode),
            synchronous: file.synchronous.unwrap_or(defaults.synchronous),
            cache_size_kb: file.cache_size_kb.unwrap_or(defaults.cache_size_kb),
            busy_timeout_ms: file.busy_timeout_ms.unwrap_or(defaults.busy_timeout_ms),
            pool_size: file.pool_size.unwrap_or(defaults.pool_size),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batched writes
// ─────────────────────────────────────────────────────────────────────────────

/// Batched write engine settings
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Route metric writes through the batch engine (false = direct writes)
    pub enabled: bool,
    /// Metrics per batch transaction
    pub batch_size: usize,
    /// Maximum time a partial batch waits before flushing (milliseconds)
    pub flush_interval_ms: u64,
    /// Persistence worker threads
    pub workers: usize,
    /// Attempts the retry worker makes before dropping a batch
    pub max_retries: u32,
    /// Base retry delay; attempt N waits N times this (milliseconds)
    pub retry_backoff_ms: u64,
    /// Grace period for draining on shutdown (seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            flush_interval_ms: 1_000,
            workers: 2,
            max_retries: 3,
            retry_backoff_ms: 500,
            shutdown_timeout_secs: 5,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Intake queue capacity (twice the batch size)
    pub fn intake_capacity(&self) -> usize {
        self.batch_size.saturating_mul(2)
    }
}

/// Batch settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileBatchConfig {
    pub enabled: Option<bool>,
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
}

impl BatchConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileBatchConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            flush_interval_ms: file.flush_interval_ms.unwrap_or(defaults.flush_interval_ms),
            workers: file.workers.unwrap_or(defaults.workers),
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff_ms: file.retry_backoff_ms.unwrap_or(defaults.retry_backoff_ms),
            shutdown_timeout_secs: file
                .shutdown_timeout_secs
                .unwrap_or(defaults.shutdown_timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retention
// ─────────────────────────────────────────────────────────────────────────────

/// Retention manager settings
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Run the background cleanup scheduler
    pub enabled: bool,
    /// Raw metrics lifetime (days); completed sessions live twice as long
    pub metrics_retention_days: u32,
    /// Events lifetime (days)
    pub events_retention_days: u32,
    /// Time between scheduled cleanups (seconds, default one hour)
    pub cleanup_interval_secs: u64,
    /// Delay before the first scheduled cleanup (seconds)
    pub initial_delay_secs: u64,
    /// Deadline for one cleanup run (seconds)
    pub run_timeout_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_retention_days: 30,
            events_retention_days: 30,
            cleanup_interval_secs: 3_600,
            initial_delay_secs: 30,
            run_timeout_secs: 300,
        }
    }
}

impl RetentionConfig {
    pub fn metrics_retention(&self) -> Duration {
        days(self.metrics_retention_days)
    }

    pub fn events_retention(&self) -> Duration {
        days(self.events_retention_days)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

fn days(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 24 * 3600)
}

/// Retention settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileRetentionConfig {
    pub enabled: Option<bool>,
    pub metrics_retention_days: Option<u32>,
    pub events_retention_days: Option<u32>,
    pub cleanup_interval_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
    pub run_timeout_secs: Option<u64>,
}

impl RetentionConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileRetentionConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            metrics_retention_days: file
                .metrics_retention_days
                .unwrap_or(defaults.metrics_retention_days),
            events_retention_days: file
                .events_retention_days
                .unwrap_or(defaults.events_retention_days),
            cleanup_interval_secs: file
                .cleanup_interval_secs
                .unwrap_or(defaults.cleanup_interval_secs),
            initial_delay_secs: file
                .initial_delay_secs
                .unwrap_or(defaults.initial_delay_secs),
            run_timeout_secs: file.run_timeout_secs.unwrap_or(defaults.run_timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration backups
// ─────────────────────────────────────────────────────────────────────────────

/// Pre-migration snapshot settings
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Snapshot the store before applying or rolling back migrations
    pub enabled: bool,
    /// Directory for snapshot files
    pub dir: PathBuf,
    /// Snapshots to keep (oldest pruned first)
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./data/backups"),
            keep: 5,
        }
    }
}

/// Backup settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileBackupConfig {
    pub enabled: Option<bool>,
    pub dir: Option<String>,
    pub keep: Option<usize>,
}

impl BackupConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileBackupConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            dir: file.dir.map(PathBuf::from).unwrap_or(defaults.dir),
            keep: file.keep.unwrap_or(defaults.keep),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session index
// ─────────────────────────────────────────────────────────────────────────────

/// Session index settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions open longer than this are force-ended as `timeout` (seconds)
    pub orphan_threshold_secs: u64,
    /// Time between orphan sweeps (seconds)
    pub sweep_interval_secs: u64,
    /// Lifetime of cached analytics (seconds)
    pub analytics_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            orphan_threshold_secs: 2 * 3600,
            sweep_interval_secs: 600,
            analytics_ttl_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.orphan_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn analytics_ttl(&self) -> Duration {
        Duration::from_secs(self.analytics_ttl_secs)
    }
}

/// Session settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileSessionConfig {
    pub orphan_threshold_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub analytics_ttl_secs: Option<u64>,
}

impl SessionConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileSessionConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            orphan_threshold_secs: file
                .orphan_threshold_secs
                .unwrap_or(defaults.orphan_threshold_secs),
            sweep_interval_secs: file
                .sweep_interval_secs
                .unwrap_or(defaults.sweep_interval_secs),
            analytics_ttl_secs: file
                .analytics_ttl_secs
                .unwrap_or(defaults.analytics_ttl_secs),
        }
    }
}
