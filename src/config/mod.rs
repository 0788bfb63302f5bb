//! Configuration for the pipeline metrics store
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/pipestore/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Everything is validated by [`Config::validate`] before any store component
//! is constructed. A bad value is reported at startup, never during a write.

use crate::store::{StoreError, StoreResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod observability;
mod serialization;
mod storage;

#[cfg(test)]
mod tests;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (maintain public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use observability::{FileLogging, LogFormat, LogRotation, LoggingConfig, LOG_LEVELS};
pub use storage::{
    BackupConfig, BatchConfig, FileBackupConfig, FileBatchConfig, FileRetentionConfig,
    FileSessionConfig, FileStoreConfig, RetentionConfig, SessionConfig, StoreConfig,
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const JOURNAL_MODES: &[&str] = &["WAL", "DELETE", "TRUNCATE", "PERSIST", "MEMORY"];
const SYNCHRONOUS_MODES: &[&str] = &["OFF", "NORMAL", "FULL", "EXTRA"];

/// Longest accepted retention period (days)
pub const MAX_RETENTION_DAYS: u32 = 36_500;
/// Longest accepted orphan threshold (seconds, one year)
pub const MAX_ORPHAN_THRESHOLD_SECS: u64 = 365 * 24 * 3600;

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// SQLite connection and performance settings
    pub store: StoreConfig,

    /// Batched write engine
    pub batch: BatchConfig,

    /// Retention policies and cleanup schedule
    pub retention: RetentionConfig,

    /// Pre-migration snapshots
    pub backup: BackupConfig,

    /// Session index (orphan sweep, analytics cache)
    pub sessions: SessionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    /// Optional [store] section
    pub store: Option<FileStoreConfig>,

    /// Optional [batch] section
    pub batch: Option<FileBatchConfig>,

    /// Optional [retention] section
    pub retention: Option<FileRetentionConfig>,

    /// Optional [backup] section
    pub backup: Option<FileBackupConfig>,

    /// Optional [sessions] section
    pub sessions: Option<FileSessionConfig>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,
}

impl Config {
    fn from_file(file: FileConfig) -> Self {
        Self {
            store: StoreConfig::from_file(file.store),
            batch: BatchConfig::from_file(file.batch),
            retention: RetentionConfig::from_file(file.retention),
            backup: BackupConfig::from_file(file.backup),
            sessions: SessionConfig::from_file(file.sessions),
            logging: LoggingConfig::from_file(file.logging),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/pipestore/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("pipestore").join("config.toml"))
    }

    /// Parse a TOML document into a config (no env overrides, no validation)
    pub fn from_toml_str(contents: &str) -> StoreResult<Self> {
        let file: FileConfig = toml::from_str(contents)
            .map_err(|e| StoreError::ConfigInvalid(format!("failed to parse config: {e}")))?;
        Ok(Self::from_file(file))
    }

    /// Load a config file if it exists; a missing file yields defaults.
    ///
    /// A file that exists but cannot be read or parsed is an error. A broken
    /// config should fail fast, not silently fall back to defaults.
    pub fn load_file(path: &Path) -> StoreResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).map_err(|e| match e {
                StoreError::ConfigInvalid(msg) => {
                    StoreError::ConfigInvalid(format!("{}: {}", path.display(), msg))
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StoreError::ConfigInvalid(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load configuration: file -> env vars -> defaults, then validate
    pub fn load() -> StoreResult<Self> {
        Self::load_from(None)
    }

    /// Like [`Config::load`], reading `path` instead of the default location
    pub fn load_from(path: Option<&Path>) -> StoreResult<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::config_path);
        let mut config = match path {
            Some(path) => Self::load_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PIPESTORE_*` overrides. `lookup` is injected so tests don't
    /// have to mutate the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> StoreResult<()> {
        if let Some(v) = lookup("PIPESTORE_DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PIPESTORE_SYNCHRONOUS") {
            self.store.synchronous = v;
        }
        if let Some(v) = lookup("PIPESTORE_CACHE_SIZE_KB") {
            self.store.cache_size_kb = parse_env("PIPESTORE_CACHE_SIZE_KB", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_BATCH_SIZE") {
            self.batch.batch_size = parse_env("PIPESTORE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_FLUSH_INTERVAL_MS") {
            self.batch.flush_interval_ms = parse_env("PIPESTORE_FLUSH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_METRICS_RETENTION_DAYS") {
            self.retention.metrics_retention_days =
                parse_env("PIPESTORE_METRICS_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_EVENTS_RETENTION_DAYS") {
            self.retention.events_retention_days =
                parse_env("PIPESTORE_EVENTS_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_CLEANUP_INTERVAL_SECS") {
            self.retention.cleanup_interval_secs =
                parse_env("PIPESTORE_CLEANUP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_BACKUP_ENABLED") {
            self.backup.enabled = v == "1" || v.to_lowercase() == "true";
        }
        if let Some(v) = lookup("PIPESTORE_BACKUP_KEEP") {
            self.backup.keep = parse_env("PIPESTORE_BACKUP_KEEP", &v)?;
        }
        if let Some(v) = lookup("PIPESTORE_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Reject configurations the store cannot run with
    pub fn validate(&self) -> StoreResult<()> {
        let invalid = |msg: String| Err(StoreError::ConfigInvalid(msg));

        if self.store.db_path.as_os_str().is_empty() {
            return invalid("store.db_path must not be empty".into());
        }
        if !JOURNAL_MODES.contains(&self.store.journal_mode.to_uppercase().as_str()) {
            return invalid(format!(
                "store.journal_mode '{}' must be one of {:?}",
                self.store.journal_mode, JOURNAL_MODES
            ));
        }
        if !SYNCHRONOUS_MODES.contains(&self.store.synchronous.to_uppercase().as_str()) {
            return invalid(format!(
                "store.synchronous '{}' must be one of {:?}",
                self.store.synchronous, SYNCHRONOUS_MODES
            ));
        }
        if self.store.pool_size == 0 {
            return invalid("store.pool_size must be at least 1".into());
        }

        if self.batch.batch_size == 0 {
            return invalid("batch.batch_size must be at least 1".into());
        }
        if self.batch.flush_interval_ms == 0 {
            return invalid("batch.flush_interval_ms must be greater than 0".into());
        }
        if self.batch.workers == 0 {
            return invalid("batch.workers must be at least 1".into());
        }

        if self.retention.metrics_retention_days == 0 || self.retention.events_retention_days == 0
        {
            return invalid("retention periods must be at least 1 day".into());
        }
        if self.retention.metrics_retention_days > MAX_RETENTION_DAYS
            || self.retention.events_retention_days > MAX_RETENTION_DAYS
        {
            return invalid(format!(
                "retention periods must be at most {MAX_RETENTION_DAYS} days"
            ));
        }
        if self.retention.cleanup_interval_secs == 0 {
            return invalid("retention.cleanup_interval_secs must be greater than 0".into());
        }

        if self.backup.enabled && self.backup.keep == 0 {
            return invalid("backup.keep must be at least 1 when backups are enabled".into());
        }

        if self.sessions.orphan_threshold_secs == 0 || self.sessions.sweep_interval_secs == 0 {
            return invalid("session orphan threshold and sweep interval must be > 0".into());
        }
        if self.sessions.orphan_threshold_secs > MAX_ORPHAN_THRESHOLD_SECS {
            return invalid(format!(
                "sessions.orphan_threshold_secs must be at most {MAX_ORPHAN_THRESHOLD_SECS}"
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return invalid(format!(
                "logging.level '{}' must be one of {:?}",
                self.logging.level, LOG_LEVELS
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> StoreResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StoreError::ConfigInvalid(format!("{key}='{value}' is not a valid number")))
}
