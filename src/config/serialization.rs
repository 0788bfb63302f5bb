//! Config serialization to TOML
//!
//! Single source of truth for config file format.

use super::Config;

impl Config {
    /// Render the effective configuration as a commented TOML document
    pub fn to_toml(&self) -> String {
        format!(
            r#"# pipestore configuration

# SQLite store
[store]
db_path = "{db_path}"
journal_mode = "{journal_mode}"  # WAL, DELETE, TRUNCATE, PERSIST, MEMORY
synchronous = "{synchronous}"     # OFF, NORMAL, FULL, EXTRA
cache_size_kb = {cache_size_kb}
busy_timeout_ms = {busy_timeout_ms}
pool_size = {pool_size}

# Batched metric writes
[batch]
enabled = {batch_enabled}
batch_size = {batch_size}
flush_interval_ms = {flush_interval_ms}
workers = {workers}
max_retries = {max_retries}
retry_backoff_ms = {retry_backoff_ms}
shutdown_timeout_secs = {shutdown_timeout_secs}

# Data lifetimes (completed sessions are kept twice as long as metrics)
[retention]
enabled = {retention_enabled}
metrics_retention_days = {metrics_days}
events_retention_days = {events_days}
cleanup_interval_secs = {cleanup_interval}
initial_delay_secs = {initial_delay}
run_timeout_secs = {run_timeout}

# Snapshots taken before schema migrations
[backup]
enabled = {backup_enabled}
dir = "{backup_dir}"
keep = {backup_keep}

# Open-session index
[sessions]
orphan_threshold_secs = {orphan_threshold}
sweep_interval_secs = {sweep_interval}
analytics_ttl_secs = {analytics_ttl}

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
format = "{log_format}"  # text, json
file_enabled = {log_file_enabled}
file_dir = "{log_file_dir}"
file_rotation = "{log_file_rotation}"  # hourly, daily, never
file_prefix = "{log_file_prefix}"
"#,
            db_path = escape_path(&self.store.db_path),
            journal_mode = self.store.journal_mode,
            synchronous = self.store.synchronous,
            cache_size_kb = self.store.cache_size_kb,
            busy_timeout_ms = self.store.busy_timeout_ms,
            pool_size = self.store.pool_size,
            batch_enabled = self.batch.enabled,
            batch_size = self.batch.batch_size,
            flush_interval_ms = self.batch.flush_interval_ms,
            workers = self.batch.workers,
            max_retries = self.batch.max_retries,
            retry_backoff_ms = self.batch.retry_backoff_ms,
            shutdown_timeout_secs = self.batch.shutdown_timeout_secs,
            retention_enabled = self.retention.enabled,
            metrics_days = self.retention.metrics_retention_days,
            events_days = self.retention.events_retention_days,
            cleanup_interval = self.retention.cleanup_interval_secs,
            initial_delay = self.retention.initial_delay_secs,
            run_timeout = self.retention.run_timeout_secs,
            backup_enabled = self.backup.enabled,
            backup_dir = escape_path(&self.backup.dir),
            backup_keep = self.backup.keep,
            orphan_threshold = self.sessions.orphan_threshold_secs,
            sweep_interval = self.sessions.sweep_interval_secs,
            analytics_ttl = self.sessions.analytics_ttl_secs,
            log_level = self.logging.level,
            log_format = self.logging.format.as_str(),
            log_file_enabled = self.logging.file_enabled,
            log_file_dir = escape_path(&self.logging.file_dir),
            log_file_rotation = self.logging.file_rotation.as_str(),
            log_file_prefix = self.logging.file_prefix,
        )
    }
}

/// Paths go inside basic TOML strings, so backslashes (Windows) need escaping
fn escape_path(path: &std::path::Path) -> String {
    path.display().to_string().replace('\\', "\\\\")
}
