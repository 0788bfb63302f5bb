//! Embedded metrics and events store for audio pipelines
//!
//! [`MetricsStore`] is the component the rest of the bot talks to. It owns:
//!
//! - a pooled set of SQLite connections (WAL mode) shared by readers,
//!   batch workers and retention,
//! - one direct-write connection with cached prepared statements for
//!   sessions, events and unbatched metrics,
//! - the [`BatchWriter`] and the [`RetentionManager`].
//!
//! # Startup order
//!
//! ```text
//! MetricsStore::open
//!     │
//!     ├──→ Config::validate
//!     ├──→ MigrationEngine (sole connection) → migrate to latest → dropped
//!     ├──→ r2d2 pool + direct connection → ensure_schema
//!     ├──→ BatchWriter::start          (if batching enabled)
//!     └──→ RetentionManager scheduler  (if retention enabled)
//! ```
//!
//! # Module Organization
//!
//! - `model` - metric, event and session row types
//! - `migrations` - versioned schema engine with backups
//! - `batch` - batched metric writer
//! - `retention` - retention policies and cleanup scheduler
//! - `query` - metric/event filters and aggregates
//! - `analytics` - session lookups and analytics
//! - `sessions` - in-memory index of open sessions

mod analytics;
mod batch;
mod error;
mod migrations;
mod model;
mod query;
mod retention;
mod sessions;
mod signal;

#[cfg(test)]
mod tests;

pub use analytics::{HourBucket, SessionAnalytics, SessionHealth};
pub use batch::{BatchStats, BatchWriter};
pub use error::{StoreError, StoreResult};
pub use migrations::{
    builtin as builtin_migrations, AppliedMigration, Migration, MigrationEngine, MigrationReport,
    MigrationStatus,
};
pub use model::{
    format_ts, parse_ts, Event, FinalState, Metric, MetricType, Session, SessionCounter,
    SessionUpdate, Severity,
};
pub use query::{AggregatePoint, AggregateQuery, Aggregation, EventFilter, MetricFilter};
pub use retention::{
    default_policies, CleanupReport, PolicyResult, RetentionManager, RetentionPolicy,
    RetentionStats,
};
pub use sessions::SessionIndex;
pub use signal::{CompletionSignal, StopToken};

use crate::config::{Config, StoreConfig};
use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Connection pool shared by readers, batch workers and retention
pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Prepared statements kept on the direct-write connection
const STATEMENT_CACHE_CAPACITY: usize = 32;

const INSERT_EVENT_SQL: &str = r#"
INSERT INTO pipeline_events (pipeline_id, event_type, event_data, severity, timestamp)
VALUES (?1, ?2, ?3, ?4, ?5)
"#;

const INSERT_SESSION_SQL: &str = r#"
INSERT INTO pipeline_sessions
    (pipeline_id, guild_id, channel_id, user_id, stream_url, started_at, ended_at,
     final_state, total_errors, total_recoveries)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#;

/// Build the shared pool; every pooled connection gets the store pragmas
pub(crate) fn build_pool(config: &StoreConfig) -> StoreResult<SqlitePool> {
    let pragmas = config.pragmas();
    let manager =
        SqliteConnectionManager::file(&config.db_path).with_init(move |c| c.execute_batch(&pragmas));
    Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.busy_timeout().max(Duration::from_secs(1)))
        .build(manager)
        .map_err(|e| StoreError::Connection(format!("{}: {}", config.db_path.display(), e)))
}

/// Idempotent check that the core tables exist on this connection
fn ensure_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(migrations::CORE_TABLES_SQL)?;
    conn.execute_batch(migrations::QUERY_INDEXES_SQL)?;
    Ok(())
}

/// Row counts and component stats for the whole store
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub schema_version: u32,
    pub metrics_rows: u64,
    pub events_rows: u64,
    pub session_rows: u64,
    pub open_sessions: u64,
    /// `None` when batching is disabled
    pub batch: Option<BatchStats>,
    pub retention: RetentionStats,
}

/// Metrics store façade
pub struct MetricsStore {
    config: Config,
    pool: SqlitePool,
    /// Direct-write connection; `None` after `close()`
    direct: Mutex<Option<Connection>>,
    batch: Option<BatchWriter>,
    retention: Arc<RetentionManager>,
    closed: AtomicBool,
}

impl MetricsStore {
    /// Validate, migrate, then start the background components
    pub fn open(config: &Config) -> StoreResult<Self> {
        config.validate()?;

        {
            let mut engine = MigrationEngine::open(&config.store, &config.backup)?;
            let report = engine.migrate().inspect_err(|e| {
                tracing::error!("Schema migration failed, refusing to open store: {}", e);
            })?;
            if !report.is_noop() {
                tracing::info!(
                    from = report.from,
                    to = report.to,
                    steps = report.steps.len(),
                    "Schema migrated"
                );
            }
        }

        let pool = build_pool(&config.store)?;
        let direct = migrations::open_connection(&config.store.db_path, &config.store.pragmas())?;
        direct.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        ensure_schema(&direct)?;

        let batch = if config.batch.enabled {
            Some(BatchWriter::start(pool.clone(), config.batch.clone())?)
        } else {
            tracing::debug!("Batching disabled, metrics are written directly");
            None
        };

        let retention = RetentionManager::new(pool.clone(), config.retention.clone());
        if config.retention.enabled {
            retention.start_scheduler()?;
        }

        tracing::info!(
            path = %config.store.db_path.display(),
            batching = config.batch.enabled,
            retention = config.retention.enabled,
            "Metrics store opened"
        );

        Ok(Self {
            config: config.clone(),
            pool,
            direct: Mutex::new(Some(direct)),
            batch,
            retention,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn batch_writer(&self) -> Option<&BatchWriter> {
        self.batch.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pooled connection for reads
    pub(crate) fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        if self.is_closed() {
            return Err(StoreError::Closed("metrics store"));
        }
        Ok(self.pool.get()?)
    }

    /// Run `f` against the direct-write connection
    fn with_direct<T>(&self, f: impl FnOnce(&mut Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.direct.lock().unwrap_or_else(|e| e.into_inner());
        let conn = guard
            .as_mut()
            .ok_or(StoreError::Closed("metrics store"))?;
        f(conn)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics and events
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a metric. Goes through the batch writer when enabled
    /// (fire-and-forget, may return `BufferFull`), otherwise written directly.
    pub fn store_metric(&self, metric: Metric) -> StoreResult<()> {
        match &self.batch {
            Some(writer) => writer.add_metric(metric),
            None => self.with_direct(|conn| batch::insert_metrics(conn, &[metric])),
        }
    }

    /// Record several metrics. Returns how many were accepted.
    pub fn store_batch_metrics(&self, metrics: Vec<Metric>) -> StoreResult<usize> {
        if metrics.is_empty() {
            return Ok(0);
        }
        match &self.batch {
            Some(writer) => writer.add_metrics(metrics),
            None => {
                let count = metrics.len();
                self.with_direct(|conn| batch::insert_metrics(conn, &metrics))?;
                Ok(count)
            }
        }
    }

    /// Record an event; returns its row id
    pub fn store_event(&self, event: &Event) -> StoreResult<i64> {
        let data = serde_json::to_string(&event.event_data)?;
        self.with_direct(|conn| {
            conn.prepare_cached(INSERT_EVENT_SQL)?.execute(params![
                event.pipeline_id,
                event.event_type,
                data,
                event.severity.as_str(),
                format_ts(&event.timestamp),
            ])?;
            Ok(conn.last_insert_rowid())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new session; a second create for the same pipeline fails
    /// with `DuplicateSession` and leaves the first untouched.
    pub fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.with_direct(|conn| {
            conn.prepare_cached(INSERT_SESSION_SQL)?
                .execute(params![
                    session.pipeline_id,
                    session.guild_id,
                    session.channel_id,
                    session.user_id,
                    session.stream_url,
                    format_ts(&session.started_at),
                    session.ended_at.as_ref().map(format_ts),
                    session.final_state.map(|s| s.as_str()),
                    session.total_errors,
                    session.total_recoveries,
                ])
                .map_err(|e| error::map_session_insert_error(e, &session.pipeline_id))?;
            Ok(())
        })?;
        tracing::debug!(pipeline_id = %session.pipeline_id, "Session created");
        Ok(())
    }

    /// Apply the `Some` fields of `update` in a single `UPDATE`
    pub fn update_session(&self, pipeline_id: &str, update: &SessionUpdate) -> StoreResult<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        let text = |v: &Option<String>| v.clone().map(Value::Text);
        for (column, value) in [
            ("guild_id = ?", text(&update.guild_id)),
            ("channel_id = ?", text(&update.channel_id)),
            ("user_id = ?", text(&update.user_id)),
            ("stream_url = ?", text(&update.stream_url)),
            ("ended_at = ?", update.ended_at.as_ref().map(|t| Value::Text(format_ts(t)))),
            (
                "final_state = ?",
                update.final_state.map(|s| Value::Text(s.as_str().to_string())),
            ),
            ("total_errors = ?", update.total_errors.map(Value::Integer)),
            ("total_recoveries = ?", update.total_recoveries.map(Value::Integer)),
        ] {
            if let Some(value) = value {
                sets.push(column);
                values.push(value);
            }
        }

        if sets.is_empty() {
            // Nothing to write, but a missing or ended session is still an error
            let session = self.get_session(pipeline_id)?;
            if !session.is_open() {
                return Err(StoreError::SessionEnded(pipeline_id.to_string()));
            }
            return Ok(());
        }

        // Ended sessions are immutable
        let sql = format!(
            "UPDATE pipeline_sessions SET {} WHERE pipeline_id = ? AND ended_at IS NULL",
            sets.join(", ")
        );
        values.push(Value::Text(pipeline_id.to_string()));

        let changed =
            self.with_direct(|conn| Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(values))?))?;
        if changed == 0 {
            return Err(self.unmatched_session(pipeline_id));
        }
        Ok(())
    }

    /// Add one to a counter of an open session and return the new value.
    /// The increment happens inside SQLite, so concurrent callers never
    /// overwrite each other.
    pub fn increment_session_counter(
        &self,
        pipeline_id: &str,
        counter: SessionCounter,
    ) -> StoreResult<i64> {
        let column = counter.column();
        let sql = format!(
            "UPDATE pipeline_sessions SET {column} = {column} + 1 \
             WHERE pipeline_id = ?1 AND ended_at IS NULL RETURNING {column}"
        );
        let value = self.with_direct(|conn| {
            Ok(conn
                .prepare_cached(&sql)?
                .query_row(params![pipeline_id], |row| row.get::<_, i64>(0))
                .optional()?)
        })?;
        value.ok_or_else(|| self.unmatched_session(pipeline_id))
    }

    /// Why a guarded session update touched no row
    fn unmatched_session(&self, pipeline_id: &str) -> StoreError {
        match self.get_session(pipeline_id) {
            Ok(_) => StoreError::SessionEnded(pipeline_id.to_string()),
            Err(e) => e,
        }
    }

    /// Close a session now with `final_state`
    pub fn end_session(&self, pipeline_id: &str, final_state: FinalState) -> StoreResult<()> {
        self.update_session(pipeline_id, &SessionUpdate::end(final_state))?;
        tracing::debug!(pipeline_id, final_state = %final_state, "Session ended");
        Ok(())
    }

    pub fn get_session(&self, pipeline_id: &str) -> StoreResult<Session> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM pipeline_sessions WHERE pipeline_id = ?1",
            analytics::SESSION_COLUMNS
        );
        conn.query_row(&sql, params![pipeline_id], analytics::session_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session '{pipeline_id}'")))
    }

    /// Sessions with no `ended_at`, oldest first
    pub fn open_sessions(&self) -> StoreResult<Vec<Session>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM pipeline_sessions WHERE ended_at IS NULL ORDER BY started_at",
            analytics::SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], analytics::session_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait for buffered metrics to be committed (no-op without batching)
    pub fn flush(&self, timeout: Duration) -> StoreResult<()> {
        match &self.batch {
            Some(writer) => writer.flush(timeout),
            None => Ok(()),
        }
    }

    /// Run retention now, serialised with the scheduler
    pub fn run_cleanup(&self) -> StoreResult<CleanupReport> {
        if self.is_closed() {
            return Err(StoreError::Closed("metrics store"));
        }
        self.retention.run_cleanup()
    }

    pub fn schema_version(&self) -> StoreResult<u32> {
        let version: Option<u32> = self.conn()?.query_row(
            "SELECT MAX(version) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> StoreResult<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(StoreStats {
            schema_version: self.schema_version()?,
            metrics_rows: count("SELECT COUNT(*) FROM pipeline_metrics")?,
            events_rows: count("SELECT COUNT(*) FROM pipeline_events")?,
            session_rows: count("SELECT COUNT(*) FROM pipeline_sessions")?,
            open_sessions: count("SELECT COUNT(*) FROM pipeline_sessions WHERE ended_at IS NULL")?,
            batch: self.batch.as_ref().map(BatchWriter::stats),
            retention: self.retention.stats(),
        })
    }

    /// Stop background components, flush the statement cache and close the
    /// direct connection. Every step runs even if an earlier one failed.
    /// Idempotent.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();

        if let Some(writer) = &self.batch {
            if let Err(e) = writer.shutdown() {
                errors.push(format!("batch writer: {e}"));
            }
        }

        if let Err(e) = self.retention.stop(self.config.batch.shutdown_timeout()) {
            errors.push(format!("retention: {e}"));
        }

        let direct = self
            .direct
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(conn) = direct {
            conn.flush_prepared_statement_cache();
            if let Err((_, e)) = conn.close() {
                errors.push(format!("direct connection: {e}"));
            }
        }

        if errors.is_empty() {
            tracing::info!(closed_at = %format_ts(&Utc::now()), "Metrics store closed");
            Ok(())
        } else {
            for e in &errors {
                tracing::error!("Error while closing metrics store: {}", e);
            }
            Err(StoreError::Close(errors))
        }
    }
}

impl Drop for MetricsStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Metrics store close on drop: {}", e);
        }
    }
}
