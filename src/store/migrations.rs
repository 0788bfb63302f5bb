//! Versioned schema migration engine
//!
//! Brings the store file to a target schema version by applying forward
//! (`up`) or backward (`down`) scripts, one transaction per version. Every
//! applied version is recorded in `schema_migrations` together with the
//! SHA-256 of its forward script; a recorded checksum that no longer matches
//! the registry aborts the run before anything is touched.
//!
//! # Backups
//!
//! When backups are enabled and there is work to do, the engine snapshots
//! the store with `VACUUM INTO` first. If a step then fails, the snapshot is
//! copied back over the store file and the error reports both the failure and
//! the restore outcome.
//!
//! The engine owns the only connection to the file while it runs
//! ([`MetricsStore::open`](super::MetricsStore::open) runs it before the pool
//! exists), so restoring can close, swap and reopen without coordinating with
//! other handles.

use super::error::{StoreError, StoreResult};
use crate::config::{BackupConfig, StoreConfig};
use chrono::Utc;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Built-in schema
// ─────────────────────────────────────────────────────────────────────────────

/// v1: metrics, sessions and events tables
pub const CORE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    value REAL NOT NULL,
    tags TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id TEXT NOT NULL UNIQUE,
    guild_id TEXT,
    channel_id TEXT,
    user_id TEXT,
    stream_url TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    final_state TEXT
);

CREATE TABLE IF NOT EXISTS pipeline_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_data TEXT NOT NULL DEFAULT '{}',
    severity TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
"#;

const CORE_TABLES_DOWN_SQL: &str = r#"
DROP TABLE IF EXISTS pipeline_events;
DROP TABLE IF EXISTS pipeline_sessions;
DROP TABLE IF EXISTS pipeline_metrics;
"#;

/// v2: indexes for per-pipeline lookups and retention range scans
pub const QUERY_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_metrics_pipeline_ts ON pipeline_metrics(pipeline_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON pipeline_metrics(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_pipeline_ts ON pipeline_events(pipeline_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON pipeline_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_sessions_guild ON pipeline_sessions(guild_id, started_at);
CREATE INDEX IF NOT EXISTS idx_sessions_ended ON pipeline_sessions(ended_at);
"#;

const QUERY_INDEXES_DOWN_SQL: &str = r#"
DROP INDEX IF EXISTS idx_sessions_ended;
DROP INDEX IF EXISTS idx_sessions_guild;
DROP INDEX IF EXISTS idx_events_timestamp;
DROP INDEX IF EXISTS idx_events_pipeline_ts;
DROP INDEX IF EXISTS idx_metrics_timestamp;
DROP INDEX IF EXISTS idx_metrics_pipeline_ts;
"#;

const SESSION_COUNTERS_SQL: &str = r#"
ALTER TABLE pipeline_sessions ADD COLUMN total_errors INTEGER NOT NULL DEFAULT 0;
ALTER TABLE pipeline_sessions ADD COLUMN total_recoveries INTEGER NOT NULL DEFAULT 0;
"#;

const SESSION_COUNTERS_DOWN_SQL: &str = r#"
ALTER TABLE pipeline_sessions DROP COLUMN total_recoveries;
ALTER TABLE pipeline_sessions DROP COLUMN total_errors;
"#;

const METRIC_NAME_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON pipeline_metrics(metric_name, timestamp);";

const METRIC_NAME_INDEX_DOWN_SQL: &str = "DROP INDEX IF EXISTS idx_metrics_name_ts;";

const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#;

// ─────────────────────────────────────────────────────────────────────────────
// Migration definitions
// ─────────────────────────────────────────────────────────────────────────────

/// One registered schema version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub description: String,
    pub up: String,
    pub down: String,
}

impl Migration {
    pub fn new(
        version: u32,
        name: impl Into<String>,
        description: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            description: description.into(),
            up: up.into(),
            down: down.into(),
        }
    }

    /// Hex SHA-256 of the forward script
    pub fn checksum(&self) -> String {
        checksum(&self.up)
    }
}

fn checksum(script: &str) -> String {
    let digest = Sha256::digest(script.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The migrations this crate ships, ascending
pub fn builtin() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "core_tables",
            "Metrics, sessions and events tables",
            CORE_TABLES_SQL,
            CORE_TABLES_DOWN_SQL,
        ),
        Migration::new(
            2,
            "query_indexes",
            "Per-pipeline and timestamp indexes",
            QUERY_INDEXES_SQL,
            QUERY_INDEXES_DOWN_SQL,
        ),
        Migration::new(
            3,
            "session_counters",
            "Error and recovery counters on sessions",
            SESSION_COUNTERS_SQL,
            SESSION_COUNTERS_DOWN_SQL,
        ),
        Migration::new(
            4,
            "metric_name_index",
            "Metric name lookups for aggregates",
            METRIC_NAME_INDEX_SQL,
            METRIC_NAME_INDEX_DOWN_SQL,
        ),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a successful migrate/rollback call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Versions applied (forward) or reverted (backward), in execution order
    pub steps: Vec<u32>,
    pub backup: Option<PathBuf>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A row of `schema_migrations`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub checksum: String,
    pub applied_at: String,
}

/// Current schema position relative to the registry
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current: u32,
    pub latest: u32,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<(u32, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Schema migration engine over a single exclusively-owned connection
pub struct MigrationEngine {
    db_path: PathBuf,
    pragmas: String,
    conn: Option<Connection>,
    backup: BackupConfig,
    migrations: Vec<Migration>,
}

impl MigrationEngine {
    /// Open the store file and make sure the audit table exists
    pub fn open(store: &StoreConfig, backup: &BackupConfig) -> StoreResult<Self> {
        if let Some(parent) = store.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let pragmas = store.pragmas();
        let conn = open_connection(&store.db_path, &pragmas)?;
        conn.execute_batch(MIGRATIONS_TABLE_SQL)?;

        Ok(Self {
            db_path: store.db_path.clone(),
            pragmas,
            conn: Some(conn),
            backup: backup.clone(),
            migrations: builtin(),
        })
    }

    /// Replace the registry (sorted by version)
    pub fn with_migrations(mut self, mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        self.migrations = migrations;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::Closed("migration engine"))
    }

    /// Highest recorded version, 0 for a fresh store
    pub fn current_version(&self) -> StoreResult<u32> {
        let version: Option<u32> = self
            .conn()?
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })?;
        Ok(version.unwrap_or(0))
    }

    /// Highest version in the registry
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    fn applied(&self) -> StoreResult<Vec<AppliedMigration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT version, name, checksum, applied_at FROM schema_migrations ORDER BY version",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AppliedMigration {
                version: row.get(0)?,
                name: row.get(1)?,
                checksum: row.get(2)?,
                applied_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Re-hash every recorded version against the registry
    pub fn validate(&self) -> StoreResult<()> {
        for record in self.applied()? {
            let Some(migration) = self.migrations.iter().find(|m| m.version == record.version)
            else {
                return Err(StoreError::ChecksumMismatch {
                    version: record.version,
                    name: record.name,
                    recorded: record.checksum,
                    computed: "<not in registry>".to_string(),
                });
            };

            let computed = migration.checksum();
            if computed != record.checksum {
                tracing::error!(
                    version = record.version,
                    name = %record.name,
                    "Migration checksum drift detected"
                );
                return Err(StoreError::ChecksumMismatch {
                    version: record.version,
                    name: record.name,
                    recorded: record.checksum,
                    computed,
                });
            }
        }
        Ok(())
    }

    pub fn status(&self) -> StoreResult<MigrationStatus> {
        let current = self.current_version()?;
        let applied = self.applied()?;
        let pending = self
            .migrations
            .iter()
            .filter(|m| !applied.iter().any(|a| a.version == m.version))
            .map(|m| (m.version, m.name.clone()))
            .collect();

        Ok(MigrationStatus {
            current,
            latest: self.latest_version(),
            applied,
            pending,
        })
    }

    /// Apply every pending version
    pub fn migrate(&mut self) -> StoreResult<MigrationReport> {
        // A store ahead of the registry fails here as drift, never as a rollback
        self.validate()?;
        self.migrate_to(self.latest_version())
    }

    /// Revert the single most recent version
    pub fn rollback(&mut self) -> StoreResult<MigrationReport> {
        let current = self.current_version()?;
        let target = self
            .migrations
            .iter()
            .rev()
            .map(|m| m.version)
            .find(|v| *v < current)
            .unwrap_or(0);
        self.rollback_to(target)
    }

    /// Revert down to (and excluding) `target`
    pub fn rollback_to(&mut self, target: u32) -> StoreResult<MigrationReport> {
        let current = self.current_version()?;
        if target > current {
            return Err(StoreError::ConfigInvalid(format!(
                "cannot roll back to v{target}: store is at v{current}"
            )));
        }
        self.migrate_to(target)
    }

    /// Move the schema to exactly `target`, forwards or backwards
    pub fn migrate_to(&mut self, target: u32) -> StoreResult<MigrationReport> {
        if target != 0 && !self.migrations.iter().any(|m| m.version == target) {
            return Err(StoreError::NotFound(format!("migration v{target}")));
        }

        self.validate()?;

        let from = self.current_version()?;
        let (direction, plan): (Direction, Vec<Migration>) = if target >= from {
            (
                Direction::Up,
                self.migrations
                    .iter()
                    .filter(|m| m.version > from && m.version <= target)
                    .cloned()
                    .collect(),
            )
        } else {
            (
                Direction::Down,
                self.migrations
                    .iter()
                    .rev()
                    .filter(|m| m.version > target && m.version <= from)
                    .cloned()
                    .collect(),
            )
        };

        if plan.is_empty() {
            tracing::debug!(version = from, "Schema up to date");
            return Ok(MigrationReport {
                from,
                to: from,
                steps: Vec::new(),
                backup: None,
            });
        }

        let backup = if self.backup.enabled {
            Some(self.take_backup(from, target)?)
        } else {
            None
        };

        let mut steps = Vec::with_capacity(plan.len());
        for migration in &plan {
            let start = Instant::now();
            if let Err(e) = self.run_step(migration, direction) {
                return Err(self.abort_step(migration, e, backup.as_deref()));
            }

            tracing::info!(
                version = migration.version,
                name = %migration.name,
                direction = ?direction,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Applied migration"
            );
            steps.push(migration.version);
        }

        if backup.is_some() {
            if let Err(e) = self.prune_backups() {
                tracing::warn!("Failed to prune old backups: {}", e);
            }
        }

        Ok(MigrationReport {
            from,
            to: target,
            steps,
            backup,
        })
    }

    fn run_step(&mut self, migration: &Migration, direction: Direction) -> StoreResult<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(StoreError::Closed("migration engine"))?;
        let tx = conn.transaction()?;

        match direction {
            Direction::Up => {
                tx.execute_batch(&migration.up)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, name, description, checksum, applied_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        migration.version,
                        migration.name,
                        migration.description,
                        migration.checksum(),
                        super::model::format_ts(&Utc::now()),
                    ],
                )?;
            }
            Direction::Down => {
                tx.execute_batch(&migration.down)?;
                tx.execute(
                    "DELETE FROM schema_migrations WHERE version = ?1",
                    params![migration.version],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Backups
    // ─────────────────────────────────────────────────────────────────────────

    fn take_backup(&self, from: u32, to: u32) -> StoreResult<PathBuf> {
        fs::create_dir_all(&self.backup.dir)?;
        let path = self.backup.dir.join(backup_file_name(from, to));

        self.conn()?.execute(
            "VACUUM INTO ?1",
            params![path.to_string_lossy().into_owned()],
        )?;

        tracing::info!(path = %path.display(), from, to, "Created pre-migration backup");
        Ok(path)
    }

    /// Restore `backup` (if any) after a failed step. A failed restore is
    /// reported next to the step's own cause, never instead of it.
    fn abort_step(
        &mut self,
        migration: &Migration,
        cause: StoreError,
        backup: Option<&Path>,
    ) -> StoreError {
        let restore = backup.map(|path| match self.restore(path) {
            Ok(()) => "backup restored".to_string(),
            Err(re) => format!("backup restore failed: {re}"),
        });
        tracing::error!(
            version = migration.version,
            name = %migration.name,
            error = %cause,
            restore = restore.as_deref().unwrap_or("no backup"),
            "Migration failed"
        );
        StoreError::MigrationFailure {
            version: migration.version,
            cause: cause.to_string(),
            restore,
        }
    }

    /// Swap the store file for `backup`. The engine's handle is the only one
    /// open, so closing it first is enough to make the copy safe.
    fn restore(&mut self, backup: &Path) -> StoreResult<()> {
        if !backup.is_file() {
            return Err(StoreError::NotFound(format!("backup {}", backup.display())));
        }
        if let Some(conn) = self.conn.take() {
            if let Err((conn, e)) = conn.close() {
                self.conn = Some(conn);
                return Err(e.into());
            }
        }

        for suffix in ["-wal", "-shm"] {
            let side = sidecar(&self.db_path, suffix);
            if side.exists() {
                fs::remove_file(&side)?;
            }
        }

        fs::copy(backup, &self.db_path)?;
        self.conn = Some(open_connection(&self.db_path, &self.pragmas)?);

        tracing::warn!(backup = %backup.display(), "Restored store from backup");
        Ok(())
    }

    /// Backup files in the backup directory, newest first
    pub fn backups(&self) -> StoreResult<Vec<PathBuf>> {
        if !self.backup.dir.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.backup.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("backup_v") && name.ends_with(".db") {
                let modified = entry.metadata()?.modified()?;
                found.push((modified, entry.path()));
            }
        }

        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn prune_backups(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for stale in self.backups()?.into_iter().skip(self.backup.keep) {
            fs::remove_file(&stale)?;
            tracing::debug!(path = %stale.display(), "Pruned backup");
            removed += 1;
        }
        Ok(removed)
    }
}

/// Open a connection with the store pragmas applied
pub(crate) fn open_connection(path: &Path, pragmas: &str) -> StoreResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Connection(format!("{}: {}", path.display(), e)))?;
    conn.execute_batch(pragmas)?;
    Ok(conn)
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// `backup_v{from}_to_v{to}_{YYYYmmddTHHMMSS}_{xxxx}.db`
fn backup_file_name(from: u32, to: u32) -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let timestamp = Utc::now().format("%Y%m%dT%H%M%S");
    let random = RandomState::new().build_hasher().finish();
    format!("backup_v{}_to_v{}_{}_{:04x}.db", from, to, timestamp, random & 0xFFFF)
}
