//! Store-specific error types.
//!
//! Every synchronous store operation returns [`StoreError`]. Background
//! threads (batch workers, retention scheduler, orphan sweep) have no caller
//! to report to, so they count failures in their stats and log them instead.

use thiserror::Error;

/// Errors that can occur in the metrics store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Configuration rejected before any component was constructed.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The store file could not be opened. Fatal to startup.
    #[error("connection error: {0}")]
    Connection(String),

    /// A batch transaction failed; retried inside the write engine.
    #[error("transient write error: {0}")]
    TransientWrite(String),

    /// Intake queue is full. Returned synchronously, never retried internally.
    #[error("metric buffer full (capacity {capacity})")]
    BufferFull { capacity: usize },

    /// A recorded migration no longer matches its script.
    #[error("checksum mismatch for migration v{version} ({name}): recorded {recorded}, computed {computed}")]
    ChecksumMismatch {
        version: u32,
        name: String,
        recorded: String,
        computed: String,
    },

    /// A migration step failed. `restore` describes what happened to the
    /// pre-migration backup, if there was one.
    #[error("migration v{version} failed: {cause}{}", restore_suffix(.restore))]
    MigrationFailure {
        version: u32,
        cause: String,
        restore: Option<String>,
    },

    /// One retention policy failed. Siblings are unaffected.
    #[error("retention policy '{policy}' failed: {cause}")]
    PolicyExecution { policy: String, cause: String },

    /// The requested row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A session with this pipeline id already exists.
    #[error("session already exists for pipeline '{0}'")]
    DuplicateSession(String),

    /// The session has already ended and can no longer change.
    #[error("session for pipeline '{0}' has already ended")]
    SessionEnded(String),

    /// A bounded operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The component has already been shut down.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// `close()` finished but one or more steps failed.
    #[error("close finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the error is a missing row rather than a genuine failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when a session mutation hit an already-ended session.
    pub fn is_session_ended(&self) -> bool {
        matches!(self, Self::SessionEnded(_))
    }

    /// True when the intake queue rejected the write.
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, Self::BufferFull { .. })
    }
}

fn restore_suffix(restore: &Option<String>) -> String {
    restore
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Map a UNIQUE violation on `pipeline_sessions.pipeline_id` to
/// [`StoreError::DuplicateSession`]; everything else passes through.
pub(crate) fn map_session_insert_error(err: rusqlite::Error, pipeline_id: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::DuplicateSession(pipeline_id.to_string())
        }
        _ => StoreError::Database(err),
    }
}
