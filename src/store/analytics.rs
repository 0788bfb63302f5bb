//! Session lookups and analytics
//!
//! Read-only queries over `pipeline_sessions`: lookups by guild and time
//! range, hour-of-day distribution, error/recovery rates and orphan
//! detection, plus the summary the session index caches.

use super::error::StoreResult;
use super::model::{format_ts, ts_from_row, Session};
use super::query::enum_column;
use super::MetricsStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::time::Duration;

pub(crate) const SESSION_COLUMNS: &str = "pipeline_id, guild_id, channel_id, user_id, stream_url, \
     started_at, ended_at, final_state, total_errors, total_recoveries";

pub(crate) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let ended_at: Option<String> = row.get(6)?;
    let final_state: Option<String> = row.get(7)?;
    Ok(Session {
        pipeline_id: row.get(0)?,
        guild_id: row.get(1)?,
        channel_id: row.get(2)?,
        user_id: row.get(3)?,
        stream_url: row.get(4)?,
        started_at: ts_from_row(row.get(5)?, 5)?,
        ended_at: ended_at.map(|raw| ts_from_row(raw, 6)).transpose()?,
        final_state: match final_state {
            Some(_) => Some(enum_column(row, 7)?),
            None => None,
        },
        total_errors: row.get(8)?,
        total_recoveries: row.get(9)?,
    })
}

/// Sessions started within one hour of the day (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourBucket {
    pub hour: u32,
    pub sessions: u64,
}

/// Error and recovery totals over a set of sessions
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionHealth {
    pub sessions: u64,
    pub total_errors: u64,
    pub total_recoveries: u64,
}

impl SessionHealth {
    /// Errors per session
    pub fn error_rate(&self) -> f64 {
        if self.sessions == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.sessions as f64
        }
    }

    /// Share of errors that were recovered from
    pub fn recovery_rate(&self) -> f64 {
        if self.total_errors == 0 {
            0.0
        } else {
            self.total_recoveries as f64 / self.total_errors as f64
        }
    }
}

/// Store-wide session summary
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAnalytics {
    pub total_sessions: u64,
    pub open_sessions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Mean duration of ended sessions
    pub avg_duration_secs: Option<f64>,
    pub health: SessionHealth,
    pub computed_at: DateTime<Utc>,
}

impl MetricsStore {
    fn query_sessions(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, session_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent sessions for a guild
    pub fn sessions_by_guild(&self, guild_id: &str, limit: usize) -> StoreResult<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM pipeline_sessions
                 WHERE guild_id = ?1 ORDER BY started_at DESC LIMIT ?2"
            ),
            params![guild_id, limit as i64],
        )
    }

    /// Sessions started in `[since, until)`, oldest first
    pub fn sessions_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM pipeline_sessions
                 WHERE started_at >= ?1 AND started_at < ?2 ORDER BY started_at"
            ),
            params![format_ts(&since), format_ts(&until)],
        )
    }

    /// Open sessions that started more than `threshold` ago
    pub fn orphaned_sessions(&self, threshold: Duration) -> StoreResult<Vec<Session>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM pipeline_sessions
                 WHERE ended_at IS NULL AND started_at < ?1 ORDER BY started_at"
            ),
            params![format_ts(&cutoff)],
        )
    }

    /// Session starts per UTC hour of day; hours with no sessions are omitted
    pub fn sessions_by_hour(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<HourBucket>> {
        let since = since.map(|s| format_ts(&s)).unwrap_or_default();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT CAST(strftime('%H', started_at) AS INTEGER) AS hour, COUNT(*)
             FROM pipeline_sessions WHERE started_at >= ?1
             GROUP BY hour ORDER BY hour",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(HourBucket {
                hour: row.get(0)?,
                sessions: row.get::<_, i64>(1)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Error/recovery totals, optionally limited to one guild
    pub fn session_health(&self, guild_id: Option<&str>) -> StoreResult<SessionHealth> {
        let conn = self.conn()?;
        let (sessions, errors, recoveries): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(total_errors), 0), COALESCE(SUM(total_recoveries), 0)
             FROM pipeline_sessions WHERE ?1 IS NULL OR guild_id = ?1",
            params![guild_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(SessionHealth {
            sessions: sessions as u64,
            total_errors: errors as u64,
            total_recoveries: recoveries as u64,
        })
    }

    /// Totals, outcome breakdown, mean duration and health in one pass
    pub fn session_analytics(&self) -> StoreResult<SessionAnalytics> {
        let conn = self.conn()?;
        let analytics = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(ended_at IS NULL), 0),
                COALESCE(SUM(final_state = 'completed'), 0),
                COALESCE(SUM(final_state = 'failed'), 0),
                COALESCE(SUM(final_state = 'cancelled'), 0),
                COALESCE(SUM(final_state = 'timeout'), 0),
                AVG(CASE WHEN ended_at IS NOT NULL
                    THEN (julianday(ended_at) - julianday(started_at)) * 86400.0 END),
                COALESCE(SUM(total_errors), 0),
                COALESCE(SUM(total_recoveries), 0)
            FROM pipeline_sessions
            "#,
            [],
            |row| {
                let total = row.get::<_, i64>(0)? as u64;
                Ok(SessionAnalytics {
                    total_sessions: total,
                    open_sessions: row.get::<_, i64>(1)? as u64,
                    completed: row.get::<_, i64>(2)? as u64,
                    failed: row.get::<_, i64>(3)? as u64,
                    cancelled: row.get::<_, i64>(4)? as u64,
                    timed_out: row.get::<_, i64>(5)? as u64,
                    avg_duration_secs: row.get(6)?,
                    health: SessionHealth {
                        sessions: total,
                        total_errors: row.get::<_, i64>(7)? as u64,
                        total_recoveries: row.get::<_, i64>(8)? as u64,
                    },
                    computed_at: Utc::now(),
                })
            },
        )?;
        Ok(analytics)
    }
}
