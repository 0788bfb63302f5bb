//! Row types for metrics, events and sessions
//!
//! Timestamps are persisted as fixed-width RFC 3339 text in UTC with
//! millisecond precision (`2024-05-01T12:00:00.000Z`). The fixed width keeps
//! lexical and chronological order identical, which the retention predicates
//! and range filters rely on.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Format a timestamp the way every table stores it.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into a `DateTime<Utc>`.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert a stored-timestamp parse failure into a rusqlite row error so it
/// surfaces through `query_map` like any other conversion failure.
pub(crate) fn ts_from_row(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{raw}'").into(),
        )
    })
}

/// Generates `as_str` / `Display` / `FromStr` for the text-backed enums below.
macro_rules! text_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$(Self::$variant),+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", $what, other)),
                }
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of measurement a metric represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Timing,
}

text_enum!(MetricType, "metric type", {
    Counter => "counter",
    Gauge => "gauge",
    Histogram => "histogram",
    Timing => "timing",
});

/// A single telemetry sample from an audio pipeline. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub pipeline_id: String,
    pub name: String,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    /// New metric stamped with the current time
    pub fn new(
        pipeline_id: impl Into<String>,
        name: impl Into<String>,
        metric_type: MetricType,
        value: f64,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            name: name.into(),
            metric_type,
            value,
            tags: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// A discrete pipeline event (reconnect, stream error, skip...). Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub pipeline_id: String,
    pub event_type: String,
    #[serde(default)]
    pub event_data: HashMap<String, serde_json::Value>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        pipeline_id: impl Into<String>,
        event_type: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            event_type: event_type.into(),
            event_data: HashMap::new(),
            severity,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.event_data.insert(key.into(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// How a playback session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

text_enum!(FinalState, "final state", {
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    Timeout => "timeout",
});

/// One audio pipeline's lifetime. Mutable until `ended_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub pipeline_id: String,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub stream_url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub final_state: Option<FinalState>,
    pub total_errors: i64,
    pub total_recoveries: i64,
}

impl Session {
    /// New open session started now
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            guild_id: None,
            channel_id: None,
            user_id: None,
            stream_url: None,
            started_at: Utc::now(),
            ended_at: None,
            final_state: None,
            total_errors: 0,
            total_recoveries: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Apply the `Some` fields of a partial update in memory
    pub fn apply(&mut self, update: &SessionUpdate) {
        if let Some(v) = &update.guild_id {
            self.guild_id = Some(v.clone());
        }
        if let Some(v) = &update.channel_id {
            self.channel_id = Some(v.clone());
        }
        if let Some(v) = &update.user_id {
            self.user_id = Some(v.clone());
        }
        if let Some(v) = &update.stream_url {
            self.stream_url = Some(v.clone());
        }
        if let Some(v) = update.ended_at {
            self.ended_at = Some(v);
        }
        if let Some(v) = update.final_state {
            self.final_state = Some(v);
        }
        if let Some(v) = update.total_errors {
            self.total_errors = v;
        }
        if let Some(v) = update.total_recoveries {
            self.total_recoveries = v;
        }
    }
}

/// Partial session update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub stream_url: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub final_state: Option<FinalState>,
    pub total_errors: Option<i64>,
    pub total_recoveries: Option<i64>,
}

impl SessionUpdate {
    /// Update that closes the session now with the given final state
    pub fn end(final_state: FinalState) -> Self {
        Self {
            ended_at: Some(Utc::now()),
            final_state: Some(final_state),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-session counter bumped in place by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCounter {
    Errors,
    Recoveries,
}

impl SessionCounter {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Errors => "total_errors",
            Self::Recoveries => "total_recoveries",
        }
    }

    /// Set this counter on `session`, never moving it backwards
    pub(crate) fn raise(&self, session: &mut Session, value: i64) {
        let slot = match self {
            Self::Errors => &mut session.total_errors,
            Self::Recoveries => &mut session.total_recoveries,
        };
        *slot = (*slot).max(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(7);
        assert_eq!(format_ts(&a), "2024-05-01T12:00:00.000Z");
        assert_eq!(format_ts(&b), "2024-05-01T12:00:00.007Z");
        assert!(format_ts(&a) < format_ts(&b));
        assert_eq!(parse_ts(&format_ts(&b)), Some(b));
    }

    #[test]
    fn test_text_enums_parse_case_insensitively() {
        assert_eq!("Gauge".parse::<MetricType>(), Ok(MetricType::Gauge));
        assert_eq!("CRITICAL".parse::<Severity>(), Ok(Severity::Critical));
        assert!("sometimes".parse::<FinalState>().is_err());
        assert_eq!(MetricType::all().len(), 4);
    }

    #[test]
    fn test_session_apply_only_touches_some_fields() {
        let mut session = Session::new("p1");
        session.guild_id = Some("g1".to_string());

        session.apply(&SessionUpdate {
            total_errors: Some(3),
            ..Default::default()
        });

        assert_eq!(session.guild_id.as_deref(), Some("g1"));
        assert_eq!(session.total_errors, 3);
        assert!(session.is_open());

        session.apply(&SessionUpdate::end(FinalState::Completed));
        assert!(!session.is_open());
        assert_eq!(session.final_state, Some(FinalState::Completed));
    }

    #[test]
    fn test_empty_update() {
        assert!(SessionUpdate::default().is_empty());
        assert!(!SessionUpdate::end(FinalState::Failed).is_empty());
    }
}
