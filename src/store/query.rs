//! Metric and event queries
//!
//! Filters and aggregates compile into one parametrized statement each;
//! nothing user-supplied is spliced into SQL text.

use super::error::StoreResult;
use super::model::{format_ts, ts_from_row, Event, Metric, MetricType, Severity};
use super::MetricsStore;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Row};
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// WHERE builder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Conditions {
    fn eq(&mut self, column: &str, value: Option<&str>) {
        if let Some(v) = value {
            self.clauses.push(format!("{column} = ?"));
            self.values.push(Value::Text(v.to_string()));
        }
    }

    fn any_of(&mut self, column: &str, values: impl IntoIterator<Item = String>) {
        let values: Vec<Value> = values.into_iter().map(Value::Text).collect();
        if values.is_empty() {
            return;
        }
        let marks = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{column} IN ({marks})"));
        self.values.extend(values);
    }

    fn range(&mut self, column: &str, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) {
        if let Some(since) = since {
            self.clauses.push(format!("{column} >= ?"));
            self.values.push(Value::Text(format_ts(&since)));
        }
        if let Some(until) = until {
            self.clauses.push(format!("{column} < ?"));
            self.values.push(Value::Text(format_ts(&until)));
        }
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn page(&mut self, limit: Option<usize>, offset: usize) -> String {
        // SQLite needs a LIMIT before an OFFSET; -1 means unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.values.push(Value::Integer(limit));
        self.values.push(Value::Integer(offset as i64));
        "LIMIT ? OFFSET ?".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filters
// ─────────────────────────────────────────────────────────────────────────────

/// Metric selection; empty sets mean "any"
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    pub pipeline_id: Option<String>,
    pub names: Vec<String>,
    pub types: Vec<MetricType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl MetricFilter {
    pub fn for_pipeline(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: Some(pipeline_id.into()),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn metric_type(mut self, metric_type: MetricType) -> Self {
        self.types.push(metric_type);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Event selection; empty sets mean "any"
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub pipeline_id: Option<String>,
    pub event_types: Vec<String>,
    pub severities: Vec<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventFilter {
    pub fn for_pipeline(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: Some(pipeline_id.into()),
            ..Default::default()
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severities.push(severity);
        self
    }

    /// Every severity at or above `min`
    pub fn at_least(mut self, min: Severity) -> Self {
        self.severities = Severity::all().iter().copied().filter(|s| *s >= min).collect();
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregates
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    fn sql(&self) -> &'static str {
        match self {
            Self::Sum => "SUM(value)",
            Self::Avg => "AVG(value)",
            Self::Min => "MIN(value)",
            Self::Max => "MAX(value)",
            Self::Count => "COUNT(*)",
        }
    }
}

impl std::str::FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" | "mean" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            other => Err(format!("unknown aggregation '{other}'")),
        }
    }
}

/// Aggregate over one metric name, optionally bucketed by time
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub metric_name: String,
    pub aggregation: Aggregation,
    pub pipeline_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Bucket width in seconds; `None` aggregates the whole range
    pub bucket_secs: Option<u64>,
}

impl AggregateQuery {
    pub fn new(metric_name: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            metric_name: metric_name.into(),
            aggregation,
            pipeline_id: None,
            since: None,
            until: None,
            bucket_secs: None,
        }
    }

    pub fn pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn bucketed(mut self, seconds: u64) -> Self {
        self.bucket_secs = Some(seconds.max(1));
        self
    }
}

/// One aggregate value; `bucket_start` is `None` for unbucketed queries
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePoint {
    pub bucket_start: Option<DateTime<Utc>>,
    pub value: f64,
    pub samples: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

const METRIC_COLUMNS: &str = "pipeline_id, metric_name, metric_type, value, tags, metadata, timestamp";
const EVENT_COLUMNS: &str = "pipeline_id, event_type, event_data, severity, timestamp";

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn enum_column<T: std::str::FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        pipeline_id: row.get(0)?,
        name: row.get(1)?,
        metric_type: enum_column(row, 2)?,
        value: row.get(3)?,
        tags: json_column::<HashMap<String, String>>(row, 4)?,
        metadata: json_column(row, 5)?,
        timestamp: ts_from_row(row.get(6)?, 6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        pipeline_id: row.get(0)?,
        event_type: row.get(1)?,
        event_data: json_column(row, 2)?,
        severity: enum_column(row, 3)?,
        timestamp: ts_from_row(row.get(4)?, 4)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

impl MetricsStore {
    /// Metrics matching `filter`, oldest first
    pub fn get_metrics(&self, filter: &MetricFilter) -> StoreResult<Vec<Metric>> {
        let mut cond = Conditions::default();
        cond.eq("pipeline_id", filter.pipeline_id.as_deref());
        cond.any_of("metric_name", filter.names.iter().cloned());
        cond.any_of(
            "metric_type",
            filter.types.iter().map(|t| t.as_str().to_string()),
        );
        cond.range("timestamp", filter.since, filter.until);

        let where_clause = cond.where_clause();
        let page = cond.page(filter.limit, filter.offset);
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM pipeline_metrics {where_clause} ORDER BY timestamp, id {page}"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(cond.values), metric_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Events matching `filter`, oldest first
    pub fn get_events(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        let mut cond = Conditions::default();
        cond.eq("pipeline_id", filter.pipeline_id.as_deref());
        cond.any_of("event_type", filter.event_types.iter().cloned());
        cond.any_of(
            "severity",
            filter.severities.iter().map(|s| s.as_str().to_string()),
        );
        cond.range("timestamp", filter.since, filter.until);

        let where_clause = cond.where_clause();
        let page = cond.page(filter.limit, filter.offset);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM pipeline_events {where_clause} ORDER BY timestamp, id {page}"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(cond.values), event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregate one metric name. Bucketed results are ordered by bucket;
    /// an empty range yields no points.
    pub fn aggregate(&self, query: &AggregateQuery) -> StoreResult<Vec<AggregatePoint>> {
        let mut cond = Conditions::default();
        cond.eq("metric_name", Some(query.metric_name.as_str()));
        cond.eq("pipeline_id", query.pipeline_id.as_deref());
        cond.range("timestamp", query.since, query.until);
        let where_clause = cond.where_clause();
        let agg = query.aggregation.sql();

        let conn = self.conn()?;
        match query.bucket_secs {
            None => {
                let sql = format!(
                    "SELECT COALESCE({agg}, 0), COUNT(*) FROM pipeline_metrics {where_clause}"
                );
                let (value, samples): (f64, i64) = conn.query_row(
                    &sql,
                    params_from_iter(cond.values),
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                if samples == 0 {
                    return Ok(Vec::new());
                }
                Ok(vec![AggregatePoint {
                    bucket_start: None,
                    value,
                    samples: samples as u64,
                }])
            }
            Some(width) => {
                let width = width.max(1) as i64;
                let bucket = format!("(CAST(strftime('%s', timestamp) AS INTEGER) / {width}) * {width}");
                let sql = format!(
                    "SELECT {bucket} AS bucket, {agg}, COUNT(*) FROM pipeline_metrics {where_clause}
                     GROUP BY bucket ORDER BY bucket"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(cond.values), |row| {
                    let start: i64 = row.get(0)?;
                    Ok(AggregatePoint {
                        bucket_start: DateTime::from_timestamp(start, 0),
                        value: row.get(1)?,
                        samples: row.get::<_, i64>(2)? as u64,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            }
        }
    }

    /// Distinct metric names seen for a pipeline
    pub fn metric_names(&self, pipeline_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT metric_name FROM pipeline_metrics WHERE pipeline_id = ?1 ORDER BY metric_name",
        )?;
        let rows = stmt.query_map([pipeline_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
