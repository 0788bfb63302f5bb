//! Tests for the store façade

use super::testutil::test_config;
use super::*;
use crate::store::{MetricType, Severity};
use chrono::{Duration as ChronoDuration, TimeZone};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

fn open_direct(dir: &TempDir) -> MetricsStore {
    let mut config = test_config(dir);
    config.batch.enabled = false;
    config.retention.enabled = false;
    MetricsStore::open(&config).unwrap()
}

fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
}

#[test]
fn test_open_migrates_to_latest() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);
    let latest = migrations::builtin().last().map(|m| m.version).unwrap();
    assert_eq!(store.schema_version().unwrap(), latest);

    drop(store);
    // Reopening an up-to-date store is a no-op
    let store = open_direct(&dir);
    assert_eq!(store.schema_version().unwrap(), latest);
}

#[test]
fn test_open_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.batch.batch_size = 0;
    assert!(matches!(
        MetricsStore::open(&config),
        Err(StoreError::ConfigInvalid(_))
    ));
}

#[test]
fn test_direct_metric_writes_and_filters() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    store
        .store_metric(
            Metric::new("p1", "latency_ms", MetricType::Timing, 12.5)
                .with_tag("region", "eu")
                .with_metadata("codec", json!("opus"))
                .at(at(10, 0)),
        )
        .unwrap();
    let accepted = store
        .store_batch_metrics(vec![
            Metric::new("p1", "buffer_health", MetricType::Gauge, 0.9).at(at(10, 1)),
            Metric::new("p2", "latency_ms", MetricType::Timing, 40.0).at(at(10, 2)),
        ])
        .unwrap();
    assert_eq!(accepted, 2);
    assert_eq!(store.store_batch_metrics(Vec::new()).unwrap(), 0);

    let p1 = store.get_metrics(&MetricFilter::for_pipeline("p1")).unwrap();
    assert_eq!(p1.len(), 2);
    assert_eq!(p1[0].name, "latency_ms");
    assert_eq!(p1[0].tags.get("region").map(String::as_str), Some("eu"));
    assert_eq!(p1[0].metadata.get("codec"), Some(&json!("opus")));
    assert_eq!(p1[0].timestamp, at(10, 0));

    let timings = store
        .get_metrics(&MetricFilter::default().metric_type(MetricType::Timing))
        .unwrap();
    assert_eq!(timings.len(), 2);

    let window = store
        .get_metrics(&MetricFilter::default().between(at(10, 1), at(10, 2)))
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].name, "buffer_health");

    let paged = store
        .get_metrics(&MetricFilter::default().limit(1).offset(2))
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].pipeline_id, "p2");

    assert_eq!(
        store.metric_names("p1").unwrap(),
        vec!["buffer_health".to_string(), "latency_ms".to_string()]
    );
}

#[test]
fn test_batched_metrics_visible_after_flush() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.retention.enabled = false;
    let store = MetricsStore::open(&config).unwrap();

    for i in 0..7 {
        store
            .store_metric(Metric::new("p1", "frames", MetricType::Counter, i as f64))
            .unwrap();
    }
    store.flush(Duration::from_secs(5)).unwrap();

    let rows = store.get_metrics(&MetricFilter::for_pipeline("p1")).unwrap();
    assert_eq!(rows.len(), 7);

    let stats = store.stats().unwrap();
    assert_eq!(stats.metrics_rows, 7);
    assert_eq!(stats.batch.map(|b| b.processed), Some(7));
}

#[test]
fn test_events_with_severity_filter() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    let first = store
        .store_event(
            &Event::new("p1", "reconnect", Severity::Low)
                .with_data("attempt", json!(1))
                .at(at(9, 0)),
        )
        .unwrap();
    let second = store
        .store_event(&Event::new("p1", "stream_error", Severity::High).at(at(9, 5)))
        .unwrap();
    store
        .store_event(&Event::new("p2", "stream_error", Severity::Critical).at(at(9, 10)))
        .unwrap();
    assert!(second > first);

    let severe = store
        .get_events(&EventFilter::default().at_least(Severity::High))
        .unwrap();
    assert_eq!(severe.len(), 2);
    assert!(severe.iter().all(|e| e.severity >= Severity::High));

    let p1_errors = store
        .get_events(&EventFilter::for_pipeline("p1").event_type("stream_error"))
        .unwrap();
    assert_eq!(p1_errors.len(), 1);

    let low = store
        .get_events(&EventFilter::default().severity(Severity::Low))
        .unwrap();
    assert_eq!(low[0].event_data.get("attempt"), Some(&json!(1)));
}

#[test]
fn test_aggregate_plain_and_bucketed() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    store
        .store_batch_metrics(vec![
            Metric::new("p1", "latency_ms", MetricType::Timing, 10.0).at(at(10, 0)),
            Metric::new("p1", "latency_ms", MetricType::Timing, 20.0).at(at(10, 30)),
            Metric::new("p1", "latency_ms", MetricType::Timing, 60.0).at(at(11, 15)),
            Metric::new("p2", "latency_ms", MetricType::Timing, 1000.0).at(at(11, 20)),
        ])
        .unwrap();

    let avg = store
        .aggregate(&AggregateQuery::new("latency_ms", Aggregation::Avg).pipeline("p1"))
        .unwrap();
    assert_eq!(avg.len(), 1);
    assert_eq!(avg[0].value, 30.0);
    assert_eq!(avg[0].samples, 3);
    assert!(avg[0].bucket_start.is_none());

    let hourly = store
        .aggregate(
            &AggregateQuery::new("latency_ms", Aggregation::Max)
                .pipeline("p1")
                .bucketed(3600),
        )
        .unwrap();
    assert_eq!(hourly.len(), 2);
    assert_eq!(hourly[0].bucket_start, Some(at(10, 0)));
    assert_eq!(hourly[0].value, 20.0);
    assert_eq!(hourly[1].bucket_start, Some(at(11, 0)));
    assert_eq!(hourly[1].value, 60.0);

    let none = store
        .aggregate(&AggregateQuery::new("missing", Aggregation::Sum))
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_duplicate_session_leaves_first_untouched() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    let mut first = Session::new("p1");
    first.guild_id = Some("g1".into());
    store.create_session(&first).unwrap();

    let mut second = Session::new("p1");
    second.guild_id = Some("g2".into());
    let err = store.create_session(&second).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateSession(ref id) if id == "p1"));

    let stored = store.get_session("p1").unwrap();
    assert_eq!(stored.guild_id.as_deref(), Some("g1"));
}

#[test]
fn test_partial_update_and_end_session() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    let mut session = Session::new("p1");
    session.guild_id = Some("g1".into());
    session.stream_url = Some("https://example.invalid/a".into());
    store.create_session(&session).unwrap();

    store
        .update_session(
            "p1",
            &SessionUpdate {
                channel_id: Some("c9".into()),
                total_errors: Some(3),
                ..Default::default()
            },
        )
        .unwrap();

    let updated = store.get_session("p1").unwrap();
    assert_eq!(updated.channel_id.as_deref(), Some("c9"));
    assert_eq!(updated.total_errors, 3);
    // Untouched fields survive
    assert_eq!(updated.guild_id.as_deref(), Some("g1"));
    assert_eq!(updated.stream_url.as_deref(), Some("https://example.invalid/a"));
    assert!(updated.is_open());

    // Empty update is a no-op on an existing session
    store.update_session("p1", &SessionUpdate::default()).unwrap();

    store.end_session("p1", FinalState::Completed).unwrap();
    let ended = store.get_session("p1").unwrap();
    assert_eq!(ended.final_state, Some(FinalState::Completed));
    assert!(ended.ended_at.is_some());
    assert!(store.open_sessions().unwrap().is_empty());
}

#[test]
fn test_ended_session_rejects_further_changes() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    store.create_session(&Session::new("p1")).unwrap();
    store.end_session("p1", FinalState::Completed).unwrap();
    let ended = store.get_session("p1").unwrap();

    assert!(store
        .end_session("p1", FinalState::Timeout)
        .unwrap_err()
        .is_session_ended());
    let late = SessionUpdate {
        guild_id: Some("late".into()),
        ..Default::default()
    };
    assert!(store.update_session("p1", &late).unwrap_err().is_session_ended());
    assert!(store
        .update_session("p1", &SessionUpdate::default())
        .unwrap_err()
        .is_session_ended());
    assert!(store
        .increment_session_counter("p1", SessionCounter::Errors)
        .unwrap_err()
        .is_session_ended());

    assert_eq!(store.get_session("p1").unwrap(), ended);
}

#[test]
fn test_counter_increment_returns_new_value() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    let mut session = Session::new("p1");
    session.total_errors = 4;
    store.create_session(&session).unwrap();

    assert_eq!(store.increment_session_counter("p1", SessionCounter::Errors).unwrap(), 5);
    assert_eq!(
        store.increment_session_counter("p1", SessionCounter::Recoveries).unwrap(),
        1
    );
    assert!(store
        .increment_session_counter("nope", SessionCounter::Errors)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_update_missing_session_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    let update = SessionUpdate {
        total_recoveries: Some(1),
        ..Default::default()
    };
    assert!(store.update_session("nope", &update).unwrap_err().is_not_found());
    assert!(store
        .update_session("nope", &SessionUpdate::default())
        .unwrap_err()
        .is_not_found());
    assert!(store.get_session("nope").unwrap_err().is_not_found());
}

#[test]
fn test_session_queries_and_analytics() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    for (id, guild, hour, errors, recoveries) in [
        ("a", "g1", 8, 2, 2),
        ("b", "g1", 8, 0, 0),
        ("c", "g2", 20, 4, 1),
    ] {
        let mut s = Session::new(id);
        s.guild_id = Some(guild.into());
        s.started_at = at(hour, 0);
        s.total_errors = errors;
        s.total_recoveries = recoveries;
        store.create_session(&s).unwrap();
    }
    store
        .update_session(
            "a",
            &SessionUpdate {
                ended_at: Some(at(8, 0) + ChronoDuration::seconds(90)),
                final_state: Some(FinalState::Completed),
                ..Default::default()
            },
        )
        .unwrap();
    store
        .update_session(
            "c",
            &SessionUpdate {
                ended_at: Some(at(20, 0) + ChronoDuration::seconds(30)),
                final_state: Some(FinalState::Failed),
                ..Default::default()
            },
        )
        .unwrap();

    let g1 = store.sessions_by_guild("g1", 10).unwrap();
    assert_eq!(g1.len(), 2);

    let morning = store.sessions_between(at(7, 0), at(9, 0)).unwrap();
    assert_eq!(morning.len(), 2);

    let hours = store.sessions_by_hour(None).unwrap();
    assert_eq!(
        hours,
        vec![
            HourBucket { hour: 8, sessions: 2 },
            HourBucket { hour: 20, sessions: 1 },
        ]
    );

    // "b" is still open and started long before now
    let orphans = store.orphaned_sessions(Duration::from_secs(3600)).unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].pipeline_id, "b");

    let g1_health = store.session_health(Some("g1")).unwrap();
    assert_eq!(g1_health.sessions, 2);
    assert_eq!(g1_health.error_rate(), 1.0);
    assert_eq!(g1_health.recovery_rate(), 1.0);

    let analytics = store.session_analytics().unwrap();
    assert_eq!(analytics.total_sessions, 3);
    assert_eq!(analytics.open_sessions, 1);
    assert_eq!(analytics.completed, 1);
    assert_eq!(analytics.failed, 1);
    assert_eq!(analytics.health.total_errors, 6);
    let avg = analytics.avg_duration_secs.unwrap();
    assert!((avg - 60.0).abs() < 0.01, "avg duration {avg}");
}

#[test]
fn test_run_cleanup_through_facade() {
    let dir = TempDir::new().unwrap();
    let store = open_direct(&dir);

    let old = Utc::now() - ChronoDuration::days(60);
    store
        .store_metric(Metric::new("p1", "frames", MetricType::Counter, 1.0).at(old))
        .unwrap();
    store
        .store_metric(Metric::new("p1", "frames", MetricType::Counter, 2.0))
        .unwrap();

    let report = store.run_cleanup().unwrap();
    assert_eq!(report.result("metrics").map(|r| r.cleaned), Some(1));
    assert_eq!(store.stats().unwrap().metrics_rows, 1);
}

#[test]
fn test_close_is_idempotent_and_blocks_operations() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.retention.enabled = true;
    let store = MetricsStore::open(&config).unwrap();

    store
        .store_metric(Metric::new("p1", "frames", MetricType::Counter, 1.0))
        .unwrap();
    store.close().unwrap();
    store.close().unwrap();
    assert!(store.is_closed());

    assert!(matches!(
        store.store_metric(Metric::new("p1", "frames", MetricType::Counter, 2.0)),
        Err(StoreError::Closed(_))
    ));
    assert!(matches!(
        store.store_event(&Event::new("p1", "x", Severity::Low)),
        Err(StoreError::Closed(_))
    ));
    assert!(matches!(store.stats(), Err(StoreError::Closed(_))));
    assert!(matches!(store.run_cleanup(), Err(StoreError::Closed(_))));

    // The metric buffered before close was persisted by the shutdown drain
    drop(store);
    let store = open_direct(&dir);
    assert_eq!(store.stats().unwrap().metrics_rows, 1);
}
