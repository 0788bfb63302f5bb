//! Configuration tests

use super::*;
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// Round-trip tests
// ─────────────────────────────────────────────────────────────────────────────

/// Verify that serialized config can be parsed back.
#[test]
fn test_config_roundtrip_default() {
    let config = Config::default();
    let toml_str = config.to_toml();

    let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
    assert!(
        parsed.is_ok(),
        "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
        toml_str,
        parsed.err()
    );
}

#[test]
fn test_config_roundtrip_preserves_custom_values() {
    let mut config = Config::default();
    config.batch.batch_size = 250;
    config.retention.metrics_retention_days = 7;
    config.backup.enabled = false;
    config.logging.file_rotation = LogRotation::Hourly;
    config.logging.format = LogFormat::Json;

    let reparsed = Config::from_toml_str(&config.to_toml()).expect("should parse");
    assert_eq!(reparsed.batch.batch_size, 250);
    assert_eq!(reparsed.retention.metrics_retention_days, 7);
    assert!(!reparsed.backup.enabled);
    assert_eq!(reparsed.logging.file_rotation, LogRotation::Hourly);
    assert_eq!(reparsed.logging.format, LogFormat::Json);
}

// ─────────────────────────────────────────────────────────────────────────────
// Partial files and defaults
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_partial_file_fills_defaults() {
    let config = Config::from_toml_str(
        r#"
        [batch]
        batch_size = 10
        "#,
    )
    .unwrap();

    assert_eq!(config.batch.batch_size, 10);
    assert_eq!(config.batch.flush_interval_ms, BatchConfig::default().flush_interval_ms);
    assert_eq!(config.store.synchronous, "NORMAL");
    assert_eq!(config.batch.intake_capacity(), 20);
}

#[test]
fn test_malformed_file_is_config_invalid() {
    let err = Config::from_toml_str("[batch\nbatch_size = ").unwrap_err();
    assert!(matches!(err, StoreError::ConfigInvalid(_)));
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_file(&dir.path().join("nope.toml")).unwrap();
    assert_eq!(config.batch.batch_size, BatchConfig::default().batch_size);
}

#[test]
fn test_load_from_explicit_path_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipestore.toml");
    std::fs::write(&path, "[sessions]\norphan_threshold_secs = 0\n").unwrap();

    let err = Config::load_from(Some(&path)).unwrap_err();
    assert!(matches!(err, StoreError::ConfigInvalid(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment overrides
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_env_overrides_file_values() {
    let mut config = Config::from_toml_str("[batch]\nbatch_size = 10\n").unwrap();
    let env: HashMap<&str, &str> = [
        ("PIPESTORE_BATCH_SIZE", "42"),
        ("PIPESTORE_BACKUP_ENABLED", "false"),
        ("PIPESTORE_DB_PATH", "/tmp/x.db"),
    ]
    .into_iter()
    .collect();

    config
        .apply_env(|k| env.get(k).map(|v| v.to_string()))
        .unwrap();

    assert_eq!(config.batch.batch_size, 42);
    assert!(!config.backup.enabled);
    assert_eq!(config.store.db_path, PathBuf::from("/tmp/x.db"));
}

#[test]
fn test_env_non_numeric_is_rejected() {
    let mut config = Config::default();
    let err = config
        .apply_env(|k| (k == "PIPESTORE_BATCH_SIZE").then(|| "lots".to_string()))
        .unwrap_err();
    assert!(matches!(err, StoreError::ConfigInvalid(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_default_config_is_valid() {
    Config::default().validate().unwrap();
}

#[test]
fn test_validation_rejects_bad_values() {
    let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
        ("zero batch", Box::new(|c| c.batch.batch_size = 0)),
        ("zero flush", Box::new(|c| c.batch.flush_interval_ms = 0)),
        ("zero workers", Box::new(|c| c.batch.workers = 0)),
        ("bad sync", Box::new(|c| c.store.synchronous = "SOMETIMES".into())),
        ("bad journal", Box::new(|c| c.store.journal_mode = "LOG".into())),
        ("zero pool", Box::new(|c| c.store.pool_size = 0)),
        ("zero retention", Box::new(|c| c.retention.events_retention_days = 0)),
        ("zero interval", Box::new(|c| c.retention.cleanup_interval_secs = 0)),
        ("zero keep", Box::new(|c| c.backup.keep = 0)),
        ("bad level", Box::new(|c| c.logging.level = "loud".into())),
        (
            "huge metrics retention",
            Box::new(|c| c.retention.metrics_retention_days = 200_000_000),
        ),
        (
            "huge events retention",
            Box::new(|c| c.retention.events_retention_days = MAX_RETENTION_DAYS + 1),
        ),
        (
            "huge orphan threshold",
            Box::new(|c| c.sessions.orphan_threshold_secs = u64::MAX),
        ),
    ];

    for (name, mutate) in cases {
        let mut config = Config::default();
        mutate(&mut config);
        assert!(
            matches!(config.validate(), Err(StoreError::ConfigInvalid(_))),
            "{name} should be rejected"
        );
    }
}

#[test]
fn test_upper_bounds_are_inclusive() {
    let mut config = Config::default();
    config.retention.metrics_retention_days = MAX_RETENTION_DAYS;
    config.retention.events_retention_days = MAX_RETENTION_DAYS;
    config.sessions.orphan_threshold_secs = MAX_ORPHAN_THRESHOLD_SECS;
    config.validate().unwrap();
}

#[test]
fn test_keep_zero_allowed_when_backups_disabled() {
    let mut config = Config::default();
    config.backup.enabled = false;
    config.backup.keep = 0;
    config.validate().unwrap();
}

#[test]
fn test_pragmas_reflect_settings() {
    let mut store = StoreConfig::default();
    store.synchronous = "full".into();
    store.cache_size_kb = 2048;
    let pragmas = store.pragmas();
    assert!(pragmas.contains("PRAGMA synchronous=FULL;"));
    assert!(pragmas.contains("PRAGMA cache_size=-2048;"));
    assert!(pragmas.contains("PRAGMA journal_mode=WAL;"));
}
