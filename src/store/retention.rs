//! Retention manager
//!
//! Deletes expired rows according to declarative policies. Policies run in
//! ascending priority order and are independent: each one counts and deletes
//! inside its own transaction, and a failure is recorded against that policy
//! alone.
//!
//! A scheduler thread runs one cleanup shortly after start and then one per
//! `cleanup_interval`. Manual runs share a lock with scheduled ones so two
//! cleanups never overlap.

use super::error::{StoreError, StoreResult};
use super::model::format_ts;
use super::signal::{CompletionSignal, StopToken};
use super::SqlitePool;
use crate::config::RetentionConfig;
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a concurrent run to finish
const RUN_LOCK_POLL: Duration = Duration::from_millis(10);

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

/// Rows in `table_name` whose `timestamp_column` is older than
/// `retention_period` (and which match every extra condition) are deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub name: String,
    pub table_name: String,
    pub timestamp_column: String,
    pub retention_period: Duration,
    /// Raw SQL boolean expressions, ANDed onto the cutoff predicate
    pub extra_conditions: Vec<String>,
    /// Lower runs first
    pub priority: u32,
    pub enabled: bool,
}

impl RetentionPolicy {
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        timestamp_column: impl Into<String>,
        retention_period: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            timestamp_column: timestamp_column.into(),
            retention_period,
            extra_conditions: Vec::new(),
            priority: 100,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.extra_conditions.push(condition.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Table and column names are spliced into SQL, so they must be plain
    /// identifiers. Conditions may not chain statements.
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::ConfigInvalid(
                "retention policy name must not be empty".into(),
            ));
        }
        for (what, ident) in [
            ("table", &self.table_name),
            ("timestamp column", &self.timestamp_column),
        ] {
            if !is_identifier(ident) {
                return Err(StoreError::ConfigInvalid(format!(
                    "retention policy '{}': invalid {} name '{}'",
                    self.name, what, ident
                )));
            }
        }
        if let Some(bad) = self.extra_conditions.iter().find(|c| c.contains(';')) {
            return Err(StoreError::ConfigInvalid(format!(
                "retention policy '{}': condition '{}' must be a single expression",
                self.name, bad
            )));
        }
        if self.retention_period.is_zero() {
            return Err(StoreError::ConfigInvalid(format!(
                "retention policy '{}': retention period must be > 0",
                self.name
            )));
        }
        Ok(())
    }

    /// WHERE clause shared by the count and the delete; `?1` is the cutoff
    fn predicate(&self) -> String {
        let mut clause = format!("{} < ?1", self.timestamp_column);
        for condition in &self.extra_conditions {
            clause.push_str(" AND (");
            clause.push_str(condition);
            clause.push(')');
        }
        clause
    }

    fn cutoff(&self, now: DateTime<Utc>) -> StoreResult<String> {
        let period = chrono::Duration::from_std(self.retention_period).map_err(|_| {
            StoreError::ConfigInvalid(format!(
                "retention policy '{}': period out of range",
                self.name
            ))
        })?;
        let cutoff = now.checked_sub_signed(period).ok_or_else(|| {
            StoreError::ConfigInvalid(format!(
                "retention policy '{}': period out of range",
                self.name
            ))
        })?;
        Ok(format_ts(&cutoff))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Built-in policies derived from the retention config
pub fn default_policies(config: &RetentionConfig) -> Vec<RetentionPolicy> {
    let metrics = config.metrics_retention();
    vec![
        RetentionPolicy::new("metrics", "pipeline_metrics", "timestamp", metrics).with_priority(10),
        RetentionPolicy::new(
            "events",
            "pipeline_events",
            "timestamp",
            config.events_retention(),
        )
        .with_priority(20),
        RetentionPolicy::new(
            "completed_sessions",
            "pipeline_sessions",
            "started_at",
            metrics * 2,
        )
        .with_condition("ended_at IS NOT NULL")
        .with_priority(30),
        RetentionPolicy::new(
            "low_priority_metrics",
            "pipeline_metrics",
            "timestamp",
            metrics / 2,
        )
        .with_condition("json_extract(tags, '$.level') IN ('debug', 'trace')")
        .with_priority(40),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one policy within a cleanup run
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyResult {
    pub policy: String,
    pub found: u64,
    pub cleaned: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

impl PolicyResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a whole cleanup run
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<PolicyResult>,
}

impl CleanupReport {
    pub fn total_cleaned(&self) -> u64 {
        self.results.iter().map(|r| r.cleaned).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PolicyResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn result(&self, policy: &str) -> Option<&PolicyResult> {
        self.results.iter().find(|r| r.policy == policy)
    }
}

/// Cumulative retention statistics
#[derive(Debug, Clone, Default)]
pub struct RetentionStats {
    pub total_cleaned: u64,
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_results: Vec<PolicyResult>,
    pub next_run: Option<DateTime<Utc>>,
    pub scheduler_running: bool,
}

#[derive(Debug, Default)]
struct RetentionState {
    total_cleaned: u64,
    runs: u64,
    last_run: Option<DateTime<Utc>>,
    last_results: Vec<PolicyResult>,
    next_run: Option<DateTime<Utc>>,
}

struct Scheduler {
    stop: StopToken,
    done: Arc<CompletionSignal>,
    handle: JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the policy set, the cleanup lock and the scheduler thread
pub struct RetentionManager {
    pool: SqlitePool,
    config: RetentionConfig,
    policies: RwLock<Vec<RetentionPolicy>>,
    /// Serialises manual and scheduled runs
    run_lock: Mutex<()>,
    state: Mutex<RetentionState>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl RetentionManager {
    /// Manager with the default policy set; the scheduler is not started
    pub fn new(pool: SqlitePool, config: RetentionConfig) -> Arc<Self> {
        let policies = default_policies(&config);
        Arc::new(Self {
            pool,
            config,
            policies: RwLock::new(policies),
            run_lock: Mutex::new(()),
            state: Mutex::new(RetentionState::default()),
            scheduler: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, RetentionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a policy, replacing any existing policy with the same name
    pub fn add_policy(&self, policy: RetentionPolicy) -> StoreResult<()> {
        policy.validate()?;
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        policies.retain(|p| p.name != policy.name);
        tracing::debug!(
            policy = %policy.name,
            table = %policy.table_name,
            priority = policy.priority,
            "Registered retention policy"
        );
        policies.push(policy);
        policies.sort_by_key(|p| p.priority);
        Ok(())
    }

    /// Returns true if a policy was removed
    pub fn remove_policy(&self, name: &str) -> bool {
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        let before = policies.len();
        policies.retain(|p| p.name != name);
        policies.len() != before
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> StoreResult<()> {
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        let policy = policies
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| StoreError::NotFound(format!("retention policy '{name}'")))?;
        policy.enabled = enabled;
        Ok(())
    }

    /// Policies in execution order
    pub fn policies(&self) -> Vec<RetentionPolicy> {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run every enabled policy, bounded by the configured run timeout
    pub fn run_cleanup(&self) -> StoreResult<CleanupReport> {
        self.run_cleanup_with_deadline(self.config.run_timeout())
    }

    /// Run every enabled policy. Policies not started before the deadline
    /// are reported as timed out; a policy already running is not interrupted.
    pub fn run_cleanup_with_deadline(&self, timeout: Duration) -> StoreResult<CleanupReport> {
        let deadline = Instant::now() + timeout;
        let _guard = self.acquire_run_lock(deadline)?;

        let started_at = Utc::now();
        let start = Instant::now();
        let policies: Vec<RetentionPolicy> = self
            .policies()
            .into_iter()
            .filter(|p| p.enabled)
            .collect();

        let mut results = Vec::with_capacity(policies.len());
        for policy in &policies {
            if Instant::now() >= deadline {
                tracing::warn!(policy = %policy.name, "Cleanup deadline reached, skipping policy");
                results.push(PolicyResult {
                    policy: policy.name.clone(),
                    found: 0,
                    cleaned: 0,
                    duration: Duration::ZERO,
                    error: Some(
                        StoreError::Timeout(format!("cleanup deadline of {timeout:?} exceeded"))
                            .to_string(),
                    ),
                });
                continue;
            }
            results.push(self.execute_policy(policy, started_at));
        }

        let report = CleanupReport {
            started_at,
            duration: start.elapsed(),
            results,
        };

        {
            let mut state = self.state();
            state.total_cleaned += report.total_cleaned();
            state.runs += 1;
            state.last_run = Some(started_at);
            state.last_results = report.results.clone();
        }

        let failed = report.failures().count();
        tracing::info!(
            cleaned = report.total_cleaned(),
            policies = report.results.len(),
            failed,
            elapsed_ms = report.duration.as_millis() as u64,
            "Retention cleanup complete"
        );
        Ok(report)
    }

    fn acquire_run_lock(&self, deadline: Instant) -> StoreResult<MutexGuard<'_, ()>> {
        loop {
            match self.run_lock.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::Poisoned(e)) => return Ok(e.into_inner()),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Timeout(
                            "another retention cleanup is still running".into(),
                        ));
                    }
                    thread::sleep(RUN_LOCK_POLL);
                }
            }
        }
    }

    fn execute_policy(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> PolicyResult {
        let start = Instant::now();
        match self.apply_policy(policy, now) {
            Ok((found, cleaned)) => {
                if cleaned > 0 {
                    tracing::debug!(policy = %policy.name, found, cleaned, "Applied retention policy");
                }
                PolicyResult {
                    policy: policy.name.clone(),
                    found,
                    cleaned,
                    duration: start.elapsed(),
                    error: None,
                }
            }
            Err(e) => {
                let err = StoreError::PolicyExecution {
                    policy: policy.name.clone(),
                    cause: e.to_string(),
                };
                tracing::warn!("{}", err);
                PolicyResult {
                    policy: policy.name.clone(),
                    found: 0,
                    cleaned: 0,
                    duration: start.elapsed(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Count then delete with the identical predicate, in one transaction
    fn apply_policy(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> StoreResult<(u64, u64)> {
        let cutoff = policy.cutoff(now)?;
        let predicate = policy.predicate();

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let found: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {}", policy.table_name, predicate),
            params![cutoff],
            |row| row.get(0),
        )?;
        let cleaned = if found > 0 {
            tx.execute(
                &format!("DELETE FROM {} WHERE {}", policy.table_name, predicate),
                params![cutoff],
            )?
        } else {
            0
        };
        tx.commit()?;

        Ok((found as u64, cleaned as u64))
    }

    pub fn stats(&self) -> RetentionStats {
        let running = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| !s.done.is_complete());
        let state = self.state();
        RetentionStats {
            total_cleaned: state.total_cleaned,
            runs: state.runs,
            last_run: state.last_run,
            last_results: state.last_results.clone(),
            next_run: state.next_run.filter(|_| running),
            scheduler_running: running,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the scheduler with the configured delay and interval
    pub fn start_scheduler(self: &Arc<Self>) -> StoreResult<()> {
        self.start_scheduler_with(self.config.initial_delay(), self.config.cleanup_interval())
    }

    /// Start the scheduler. A second call while running is a no-op.
    pub fn start_scheduler_with(
        self: &Arc<Self>,
        initial_delay: Duration,
        interval: Duration,
    ) -> StoreResult<()> {
        let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|s| !s.done.is_complete()) {
            return Ok(());
        }

        let stop = StopToken::new();
        let done = Arc::new(CompletionSignal::new());
        let manager = Arc::downgrade(self);
        let thread_stop = stop.clone();
        let thread_done = done.clone();

        let handle = thread::Builder::new()
            .name("retention-scheduler".into())
            .spawn(move || {
                Self::scheduler_loop(manager, &thread_stop, initial_delay, interval);
                thread_done.complete();
            })?;

        tracing::debug!(
            initial_delay_secs = initial_delay.as_secs(),
            interval_secs = interval.as_secs(),
            "Retention scheduler started"
        );
        *slot = Some(Scheduler { stop, done, handle });
        Ok(())
    }

    fn scheduler_loop(
        manager: Weak<Self>,
        stop: &StopToken,
        initial_delay: Duration,
        interval: Duration,
    ) {
        let mut wait = initial_delay;
        loop {
            match manager.upgrade() {
                Some(m) => {
                    m.state().next_run = chrono::Duration::from_std(wait)
                        .ok()
                        .map(|d| Utc::now() + d);
                }
                None => break,
            }

            if stop.sleep(wait) {
                break;
            }

            let Some(m) = manager.upgrade() else { break };
            if let Err(e) = m.run_cleanup() {
                tracing::warn!("Scheduled retention cleanup failed: {}", e);
            }
            wait = interval;
        }
        tracing::debug!("Retention scheduler stopped");
    }

    /// Stop the scheduler, waiting up to `timeout` for an in-progress run.
    /// Idempotent.
    pub fn stop(&self, timeout: Duration) -> StoreResult<()> {
        let Some(scheduler) = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(());
        };

        scheduler.stop.stop();
        if !scheduler.done.wait(timeout) {
            return Err(StoreError::Timeout(format!(
                "retention scheduler did not stop within {timeout:?}"
            )));
        }
        let _ = scheduler.handle.join();
        self.state().next_run = None;
        Ok(())
    }
}

impl Drop for RetentionManager {
    fn drop(&mut self) {
        // The scheduler only holds a Weak, so signalling is enough here
        if let Some(scheduler) = self
            .scheduler
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            scheduler.stop.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::batch::insert_metrics;
    use crate::store::model::{Metric, MetricType};
    use crate::store::testutil::migrated_pool;
    use tempfile::TempDir;

    fn days(n: i64) -> chrono::Duration {
        chrono::Duration::days(n)
    }

    fn count(pool: &SqlitePool, table: &str) -> i64 {
        pool.get()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    fn seed_metrics(pool: &SqlitePool, metrics: &[Metric]) {
        insert_metrics(&mut pool.get().unwrap(), metrics).unwrap();
    }

    #[test]
    fn test_cleanup_removes_only_expired_rows() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        seed_metrics(
            &pool,
            &[
                Metric::new("p", "latency", MetricType::Timing, 1.0).at(Utc::now() - days(40)),
                Metric::new("p", "latency", MetricType::Timing, 2.0),
            ],
        );

        let manager = RetentionManager::new(pool.clone(), RetentionConfig::default());
        let report = manager.run_cleanup().unwrap();

        assert_eq!(count(&pool, "pipeline_metrics"), 1);
        let metrics = report.result("metrics").unwrap();
        assert_eq!((metrics.found, metrics.cleaned), (1, 1));
        assert_eq!(report.total_cleaned(), 1);
        assert_eq!(manager.stats().runs, 1);
        assert_eq!(manager.stats().total_cleaned, 1);
    }

    #[test]
    fn test_failing_policy_does_not_block_siblings() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        seed_metrics(
            &pool,
            &[Metric::new("p", "latency", MetricType::Timing, 1.0).at(Utc::now() - days(40))],
        );

        let manager = RetentionManager::new(pool.clone(), RetentionConfig::default());
        manager
            .add_policy(
                RetentionPolicy::new("ghost", "no_such_table", "timestamp", Duration::from_secs(60))
                    .with_priority(5),
            )
            .unwrap();

        let report = manager.run_cleanup().unwrap();
        assert_eq!(report.results[0].policy, "ghost");
        assert!(report.result("ghost").unwrap().error.is_some());
        assert!(report.result("metrics").unwrap().is_ok());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(count(&pool, "pipeline_metrics"), 0);
    }

    #[test]
    fn test_out_of_range_period_fails_policy_without_panicking() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let manager = RetentionManager::new(pool, RetentionConfig::default());
        manager
            .add_policy(RetentionPolicy::new(
                "forever",
                "pipeline_metrics",
                "timestamp",
                Duration::from_secs(200_000_000 * 86_400),
            ))
            .unwrap();

        let report = manager.run_cleanup().unwrap();
        let error = report.result("forever").unwrap().error.clone().unwrap();
        assert!(error.contains("out of range"), "{error}");
        assert!(report.result("metrics").unwrap().is_ok());
    }

    #[test]
    fn test_low_priority_metrics_expire_early() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let twenty_days_ago = Utc::now() - days(20);
        seed_metrics(
            &pool,
            &[
                Metric::new("p", "decoder", MetricType::Counter, 1.0)
                    .with_tag("level", "debug")
                    .at(twenty_days_ago),
                Metric::new("p", "decoder", MetricType::Counter, 1.0)
                    .with_tag("level", "info")
                    .at(twenty_days_ago),
            ],
        );

        let manager = RetentionManager::new(pool.clone(), RetentionConfig::default());
        let report = manager.run_cleanup().unwrap();

        assert_eq!(report.result("low_priority_metrics").unwrap().cleaned, 1);
        assert_eq!(report.result("metrics").unwrap().cleaned, 0);
        assert_eq!(count(&pool, "pipeline_metrics"), 1);
    }

    #[test]
    fn test_completed_sessions_keep_open_ones() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let old = format_ts(&(Utc::now() - days(90)));
        {
            let conn = pool.get().unwrap();
            conn.execute(
                "INSERT INTO pipeline_sessions (pipeline_id, started_at, ended_at, final_state)
                 VALUES ('done', ?1, ?1, 'completed')",
                params![old],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO pipeline_sessions (pipeline_id, started_at) VALUES ('open', ?1)",
                params![old],
            )
            .unwrap();
        }

        let manager = RetentionManager::new(pool.clone(), RetentionConfig::default());
        let report = manager.run_cleanup().unwrap();

        assert_eq!(report.result("completed_sessions").unwrap().cleaned, 1);
        let remaining: String = pool
            .get()
            .unwrap()
            .query_row("SELECT pipeline_id FROM pipeline_sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, "open");
    }

    #[test]
    fn test_policies_sorted_and_validated() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let manager = RetentionManager::new(pool, RetentionConfig::default());

        let names: Vec<_> = manager.policies().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["metrics", "events", "completed_sessions", "low_priority_metrics"]
        );

        let bad = RetentionPolicy::new(
            "evil",
            "pipeline_metrics; DROP TABLE pipeline_events",
            "timestamp",
            Duration::from_secs(60),
        );
        assert!(matches!(
            manager.add_policy(bad),
            Err(StoreError::ConfigInvalid(_))
        ));

        let chained = RetentionPolicy::new("chain", "pipeline_metrics", "timestamp", Duration::from_secs(60))
            .with_condition("1=1; DELETE FROM pipeline_events");
        assert!(manager.add_policy(chained).is_err());

        // Same name replaces, priority re-sorts
        manager
            .add_policy(
                RetentionPolicy::new("events", "pipeline_events", "timestamp", Duration::from_secs(60))
                    .with_priority(1),
            )
            .unwrap();
        let policies = manager.policies();
        assert_eq!(policies.len(), 4);
        assert_eq!(policies[0].name, "events");

        assert!(manager.remove_policy("events"));
        assert!(!manager.remove_policy("events"));
        assert!(manager.set_enabled("nope", false).unwrap_err().is_not_found());
    }

    #[test]
    fn test_disabled_policy_skipped() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        seed_metrics(
            &pool,
            &[Metric::new("p", "latency", MetricType::Timing, 1.0).at(Utc::now() - days(40))],
        );

        let manager = RetentionManager::new(pool.clone(), RetentionConfig::default());
        manager.set_enabled("metrics", false).unwrap();
        let report = manager.run_cleanup().unwrap();

        assert!(report.result("metrics").is_none());
        assert_eq!(count(&pool, "pipeline_metrics"), 1);
    }

    #[test]
    fn test_expired_deadline_reports_timeouts() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        seed_metrics(
            &pool,
            &[Metric::new("p", "latency", MetricType::Timing, 1.0).at(Utc::now() - days(40))],
        );

        let manager = RetentionManager::new(pool.clone(), RetentionConfig::default());
        let report = manager.run_cleanup_with_deadline(Duration::ZERO).unwrap();

        assert_eq!(report.failures().count(), 4);
        assert_eq!(count(&pool, "pipeline_metrics"), 1);
    }

    #[test]
    fn test_scheduler_runs_and_stops_idempotently() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let manager = RetentionManager::new(pool, RetentionConfig::default());

        manager
            .start_scheduler_with(Duration::from_millis(10), Duration::from_secs(3600))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.stats().runs == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let stats = manager.stats();
        assert_eq!(stats.runs, 1);
        assert!(stats.scheduler_running);
        assert!(stats.next_run.is_some());

        manager.stop(Duration::from_secs(5)).unwrap();
        manager.stop(Duration::from_secs(5)).unwrap();
        assert!(!manager.stats().scheduler_running);
    }
}
