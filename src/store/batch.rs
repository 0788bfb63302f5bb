//! Batched metric writer
//!
//! Absorbs high-frequency metric writes without blocking the producer and
//! persists them in bulk transactions.
//!
//! # Architecture
//!
//! ```text
//! add_metric() ──try_send──→ intake (2 × batch_size)
//!                              │
//!                              └──→ Collector thread
//!                                     │  accumulator (Mutex<Vec<Metric>>)
//!                                     │  full batch → immediate hand-off
//!                                     │  timer tick → partial hand-off
//!                                     └──send──→ processing queue (10)
//!                                                  │
//!                                                  ├──→ Worker 1 ─┐
//!                                                  └──→ Worker N ─┤ one transaction per batch
//!                                                                 │
//!                                               failure ──try_send──→ retry queue (5)
//!                                                                         │
//!                                                                         └──→ Retry worker
//!                                                                              (backoff × attempt)
//! ```
//!
//! A full intake returns [`StoreError::BufferFull`] immediately. A batch that
//! exhausts its retries, or finds the retry queue full, is dropped and counted
//! in `errors` / `dropped_metrics`; nothing is lost silently.

use super::error::{StoreError, StoreResult};
use super::model::{format_ts, Metric};
use super::signal::{wait_all, CompletionSignal, StopToken};
use super::SqlitePool;
use crate::config::BatchConfig;
use rusqlite::{params, Connection};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Depth of the queue between the collector and the workers
const PROCESSING_QUEUE_DEPTH: usize = 10;

/// Depth of the queue feeding the retry worker
const RETRY_QUEUE_DEPTH: usize = 5;

/// How often `flush()` re-checks the in-flight count
const FLUSH_POLL: Duration = Duration::from_millis(5);

const INSERT_METRIC_SQL: &str = r#"
INSERT INTO pipeline_metrics (pipeline_id, metric_name, metric_type, value, tags, metadata, timestamp)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#;

/// Insert metrics inside one transaction. Shared with the direct-write path.
pub(crate) fn insert_metrics(conn: &mut Connection, metrics: &[Metric]) -> StoreResult<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_METRIC_SQL)?;
        for metric in metrics {
            stmt.execute(params![
                metric.pipeline_id,
                metric.name,
                metric.metric_type.as_str(),
                metric.value,
                serde_json::to_string(&metric.tags)?,
                serde_json::to_string(&metric.metadata)?,
                format_ts(&metric.timestamp),
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Counters for the batch writer itself
#[derive(Debug, Default)]
struct BatchCounters {
    processed: AtomicU64,
    failed_writes: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    dropped_metrics: AtomicU64,
    batches_flushed: AtomicU64,
    write_latency_us: AtomicU64,
    intake_depth: AtomicUsize,
    processing_depth: AtomicUsize,
    retry_depth: AtomicUsize,
    /// Metrics accepted but not yet persisted or dropped
    in_flight: AtomicUsize,
}

/// Point-in-time view of the batch writer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Metrics committed to the store
    pub processed: u64,
    /// Batch transactions that failed (including failed retry attempts)
    pub failed_writes: u64,
    /// Retry attempts made
    pub retries: u64,
    /// Batches dropped after exhausting retries or finding the retry queue full
    pub errors: u64,
    /// Metrics lost with dropped batches
    pub dropped_metrics: u64,
    /// Batches committed
    pub batches_flushed: u64,
    /// Mean commit time per batch (microseconds)
    pub avg_write_latency_us: u64,
    /// Metrics sitting in the accumulator
    pub buffered: usize,
    /// Metrics accepted but not yet picked up by the collector
    pub intake_depth: usize,
    /// Batches waiting for a worker
    pub processing_depth: usize,
    /// Failed batches waiting to be retried
    pub retry_depth: usize,
    /// Metrics handed off but not yet committed or dropped
    pub in_flight: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

enum Intake {
    Metric(Box<Metric>),
    /// Nudges the collector to look at `flush_requested`
    Wake,
}

type Batch = Vec<Metric>;

#[derive(Default)]
struct Shared {
    counters: BatchCounters,
    accumulator: Mutex<Vec<Metric>>,
    flush_requested: AtomicBool,
}

impl Shared {
    fn accumulator(&self) -> MutexGuard<'_, Vec<Metric>> {
        self.accumulator.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> BatchStats {
        let c = &self.counters;
        let batches = c.batches_flushed.load(Ordering::Relaxed);
        BatchStats {
            processed: c.processed.load(Ordering::Relaxed),
            failed_writes: c.failed_writes.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            dropped_metrics: c.dropped_metrics.load(Ordering::Relaxed),
            batches_flushed: batches,
            avg_write_latency_us: c
                .write_latency_us
                .load(Ordering::Relaxed)
                .checked_div(batches)
                .unwrap_or(0),
            buffered: self.accumulator().len(),
            intake_depth: c.intake_depth.load(Ordering::Relaxed),
            processing_depth: c.processing_depth.load(Ordering::Relaxed),
            retry_depth: c.retry_depth.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Acquire),
        }
    }

    /// Commit one batch, updating counters on success
    fn persist(&self, pool: &SqlitePool, batch: &[Metric]) -> StoreResult<()> {
        let start = Instant::now();
        let mut conn = pool.get()?;
        insert_metrics(&mut conn, batch).map_err(|e| StoreError::TransientWrite(e.to_string()))?;

        let latency = start.elapsed().as_micros() as u64;
        let c = &self.counters;
        c.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        c.batches_flushed.fetch_add(1, Ordering::Relaxed);
        c.write_latency_us.fetch_add(latency, Ordering::Relaxed);
        c.in_flight.fetch_sub(batch.len(), Ordering::AcqRel);

        tracing::trace!("Flushed {} metrics in {}µs", batch.len(), latency);
        Ok(())
    }

    fn drop_batch(&self, batch: Batch, reason: &str) {
        let c = &self.counters;
        c.errors.fetch_add(1, Ordering::Relaxed);
        c.dropped_metrics
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        c.in_flight.fetch_sub(batch.len(), Ordering::AcqRel);
        tracing::error!(
            metrics = batch.len(),
            total_dropped = c.dropped_metrics.load(Ordering::Relaxed),
            "Dropped metric batch: {}",
            reason
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer
// ─────────────────────────────────────────────────────────────────────────────

/// Batched metric writer
///
/// Owns a collector thread, `workers` persistence threads and one retry
/// thread, all plain OS threads so SQLite never blocks an async runtime.
pub struct BatchWriter {
    /// `None` once shut down; dropping the sender is what ends the collector
    intake: RwLock<Option<SyncSender<Intake>>>,
    shared: Arc<Shared>,
    stop: StopToken,
    completions: Vec<Arc<CompletionSignal>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    config: BatchConfig,
}

impl BatchWriter {
    /// Start the collector, workers and retry worker
    pub fn start(pool: SqlitePool, config: BatchConfig) -> StoreResult<Self> {
        let (intake_tx, intake_rx) = mpsc::sync_channel::<Intake>(config.intake_capacity());
        let (batch_tx, batch_rx) = mpsc::sync_channel::<Batch>(PROCESSING_QUEUE_DEPTH);
        let (retry_tx, retry_rx) = mpsc::sync_channel::<Batch>(RETRY_QUEUE_DEPTH);
        let batch_rx = Arc::new(Mutex::new(batch_rx));

        let shared = Arc::new(Shared::default());
        let stop = StopToken::new();
        let mut completions = Vec::with_capacity(config.workers + 2);
        let mut handles = Vec::with_capacity(config.workers + 2);

        // Collector
        {
            let shared = shared.clone();
            let config = config.clone();
            let done = Arc::new(CompletionSignal::new());
            let signal = done.clone();
            handles.push(
                thread::Builder::new()
                    .name("metrics-collector".into())
                    .spawn(move || {
                        Self::collector_loop(intake_rx, batch_tx, &shared, &config);
                        signal.complete();
                    })?,
            );
            completions.push(done);
        }

        // Persistence workers
        for id in 0..config.workers {
            let rx = batch_rx.clone();
            let retry_tx = retry_tx.clone();
            let pool = pool.clone();
            let shared = shared.clone();
            let done = Arc::new(CompletionSignal::new());
            let signal = done.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("metrics-worker-{id}"))
                    .spawn(move || {
                        Self::worker_loop(id, &rx, retry_tx, &pool, &shared);
                        signal.complete();
                    })?,
            );
            completions.push(done);
        }
        // Workers hold the only retry senders now
        drop(retry_tx);

        // Retry worker
        {
            let shared = shared.clone();
            let config = config.clone();
            let stop = stop.clone();
            let done = Arc::new(CompletionSignal::new());
            let signal = done.clone();
            handles.push(
                thread::Builder::new()
                    .name("metrics-retry".into())
                    .spawn(move || {
                        Self::retry_loop(retry_rx, &pool, &shared, &config, &stop);
                        signal.complete();
                    })?,
            );
            completions.push(done);
        }

        tracing::debug!(
            batch_size = config.batch_size,
            workers = config.workers,
            flush_interval_ms = config.flush_interval_ms,
            "Batch writer started"
        );

        Ok(Self {
            intake: RwLock::new(Some(intake_tx)),
            shared,
            stop,
            completions,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Queue a metric. Never blocks; a full intake returns `BufferFull`.
    pub fn add_metric(&self, metric: Metric) -> StoreResult<()> {
        let intake = self.intake.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = intake.as_ref() else {
            return Err(StoreError::Closed("batch writer"));
        };

        // Count first so the collector's decrement can never underflow
        let c = &self.shared.counters;
        c.intake_depth.fetch_add(1, Ordering::Relaxed);
        c.in_flight.fetch_add(1, Ordering::AcqRel);

        match tx.try_send(Intake::Metric(Box::new(metric))) {
            Ok(()) => Ok(()),
            Err(e) => {
                c.intake_depth.fetch_sub(1, Ordering::Relaxed);
                c.in_flight.fetch_sub(1, Ordering::AcqRel);
                match e {
                    TrySendError::Full(_) => Err(StoreError::BufferFull {
                        capacity: self.config.intake_capacity(),
                    }),
                    TrySendError::Disconnected(_) => {
                        tracing::error!("Metrics collector thread disconnected");
                        Err(StoreError::Closed("batch writer"))
                    }
                }
            }
        }
    }

    /// Queue several metrics, stopping at the first rejection.
    /// Returns how many were accepted.
    pub fn add_metrics(&self, metrics: Vec<Metric>) -> StoreResult<usize> {
        let total = metrics.len();
        for (accepted, metric) in metrics.into_iter().enumerate() {
            if let Err(e) = self.add_metric(metric) {
                tracing::warn!("Batch intake rejected metric {} of {}: {}", accepted + 1, total, e);
                return Err(e);
            }
        }
        Ok(total)
    }

    /// Hand off the partial accumulator and wait until every accepted metric
    /// is either committed or dropped.
    pub fn flush(&self, timeout: Duration) -> StoreResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.shared.counters.in_flight.load(Ordering::Acquire);
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Timeout(format!(
                    "flush: {pending} metrics still in flight after {timeout:?}"
                )));
            }
            self.request_flush();
            thread::sleep(FLUSH_POLL);
        }
    }

    fn request_flush(&self) {
        if self.shared.flush_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let intake = self.intake.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = intake.as_ref() {
            // A full intake means the collector is awake anyway
            let _ = tx.try_send(Intake::Wake);
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.shared.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting metrics, flush everything queued and wait for the
    /// threads to finish. Idempotent; later calls return `Ok(())`.
    pub fn shutdown(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the only intake sender lets the collector drain and exit
        let sender = self
            .intake
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(sender);
        // Remaining retries skip their backoff
        self.stop.stop();

        let timeout = self.config.shutdown_timeout();
        let stragglers = wait_all(&self.completions, timeout);
        if stragglers > 0 {
            tracing::warn!(
                "{} batch writer thread(s) did not complete within {:?}",
                stragglers,
                timeout
            );
            return Err(StoreError::Timeout(format!(
                "batch writer shutdown: {stragglers} thread(s) still running"
            )));
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }

        let stats = self.stats();
        tracing::debug!(
            processed = stats.processed,
            errors = stats.errors,
            dropped = stats.dropped_metrics,
            "Batch writer shutdown complete"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Threads
    // ─────────────────────────────────────────────────────────────────────────

    fn collector_loop(
        rx: Receiver<Intake>,
        batch_tx: SyncSender<Batch>,
        shared: &Shared,
        config: &BatchConfig,
    ) {
        let interval = config.flush_interval();
        let mut next_tick = Instant::now() + interval;

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(Intake::Metric(metric)) => {
                    shared.counters.intake_depth.fetch_sub(1, Ordering::Relaxed);
                    let full = {
                        let mut acc = shared.accumulator();
                        acc.push(*metric);
                        (acc.len() >= config.batch_size).then(|| std::mem::take(&mut *acc))
                    };
                    if let Some(batch) = full {
                        Self::hand_off(&batch_tx, shared, batch);
                    }
                }
                Ok(Intake::Wake) => {}
                Err(RecvTimeoutError::Timeout) => {
                    next_tick = Instant::now() + interval;
                    Self::hand_off_partial(&batch_tx, shared);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Intake closed and drained: final flush, then let workers finish
                    Self::hand_off_partial(&batch_tx, shared);
                    tracing::debug!("Metrics collector shutting down");
                    break;
                }
            }

            if shared.flush_requested.swap(false, Ordering::AcqRel) {
                Self::hand_off_partial(&batch_tx, shared);
            }
        }
    }

    fn hand_off_partial(batch_tx: &SyncSender<Batch>, shared: &Shared) {
        let batch = std::mem::take(&mut *shared.accumulator());
        if !batch.is_empty() {
            Self::hand_off(batch_tx, shared, batch);
        }
    }

    /// Blocking send: a saturated processing queue backs up into the intake
    fn hand_off(batch_tx: &SyncSender<Batch>, shared: &Shared, batch: Batch) {
        shared
            .counters
            .processing_depth
            .fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::SendError(batch)) = batch_tx.send(batch) {
            shared
                .counters
                .processing_depth
                .fetch_sub(1, Ordering::Relaxed);
            shared.drop_batch(batch, "no persistence workers running");
        }
    }

    fn worker_loop(
        id: usize,
        rx: &Mutex<Receiver<Batch>>,
        retry_tx: SyncSender<Batch>,
        pool: &SqlitePool,
        shared: &Shared,
    ) {
        loop {
            let next = rx.lock().unwrap_or_else(|e| e.into_inner()).recv();
            let Ok(batch) = next else {
                tracing::trace!(worker = id, "Metrics worker exiting");
                break;
            };
            shared
                .counters
                .processing_depth
                .fetch_sub(1, Ordering::Relaxed);

            if let Err(e) = shared.persist(pool, &batch) {
                shared.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    worker = id,
                    metrics = batch.len(),
                    "Batch write failed, queueing for retry: {}",
                    e
                );
                shared.counters.retry_depth.fetch_add(1, Ordering::Relaxed);
                match retry_tx.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(batch)) | Err(TrySendError::Disconnected(batch)) => {
                        shared.counters.retry_depth.fetch_sub(1, Ordering::Relaxed);
                        shared.drop_batch(batch, "retry queue full");
                    }
                }
            }
        }
    }

    fn retry_loop(
        rx: Receiver<Batch>,
        pool: &SqlitePool,
        shared: &Shared,
        config: &BatchConfig,
        stop: &StopToken,
    ) {
        while let Ok(batch) = rx.recv() {
            shared.counters.retry_depth.fetch_sub(1, Ordering::Relaxed);

            let mut committed = false;
            for attempt in 1..=config.max_retries {
                stop.sleep(config.retry_backoff() * attempt);
                shared.counters.retries.fetch_add(1, Ordering::Relaxed);

                match shared.persist(pool, &batch) {
                    Ok(()) => {
                        tracing::debug!(attempt, metrics = batch.len(), "Batch retry succeeded");
                        committed = true;
                        break;
                    }
                    Err(e) => {
                        shared.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            attempt,
                            max_retries = config.max_retries,
                            "Batch retry failed: {}",
                            e
                        );
                    }
                }
            }

            if !committed {
                shared.drop_batch(batch, "retries exhausted");
            }
        }
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Batch writer shutdown on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::MetricType;
    use crate::store::testutil::{migrated_pool, store_config};
    use tempfile::TempDir;

    fn batch_config(batch_size: usize, flush_interval_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            flush_interval_ms,
            workers: 2,
            max_retries: 2,
            retry_backoff_ms: 10,
            shutdown_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn metric(i: usize) -> Metric {
        Metric::new("pipe-1", "buffer_health", MetricType::Gauge, i as f64)
    }

    fn row_count(pool: &SqlitePool) -> i64 {
        pool.get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM pipeline_metrics", [], |r| r.get(0))
            .unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_full_batches_flush_without_timer() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let writer = BatchWriter::start(pool.clone(), batch_config(10, 3_600_000)).unwrap();

        for i in 0..35 {
            // Keep under intake capacity (20) by letting the collector catch up
            while writer.add_metric(metric(i)).is_err() {
                thread::sleep(Duration::from_millis(1));
            }
        }

        assert!(wait_for(
            || writer.stats().batches_flushed >= 3,
            Duration::from_secs(5)
        ));
        assert!(wait_for(|| writer.stats().buffered == 5, Duration::from_secs(5)));
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_exact_batches_leave_remainder_buffered() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let writer = BatchWriter::start(pool.clone(), batch_config(10, 3_600_000)).unwrap();

        for i in 0..25 {
            while writer.add_metric(metric(i)).is_err() {
                thread::sleep(Duration::from_millis(1));
            }
        }

        assert!(wait_for(
            || writer.stats().processed == 20,
            Duration::from_secs(5)
        ));
        assert!(wait_for(|| writer.stats().buffered == 5, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));

        let stats = writer.stats();
        assert_eq!(stats.batches_flushed, 2);
        assert_eq!(stats.buffered, 5);
        assert_eq!(row_count(&pool), 20);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_partial_batch_flushed_by_timer() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let writer = BatchWriter::start(pool.clone(), batch_config(100, 100)).unwrap();

        let start = Instant::now();
        for i in 0..3 {
            writer.add_metric(metric(i)).unwrap();
        }

        assert!(wait_for(|| row_count(&pool) == 3, Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(2));
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_flush_persists_partial_batch() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let writer = BatchWriter::start(pool.clone(), batch_config(100, 3_600_000)).unwrap();

        for i in 0..7 {
            writer.add_metric(metric(i)).unwrap();
        }
        writer.flush(Duration::from_secs(5)).unwrap();

        assert_eq!(row_count(&pool), 7);
        assert_eq!(writer.stats().in_flight, 0);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_full_intake_returns_buffer_full_without_blocking() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let mut config = batch_config(2, 3_600_000);
        config.workers = 1;
        let writer = BatchWriter::start(pool.clone(), config).unwrap();

        // Hold the write lock so the worker stalls and every queue backs up
        let blocker = rusqlite::Connection::open(dir.path().join("metrics.db")).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let mut saw_full = false;
        for i in 0..1_000 {
            let start = Instant::now();
            let result = writer.add_metric(metric(i));
            assert!(start.elapsed() < Duration::from_millis(200));
            if let Err(e) = result {
                assert!(e.is_buffer_full(), "unexpected error: {e}");
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);

        blocker.execute_batch("ROLLBACK").unwrap();
        drop(blocker);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_persists_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir);
        let writer = BatchWriter::start(pool.clone(), batch_config(10, 3_600_000)).unwrap();

        for i in 0..7 {
            writer.add_metric(metric(i)).unwrap();
        }

        writer.shutdown().unwrap();
        writer.shutdown().unwrap();

        assert_eq!(row_count(&pool), 7);
        assert!(writer.is_closed());
        assert!(matches!(
            writer.add_metric(metric(99)),
            Err(StoreError::Closed(_))
        ));
    }

    #[test]
    fn test_failed_batch_dropped_after_retries() {
        let dir = TempDir::new().unwrap();
        // No schema: every insert fails
        let pool = crate::store::build_pool(&store_config(&dir)).unwrap();
        let writer = BatchWriter::start(pool, batch_config(10, 3_600_000)).unwrap();

        for i in 0..3 {
            writer.add_metric(metric(i)).unwrap();
        }
        writer.flush(Duration::from_secs(5)).unwrap();

        let stats = writer.stats();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.dropped_metrics, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed_writes, 3);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_retry_recovers_transient_failure() {
        let dir = TempDir::new().unwrap();
        let pool = crate::store::build_pool(&store_config(&dir)).unwrap();
        let mut config = batch_config(10, 3_600_000);
        config.max_retries = 3;
        config.retry_backoff_ms = 200;
        let writer = BatchWriter::start(pool.clone(), config).unwrap();

        writer.add_metric(metric(1)).unwrap();
        writer.request_flush();
        assert!(wait_for(
            || writer.stats().failed_writes >= 1,
            Duration::from_secs(5)
        ));

        // Table appears while the batch waits in the retry queue
        pool.get()
            .unwrap()
            .execute_batch(crate::store::migrations::CORE_TABLES_SQL)
            .unwrap();

        writer.flush(Duration::from_secs(5)).unwrap();
        let stats = writer.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(row_count(&pool), 1);
        writer.shutdown().unwrap();
    }
}
