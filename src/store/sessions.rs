//! In-memory index of open sessions
//!
//! Mirrors every open session so hot-path lookups never touch SQLite. All
//! mutations write through the store first and only then update the map, so
//! the map never holds state the store rejected.
//!
//! A sweeper thread ends sessions that have been open longer than the orphan
//! threshold (default 2 h) with `final_state = timeout`, using the same update
//! path as everything else. Store-wide analytics are cached for a short TTL
//! and invalidated by any mutation. A generation counter keeps a computation
//! that raced a mutation from being cached.

use super::analytics::SessionAnalytics;
use super::error::{StoreError, StoreResult};
use super::model::{FinalState, Session, SessionCounter, SessionUpdate};
use super::signal::{CompletionSignal, StopToken};
use super::MetricsStore;
use crate::config::SessionConfig;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct CachedAnalytics {
    value: SessionAnalytics,
    cached_at: Instant,
}

struct Sweeper {
    stop: StopToken,
    done: Arc<CompletionSignal>,
    handle: JoinHandle<()>,
}

/// Open-session index backed by a [`MetricsStore`]
pub struct SessionIndex {
    store: Arc<MetricsStore>,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Session>>,
    analytics: Mutex<Option<CachedAnalytics>>,
    /// Bumped by every mutation
    generation: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionIndex {
    /// Load every open session and start the orphan sweeper
    pub fn start(store: Arc<MetricsStore>, config: SessionConfig) -> StoreResult<Arc<Self>> {
        let interval = config.sweep_interval();
        let index = Self::load(store, config)?;
        index.start_sweeper(interval)?;
        Ok(index)
    }

    /// Load open sessions without starting the sweeper
    pub fn load(store: Arc<MetricsStore>, config: SessionConfig) -> StoreResult<Arc<Self>> {
        let open = store.open_sessions()?;
        tracing::info!(open_sessions = open.len(), "Session index loaded");

        let sessions = open
            .into_iter()
            .map(|s| (s.pipeline_id.clone(), s))
            .collect();

        Ok(Arc::new(Self {
            store,
            config,
            sessions: RwLock::new(sessions),
            analytics: Mutex::new(None),
            generation: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Session>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, Option<CachedAnalytics>> {
        self.analytics.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations (write-through)
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_session(&self, session: Session) -> StoreResult<()> {
        self.store.create_session(&session)?;
        if session.is_open() {
            self.write().insert(session.pipeline_id.clone(), session);
        }
        self.invalidate_analytics();
        Ok(())
    }

    pub fn update_session(&self, pipeline_id: &str, update: &SessionUpdate) -> StoreResult<()> {
        if let Err(e) = self.store.update_session(pipeline_id, update) {
            self.forget_if_ended(pipeline_id, &e);
            return Err(e);
        }
        {
            let mut sessions = self.write();
            if update.ended_at.is_some() {
                sessions.remove(pipeline_id);
            } else if let Some(session) = sessions.get_mut(pipeline_id) {
                session.apply(update);
            }
        }
        self.invalidate_analytics();
        Ok(())
    }

    pub fn end_session(&self, pipeline_id: &str, final_state: FinalState) -> StoreResult<()> {
        self.update_session(pipeline_id, &SessionUpdate::end(final_state))
    }

    /// Bump the error counter of a session
    pub fn record_error(&self, pipeline_id: &str) -> StoreResult<i64> {
        self.increment(pipeline_id, SessionCounter::Errors)
    }

    /// Bump the recovery counter of a session
    pub fn record_recovery(&self, pipeline_id: &str) -> StoreResult<i64> {
        self.increment(pipeline_id, SessionCounter::Recoveries)
    }

    fn increment(&self, pipeline_id: &str, counter: SessionCounter) -> StoreResult<i64> {
        let value = match self.store.increment_session_counter(pipeline_id, counter) {
            Ok(value) => value,
            Err(e) => {
                self.forget_if_ended(pipeline_id, &e);
                return Err(e);
            }
        };
        if let Some(session) = self.write().get_mut(pipeline_id) {
            counter.raise(session, value);
        }
        self.invalidate_analytics();
        Ok(value)
    }

    /// Drop a map entry the store says is ended or gone
    fn forget_if_ended(&self, pipeline_id: &str, err: &StoreError) {
        if err.is_session_ended() || err.is_not_found() {
            self.write().remove(pipeline_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Open session by pipeline id (memory only)
    pub fn get(&self, pipeline_id: &str) -> Option<Session> {
        self.read().get(pipeline_id).cloned()
    }

    pub fn is_open(&self, pipeline_id: &str) -> bool {
        self.read().contains_key(pipeline_id)
    }

    /// Open sessions, oldest first
    pub fn open_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Store-wide analytics, served from cache while fresh
    pub fn analytics(&self) -> StoreResult<SessionAnalytics> {
        let ttl = self.config.analytics_ttl();
        if let Some(cached) = self.cache().as_ref() {
            if cached.cached_at.elapsed() < ttl {
                return Ok(cached.value.clone());
            }
        }

        // Computed outside the cache lock; only cached if no mutation
        // happened in between
        let generation = self.generation.load(Ordering::Acquire);
        let value = self.store.session_analytics()?;
        self.cache_if_current(generation, &value);
        Ok(value)
    }

    /// Cache `value` unless a mutation bumped the generation since it was read
    fn cache_if_current(&self, generation: u64, value: &SessionAnalytics) -> bool {
        let mut cache = self.cache();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        *cache = Some(CachedAnalytics {
            value: value.clone(),
            cached_at: Instant::now(),
        });
        true
    }

    pub fn invalidate_analytics(&self) {
        let mut cache = self.cache();
        self.generation.fetch_add(1, Ordering::AcqRel);
        *cache = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orphan sweep
    // ─────────────────────────────────────────────────────────────────────────

    /// End every session open longer than the orphan threshold.
    /// Returns the pipeline ids that were ended.
    pub fn sweep_orphans(&self) -> StoreResult<Vec<String>> {
        let threshold = chrono::Duration::from_std(self.config.orphan_threshold())
            .map_err(|_| StoreError::ConfigInvalid("orphan threshold out of range".into()))?;
        let cutoff = Utc::now()
            .checked_sub_signed(threshold)
            .ok_or_else(|| StoreError::ConfigInvalid("orphan threshold out of range".into()))?;

        let orphans: Vec<String> = self
            .read()
            .values()
            .filter(|s| s.started_at < cutoff)
            .map(|s| s.pipeline_id.clone())
            .collect();

        let mut ended = Vec::with_capacity(orphans.len());
        for pipeline_id in orphans {
            match self.end_session(&pipeline_id, FinalState::Timeout) {
                Ok(()) => ended.push(pipeline_id),
                // Ended elsewhere or deleted underneath us; already dropped
                // from the map
                Err(e) if e.is_not_found() || e.is_session_ended() => {}
                Err(e) => tracing::warn!(pipeline_id = %pipeline_id, "Failed to end orphaned session: {}", e),
            }
        }

        if !ended.is_empty() {
            tracing::info!(count = ended.len(), "Ended orphaned sessions");
        }
        Ok(ended)
    }

    pub(crate) fn start_sweeper(self: &Arc<Self>, interval: Duration) -> StoreResult<()> {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|s| !s.done.is_complete()) {
            return Ok(());
        }

        let stop = StopToken::new();
        let done = Arc::new(CompletionSignal::new());
        let index: Weak<Self> = Arc::downgrade(self);
        let thread_stop = stop.clone();
        let thread_done = done.clone();

        let handle = thread::Builder::new()
            .name("session-sweeper".into())
            .spawn(move || {
                while !thread_stop.sleep(interval) {
                    let Some(index) = index.upgrade() else { break };
                    if let Err(e) = index.sweep_orphans() {
                        tracing::warn!("Orphan sweep failed: {}", e);
                    }
                }
                thread_done.complete();
            })?;

        *slot = Some(Sweeper { stop, done, handle });
        Ok(())
    }

    /// Stop the sweeper. Idempotent.
    pub fn stop(&self, timeout: Duration) -> StoreResult<()> {
        let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(());
        };

        sweeper.stop.stop();
        if !sweeper.done.wait(timeout) {
            return Err(StoreError::Timeout(format!(
                "session sweeper did not stop within {timeout:?}"
            )));
        }
        let _ = sweeper.handle.join();
        tracing::debug!("Session index stopped");
        Ok(())
    }
}

impl Drop for SessionIndex {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            sweeper.stop.stop();
        }
    }
}
