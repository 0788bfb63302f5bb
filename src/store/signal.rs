//! Thread coordination primitives shared by the background components
//!
//! Every background component (batch collector and workers, retention
//! scheduler, orphan sweep) runs on its own named OS thread. Threads are told
//! to stop through a [`StopToken`] and report that they have finished through
//! a [`CompletionSignal`], so owners can wait with a deadline instead of an
//! unbounded `join()`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot "I'm done" flag a thread raises on exit
#[derive(Debug, Default)]
pub struct CompletionSignal {
    done: Mutex<bool>,
    cvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark complete and wake every waiter
    pub fn complete(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until complete or `timeout` elapses. Returns true if complete.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Block until complete or the deadline passes. Returns true if complete.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
        }
        true
    }
}

/// Cloneable stop request shared between an owner and its threads
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<CompletionSignal>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.complete();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_complete()
    }

    /// Sleep for `timeout` unless stopped first. Returns true if stopped.
    pub fn sleep(&self, timeout: Duration) -> bool {
        self.inner.wait(timeout)
    }
}

/// Wait on several completion signals against one shared deadline.
/// Returns the number of signals that did not complete in time.
pub fn wait_all(signals: &[Arc<CompletionSignal>], timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    signals.iter().filter(|s| !s.wait_until(deadline)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completion_wait_times_out() {
        let signal = CompletionSignal::new();
        let start = Instant::now();
        assert!(!signal.wait(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_completion_from_other_thread() {
        let signal = Arc::new(CompletionSignal::new());
        let remote = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete();
        });
        assert!(signal.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_token_interrupts_sleep() {
        let token = StopToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        token.stop();
        assert!(handle.join().unwrap());
        assert!(token.is_stopped());
        // Stopping twice is harmless
        token.stop();
    }

    #[test]
    fn test_wait_all_counts_stragglers() {
        let done = Arc::new(CompletionSignal::new());
        done.complete();
        let pending = Arc::new(CompletionSignal::new());
        assert_eq!(wait_all(&[done, pending], Duration::from_millis(10)), 1);
    }
}
