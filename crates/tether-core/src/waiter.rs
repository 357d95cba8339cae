//! Condition waiting woken by explicit signals.
//!
//! A [`Waiter`] blocks until its predicate holds. It re-checks on every wake
//! signal and on a fallback tick, so a missed wake only costs latency.
//! [`Waiters`] is a registry that hands out wakes in insertion order.

use crate::utils::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

/// Default fallback tick between predicate re-checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Blocks a caller until a predicate becomes true.
pub struct Waiter {
    predicate: Predicate,
    signal: Notify,
    done: AtomicBool,
    poll_interval: Duration,
}

impl Waiter {
    /// Creates a waiter over `predicate`.
    pub fn new<F>(predicate: F, poll_interval: Duration) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            signal: Notify::new(),
            done: AtomicBool::new(false),
            poll_interval,
        }
    }

    /// Evaluates the predicate.
    pub fn is_satisfied(&self) -> bool {
        (self.predicate)()
    }

    /// Returns true once the waiting caller has gone away.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Wakes the caller if its predicate now holds.
    ///
    /// Returns true if the wake released a blocked caller.
    pub fn wake(&self) -> bool {
        if self.is_done() || !self.is_satisfied() {
            return false;
        }
        self.signal.notify_one();
        true
    }

    /// Waits until the predicate holds.
    pub async fn wait(&self) {
        loop {
            if self.is_satisfied() {
                self.mark_done();
                return;
            }
            tokio::select! {
                () = self.signal.notified() => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Marks the waiter stale if the waiting future is dropped early.
struct Registration(Arc<Waiter>);

impl Drop for Registration {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

/// Registry of waiters sharing one wake source.
pub struct Waiters {
    entries: Mutex<Vec<Arc<Waiter>>>,
    poll_interval: Duration,
}

impl Default for Waiters {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Waiters {
    /// Creates an empty registry.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            poll_interval,
        }
    }

    /// Waits until `predicate` holds, registering for wakes meanwhile.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let waiter = Arc::new(Waiter::new(predicate, self.poll_interval));
        if waiter.is_satisfied() {
            return;
        }
        lock(&self.entries).push(Arc::clone(&waiter));
        let registration = Registration(waiter);
        registration.0.wait().await;
    }

    /// Releases the first registered waiter whose predicate holds.
    ///
    /// Scans in insertion order and stops at the first waiter that actually
    /// had to be woken. Stale waiters met along the way are dropped.
    pub fn wake(&self) -> bool {
        let mut entries = lock(&self.entries);
        let mut i = 0;
        while i < entries.len() {
            if entries[i].is_done() {
                entries.remove(i);
                continue;
            }
            if entries[i].wake() {
                entries.remove(i);
                return true;
            }
            i += 1;
        }
        false
    }

    /// Releases every registered waiter whose predicate holds.
    pub fn wake_all(&self) -> usize {
        let mut woken = 0;
        lock(&self.entries).retain(|waiter| {
            if waiter.is_done() {
                return false;
            }
            if waiter.wake() {
                woken += 1;
                return false;
            }
            true
        });
        woken
    }

    /// Number of registered waiters, stale ones included.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
