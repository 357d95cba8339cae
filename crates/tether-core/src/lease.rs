//! Busy/free tracking for the shared runner.
//!
//! The runner never says "I am idle", so busyness is a lease: `acquire`
//! mints a token, `release` with the matching token frees the runner, and
//! an optional expiry timer frees it anyway once traffic goes silent.
//! Every keepalive pushes the expiry back.

use crate::utils::lock;
use crate::waiter::Waiters;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Proof of holding the lease.
///
/// Only the tracker that minted a token accepts it, and only while no newer
/// token has been minted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    tracker: u64,
    serial: u64,
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}.{}", self.tracker, self.serial)
    }
}

/// Decision returned by an [`ExpiryHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preemption {
    /// Let the tracker release the expired lease.
    Allow,
    /// Keep the lease and restart the timer.
    Prevent,
}

/// Callback consulted when a lease times out.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn on_expire(&self, token: &LeaseToken) -> Preemption;
}

struct LeaseState {
    current: Option<LeaseToken>,
    next_serial: u64,
    timeout: Option<Duration>,
    /// Bumped on every timer (re)arm so a late timer can tell it is stale.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    id: u64,
    state: Mutex<LeaseState>,
    free_waiters: Waiters,
    handler: Mutex<Option<Arc<dyn ExpiryHandler>>>,
    busy_tx: watch::Sender<bool>,
}

/// Tracks whether the runner is currently owned by someone.
#[derive(Clone)]
pub struct LeaseTracker {
    inner: Arc<Inner>,
}

impl LeaseTracker {
    /// Creates a free tracker with the given expiry budget.
    pub fn new(timeout: Option<Duration>, poll_interval: Duration) -> Self {
        let (busy_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(LeaseState {
                    current: None,
                    next_serial: 1,
                    timeout,
                    generation: 0,
                    timer: None,
                }),
                free_waiters: Waiters::new(poll_interval),
                handler: Mutex::new(None),
                busy_tx,
            }),
        }
    }

    /// Installs the callback consulted on expiry.
    pub fn set_expiry_handler(&self, handler: Arc<dyn ExpiryHandler>) {
        *lock(&self.inner.handler) = Some(handler);
    }

    /// Marks the runner busy and returns a fresh token.
    ///
    /// Any previously held token becomes stale.
    pub fn acquire(&self) -> LeaseToken {
        let token = {
            let mut state = lock(&self.inner.state);
            let token = LeaseToken {
                tracker: self.inner.id,
                serial: state.next_serial,
            };
            state.next_serial += 1;
            if let Some(previous) = state.current.replace(token.clone()) {
                debug!(previous = %previous, "Lease superseded by a newer acquire");
            }
            Inner::arm_timer(&self.inner, &mut state);
            token
        };
        self.inner.busy_tx.send_replace(true);
        debug!(token = %token, "Lease acquired");
        token
    }

    /// Frees the runner if `token` is the current lease.
    ///
    /// Stale or foreign tokens are ignored, which makes it safe to call from
    /// several racing completion paths.
    pub fn release(&self, token: &LeaseToken) -> bool {
        Inner::release(&self.inner, token)
    }

    /// Pushes back the expiry without changing ownership.
    pub fn keepalive(&self) {
        let mut state = lock(&self.inner.state);
        Inner::arm_timer(&self.inner, &mut state);
    }

    /// Changes the expiry budget. `None` disables expiry.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let mut state = lock(&self.inner.state);
        state.timeout = timeout;
        Inner::arm_timer(&self.inner, &mut state);
    }

    /// Returns the expiry budget.
    pub fn timeout(&self) -> Option<Duration> {
        lock(&self.inner.state).timeout
    }

    /// Returns true while a lease is held.
    pub fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    /// Returns the token currently holding the lease.
    pub fn current(&self) -> Option<LeaseToken> {
        lock(&self.inner.state).current.clone()
    }

    /// Watches busy/free flips.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.busy_tx.subscribe()
    }

    /// Waits until no lease is held.
    pub async fn wait_until_free(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner
            .free_waiters
            .wait_until(move || weak.upgrade().is_none_or(|inner| !inner.is_busy()))
            .await;
    }
}

impl Inner {
    fn is_busy(&self) -> bool {
        lock(&self.state).current.is_some()
    }

    fn release(this: &Arc<Self>, token: &LeaseToken) -> bool {
        {
            let mut state = lock(&this.state);
            if state.current.as_ref() != Some(token) {
                debug!(token = %token, "Ignoring release with stale lease token");
                return false;
            }
            state.current = None;
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        // Waiter predicates take the state lock, so wake with it dropped.
        this.busy_tx.send_replace(false);
        this.free_waiters.wake_all();
        debug!(token = %token, "Lease released");
        true
    }

    /// (Re)starts the expiry timer for the current lease, if any.
    fn arm_timer(this: &Arc<Self>, state: &mut LeaseState) {
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let (Some(token), Some(timeout)) = (state.current.clone(), state.timeout) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available; lease expiry disabled");
            return;
        };
        let generation = state.generation;
        let weak = Arc::downgrade(this);
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Inner::expire(&inner, generation, token).await;
            }
        }));
    }

    async fn expire(this: &Arc<Self>, generation: u64, token: LeaseToken) {
        {
            let mut state = lock(&this.state);
            if state.generation != generation || state.current.as_ref() != Some(&token) {
                return;
            }
            // Detach ourselves so a keepalive during the handler call does
            // not abort this task half way through.
            state.timer = None;
        }

        let handler = lock(&this.handler).clone();
        let decision = match handler {
            Some(handler) => handler.on_expire(&token).await,
            None => Preemption::Allow,
        };

        match decision {
            Preemption::Allow => {
                if Inner::release(this, &token) {
                    info!(token = %token, "Lease expired without activity; runner considered free");
                }
            }
            Preemption::Prevent => {
                debug!(token = %token, "Lease expiry vetoed; restarting timer");
                let mut state = lock(&this.state);
                if state.current.as_ref() == Some(&token) {
                    Inner::arm_timer(this, &mut state);
                }
            }
        }
    }
}
