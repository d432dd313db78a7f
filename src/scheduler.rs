//! Time abstraction for delays and reconnect timers.
//!
//! Production code waits on tokio timers; tests use [`ManualScheduler`] so the
//! broadcast pacing and reconnect backoff can be checked without wall-clock
//! time.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Suspend the caller for `delay`
    async fn after(&self, delay: Duration);
}

/// Real timers
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn after(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Virtual-time scheduler.
///
/// Every requested delay is recorded. In immediate mode `after` returns right
/// away; otherwise waiters stay parked until [`ManualScheduler::fire_all`].
#[derive(Debug, Default)]
pub struct ManualScheduler {
    immediate: bool,
    requested: Mutex<Vec<Duration>>,
    parked: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ManualScheduler {
    /// Waiters park until released
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiters return immediately; delays are only recorded
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::default()
        }
    }

    /// All delays requested so far, in order
    pub fn requested(&self) -> Vec<Duration> {
        lock(&self.requested).clone()
    }

    /// Number of waiters currently parked
    pub fn parked(&self) -> usize {
        lock(&self.parked).len()
    }

    /// Release every parked waiter, returning how many were released
    pub fn fire_all(&self) -> usize {
        let waiters: Vec<_> = lock(&self.parked).drain(..).collect();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(());
        }
        count
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn after(&self, delay: Duration) {
        lock(&self.requested).push(delay);
        if self.immediate {
            tokio::task::yield_now().await;
            return;
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.parked).push(tx);
        // A dropped scheduler releases its waiters
        let _ = rx.await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
