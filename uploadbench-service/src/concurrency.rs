//! Worker slots for bounded concurrency.
//!
//! [`ConcurrencyLimiter`] caps the number of tasks running at once using a tokio semaphore. Each
//! acquired [`ConcurrencyPermit`] notifies waiters on drop, allowing
//! [`ConcurrencyLimiter::wait_all`] to resolve once all permits have been returned. The limiter
//! also records the highest number of permits ever held at the same time, which tests use to
//! verify the bound.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Interval for the periodic usage emitter.
const EMITTER_INTERVAL: Duration = Duration::from_secs(1);

/// Limits concurrent tasks and tracks the in-flight count.
///
/// Permits are acquired with [`acquire`](Self::acquire) and automatically returned when the
/// [`ConcurrencyPermit`] is dropped, including when the task holding it fails or panics.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    peak: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl ConcurrencyLimiter {
    /// Creates a new limiter with the given maximum number of permits.
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            peak: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(Notify::new()),
        }
    }

    /// Waits for a free permit.
    ///
    /// Waiters are served in the order they started waiting. Returns `None` once the limiter has
    /// been [closed](Self::close).
    pub async fn acquire(&self) -> Option<ConcurrencyPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        Some(self.wrap(permit))
    }

    /// Tries to acquire a permit without waiting.
    ///
    /// Returns `None` when all permits are held or the limiter is closed.
    #[cfg(test)]
    fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> ConcurrencyPermit {
        self.peak.fetch_max(self.used_permits(), Ordering::Relaxed);
        ConcurrencyPermit {
            permit: Some(permit),
            released: Arc::clone(&self.released),
        }
    }

    /// Stops handing out permits. Pending and future acquisitions return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Returns the maximum number of permits.
    pub fn max_permits(&self) -> usize {
        self.max
    }

    /// Returns the number of permits currently held.
    pub fn used_permits(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    /// Returns the highest number of permits that were held at the same time.
    pub fn peak_permits(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Waits until all permits have been returned.
    pub async fn wait_all(&self) {
        loop {
            let notified = self.released.notified();
            if self.used_permits() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Periodically calls `emit` with the current in-use count.
    ///
    /// This future runs forever and is intended to be spawned as a background task next to the
    /// tasks being limited.
    pub async fn run_emitter<F, Fut>(&self, mut emit: F)
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(EMITTER_INTERVAL);
        loop {
            ticker.tick().await;
            emit(self.used_permits()).await;
        }
    }
}

/// RAII guard for a concurrency permit.
///
/// Dropping this permit releases it back to the [`ConcurrencyLimiter`] and notifies any task
/// waiting in [`ConcurrencyLimiter::wait_all`].
#[derive(Debug)]
pub struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.released.notify_waiters();
    }
}
