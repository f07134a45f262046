//! FIFO counting semaphore capping concurrent external processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::RunError;

/// Caps how many tasks of one stage run at once.
///
/// Backed by [`tokio::sync::Semaphore`], which is fair: waiters are woken
/// in the order they called [`acquire`](Self::acquire). In-flight and peak
/// counters are kept for logging and tests.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    permits: usize,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyLimiter {
    /// A limiter with `permits` slots (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at the same time so far.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<LimiterPermit, RunError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RunError::LimiterClosed)?;
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        Ok(LimiterPermit { _permit: permit, counters: self.counters.clone() })
    }
}

/// A held slot of a [`ConcurrencyLimiter`].
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl LimiterPermit {
    /// Give the slot back to the oldest waiter.
    pub fn release(self) {}
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn zero_permits_become_one() {
        assert_eq!(ConcurrencyLimiter::new(0).permits(), 1);
    }

    #[tokio::test]
    async fn release_frees_slot() {
        let limiter = ConcurrencyLimiter::new(1);
        let permit = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 1);
        permit.release();
        assert_eq!(limiter.in_flight(), 0);
        let _again = limiter.acquire().await.unwrap();
        assert_eq!(limiter.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_fifo_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = limiter.acquire().await.unwrap();
        let mut handles = Vec::new();
        for i in 0..5 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                order.lock().await.push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            // Let each task reach the semaphore queue before spawning the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(limiter.peak(), 1);
    }
}
