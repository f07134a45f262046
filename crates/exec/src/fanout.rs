//! Bounded fan-out that waits for every task.

use std::future::Future;

use futures::future::join_all;

use crate::error::RunError;
use crate::limiter::ConcurrencyLimiter;

/// Run `task(index, item)` for every item, at most `limiter.permits()` at a
/// time, and return every result in submission order.
///
/// Tasks are polled in submission order, so with the FIFO limiter they start
/// in that order; completion order is unconstrained. Nothing is cancelled
/// when a task fails.
pub async fn settle_all<T, R, E, F, Fut>(
    limiter: &ConcurrencyLimiter,
    items: Vec<T>,
    task: F,
) -> Vec<Result<R, E>>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: From<RunError>,
{
    let futures = items.into_iter().enumerate().map(|(index, item)| {
        let fut = task(index, item);
        async move {
            let permit = limiter.acquire().await.map_err(E::from)?;
            let result = fut.await;
            permit.release();
            result
        }
    });
    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_permits() {
        let limiter = ConcurrencyLimiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let results = settle_all(&limiter, (0..12).collect(), |_, n: u64| {
            let running = running.clone();
            let max_seen = max_seen.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + n)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, RunError>(n)
            }
        })
        .await;

        assert_eq!(results.len(), 12);
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.peak(), 3);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_rest() {
        let limiter = ConcurrencyLimiter::new(2);
        let results = settle_all(&limiter, vec![1, 2, 3, 4], |_, n: i32| async move {
            if n % 2 == 0 {
                Err(RunError::LimiterClosed)
            } else {
                Ok(n)
            }
        })
        .await;

        let ok: Vec<i32> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(ok, vec![1, 3]);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 2);
    }

    #[tokio::test]
    async fn passes_submission_index() {
        let limiter = ConcurrencyLimiter::new(1);
        let results = settle_all(&limiter, vec!["a", "b", "c"], |i, s: &str| async move {
            Ok::<_, RunError>(format!("{i}:{s}"))
        })
        .await;
        let values: Vec<String> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec!["0:a", "1:b", "2:c"]);
    }
}
