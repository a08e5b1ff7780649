//! Pacing and bounded fan-out for remote calls.
//!
//! [`BatchScheduler`] runs one page worth of items either strictly in order or
//! with a bounded number in flight. Either way every item gets its own result
//! slot, so one failure never cancels its siblings.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ErrorClass, Result};

/// Enforces a minimum interval between request starts.
///
/// Shared by all in-flight items of a batch; callers queue on an async mutex
/// so starts are released one at a time.
pub struct RateLimiter {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    /// Wait until the next request may start.
    pub async fn acquire(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Fan-out settings for one batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Items in flight; `<= 1` means strictly sequential.
    pub concurrency: usize,

    /// Spacing between item starts.
    pub inter_item_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            inter_item_delay: Duration::from_millis(100),
        }
    }
}

impl BatchOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }
}

/// Runs a batch of items through an async worker.
pub struct BatchScheduler {
    options: BatchOptions,
    limiter: RateLimiter,
}

impl BatchScheduler {
    pub fn new(options: BatchOptions) -> Self {
        let limiter = RateLimiter::new(options.inter_item_delay);
        Self { options, limiter }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Run `worker` over `items`, returning one result per item in input order.
    pub async fn run_batch<I, T, F, Fut>(&self, items: Vec<I>, worker: F) -> Vec<Result<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total = items.len();
        if self.options.concurrency <= 1 {
            debug!("Running {} items sequentially", total);
            let mut results = Vec::with_capacity(total);
            for (i, item) in items.into_iter().enumerate() {
                if i > 0 && !self.options.inter_item_delay.is_zero() {
                    tokio::time::sleep(self.options.inter_item_delay).await;
                }
                results.push(worker(item).await);
            }
            return results;
        }

        debug!(
            "Running {} items with up to {} in flight",
            total, self.options.concurrency
        );
        let worker = &worker;
        stream::iter(items)
            .map(|item| async move {
                self.limiter.acquire().await;
                worker(item).await
            })
            .buffered(self.options.concurrency)
            .collect()
            .await
    }
}

/// Retry `op` on transient errors with exponential backoff.
///
/// Any other error class is returned immediately. After `max_retries`
/// retries the last transient error is returned.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(e) if e.class() == ErrorClass::Transient && retries < max_retries => {
                retries += 1;
                let delay = base_delay.saturating_mul(1u32 << (retries - 1).min(16));
                warn!(
                    "{} failed with transient error, retry {}/{} in {:?}: {}",
                    what, retries, max_retries, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_sequential_batch_spaces_items() {
        let scheduler = BatchScheduler::new(
            BatchOptions::default().with_inter_item_delay(Duration::from_millis(100)),
        );
        let start = Instant::now();
        let results = scheduler
            .run_batch(vec![1, 2, 3], |n| async move { Ok(n * 10) })
            .await;

        let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![10, 20, 30]);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_item_does_not_abort_siblings() {
        let scheduler = BatchScheduler::new(
            BatchOptions::default()
                .with_concurrency(3)
                .with_inter_item_delay(Duration::ZERO),
        );
        let results = scheduler
            .run_batch(vec![1, 2, 3, 4], |n| async move {
                if n == 2 {
                    Err(SyncError::Validation("bad item".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(results.len(), 4);
        assert!(results[1].is_err());
        assert_eq!(results[3].as_ref().unwrap(), &4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let scheduler = BatchScheduler::new(
            BatchOptions::default()
                .with_concurrency(2)
                .with_inter_item_delay(Duration::ZERO),
        );
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = scheduler
            .run_batch((0..6).collect(), |n: usize| {
                let in_flight = &in_flight;
                let peak = &peak;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await;

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_starts() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient("lookup", 3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::TransientNetwork("503".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_skips_item_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient("create", 3, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Rejected { status: 400, message: "bad".into() }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_gives_up() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient("fetch", 2, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::TransientNetwork("timeout".into())) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::TransientNetwork(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
