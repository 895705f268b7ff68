//! A capacity-bounded concurrency gate with live metrics and resizing.
//!
//! `Throttle` wraps a `tokio::sync::Semaphore` behind a lock so that
//! `set_capacity` can swap the semaphore wholesale rather than trying to
//! grow or shrink its permit count in place. Permits already handed out
//! against the old semaphore stay valid and release against it normally;
//! only future acquisitions observe the new capacity.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use orchestrator_types::throttle::{ThrottleError, ThrottleMetrics};

/// A boxed, cancel-aware unit of asynchronous work.
///
/// `T` is the operation's success type; failure is carried as an opaque
/// `anyhow::Error` -- the core never inspects why an operation failed, only
/// whether.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A unit of work submitted to the `Throttle` or `BatchExecutor`: given a
/// cancellation token, produces a future yielding a typed success or an
/// opaque failure.
pub type Operation<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, T> + Send>;

/// A capacity-bounded gate tracking in-flight count, executed/failed
/// totals, and a running mean duration.
pub struct Throttle {
    semaphore: RwLock<Arc<Semaphore>>,
    capacity: AtomicUsize,
    in_flight: AtomicUsize,
    executed_total: AtomicU64,
    failed_total: AtomicU64,
    duration_sum_nanos: AtomicU64,
}

impl Throttle {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: RwLock::new(Arc::new(Semaphore::new(capacity))),
            capacity: AtomicUsize::new(capacity),
            in_flight: AtomicUsize::new(0),
            executed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            duration_sum_nanos: AtomicU64::new(0),
        }
    }

    /// Replace the gate's capacity. Existing permit holders are unaffected;
    /// only future acquisitions observe the new limit.
    pub fn set_capacity(&self, n: i64) -> Result<(), ThrottleError> {
        if n <= 0 {
            tracing::warn!(requested = n, "rejected non-positive throttle capacity");
            return Err(ThrottleError::InvalidCapacity);
        }
        let n = n as usize;
        let new_semaphore = Arc::new(Semaphore::new(n));
        *self.semaphore.write().unwrap() = new_semaphore;
        let previous = self.capacity.swap(n, Ordering::SeqCst);
        tracing::debug!(previous, new = n, "throttle capacity resized");
        Ok(())
    }

    /// Wait for a permit (racing `cancel`), run `op`, release the permit on
    /// any exit path, and faithfully propagate the operation's outcome.
    pub async fn acquire_and_run<T>(
        &self,
        cancel: CancellationToken,
        op: Operation<T>,
    ) -> anyhow::Result<T> {
        let semaphore = self.semaphore.read().unwrap().clone();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ThrottleError::Cancelled.into());
            }
            acquired = semaphore.acquire_owned() => {
                acquired.expect("semaphore is never closed while the Throttle is alive")
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let result = op(cancel).await;
        let elapsed = start.elapsed();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        self.executed_total.fetch_add(1, Ordering::SeqCst);
        self.duration_sum_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::SeqCst);
        if let Err(err) = &result {
            self.failed_total.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, error = %err, "throttled operation failed");
        } else {
            tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "throttled operation succeeded");
        }
        result
    }

    /// Run each operation through `acquire_and_run`, preserving input order.
    /// Every operation is submitted concurrently (bounded by the Throttle's
    /// own permits); the caller observes a given operation's failure only
    /// after every previously-submitted operation has resolved.
    pub async fn acquire_and_run_batch<T>(
        &self,
        cancel: CancellationToken,
        ops: Vec<Operation<T>>,
    ) -> anyhow::Result<Vec<T>>
    where
        T: Send + 'static,
    {
        let futures = ops.into_iter().map(|op| {
            let child = cancel.child_token();
            self.acquire_and_run(child, op)
        });

        // `join_all` polls every future concurrently and only resolves once
        // all of them have resolved (success or failure) -- unlike
        // `try_join_all`, it never drops a still-running sibling early on the
        // first error, matching the "already-running operations are not
        // cancelled" contract. `collect` then surfaces the first failure in
        // original submission order.
        futures_util::future::join_all(futures)
            .await
            .into_iter()
            .collect()
    }

    pub fn metrics(&self) -> ThrottleMetrics {
        let executed = self.executed_total.load(Ordering::SeqCst);
        let mean_duration = if executed == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.duration_sum_nanos.load(Ordering::SeqCst) / executed)
        };
        ThrottleMetrics {
            capacity: self.capacity.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            executed_total: executed,
            failed_total: self.failed_total.load(Ordering::SeqCst),
            mean_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_ok(value: u32) -> Operation<u32> {
        Box::new(move |_cancel| Box::pin(async move { Ok(value) }))
    }

    fn op_err(msg: &'static str) -> Operation<u32> {
        Box::new(move |_cancel| Box::pin(async move { Err(anyhow::anyhow!(msg)) }))
    }

    #[tokio::test]
    async fn acquire_and_run_records_success_metrics() {
        let throttle = Throttle::new(2);
        let cancel = CancellationToken::new();
        let result = throttle.acquire_and_run(cancel, op_ok(7)).await.unwrap();
        assert_eq!(result, 7);

        let metrics = throttle.metrics();
        assert_eq!(metrics.capacity, 2);
        assert_eq!(metrics.in_flight, 0);
        assert_eq!(metrics.executed_total, 1);
        assert_eq!(metrics.failed_total, 0);
    }

    #[tokio::test]
    async fn acquire_and_run_records_failure_metrics() {
        let throttle = Throttle::new(1);
        let cancel = CancellationToken::new();
        let result = throttle.acquire_and_run(cancel, op_err("boom")).await;
        assert!(result.is_err());

        let metrics = throttle.metrics();
        assert_eq!(metrics.executed_total, 1);
        assert_eq!(metrics.failed_total, 1);
    }

    #[tokio::test]
    async fn cancelled_while_waiting_never_acquires() {
        let throttle = Arc::new(Throttle::new(1));
        let cancel = CancellationToken::new();

        // Hold the only permit with a long-running op.
        let holder = {
            let throttle = throttle.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let op: Operation<()> = Box::new(|_| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                });
                throttle.acquire_and_run(cancel, op).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = throttle.acquire_and_run(cancel, op_ok(1)).await;
        assert!(result.is_err());

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn set_capacity_rejects_non_positive() {
        let throttle = Throttle::new(1);
        assert!(matches!(
            throttle.set_capacity(0),
            Err(ThrottleError::InvalidCapacity)
        ));
        assert!(matches!(
            throttle.set_capacity(-3),
            Err(ThrottleError::InvalidCapacity)
        ));
    }

    #[tokio::test]
    async fn set_capacity_is_observed_by_future_acquisitions() {
        let throttle = Throttle::new(1);
        throttle.set_capacity(4).unwrap();
        assert_eq!(throttle.metrics().capacity, 4);

        let cancel = CancellationToken::new();
        throttle.acquire_and_run(cancel, op_ok(1)).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_and_run_batch_preserves_order() {
        let throttle = Throttle::new(2);
        let cancel = CancellationToken::new();
        let ops: Vec<Operation<u32>> = vec![op_ok(1), op_ok(2), op_ok(3)];
        let result = throttle.acquire_and_run_batch(cancel, ops).await.unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn acquire_and_run_batch_runs_operations_concurrently() {
        let throttle = Throttle::new(4);
        let cancel = CancellationToken::new();
        let ops: Vec<Operation<u32>> = (0..4)
            .map(|i| -> Operation<u32> {
                Box::new(move |_cancel| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(i)
                    })
                })
            })
            .collect();

        let start = Instant::now();
        let result = throttle.acquire_and_run_batch(cancel, ops).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result, vec![0, 1, 2, 3]);
        // Sequential execution would take >= 200ms; concurrent execution
        // bounded by the 4-permit throttle takes roughly one sleep's worth.
        assert!(elapsed < Duration::from_millis(150), "elapsed = {elapsed:?}");
    }

    #[tokio::test]
    async fn acquire_and_run_batch_surfaces_first_failure_in_submission_order() {
        let throttle = Throttle::new(4);
        let cancel = CancellationToken::new();
        let ops: Vec<Operation<u32>> = vec![op_ok(1), op_err("second failed"), op_err("third failed")];
        let result = throttle.acquire_and_run_batch(cancel, ops).await;
        assert_eq!(result.unwrap_err().to_string(), "second failed");
    }
}
