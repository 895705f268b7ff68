//! Parallel fan-out over a finite, ordered sequence of independent
//! operations with bounded concurrency, optional per-operation timeout, and
//! either error aggregation or fail-fast semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use orchestrator_types::batch::{BatchOptions, BatchProgress};

use crate::panic_guard::catch_panic;
pub use crate::throttle::{BoxFuture, Operation};

/// A single operation's recorded failure within a `BatchResult`.
#[derive(Debug)]
pub struct ExecutionError {
    pub operation_index: usize,
    pub cause: anyhow::Error,
    pub message: String,
}

impl ExecutionError {
    fn new(operation_index: usize, cause: anyhow::Error) -> Self {
        let message = cause.to_string();
        Self {
            operation_index,
            cause,
            message,
        }
    }
}

/// Errors `BatchExecutor::run` itself raises, as opposed to aggregating.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch run cancelled")]
    Cancelled,

    #[error("operation {} failed, aborting batch (fail-fast): {}", .0.operation_index, .0.message)]
    FailFast(ExecutionError),
}

/// The cancellation-typed cause carried by an `ExecutionError` whose
/// operation ran past its `per_op_timeout`, distinguishing a timeout from an
/// ordinary operation failure structurally rather than by message text.
#[derive(Debug, thiserror::Error)]
#[error("operation {operation_index} timed out after {timeout:?}")]
pub struct OperationTimedOut {
    pub operation_index: usize,
    pub timeout: Duration,
}

/// The aggregated outcome of one `BatchExecutor::run` call.
#[derive(Debug)]
pub struct BatchResult<T> {
    pub successes: Vec<T>,
    pub errors: Vec<ExecutionError>,
    pub submitted: usize,
    pub succeeded: usize,
    pub duration: Duration,
}

impl<T> BatchResult<T> {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty() && self.succeeded == self.submitted
    }

    pub fn success_rate(&self) -> f64 {
        if self.submitted == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.submitted as f64
        }
    }
}

/// A progress sink invoked synchronously, from the task that completed the
/// unit of work, after each operation resolves.
pub type ProgressSink = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Bounded-parallelism executor over a flat collection of independent
/// operations.
#[derive(Default)]
pub struct BatchExecutor;

struct ProgressState {
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run<T>(
        &self,
        ops: Vec<Operation<T>>,
        options: BatchOptions,
        progress: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<BatchResult<T>, BatchError>
    where
        T: Send + 'static,
    {
        let submitted = ops.len();
        tracing::debug!(submitted, continue_on_error = options.continue_on_error, "starting batch run");

        if submitted == 0 {
            tracing::debug!("empty batch, returning trivially");
            return Ok(BatchResult {
                successes: Vec::new(),
                errors: Vec::new(),
                submitted: 0,
                succeeded: 0,
                duration: Duration::ZERO,
            });
        }

        let start = Instant::now();
        let effective_parallelism = options
            .max_parallelism
            .unwrap_or_else(available_parallelism)
            .max(1)
            .min(submitted);

        let gate = Arc::new(Semaphore::new(effective_parallelism));
        let successes: Arc<Mutex<Vec<(usize, T)>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<ExecutionError>>> = Arc::new(Mutex::new(Vec::new()));
        let progress_state = Arc::new(ProgressState {
            total: submitted,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let mut join_set: JoinSet<()> = JoinSet::new();
        let stop = Arc::new(tokio_util::sync::CancellationToken::new());

        for (index, op) in ops.into_iter().enumerate() {
            if stop.is_cancelled() || cancel.is_cancelled() {
                break;
            }

            let permit = match gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let op_cancel = cancel.child_token();
            let per_op_timeout = options.per_op_timeout;
            let successes = successes.clone();
            let errors = errors.clone();
            let progress_state = progress_state.clone();
            let progress_sink = progress.clone();
            let stop = stop.clone();
            let continue_on_error = options.continue_on_error;

            join_set.spawn(async move {
                let _permit = permit;

                let run = op(op_cancel.clone());
                let outcome: anyhow::Result<T> = match per_op_timeout {
                    Some(timeout) => {
                        tokio::select! {
                            result = catch_panic(run) => flatten_panic(result),
                            _ = tokio::time::sleep(timeout) => {
                                op_cancel.cancel();
                                Err(anyhow::Error::from(OperationTimedOut {
                                    operation_index: index,
                                    timeout,
                                }))
                            }
                        }
                    }
                    None => flatten_panic(catch_panic(run).await),
                };

                match outcome {
                    Ok(value) => {
                        successes.lock().await.push((index, value));
                        progress_state.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(cause) => {
                        errors.lock().await.push(ExecutionError::new(index, cause));
                        progress_state.completed.fetch_add(1, Ordering::SeqCst);
                        progress_state.failed.fetch_add(1, Ordering::SeqCst);
                        if !continue_on_error {
                            tracing::warn!(operation_index = index, "fail-fast triggered, aborting remaining submissions");
                            stop.cancel();
                        }
                    }
                }

                if let Some(sink) = progress_sink {
                    sink(BatchProgress {
                        total: progress_state.total,
                        completed: progress_state.completed.load(Ordering::SeqCst),
                        failed: progress_state.failed.load(Ordering::SeqCst),
                    });
                }
            });
        }

        while let Some(result) = join_set.join_next().await {
            result.map_err(|_| BatchError::Cancelled)?;
        }

        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }

        if !options.continue_on_error {
            let mut errors = errors.lock().await;
            if !errors.is_empty() {
                let first = errors.remove(0);
                return Err(BatchError::FailFast(first));
            }
        }

        let mut successes = Arc::try_unwrap(successes)
            .expect("all spawned tasks have completed; no other Arc holders remain")
            .into_inner();
        successes.sort_by_key(|(index, _)| *index);
        let mut errors = Arc::try_unwrap(errors)
            .expect("all spawned tasks have completed; no other Arc holders remain")
            .into_inner();
        errors.sort_by_key(|e| e.operation_index);

        let succeeded = successes.len();
        let ordered_successes = successes.into_iter().map(|(_, value)| value).collect();
        let duration = start.elapsed();
        tracing::debug!(submitted, succeeded, failed = errors.len(), ?duration, "batch run finished");

        Ok(BatchResult {
            successes: ordered_successes,
            errors,
            submitted,
            succeeded,
            duration,
        })
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn flatten_panic<T>(result: Result<anyhow::Result<T>, String>) -> anyhow::Result<T> {
    match result {
        Ok(inner) => inner,
        Err(message) => Err(anyhow::anyhow!("operation panicked: {message}")),
    }
}
