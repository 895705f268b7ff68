//! Batch execution configuration and progress.

use std::time::Duration;

/// Options controlling a single `BatchExecutor::run` call.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Upper bound on concurrently running operations. `None` defers to an
    /// environment-derived default (the host's available parallelism).
    pub max_parallelism: Option<usize>,
    /// If `true`, a failing operation is recorded and the batch continues.
    /// If `false`, the first failure halts the batch and is propagated as
    /// the call's error.
    pub continue_on_error: bool,
    /// Optional hard bound applied to each operation individually.
    pub per_op_timeout: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            continue_on_error: true,
            per_op_timeout: None,
        }
    }
}

/// A progress snapshot delivered to a batch's progress sink after each
/// operation resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}
