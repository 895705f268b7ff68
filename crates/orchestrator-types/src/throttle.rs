//! Throttle configuration and metrics.

use std::time::Duration;

use thiserror::Error;

/// A snapshot of a `Throttle`'s live metrics.
///
/// `in_flight` is read at the instant the snapshot is taken; it never
/// exceeds `capacity`. `mean_duration` is the arithmetic mean over every
/// operation the throttle has ever run to completion (success or failure).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleMetrics {
    pub capacity: usize,
    pub in_flight: usize,
    pub executed_total: u64,
    pub failed_total: u64,
    pub mean_duration: Duration,
}

/// Errors raised directly by `Throttle` (capacity management and the
/// acquire path), as opposed to the operation failures it merely carries.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("throttle capacity must be greater than zero")]
    InvalidCapacity,

    #[error("cancelled while waiting for capacity")]
    Cancelled,
}
