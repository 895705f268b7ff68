//! A small helper so a caller-supplied future's panic becomes a captured
//! value instead of unwinding into the executor. Used by `BatchExecutor`
//! (an operation's panic becomes an `ExecutionError`) and `WorkflowEngine`
//! (a step's panic becomes a failing `StepOutcome`) -- both treat a
//! caller-supplied closure's panic the same way they treat a returned
//! failure: captured, never propagated as a Rust panic.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

/// Run `fut` to completion, turning a panic into `Err(message)` rather than
/// unwinding into the caller. Sound here because the wrapped future is
/// always polled to completion or dropped as a whole -- nothing ever
/// observes it in a torn, post-panic state.
pub(crate) async fn catch_panic<F>(fut: F) -> Result<F::Output, String>
where
    F: Future + Send,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(&*payload))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
