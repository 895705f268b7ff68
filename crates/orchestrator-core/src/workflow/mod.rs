//! Dependency-ordered execution of named steps against a shared context.
//!
//! - `context` -- the concurrency-safe `WorkflowContext` map threaded
//!   through a run.
//! - `engine` -- `Step`, `Workflow`, and the wave-based `WorkflowEngine`
//!   that schedules them.

pub mod context;
pub mod engine;

pub use context::WorkflowContext;
pub use engine::{Step, StepFn, Workflow, WorkflowEngine, WorkflowProgressSink};
