//! Concurrency substrate for developer-tooling services: a capacity-bounded
//! throttle, a parallel batch executor, a dependency-aware workflow engine,
//! and an orchestrator facade that wires the three together behind a
//! registry of named tool handlers.
//!
//! This crate depends on `orchestrator-types` for the plain data shapes that
//! cross its public boundary, plus the async runtime and concurrency crates
//! (`tokio`, `tokio-util`, `dashmap`, `futures-util`) needed to implement
//! them. It owns no persistence, no network transport, and no CLI surface --
//! those are external collaborators that embed this crate, not part of it.

pub mod batch;
mod panic_guard;
pub mod orchestrator;
pub mod throttle;
pub mod tool;
pub mod workflow;

pub use batch::{BatchExecutor, BatchError, ExecutionError, Operation};
pub use orchestrator::Orchestrator;
pub use throttle::Throttle;
pub use tool::{ToolHandler, ToolRegistry};
pub use workflow::{Step, Workflow, WorkflowContext, WorkflowEngine};
