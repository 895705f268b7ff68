//! Workflow execution results and progress.
//!
//! The step and workflow definitions themselves (`Step`, `Workflow`,
//! `WorkflowContext`) live in `orchestrator-core`, since a step's `run`
//! closure is an async, cancel-aware value with no sensible runtime-free
//! representation. This module only holds the data produced *by* running a
//! workflow, plus the errors the engine itself raises.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// The outcome of a single step invocation, before it's folded into a
/// `StepExecutionResult` with timing attached.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub error_message: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
        }
    }
}

/// A single step's recorded result within a `WorkflowResult`.
#[derive(Debug, Clone)]
pub struct StepExecutionResult {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// The result of running a workflow to completion (or halt).
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub success: bool,
    pub steps: Vec<StepExecutionResult>,
    pub final_context: HashMap<String, Value>,
    pub duration: Duration,
}

/// A progress snapshot delivered to a workflow's progress sink on step start
/// and step completion.
#[derive(Debug, Clone)]
pub struct WorkflowProgress {
    pub total: usize,
    pub completed: usize,
    pub current_step_name: Option<String>,
}

/// Errors the `WorkflowEngine` itself raises. A step reporting failure is
/// *not* one of these -- it surfaces as `WorkflowResult { success: false,
/// .. } `, a normal return value, not an error.
#[derive(Debug, Error, Clone)]
pub enum WorkflowError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("workflow run cancelled")]
    Cancelled,
}
