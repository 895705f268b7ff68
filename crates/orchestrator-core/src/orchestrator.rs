//! The facade composing `Throttle`, `BatchExecutor`, `WorkflowEngine`, and
//! `ToolRegistry` into the two entry points services actually call:
//! parallel tool dispatch and workflow execution.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use orchestrator_types::batch::BatchOptions;
use orchestrator_types::throttle::{ThrottleError, ThrottleMetrics};
use orchestrator_types::tool::ToolResult;
use orchestrator_types::workflow::WorkflowError;

use crate::batch::{BatchError, BatchExecutor};
use crate::throttle::Throttle;
use crate::tool::{ToolHandler, ToolRegistry};
use crate::workflow::{Workflow, WorkflowEngine, WorkflowProgressSink};

/// A single `(tool name, argument string)` pair submitted to
/// `dispatch_parallel`.
pub type ToolCall = (String, String);

/// Composes the three coordinators behind one shared `Throttle` so that
/// batch dispatch and workflow steps draw from the same global concurrency
/// budget.
pub struct Orchestrator {
    throttle: Arc<Throttle>,
    registry: ToolRegistry,
    batch_executor: BatchExecutor,
    workflow_engine: WorkflowEngine,
}

impl Orchestrator {
    pub fn new(capacity: usize) -> Self {
        let throttle = Arc::new(Throttle::new(capacity));
        let workflow_engine = WorkflowEngine::new(throttle.clone());
        Self {
            throttle,
            registry: ToolRegistry::new(),
            batch_executor: BatchExecutor::new(),
            workflow_engine,
        }
    }

    pub fn register_tool(&self, name: impl Into<String>, handler: ToolHandler) {
        let name = name.into();
        tracing::debug!(tool = %name, "registering tool");
        self.registry.register_tool(name, handler);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = self.registry.unregister_tool(name);
        tracing::debug!(tool = %name, removed, "unregistering tool");
        removed
    }

    pub fn registered_tools(&self) -> Vec<String> {
        self.registry.registered_tools()
    }

    pub fn metrics(&self) -> ThrottleMetrics {
        self.throttle.metrics()
    }

    pub fn set_capacity(&self, n: i64) -> Result<(), ThrottleError> {
        self.throttle.set_capacity(n)
    }

    /// Dispatch every `(tool, args)` pair concurrently. A call naming an
    /// unregistered tool resolves in-line to a failure `ToolResult` without
    /// going through the `BatchExecutor` at all; every other call is
    /// wrapped so its dispatch acquires a permit from the shared `Throttle`
    /// before running. The returned vector always has the same length as
    /// `calls`.
    pub async fn dispatch_parallel(
        &self,
        calls: Vec<ToolCall>,
        cancel: CancellationToken,
    ) -> Result<Vec<ToolResult>, BatchError> {
        let total = calls.len();
        tracing::debug!(calls = total, "dispatching parallel tool calls");
        if total == 0 {
            return Ok(Vec::new());
        }

        // Calls to an unregistered tool are answered in-line; only calls to
        // a registered handler go through the throttled batch executor.
        let mut dispatched: Vec<(usize, String, String, ToolHandler)> = Vec::with_capacity(total);
        let mut unregistered: Vec<(usize, ToolResult)> = Vec::new();

        for (index, (name, args)) in calls.into_iter().enumerate() {
            match self.registry.get(&name) {
                Some(handler) => dispatched.push((index, name, args, handler)),
                None => {
                    tracing::warn!(tool = %name, index, "dispatch requested unregistered tool");
                    unregistered.push((
                        index,
                        ToolResult::failure(format!("no tool registered under name '{name}'")),
                    ))
                }
            }
        }

        let throttle = self.throttle.clone();
        let ops = dispatched
            .iter()
            .map(|(_, _name, args, handler)| -> crate::throttle::Operation<ToolResult> {
                let args = args.clone();
                let handler = handler.clone();
                let throttle = throttle.clone();
                Box::new(move |cancel| {
                    Box::pin(async move {
                        let op: crate::throttle::Operation<ToolResult> = Box::new(move |cancel| {
                            Box::pin(async move { Ok(handler(args, cancel).await) })
                        });
                        throttle.acquire_and_run(cancel, op).await
                    })
                })
            })
            .collect();

        let batch_result = self
            .batch_executor
            .run(
                ops,
                BatchOptions {
                    max_parallelism: None,
                    continue_on_error: true,
                    per_op_timeout: None,
                },
                None,
                cancel,
            )
            .await?;

        // Tool failures are normally encoded inside `ToolResult` rather than
        // surfaced as an `Err` (the handler call can't itself return one),
        // but a panicking handler is still caught by `BatchExecutor` and
        // routed into `errors` rather than `successes` -- so `successes`
        // only has one entry per dispatched index that did *not* fail, and
        // the two lists must be reassembled by the complement of `errors`'
        // indices rather than a raw positional zip.
        let failed_locals: std::collections::HashSet<usize> = batch_result
            .errors
            .iter()
            .map(|e| e.operation_index)
            .collect();

        let mut successes = batch_result.successes.into_iter();
        let mut by_index: std::collections::HashMap<usize, ToolResult> =
            std::collections::HashMap::with_capacity(total);
        for (local_index, (original_index, ..)) in dispatched.iter().enumerate() {
            let result = if failed_locals.contains(&local_index) {
                let message = batch_result
                    .errors
                    .iter()
                    .find(|e| e.operation_index == local_index)
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "tool dispatch failed".to_string());
                ToolResult::failure(message)
            } else {
                successes
                    .next()
                    .expect("one success per dispatched index not present in errors")
            };
            by_index.insert(*original_index, result);
        }
        for (index, result) in unregistered {
            by_index.insert(index, result);
        }

        let mut ordered = Vec::with_capacity(total);
        for index in 0..total {
            ordered.push(
                by_index
                    .remove(&index)
                    .expect("every submitted index produced exactly one ToolResult"),
            );
        }
        Ok(ordered)
    }

    /// Run a workflow to completion, projecting its `WorkflowResult` into a
    /// single `ToolResult`. Only validation, invariant, or cancellation
    /// failures raise `Err`; an ordinary step failure is represented in the
    /// returned `ToolResult` with `ok: false`.
    pub async fn run_workflow(
        &self,
        workflow: Workflow,
        cancel: CancellationToken,
    ) -> Result<ToolResult, WorkflowError> {
        self.run_workflow_with_progress(workflow, None, cancel).await
    }

    pub async fn run_workflow_with_progress(
        &self,
        workflow: Workflow,
        progress: Option<WorkflowProgressSink>,
        cancel: CancellationToken,
    ) -> Result<ToolResult, WorkflowError> {
        let total_steps = workflow.steps.len();
        let result = self.workflow_engine.run(workflow, progress, cancel).await?;

        if result.success {
            Ok(ToolResult::success(format!(
                "{}/{} steps succeeded in {:?}",
                result.steps.len(),
                total_steps,
                result.duration
            )))
        } else {
            let failed_steps: Vec<&str> = result
                .steps
                .iter()
                .filter(|s| !s.success)
                .map(|s| s.name.as_str())
                .collect();
            Ok(ToolResult::failure(format!(
                "workflow failed at step(s): {}",
                failed_steps.join(", ")
            )))
        }
    }
}
