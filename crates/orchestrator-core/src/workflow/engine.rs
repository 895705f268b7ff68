//! Dependency-aware, wave-based scheduler for named steps sharing a
//! `WorkflowContext`.
//!
//! Each iteration computes the current `ready` set (steps whose
//! predecessors have all completed successfully), splits it into a
//! sequential group and a parallel group, runs the sequential group one
//! step at a time in declaration order, then runs the parallel group
//! concurrently -- each acquiring a permit from the engine's shared
//! `Throttle`. A step reporting failure halts the workflow; the ready-set
//! computation doubling as cycle detection (an empty ready set with
//! unexecuted steps remaining) means no separate topological pre-pass is
//! needed.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use orchestrator_types::workflow::{
    StepExecutionResult, StepOutcome, WorkflowError, WorkflowProgress, WorkflowResult,
};

use crate::panic_guard::catch_panic;
use crate::throttle::Throttle;
use crate::workflow::context::WorkflowContext;

/// A step's async body: given the shared context and a cancellation token,
/// produces an outcome. Stored as `Arc` rather than `Box` because a
/// parallel wave clones it into each concurrently spawned task.
pub type StepFn = Arc<
    dyn Fn(Arc<WorkflowContext>, CancellationToken) -> Pin<Box<dyn Future<Output = StepOutcome> + Send>>
        + Send
        + Sync,
>;

/// A named unit of work within a `Workflow`.
pub struct Step {
    pub name: String,
    pub predecessors: HashSet<String>,
    pub parallel_capable: bool,
    pub run: StepFn,
}

impl Step {
    pub fn new(name: impl Into<String>, run: StepFn) -> Self {
        Self {
            name: name.into(),
            predecessors: HashSet::new(),
            parallel_capable: false,
            run,
        }
    }

    pub fn depends_on(mut self, predecessors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.predecessors = predecessors.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel_capable(mut self, parallel_capable: bool) -> Self {
        self.parallel_capable = parallel_capable;
        self
    }
}

/// A named DAG of steps.
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

/// A progress sink invoked on step start and step completion.
pub type WorkflowProgressSink = Arc<dyn Fn(WorkflowProgress) + Send + Sync>;

/// Schedules a `Workflow`'s steps in topological waves, acquiring capacity
/// from a shared `Throttle` for every step it runs.
pub struct WorkflowEngine {
    throttle: Arc<Throttle>,
}

impl WorkflowEngine {
    pub fn new(throttle: Arc<Throttle>) -> Self {
        Self { throttle }
    }

    pub async fn run(
        &self,
        workflow: Workflow,
        progress: Option<WorkflowProgressSink>,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult, WorkflowError> {
        let Workflow { name, steps } = workflow;
        let total = steps.len();
        tracing::debug!(workflow = %name, total_steps = total, "starting workflow run");

        validate(&steps)?;

        if total == 0 {
            tracing::debug!(workflow = %name, "empty workflow, returning trivially");
            return Ok(WorkflowResult {
                success: true,
                steps: Vec::new(),
                final_context: Default::default(),
                duration: std::time::Duration::ZERO,
            });
        }

        let start = Instant::now();
        let context = Arc::new(WorkflowContext::new());
        let mut executed: HashSet<String> = HashSet::new();
        let mut results: Vec<StepExecutionResult> = Vec::new();
        let mut completed_count = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            let ready: Vec<&Step> = steps
                .iter()
                .filter(|s| !executed.contains(&s.name) && s.predecessors.iter().all(|p| executed.contains(p)))
                .collect();

            if ready.is_empty() {
                if executed.len() == total {
                    break;
                }
                tracing::warn!(workflow = %name, executed = executed.len(), total, "no ready steps remain with the workflow incomplete");
                return Err(WorkflowError::InvariantViolation(
                    "no ready steps remain but the workflow is incomplete; the remaining steps form a cycle".to_string(),
                ));
            }

            let run_in_parallel = ready.len() > 1;
            let (parallel_group, sequential_group): (Vec<&Step>, Vec<&Step>) = ready
                .into_iter()
                .partition(|s| run_in_parallel && s.parallel_capable);

            for step in sequential_group {
                if cancel.is_cancelled() {
                    return Err(WorkflowError::Cancelled);
                }

                emit_start(&progress, total, completed_count, &step.name);
                let (outcome, duration) = self
                    .run_step(step, context.clone(), cancel.child_token())
                    .await?;
                completed_count += 1;
                emit_completed(&progress, total, completed_count);

                executed.insert(step.name.clone());
                let success = outcome.success;
                results.push(StepExecutionResult {
                    name: step.name.clone(),
                    success,
                    error: outcome.error_message,
                    duration,
                });

                if !success {
                    tracing::warn!(workflow = %name, step = %results.last().unwrap().name, "workflow halted on step failure");
                    return Ok(WorkflowResult {
                        success: false,
                        steps: results,
                        final_context: context.snapshot(),
                        duration: start.elapsed(),
                    });
                }
            }

            if !parallel_group.is_empty() {
                let mut join_set = JoinSet::new();
                for step in &parallel_group {
                    let name = step.name.clone();
                    let run = step.run.clone();
                    let context = context.clone();
                    let child_cancel = cancel.child_token();
                    let throttle = self.throttle.clone();
                    emit_start(&progress, total, completed_count, &name);

                    join_set.spawn(async move {
                        let step_start = Instant::now();
                        let outcome = run_through_throttle(&throttle, run, context, child_cancel).await;
                        (name, outcome, step_start.elapsed())
                    });
                }

                let mut any_failed = false;
                while let Some(joined) = join_set.join_next().await {
                    let (name, outcome, duration) =
                        joined.map_err(|e| WorkflowError::InvariantViolation(format!("step task panicked: {e}")))?;
                    let outcome = outcome?;
                    completed_count += 1;
                    emit_completed(&progress, total, completed_count);

                    executed.insert(name.clone());
                    let success = outcome.success;
                    if !success {
                        any_failed = true;
                    }
                    results.push(StepExecutionResult {
                        name,
                        success,
                        error: outcome.error_message,
                        duration,
                    });
                }

                if any_failed {
                    tracing::warn!(workflow = %name, "workflow halted after a parallel wave reported a failure");
                    return Ok(WorkflowResult {
                        success: false,
                        steps: results,
                        final_context: context.snapshot(),
                        duration: start.elapsed(),
                    });
                }
            }
        }

        let duration = start.elapsed();
        tracing::debug!(workflow = %name, total_steps = total, ?duration, "workflow run succeeded");
        Ok(WorkflowResult {
            success: true,
            steps: results,
            final_context: context.snapshot(),
            duration,
        })
    }

    async fn run_step(
        &self,
        step: &Step,
        context: Arc<WorkflowContext>,
        cancel: CancellationToken,
    ) -> Result<(StepOutcome, std::time::Duration), WorkflowError> {
        let start = Instant::now();
        let outcome = run_through_throttle(&self.throttle, step.run.clone(), context, cancel).await?;
        Ok((outcome, start.elapsed()))
    }
}

/// Acquire a permit from `throttle`, run the step's body, and translate a
/// synchronous panic into a failing `StepOutcome` rather than propagating
/// it. The only way this returns `Err` is outer cancellation observed while
/// waiting for a permit.
async fn run_through_throttle(
    throttle: &Throttle,
    run: StepFn,
    context: Arc<WorkflowContext>,
    cancel: CancellationToken,
) -> Result<StepOutcome, WorkflowError> {
    let op: crate::throttle::Operation<StepOutcome> = Box::new(move |cancel| {
        Box::pin(async move {
            match catch_panic(run(context, cancel)).await {
                Ok(outcome) => Ok(outcome),
                Err(message) => Ok(StepOutcome::failure(message)),
            }
        })
    });

    throttle
        .acquire_and_run(cancel, op)
        .await
        .map_err(|_| WorkflowError::Cancelled)
}

fn validate(steps: &[Step]) -> Result<(), WorkflowError> {
    let names: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    if names.len() != steps.len() {
        return Err(WorkflowError::InvalidArgument(
            "step names must be unique within a workflow".to_string(),
        ));
    }
    for step in steps {
        for predecessor in &step.predecessors {
            if !names.contains(predecessor.as_str()) {
                return Err(WorkflowError::InvalidArgument(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.name, predecessor
                )));
            }
        }
    }
    Ok(())
}

fn emit_start(progress: &Option<WorkflowProgressSink>, total: usize, completed: usize, name: &str) {
    if let Some(sink) = progress {
        sink(WorkflowProgress {
            total,
            completed,
            current_step_name: Some(name.to_string()),
        });
    }
}

fn emit_completed(progress: &Option<WorkflowProgressSink>, total: usize, completed: usize) {
    if let Some(sink) = progress {
        sink(WorkflowProgress {
            total,
            completed,
            current_step_name: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ok_step() -> StepFn {
        Arc::new(|_ctx, _cancel| Box::pin(async move { StepOutcome::success() }))
    }

    fn failing_step() -> StepFn {
        Arc::new(|_ctx, _cancel| Box::pin(async move { StepOutcome::failure("boom") }))
    }

    fn sleeping_step(millis: u64) -> StepFn {
        Arc::new(move |_ctx, _cancel| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                StepOutcome::success()
            })
        })
    }

    #[tokio::test]
    async fn empty_workflow_succeeds_trivially() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        let workflow = Workflow::new("empty", vec![]);
        let result = engine.run(workflow, None, CancellationToken::new()).await.unwrap();
        assert!(result.success);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn invalid_predecessor_fails_before_running_anything() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        let steps = vec![Step::new("a", ok_step()).depends_on(["ghost"])];
        let workflow = Workflow::new("bad", steps);
        let result = engine.run(workflow, None, CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkflowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn diamond_runs_b_and_c_concurrently_before_d() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        let steps = vec![
            Step::new("A", ok_step()),
            Step::new("B", sleeping_step(50)).depends_on(["A"]).parallel_capable(true),
            Step::new("C", sleeping_step(50)).depends_on(["A"]).parallel_capable(true),
            Step::new("D", ok_step()).depends_on(["B", "C"]),
        ];
        let workflow = Workflow::new("diamond", steps);

        let start = Instant::now();
        let result = engine.run(workflow, None, CancellationToken::new()).await.unwrap();
        let elapsed = start.elapsed();

        assert!(result.success);
        assert_eq!(result.steps.len(), 4);
        // B and C run concurrently: total time should be well under 2x50ms.
        assert!(elapsed < Duration::from_millis(150), "elapsed = {elapsed:?}");
        assert_eq!(result.steps[0].name, "A");
        assert_eq!(result.steps.last().unwrap().name, "D");
    }

    #[tokio::test]
    async fn failure_midstream_halts_remaining_steps() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        let steps = vec![
            Step::new("S1", ok_step()),
            Step::new("S2", failing_step()).depends_on(["S1"]),
            Step::new("S3", ok_step()).depends_on(["S2"]),
        ];
        let workflow = Workflow::new("linear", steps);
        let result = engine.run(workflow, None, CancellationToken::new()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].name, "S1");
        assert!(result.steps[0].success);
        assert_eq!(result.steps[1].name, "S2");
        assert!(!result.steps[1].success);
    }

    #[tokio::test]
    async fn lone_ready_step_runs_even_when_parallel_capable() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let step_fn: StepFn = Arc::new(move |_ctx, _cancel| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StepOutcome::success()
            })
        });
        let workflow = Workflow::new("solo", vec![Step { name: "only".into(), predecessors: HashSet::new(), parallel_capable: true, run: step_fn }]);
        let result = engine.run(workflow, None, CancellationToken::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outer_cancellation_raises_instead_of_a_partial_result() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        // "first" has no knowledge of cancellation and runs to completion;
        // cancellation fires while it's mid-flight, so by the time the loop
        // revisits the top to schedule "second" it observes `cancel` already
        // fired and discards the completed-but-not-yet-returned first result.
        let steps = vec![
            Step::new("first", sleeping_step(100)),
            Step::new("second", ok_step()).depends_on(["first"]),
        ];
        let workflow = Workflow::new("cancelled", steps);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_clone.cancel();
        });

        let result = engine.run(workflow, None, cancel).await;
        assert!(matches!(result, Err(WorkflowError::Cancelled)));
    }

    #[tokio::test]
    async fn steps_share_context() {
        let engine = WorkflowEngine::new(Arc::new(Throttle::new(4)));
        let write_step: StepFn = Arc::new(|ctx, _cancel| {
            Box::pin(async move {
                ctx.set("greeting", json!("hello"));
                StepOutcome::success()
            })
        });
        let read_step: StepFn = Arc::new(|ctx, _cancel| {
            Box::pin(async move {
                match ctx.get("greeting") {
                    Some(v) if v == json!("hello") => StepOutcome::success(),
                    _ => StepOutcome::failure("missing context value"),
                }
            })
        });
        let steps = vec![
            Step::new("write", write_step),
            Step::new("read", read_step).depends_on(["write"]),
        ];
        let result = engine
            .run(Workflow::new("ctx", steps), None, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.final_context.get("greeting"), Some(&json!("hello")));
    }
}
