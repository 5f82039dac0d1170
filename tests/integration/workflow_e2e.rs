//! Full workflow execution tests.
//!
//! These tests run workflows through the default middleware stack against a
//! claimed work item and check compensation, tracing, retries and
//! cancellation as an agent would observe them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use hive::coordination::{Priority, WorkItem, WorkState};
use hive::telemetry::{SpanId, SpanStatus, TraceSpan};
use hive::workflow::{
    RetryPolicy, RunState, Step, StepError, StepState, Workflow, WorkflowEngine,
};

use crate::fixtures::{fatal_step, journaled_step, slow_step, Harness, Journal};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

fn engine(harness: &Harness) -> WorkflowEngine {
    WorkflowEngine::with_default_stack(
        harness.coordinator.tracer().clone(),
        harness.coordinator.clone(),
        fast_retry(),
    )
}

/// Enqueue, claim and start an item so the coordination middleware can
/// report progress against it.
async fn started_item(harness: &Harness) -> WorkItem {
    let agent = harness.agent().await;
    let item = harness.item("analysis", Priority::High).await;
    harness.coordinator.claim(&item.id, &agent.id).await.unwrap();
    harness
        .coordinator
        .start_progress(&item.id, &agent.id)
        .await
        .unwrap()
}

/// Test: Compensation ordering
/// Given steps [A, B, C] where C fails fatally
/// When the workflow runs
/// Then B's compensator runs before A's and the run ends failed
#[tokio::test]
async fn test_compensation_runs_in_reverse_order() {
    let harness = Harness::new();
    let journal = Journal::default();
    let workflow = Workflow::builder("analysis")
        .step(journaled_step("A", &journal))
        .step(journaled_step("B", &journal))
        .step(fatal_step("C"))
        .build()
        .unwrap();
    let item = started_item(&harness).await;

    let result = engine(&harness)
        .execute(&workflow, item.clone(), CancellationToken::new())
        .await;

    assert_eq!(
        journal.entries(),
        vec!["run:A", "run:B", "undo:B", "undo:A"]
    );
    assert_eq!(result.run.state, RunState::Failed);
    assert_eq!(result.run.step("A").unwrap().state, StepState::Compensated);
    assert_eq!(result.run.step("B").unwrap().state, StepState::Compensated);
    assert_eq!(result.run.step("C").unwrap().state, StepState::Failed);
    let (failed_step, error) = result.error.unwrap();
    assert_eq!(failed_step, "C");
    assert_eq!(error, StepError::fatal("disk full"));
    assert_eq!(result.run.steps_in(StepState::Compensated).count(), 2);

    // The coordination middleware fails the item on the fatal error.
    let stored = harness.coordinator.status(&item.id).await.unwrap();
    assert_eq!(stored.state, WorkState::Failed);

    let history: Vec<_> = result.run.history().iter().map(|h| h.state).collect();
    assert_eq!(
        history,
        vec![RunState::Running, RunState::Compensating, RunState::Failed]
    );
}

/// Test: Trace causality
/// Given a workflow with 3 sequential steps
/// When it runs
/// Then each step span descends from the run's root span and never starts
/// before its parent
#[tokio::test]
async fn test_step_spans_descend_from_the_run() {
    let harness = Harness::new();
    let workflow = Workflow::builder("analysis")
        .step(Step::from_fn("fetch", |_ctx| async { Ok(json!(1)) }))
        .step(Step::from_fn("parse", |_ctx| async { Ok(json!(2)) }))
        .step(Step::from_fn("store", |_ctx| async { Ok(json!(3)) }))
        .build()
        .unwrap();
    let item = started_item(&harness).await;
    harness.spans.clear();

    let result = engine(&harness)
        .execute(&workflow, item, CancellationToken::new())
        .await;
    assert!(result.is_success());

    let spans = harness.spans.spans();
    let by_id: HashMap<SpanId, &TraceSpan> = spans.iter().map(|s| (s.span_id, s)).collect();
    let root = &result.root_span;

    for name in ["step.fetch", "step.parse", "step.store"] {
        let step = spans
            .iter()
            .find(|s| s.operation == name)
            .unwrap_or_else(|| panic!("missing span {name}"));
        assert_eq!(step.trace_id, root.trace_id);
        assert_eq!(step.status, SpanStatus::Ok);

        let mut current: &TraceSpan = step;
        let mut reached_root = false;
        while let Some(parent_id) = current.parent_span_id {
            let parent = by_id[&parent_id];
            assert!(
                current.start >= parent.start,
                "{} starts before its parent {}",
                current.operation,
                parent.operation
            );
            if parent.span_id == root.span_id {
                reached_root = true;
                break;
            }
            current = parent;
        }
        assert!(reached_root, "{name} is not a descendant of the run span");
    }

    // Progress reports made by the coordination middleware join the trace.
    let progress: Vec<_> = spans
        .iter()
        .filter(|s| s.operation == "coord.progress")
        .collect();
    assert_eq!(progress.len(), 3);
    assert!(progress.iter().all(|s| s.trace_id == root.trace_id));
}

/// Test: Parallel group execution
/// Given a layer of three 100 ms steps between two fast steps
/// When the workflow runs
/// Then the layer takes about one step's time and the join sees every output
#[tokio::test]
async fn test_parallel_group_runs_concurrently() {
    let harness = Harness::new();
    let workflow = Workflow::builder("analysis")
        .step(Step::from_fn("fetch", |_ctx| async { Ok(json!("rows")) }))
        .parallel(vec![
            slow_step("lint", Duration::from_millis(100)),
            slow_step("profile", Duration::from_millis(100)),
            slow_step("score", Duration::from_millis(100)),
        ])
        .step(Step::from_fn("join", |ctx| async move {
            let seen = ["lint", "profile", "score"]
                .iter()
                .filter(|name| ctx.input(name).is_some())
                .count();
            Ok(json!(seen))
        }))
        .build()
        .unwrap();
    let item = started_item(&harness).await;

    let started = Instant::now();
    let result = engine(&harness)
        .execute(&workflow, item.clone(), CancellationToken::new())
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_success());
    assert!(elapsed < Duration::from_millis(280), "took {elapsed:?}");
    assert_eq!(result.outputs["join"], json!(3));
    assert_eq!(
        harness.coordinator.status(&item.id).await.unwrap().progress,
        100
    );
}

/// Test: Retry through the middleware stack
/// Given a step that fails transiently twice
/// When the workflow runs with three attempts allowed
/// Then the step succeeds on the third attempt and only one step span is
/// recorded for it
#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let workflow = Workflow::builder("analysis")
        .step(Step::from_fn("flaky", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StepError::retryable("lock busy"))
                } else {
                    Ok(json!("ok"))
                }
            }
        }))
        .build()
        .unwrap();
    let item = started_item(&harness).await;

    let result = engine(&harness)
        .execute(&workflow, item, CancellationToken::new())
        .await;

    assert!(result.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.run.step("flaky").unwrap().attempt_count, 3);
    let spans = harness.spans.by_operation("step.flaky");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].attribute("attempts"), Some("3"));
}

/// Test: Cancellation mid-run
/// Given A done and a slow B in flight
/// When the run is cancelled
/// Then B is aborted, A is compensated, and the run ends failed
#[tokio::test]
async fn test_cancellation_compensates_finished_steps() {
    let harness = Harness::new();
    let journal = Journal::default();
    let workflow = Workflow::builder("analysis")
        .step(journaled_step("A", &journal))
        .step(slow_step("B", Duration::from_secs(30)))
        .build()
        .unwrap();
    let item = started_item(&harness).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = engine(&harness).execute(&workflow, item.clone(), cancel).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.was_cancelled());
    assert_eq!(result.run.state, RunState::Failed);
    assert_eq!(result.run.step("B").unwrap().state, StepState::Failed);
    assert_eq!(journal.entries(), vec!["run:A", "undo:A"]);
    // Cancellation leaves the item held so the agent can release it.
    assert_eq!(
        harness.coordinator.status(&item.id).await.unwrap().state,
        WorkState::InProgress
    );
}
