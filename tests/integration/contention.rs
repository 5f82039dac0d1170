//! Contention tests.
//!
//! Many agents race over a shared backlog. Losing a race must surface as a
//! conflict the agent can move past, never as a store failure, and no item
//! may be completed twice.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use hive::coordination::{
    ClaimError, CoordinationStore, JsonFileBackend, Priority, WorkClaimCoordinator, WorkState,
};
use hive::telemetry::Tracer;

use crate::fixtures::{FileStore, Harness};

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    conflicts: usize,
    errors: usize,
}

/// Each agent repeatedly claims from the head of the queue and completes
/// what it wins, until nothing is pending.
async fn drain(coordinator: WorkClaimCoordinator, agents: usize) -> Tally {
    let mut handles = Vec::new();
    for _ in 0..agents {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let agent = coordinator.register_agent("load", 1).await.unwrap();
            let mut tally = Tally::default();
            loop {
                let candidates = coordinator.next_claimable(3).await.unwrap();
                if candidates.is_empty() {
                    break;
                }
                for candidate in candidates {
                    match coordinator.claim(&candidate.id, &agent.id).await {
                        Ok(_) => {
                            coordinator.start_progress(&candidate.id, &agent.id).await.unwrap();
                            coordinator
                                .complete(&candidate.id, &agent.id, json!({ "by": agent.id }))
                                .await
                                .unwrap();
                            tally.completed += 1;
                            break;
                        }
                        // Someone else won it, possibly already finishing it.
                        Err(ClaimError::Conflict { .. } | ClaimError::InvalidState { .. }) => {
                            tally.conflicts += 1
                        }
                        Err(_) => tally.errors += 1,
                    }
                }
            }
            tally
        }));
    }

    let mut total = Tally::default();
    for handle in handles {
        let tally = handle.await.unwrap();
        total.completed += tally.completed;
        total.conflicts += tally.conflicts;
        total.errors += tally.errors;
    }
    total
}

/// Test: Backlog drained by competing agents
/// Given 200 pending items and 20 agents
/// When the agents race to drain the queue
/// Then every item completes exactly once and no store errors occur
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agents_drain_backlog_without_errors() {
    let harness = Harness::new();
    for i in 0..200 {
        let priority = if i % 5 == 0 { Priority::High } else { Priority::Medium };
        harness.item("analysis", priority).await;
    }

    let tally = drain(harness.coordinator.clone(), 20).await;

    assert_eq!(tally.completed, 200);
    assert_eq!(tally.errors, 0);
    let snapshot = harness.coordinator.snapshot().await.unwrap();
    assert!(snapshot
        .work_items
        .iter()
        .all(|item| item.state == WorkState::Completed));
    let claims = harness.spans.by_operation("coord.claim").len();
    assert_eq!(claims, tally.completed + tally.conflicts);
}

/// Test: Contention against a file-backed store
/// Given 60 items in a JSON-file store and 12 agents
/// When the agents race with every mutation persisted to disk
/// Then every item completes exactly once and no store errors occur
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_backed_contention() {
    let files = FileStore::new();
    let store = CoordinationStore::open(Arc::new(JsonFileBackend::new(&files.path)))
        .unwrap()
        .with_lock_wait(Duration::from_secs(5));
    let coordinator = WorkClaimCoordinator::new(Arc::new(store), Tracer::new());
    for _ in 0..60 {
        coordinator.enqueue("build", Priority::Medium).await.unwrap();
    }

    let tally = drain(coordinator.clone(), 12).await;

    assert_eq!(tally.completed, 60);
    assert_eq!(tally.errors, 0);

    // What hit the disk matches what is in memory.
    let reopened = files.open();
    let on_disk = reopened.snapshot().await.unwrap();
    assert_eq!(on_disk.version, coordinator.snapshot().await.unwrap().version);
    assert!(on_disk
        .work_items
        .iter()
        .all(|item| item.state == WorkState::Completed));
}
