//! Claim lifecycle tests.
//!
//! These tests verify exclusivity, monotonic progress and terminal
//! immutability across concurrent agents and across store reopenings.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use hive::coordination::{
    ClaimError, CoordinationStore, JsonFileBackend, Priority, WorkClaimCoordinator, WorkState,
};
use hive::telemetry::Tracer;

use crate::fixtures::{FileStore, Harness};

/// Test: Exclusivity under concurrent claims
/// Given one pending item and 32 agents
/// When every agent claims it at once
/// Then exactly one claim succeeds and the rest conflict
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let harness = Harness::new();
    let agents = harness.agents(32).await;
    let item = harness.item("analysis", Priority::High).await;

    let mut handles = Vec::new();
    for agent in &agents {
        let coordinator = harness.coordinator.clone();
        let (work_id, agent_id) = (item.id, agent.id);
        handles.push(tokio::spawn(async move {
            coordinator.claim(&work_id, &agent_id).await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(claimed) => winners.push(claimed.work_item.claimed_by),
            Err(ClaimError::Conflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected claim error: {other}"),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one agent wins the claim");
    assert_eq!(conflicts, 31);
    let stored = harness.coordinator.status(&item.id).await.unwrap();
    assert_eq!(stored.state, WorkState::Claimed);
    assert_eq!(stored.claimed_by, winners[0]);
}

/// Test: Example scenario end to end
/// Given w1 (analysis, high) and agents a1, a2
/// When a1 claims, a2 races, a1 starts, reports 50% and completes
/// Then a2 conflicts, the result is stored, and later claims are invalid
#[tokio::test]
async fn test_example_scenario() {
    let harness = Harness::new();
    let coordinator = &harness.coordinator;
    let a1 = harness.agent().await;
    let a2 = harness.agent().await;
    let w1 = harness.item("analysis", Priority::High).await;

    let (first, second) = tokio::join!(coordinator.claim(&w1.id, &a1.id), async {
        tokio::task::yield_now().await;
        coordinator.claim(&w1.id, &a2.id).await
    });
    assert_eq!(first.unwrap().work_item.state, WorkState::Claimed);
    assert!(matches!(second, Err(ClaimError::Conflict { .. })));

    coordinator.start_progress(&w1.id, &a1.id).await.unwrap();
    let halfway = coordinator.update_progress(&w1.id, &a1.id, 50).await.unwrap();
    assert_eq!(halfway.progress, 50);
    let done = coordinator
        .complete(&w1.id, &a1.id, json!({ "summary": "ok" }))
        .await
        .unwrap();

    assert_eq!(done.state, WorkState::Completed);
    assert_eq!(done.result.as_ref().unwrap()["summary"], "ok");
    assert!(matches!(
        coordinator.claim(&w1.id, &a2.id).await,
        Err(ClaimError::InvalidState { .. })
    ));
}

/// Test: Monotonic progress
/// Given an in-progress item at 60%
/// When the owner reports any lower value
/// Then every regression is rejected and the stored value stays at 60
#[tokio::test]
async fn test_progress_never_regresses() {
    let harness = Harness::new();
    let agent = harness.agent().await;
    let item = harness.item("analysis", Priority::Medium).await;
    let coordinator = &harness.coordinator;
    coordinator.claim(&item.id, &agent.id).await.unwrap();
    coordinator.start_progress(&item.id, &agent.id).await.unwrap();
    coordinator.update_progress(&item.id, &agent.id, 60).await.unwrap();

    for lower in [59, 30, 1, 0] {
        let err = coordinator
            .update_progress(&item.id, &agent.id, lower)
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::InvalidState { .. }), "{lower}: {err}");
    }

    assert_eq!(coordinator.status(&item.id).await.unwrap().progress, 60);
    coordinator.update_progress(&item.id, &agent.id, 60).await.unwrap();
    coordinator.update_progress(&item.id, &agent.id, 100).await.unwrap();
}

/// Test: Progress from a non-owner
/// Given an item owned by a1
/// When a2 reports progress
/// Then the update is rejected as NotOwner
#[tokio::test]
async fn test_progress_requires_ownership() {
    let harness = Harness::new();
    let a1 = harness.agent().await;
    let a2 = harness.agent().await;
    let item = harness.item("analysis", Priority::Medium).await;
    harness.coordinator.claim(&item.id, &a1.id).await.unwrap();
    harness.coordinator.start_progress(&item.id, &a1.id).await.unwrap();

    let err = harness
        .coordinator
        .update_progress(&item.id, &a2.id, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, ClaimError::NotOwner { .. }));
}

/// Test: Terminal immutability
/// Given one completed and one failed item
/// When anyone claims, reports progress or completes them
/// Then every call returns InvalidState and nothing changes
#[tokio::test]
async fn test_terminal_items_are_immutable() {
    let harness = Harness::new();
    let coordinator = &harness.coordinator;
    let owner = harness.agent().await;
    let other = harness.agent().await;

    let completed = harness.item("analysis", Priority::Low).await;
    coordinator.claim(&completed.id, &owner.id).await.unwrap();
    coordinator.start_progress(&completed.id, &owner.id).await.unwrap();
    coordinator
        .complete(&completed.id, &owner.id, json!({ "n": 1 }))
        .await
        .unwrap();

    let failed = harness.item("analysis", Priority::Low).await;
    coordinator.claim(&failed.id, &owner.id).await.unwrap();
    coordinator.fail(&failed.id, &owner.id, "bad input").await.unwrap();

    for item in [&completed, &failed] {
        let before = coordinator.status(&item.id).await.unwrap();
        for agent in [&owner, &other] {
            assert!(matches!(
                coordinator.claim(&item.id, &agent.id).await,
                Err(ClaimError::InvalidState { .. })
            ));
            assert!(matches!(
                coordinator.update_progress(&item.id, &agent.id, 100).await,
                Err(ClaimError::InvalidState { .. })
            ));
            assert!(matches!(
                coordinator.complete(&item.id, &agent.id, json!(null)).await,
                Err(ClaimError::InvalidState { .. })
            ));
        }
        assert_eq!(coordinator.status(&item.id).await.unwrap(), before);
    }
}

/// Test: File-backed state survives reopening
/// Given a claim made through one store instance
/// When the file is reopened
/// Then the claim and the agent's load are restored
#[tokio::test]
async fn test_file_store_restores_claims() {
    let files = FileStore::new();
    let (agent, item) = {
        let coordinator = files.open();
        let agent = coordinator.register_agent("core", 2).await.unwrap();
        let item = coordinator.enqueue("analysis", Priority::High).await.unwrap();
        coordinator.claim(&item.id, &agent.id).await.unwrap();
        (agent, item)
    };

    let reopened = files.open();

    let stored = reopened.status(&item.id).await.unwrap();
    assert_eq!(stored.state, WorkState::Claimed);
    assert_eq!(stored.claimed_by, Some(agent.id));
    assert_eq!(reopened.agent(&agent.id).await.unwrap().current_load, 1);
    assert!(files.path.with_extension("json.bak").exists());
}

/// Test: Exclusivity across separate store instances
/// Given one item in a shared state file and eight agents
/// When each agent claims through its own store instance under the file lock
/// Then exactly one claim succeeds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_lock_serializes_independent_instances() {
    let files = FileStore::new();
    let (agents, work_id) = {
        let coordinator = files.open();
        let mut agents = Vec::new();
        for _ in 0..8 {
            agents.push(coordinator.register_agent("core", 1).await.unwrap().id);
        }
        let item = coordinator.enqueue("analysis", Priority::High).await.unwrap();
        (agents, item.id)
    };

    let mut handles = Vec::new();
    for agent_id in agents {
        let path = files.path.clone();
        handles.push(tokio::spawn(async move {
            let backend = JsonFileBackend::new(&path);
            let locker = backend.clone();
            let _lock = tokio::task::spawn_blocking(move || locker.lock(Duration::from_secs(10)))
                .await
                .unwrap()
                .unwrap();
            let store = CoordinationStore::open(Arc::new(backend)).unwrap();
            let coordinator = WorkClaimCoordinator::new(Arc::new(store), Tracer::new());
            coordinator.claim(&work_id, &agent_id).await
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => claimed += 1,
            Err(ClaimError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected claim error: {other}"),
        }
    }

    assert_eq!(claimed, 1);
    assert!(!files.path.with_extension("json.lock").exists());
}
