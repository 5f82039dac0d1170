//! Reaper and recovery tests.
//!
//! These tests verify that work held by agents that stop heartbeating goes
//! back to the pool and is picked up by someone else.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use hive::coordination::{
    AgentStatus, ClaimError, Priority, Reaper, ReaperActor, ReaperConfig, WorkState,
};
use hive::swarm::{Swarm, SwarmConfig, WorkerConfig, WorkflowRegistry};
use hive::workflow::{Step, Workflow};

use crate::fixtures::{Harness, SlowBackend};

fn short_liveness(liveness: Duration) -> ReaperConfig {
    ReaperConfig {
        agent_liveness: liveness,
        work_staleness: Duration::from_secs(300),
    }
}

/// Test: Reaper liveness
/// Given a1 holds an item and stops heartbeating while a2 keeps heartbeating
/// When one reaper cycle runs after the liveness threshold
/// Then the item is pending again and a2 can claim it
#[tokio::test]
async fn test_silent_agent_loses_its_claim() {
    let harness = Harness::new();
    let coordinator = &harness.coordinator;
    let a1 = harness.agent().await;
    let a2 = harness.agent().await;
    let item = harness.item("analysis", Priority::High).await;
    coordinator.claim(&item.id, &a1.id).await.unwrap();
    coordinator.start_progress(&item.id, &a1.id).await.unwrap();
    coordinator.update_progress(&item.id, &a1.id, 40).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    coordinator.heartbeat(&a2.id).await.unwrap();
    let reaper = Reaper::new(coordinator.clone(), short_liveness(Duration::from_millis(100)));

    let report = reaper.scan(Utc::now()).await.unwrap();

    assert_eq!(report.expired_agents, vec![a1.id]);
    assert_eq!(report.released.len(), 1);
    assert_eq!(report.released[0].work_id, item.id);
    assert_eq!(report.released[0].previous_owner, a1.id);

    let pending = coordinator.status(&item.id).await.unwrap();
    assert_eq!(pending.state, WorkState::Pending);
    assert_eq!(pending.progress, 0);
    assert!(pending.claimed_by.is_none());
    assert_eq!(
        coordinator.agent(&a1.id).await.unwrap().status,
        AgentStatus::Error
    );

    let reclaimed = coordinator.claim(&item.id, &a2.id).await.unwrap();
    assert_eq!(reclaimed.work_item.claimed_by, Some(a2.id));

    // The dead agent can no longer act on the item.
    assert!(matches!(
        coordinator.update_progress(&item.id, &a1.id, 90).await,
        Err(ClaimError::NotOwner { .. })
    ));
}

/// Test: Progress reported during a scan is never wiped
/// Given 20 in-progress items that have gone quiet past the staleness threshold
/// When their owners report progress while a reaper scan is releasing them
/// Then every item whose progress update was accepted stays with its owner
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_spares_items_updated_mid_scan() {
    let harness = Harness::with_backend(
        Arc::new(SlowBackend {
            delay: Duration::from_millis(5),
        }),
        Duration::from_secs(5),
    );
    let coordinator = harness.coordinator.clone();
    let mut held = Vec::new();
    for agent in harness.agents(20).await {
        let item = harness.item("analysis", Priority::Medium).await;
        coordinator.claim(&item.id, &agent.id).await.unwrap();
        coordinator.start_progress(&item.id, &agent.id).await.unwrap();
        held.push((item.id, agent.id));
    }
    let reaper = Reaper::new(
        coordinator.clone(),
        ReaperConfig {
            agent_liveness: Duration::from_secs(3600),
            work_staleness: Duration::from_millis(50),
        },
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    let scan = tokio::spawn(async move { reaper.scan(Utc::now()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut updates = Vec::new();
    for (work_id, agent_id) in held.clone() {
        let coordinator = coordinator.clone();
        updates.push(tokio::spawn(async move {
            let accepted = coordinator
                .update_progress(&work_id, &agent_id, 50)
                .await
                .is_ok();
            (work_id, accepted)
        }));
    }
    let mut accepted = HashSet::new();
    for update in updates {
        let (work_id, ok) = update.await.unwrap();
        if ok {
            accepted.insert(work_id);
        }
    }
    let report = scan.await.unwrap().unwrap();

    for released in &report.released {
        assert!(
            !accepted.contains(&released.work_id),
            "{} was reaped after its owner reported progress",
            released.work_id
        );
    }
    for (work_id, agent_id) in held {
        let item = coordinator.status(&work_id).await.unwrap();
        if accepted.contains(&work_id) {
            assert_eq!(item.state, WorkState::InProgress);
            assert_eq!(item.claimed_by, Some(agent_id));
            assert_eq!(item.progress, 50);
        } else {
            assert_eq!(item.state, WorkState::Pending);
        }
    }
}

/// Test: A live agent keeps its claim
/// Given an agent that heartbeats within the threshold
/// When the reaper scans
/// Then nothing is released
#[tokio::test]
async fn test_heartbeating_agent_keeps_claim() {
    let harness = Harness::new();
    let agent = harness.agent().await;
    let item = harness.item("analysis", Priority::High).await;
    harness.coordinator.claim(&item.id, &agent.id).await.unwrap();
    harness.coordinator.heartbeat(&agent.id).await.unwrap();
    let reaper = Reaper::new(
        harness.coordinator.clone(),
        short_liveness(Duration::from_secs(60)),
    );

    let report = reaper.scan(Utc::now()).await.unwrap();

    assert!(report.is_empty());
    assert_eq!(
        harness.coordinator.status(&item.id).await.unwrap().state,
        WorkState::Claimed
    );
}

/// Test: Reaper actor cycle
/// Given a claim by an agent that never heartbeats again
/// When the reaper actor runs on a short interval
/// Then a report naming the item arrives and the item is claimable
#[tokio::test]
async fn test_reaper_actor_releases_within_a_cycle() {
    let harness = Harness::new();
    let ghost = harness.agent().await;
    let rescuer = harness.agent().await;
    let item = harness.item("analysis", Priority::Critical).await;
    harness.coordinator.claim(&item.id, &ghost.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.coordinator.heartbeat(&rescuer.id).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let actor = ReaperActor::new(Reaper::new(
        harness.coordinator.clone(),
        short_liveness(Duration::from_millis(50)),
    ))
    .with_interval(Duration::from_millis(20))
    .with_reports(tx)
    .spawn();

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("reaper cycle")
        .expect("report");
    actor.stop().await;

    assert_eq!(report.released[0].work_id, item.id);
    harness.coordinator.claim(&item.id, &rescuer.id).await.unwrap();
}

/// Test: Swarm recovers abandoned work
/// Given an item claimed by an agent with no worker behind it
/// When a swarm with a fast reaper runs
/// Then a swarm worker completes the item and the ghost agent is expired
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swarm_finishes_work_of_a_dead_agent() {
    let harness = Harness::new();
    let ghost = harness.agent().await;
    let item = harness.item("analysis", Priority::High).await;
    harness.coordinator.claim(&item.id, &ghost.id).await.unwrap();
    let fresh = harness.item("analysis", Priority::Low).await;

    let mut registry = WorkflowRegistry::new();
    registry.register(
        "analysis",
        Workflow::builder("analysis")
            .step(Step::from_fn("fetch", |_ctx| async { Ok(json!("rows")) }))
            .build()
            .unwrap(),
    );
    let config = SwarmConfig {
        workers: 2,
        worker: WorkerConfig {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            ..WorkerConfig::default()
        },
        reaper: short_liveness(Duration::from_millis(200)),
        reaper_interval: Duration::from_millis(50),
        ..SwarmConfig::default()
    };

    let handle = Swarm::new(harness.coordinator.clone(), registry, config)
        .start()
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle.wait_idle(Duration::from_millis(10)))
        .await
        .expect("swarm went idle")
        .unwrap();
    let stats = handle.shutdown().await;

    assert_eq!(stats.completed, 2);
    for id in [item.id, fresh.id] {
        let done = harness.coordinator.status(&id).await.unwrap();
        assert_eq!(done.state, WorkState::Completed);
        assert_ne!(done.claimed_by, Some(ghost.id));
    }
    assert_eq!(
        harness.coordinator.agent(&ghost.id).await.unwrap().status,
        AgentStatus::Error
    );
}
