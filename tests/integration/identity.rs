//! Identifier uniqueness tests.

use std::collections::HashSet;
use std::sync::Arc;

use hive::coordination::Priority;
use hive::id::{next_id, IdGenerator, UniqueId};

use crate::fixtures::Harness;

/// Test: Identity uniqueness under concurrency
/// Given 50 concurrent callers sharing one generator
/// When they draw 10,000 identifiers between them
/// Then no identifier repeats
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_ten_thousand_ids_from_fifty_callers() {
    let generator = Arc::new(IdGenerator::new());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let generator = Arc::clone(&generator);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::with_capacity(200);
            for i in 0..200 {
                ids.push(generator.next_id());
                if i % 20 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            ids
        }));
    }

    let mut seen: HashSet<UniqueId> = HashSet::with_capacity(10_000);
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
    assert_eq!(seen.len(), 10_000);
}

/// Test: The process-wide generator across OS threads
/// Given 50 threads calling next_id directly
/// When each draws 200 identifiers
/// Then all 10,000 are distinct
#[test]
fn test_global_generator_across_threads() {
    let handles: Vec<_> = (0..50)
        .map(|_| std::thread::spawn(|| (0..200).map(|_| next_id()).collect::<Vec<_>>()))
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 10_000);
}

/// Test: Entity ids issued by the coordinator
/// Given many items enqueued concurrently
/// When they are all stored
/// Then each has its own id and none overwrote another
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enqueued_items_have_distinct_ids() {
    let harness = Harness::new();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let coordinator = harness.coordinator.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..10 {
                ids.push(coordinator.enqueue("analysis", Priority::Low).await.unwrap().id);
            }
            ids
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.extend(handle.await.unwrap());
    }

    assert_eq!(ids.len(), 500);
    assert_eq!(harness.coordinator.snapshot().await.unwrap().work_items.len(), 500);
}
