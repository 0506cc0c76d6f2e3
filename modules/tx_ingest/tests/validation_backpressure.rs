//! Back-pressure from the validation workers.

mod common;

use std::time::{Duration, Instant};

use agora_test_utils::ledger;

use common::{node_with, wait_for_pending};

/// While the validators are stuck, transfers beyond the queue are dropped
/// and no new announcements are worth fetching; both recover once the
/// workers catch up.
#[tokio::test]
async fn test_flooded_validators_pause_fetching() {
    let mut node = node_with(&[("validation-workers", 1), ("validation-queue-capacity", 2)]);
    let flood: Vec<_> = (0..20).map(|n| ledger::mint("alice", 1, n)).collect();
    let later = ledger::mint("bob", 1, 1_000);

    // Holding the chain lock keeps every worker waiting
    let guard = node.chain.lock().await;
    let mut accepted = 0;
    let mut dropped = 0;
    for tx in &flood {
        let report = node.pipeline.submit(tx.clone(), Instant::now());
        accepted += report.transfers;
        dropped += report.dropped_transfers;
    }
    assert_eq!(accepted + dropped, flood.len());
    assert!(dropped > 0);
    // Queue plus the one submission held for a permit plus the one running
    assert!(accepted <= 4);
    assert!(node.pipeline.is_busy());
    assert!(node.pipeline.fetchable(&[later.id()], Instant::now()).is_empty());
    drop(guard);

    assert_eq!(wait_for_pending(&node.chain, accepted).await.len(), accepted);
    let mut resumed = false;
    for _ in 0..200 {
        if node.pipeline.fetchable(&[later.id()], Instant::now()) == vec![later.id()] {
            resumed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(resumed);

    // A transfer dropped during the flood is accepted once there is room
    let retried = flood.last().unwrap().clone();
    assert!(!node.chain.lock().await.pending_transactions().contains(&retried));
    assert_eq!(node.pipeline.submit(retried.clone(), Instant::now()).transfers, 1);
    assert!(wait_for_pending(&node.chain, accepted + 1).await.contains(&retried));
}
