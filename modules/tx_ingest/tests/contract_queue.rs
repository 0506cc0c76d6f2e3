mod common;

use std::time::{Duration, Instant};

use agora_common::peer::PeerId;
use agora_common::{StoreKind, TxHash};
use agora_module_chain_coordinator::ApplyOutcome;
use agora_module_tx_ingest::IngestReport;
use agora_test_utils::{child_with_txs, genesis, ledger, now_after};

use common::{node, wait_for_pending};

/// With the contract queue full, further calls are dropped while transfers
/// keep flowing to validation.
#[tokio::test]
async fn test_full_contract_queue_drops_calls_not_transfers() {
    let mut node = node(2, 60_000);
    let calls: Vec<_> =
        (0..4).map(|n| ledger::store_call("vault", &format!("k{n}"), "v", n)).collect();
    let transfer = ledger::mint("alice", 7, 100);

    let mut batch = calls.clone();
    batch.push(transfer.clone());
    let ids: Vec<TxHash> = batch.iter().map(|tx| tx.id()).collect();
    node.pipeline.record_request(PeerId(1), &ids);

    let report = node.pipeline.on_transactions(PeerId(1), batch, Instant::now()).unwrap();
    assert_eq!(
        report,
        IngestReport {
            transfers: 1,
            dropped_transfers: 0,
            queued_contracts: 2,
            dropped_contracts: 2,
            duplicates: 0,
        }
    );

    // Only the transfer is validated; the queued calls wait for a drain
    assert_eq!(wait_for_pending(&node.chain, 1).await, vec![transfer]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.chain.lock().await.pending_transactions().len(), 1);
    assert!(node.events.try_recv().is_err());
}

/// Queued contract calls are validated on the next drain and can then be
/// included in a block.
#[tokio::test]
async fn test_drained_calls_reach_the_pending_pool() {
    let mut node = node(10, 20);
    let call = ledger::store_call("vault", "k", "v", 0);
    let transfer = ledger::mint("alice", 7, 1);
    node.pipeline.submit(call.clone(), Instant::now());
    node.pipeline.submit(transfer.clone(), Instant::now());

    let pending = wait_for_pending(&node.chain, 2).await;
    assert_eq!(pending.len(), 2);
    // The transfer skips the queue
    assert_eq!(pending[0], transfer);

    let block = child_with_txs(&genesis(), 1, pending);
    let mut chain = node.chain.lock().await;
    assert_eq!(chain.apply_block(block.clone(), now_after(&block)), Ok(ApplyOutcome::Extended));
    assert!(chain.pending_transactions().is_empty());
    let stored = chain
        .state_reader()
        .get(StoreKind::ContractStorage, &ledger::contract_key("vault", "k"))
        .unwrap();
    assert_eq!(stored, Some(b"v".to_vec()));
}

/// A call dropped on a full queue is not remembered as seen: once the queue
/// drains it can be announced, fetched and queued again.
#[tokio::test]
async fn test_dropped_call_can_be_offered_again() {
    let mut node = node(1, 20);
    let first = ledger::store_call("vault", "a", "v", 0);
    let second = ledger::store_call("vault", "b", "v", 1);

    assert_eq!(node.pipeline.submit(first, Instant::now()).queued_contracts, 1);
    let dropped = node.pipeline.submit(second.clone(), Instant::now());
    assert_eq!(dropped.dropped_contracts, 1);
    assert_eq!(node.pipeline.unseen(&[second.id()], Instant::now()), vec![second.id()]);

    // The first call drains into the pending pool, freeing the queue
    assert_eq!(wait_for_pending(&node.chain, 1).await.len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let retry = node.pipeline.submit(second.clone(), Instant::now());
    assert_eq!(
        retry,
        IngestReport {
            queued_contracts: 1,
            ..IngestReport::default()
        }
    );
    let pending = wait_for_pending(&node.chain, 2).await;
    assert!(pending.contains(&second));
}
