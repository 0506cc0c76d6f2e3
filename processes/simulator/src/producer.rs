//! Block production and transaction load for the simulated network

use std::time::{SystemTime, UNIX_EPOCH};

use agora_common::{Block, ProducerId, Transaction};
use agora_module_peer_network_interface::Node;
use agora_test_utils::ledger;
use anyhow::{Context as _, Result};
use rand::rngs::StdRng;
use rand::Rng;

/// Accounts and contract keys the generated load spreads over
const ACCOUNTS: u32 = 32;

/// Build a block on the node's current head from its pending pool
pub async fn build_block(node: &Node, producer: ProducerId) -> Result<Block> {
    let chain = node.chain.lock().await;
    let head = chain.head();
    let parent = chain
        .block_by_id(&head)?
        .with_context(|| format!("head block {head} is missing"))?;
    let timestamp = unix_millis().max(parent.header.timestamp + 1);
    Ok(Block::new(
        head,
        timestamp,
        producer,
        node.id.0.to_be_bytes().to_vec(),
        chain.pending_transactions(),
    ))
}

/// Mints and contract stores only, so every transaction applies cleanly in
/// any order
pub fn random_transaction(rng: &mut StdRng, nonce: u64) -> Transaction {
    let account = format!("account-{}", rng.random_range(0..ACCOUNTS));
    if rng.random_bool(0.75) {
        ledger::mint(&account, rng.random_range(1..1_000), nonce)
    } else {
        ledger::store_call("registry", &account, &nonce.to_string(), nonce)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::TxKind;
    use rand::SeedableRng;

    #[test]
    fn load_is_reproducible_and_mixed() {
        let mut first = StdRng::seed_from_u64(7);
        let mut second = StdRng::seed_from_u64(7);
        let a: Vec<Transaction> = (0..50).map(|n| random_transaction(&mut first, n)).collect();
        let b: Vec<Transaction> = (0..50).map(|n| random_transaction(&mut second, n)).collect();
        assert_eq!(a, b);
        assert!(a.iter().any(|tx| tx.kind == TxKind::Transfer));
        assert!(a.iter().any(|tx| tx.kind == TxKind::ContractCall));
    }
}
