//! Shared setup for chain coordinator integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use agora_common::{Block, StoreKind};
use agora_module_chain_coordinator::configuration::CoordinatorConfig;
use agora_module_chain_coordinator::stores::memory::MemoryBlockStore;
use agora_module_chain_coordinator::{ApplyOutcome, ChainCoordinator};
use agora_module_versioned_store::stores::memory::MemoryDurableStore;
use agora_test_utils::{genesis, ledger::decode_balance, now_after, CheckpointOracle, LedgerExecutor};
use config::Config;

pub fn memory_chain(oracle: CheckpointOracle) -> ChainCoordinator {
    memory_chain_with(&Config::default(), oracle)
}

/// In-memory chain with `overrides` over the coordinator defaults
pub fn memory_chain_with(overrides: &Config, oracle: CheckpointOracle) -> ChainCoordinator {
    let config = CoordinatorConfig::try_load(overrides).unwrap();
    ChainCoordinator::new(
        &config,
        genesis(),
        Arc::new(MemoryBlockStore::new()),
        Arc::new(MemoryDurableStore::new()),
        Arc::new(LedgerExecutor::new()),
        Arc::new(oracle),
    )
    .unwrap()
}

pub fn apply_all(chain: &mut ChainCoordinator, blocks: &[Block]) -> Vec<ApplyOutcome> {
    blocks
        .iter()
        .map(|block| chain.apply_block(block.clone(), now_after(block)).unwrap())
        .collect()
}

pub fn balance(chain: &ChainCoordinator, account: &str) -> u64 {
    decode_balance(chain.state_reader().get(StoreKind::Account, account.as_bytes()).unwrap())
}
