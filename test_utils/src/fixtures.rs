//! Block and transaction builders

use agora_common::{Block, ProducerId, Transaction};

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000_000;

/// Milliseconds between consecutive built blocks
pub const BLOCK_INTERVAL: u64 = 1_000;

pub fn producer(n: u8) -> ProducerId {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    ProducerId::new(bytes)
}

pub fn genesis() -> Block {
    Block::genesis(GENESIS_TIMESTAMP, producer(0))
}

/// Empty block on top of `parent`. Different `salt`s give different sibling
/// hashes, so forks can be built from the same parent.
pub fn child(parent: &Block, salt: u8) -> Block {
    child_with_txs(parent, salt, Vec::new())
}

pub fn child_with_txs(parent: &Block, salt: u8, transactions: Vec<Transaction>) -> Block {
    Block::new(
        parent.id(),
        parent.header.timestamp + BLOCK_INTERVAL,
        producer(salt),
        vec![salt],
        transactions,
    )
}

/// `length` empty blocks extending `parent`, in ascending order
pub fn build_chain(parent: &Block, length: usize, salt: u8) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(length);
    for _ in 0..length {
        let next = child(blocks.last().unwrap_or(parent), salt);
        blocks.push(next);
    }
    blocks
}

/// Genesis followed by `length` blocks
pub fn build_chain_from_genesis(length: usize, salt: u8) -> (Block, Vec<Block>) {
    let genesis = genesis();
    let chain = build_chain(&genesis, length, salt);
    (genesis, chain)
}

/// Wall-clock time just after `block` was produced
pub fn now_after(block: &Block) -> u64 {
    block.header.timestamp + 1
}
