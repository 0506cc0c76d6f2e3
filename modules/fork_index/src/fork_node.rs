//! Block representation within the fork index.

use std::sync::Arc;

use agora_common::{Block, BlockHash, BlockId};

/// A node of the fork index: one not yet irreversible block, or the root.
#[derive(Debug, Clone)]
pub struct ForkNode {
    /// Identity of the block.
    pub id: BlockId,
    /// The block itself, shared with callers.
    pub block: Arc<Block>,
    /// Parent block hash; `None` for the root.
    pub parent: Option<BlockHash>,
    /// Child block hashes.
    pub children: Vec<BlockHash>,
}

impl ForkNode {
    pub fn new(block: Arc<Block>, parent: Option<BlockHash>) -> Self {
        Self {
            id: block.id(),
            block,
            parent,
            children: Vec::new(),
        }
    }

    pub fn number(&self) -> u64 {
        self.id.number
    }
}
