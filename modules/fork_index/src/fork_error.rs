//! Error types for fork index operations.

use agora_common::{BlockId, ChainError};

/// Errors returned by [`ForkIndex`](crate::ForkIndex) operations.
#[derive(Debug, thiserror::Error)]
pub enum ForkIndexError {
    /// The block's parent is neither a node nor the root.
    #[error("unlinked block: parent {parent} not in index")]
    UnlinkedBlock { parent: BlockId },

    /// The block's number does not equal parent number + 1.
    #[error("invalid block number: expected {expected}, got {got}")]
    InvalidBlockNumber { expected: u64, got: u64 },

    /// A block referenced by an operation is not in the index.
    #[error("block not in index: {id}")]
    BlockNotInIndex { id: BlockId },

    /// `ancestor` does not lie on the chain ending at `leaf`.
    #[error("{ancestor} is not an ancestor of {leaf}")]
    NotAncestor { ancestor: BlockId, leaf: BlockId },

    /// Two chains failed to meet within the maximum branch length.
    #[error("no common ancestor within {max_branch_length} blocks")]
    HardFork { max_branch_length: u64 },

    /// The root cannot be removed, only pruned past.
    #[error("cannot remove the index root {id}")]
    RemoveRoot { id: BlockId },

    /// Writing pruned blocks to durable storage failed; nothing was pruned.
    #[error("flushing pruned blocks failed: {0:#}")]
    Flush(#[source] anyhow::Error),
}

impl From<ForkIndexError> for ChainError {
    fn from(error: ForkIndexError) -> Self {
        match error {
            ForkIndexError::UnlinkedBlock { parent } => ChainError::UnlinkedBlock { parent },
            ForkIndexError::InvalidBlockNumber { .. } => ChainError::BadMessage(error.to_string()),
            ForkIndexError::HardFork { max_branch_length } => {
                ChainError::HardFork { max_branch_length }
            }
            ForkIndexError::BlockNotInIndex { .. }
            | ForkIndexError::NotAncestor { .. }
            | ForkIndexError::RemoveRoot { .. }
            | ForkIndexError::Flush(_) => ChainError::StorageCorruption(error.to_string()),
        }
    }
}
