//! Chain-level error taxonomy shared by every module

use crate::messages::DisconnectReason;
use crate::types::BlockId;
use thiserror::Error;

/// Errors surfaced by block application and peer negotiation.
///
/// Each variant tells the network layer how to treat the peer that caused it,
/// see [`ChainError::disconnect_reason`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The block's parent is neither in the fork index nor the solid block
    #[error("Block is unlinked: parent {parent} is unknown")]
    UnlinkedBlock { parent: BlockId },

    /// Protocol violation or malformed content
    #[error("Bad message: {0}")]
    BadMessage(String),

    /// The executor or the finality oracle refused the block or transaction
    #[error("Execution rejected: {0}")]
    ExecutionRejected(String),

    /// No common ancestor within the maximum branch length
    #[error("Chains diverge beyond {max_branch_length} blocks")]
    HardFork { max_branch_length: u64 },

    /// Snapshot discipline was violated or durable storage failed; block
    /// application is halted
    #[error("Storage corruption: {0}")]
    StorageCorruption(String),
}

impl ChainError {
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ChainError::UnlinkedBlock { .. } => DisconnectReason::Unlinked,
            ChainError::BadMessage(_) => DisconnectReason::BadProtocol,
            ChainError::ExecutionRejected(_) => DisconnectReason::Rejected,
            ChainError::HardFork { .. } => DisconnectReason::Diverged,
            ChainError::StorageCorruption(_) => DisconnectReason::Internal,
        }
    }

    /// Whether the sender of the offending message should be disconnected.
    /// An unlinked block only means we are behind and calls for a new chain
    /// summary exchange instead.
    pub fn penalises_peer(&self) -> bool {
        !matches!(
            self,
            ChainError::StorageCorruption(_) | ChainError::UnlinkedBlock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlockHash;
    use test_case::test_case;

    #[test_case(ChainError::UnlinkedBlock { parent: BlockId::new(BlockHash::default(), 1) } => DisconnectReason::Unlinked)]
    #[test_case(ChainError::BadMessage("x".into()) => DisconnectReason::BadProtocol)]
    #[test_case(ChainError::ExecutionRejected("x".into()) => DisconnectReason::Rejected)]
    #[test_case(ChainError::HardFork { max_branch_length: 10 } => DisconnectReason::Diverged)]
    #[test_case(ChainError::StorageCorruption("x".into()) => DisconnectReason::Internal)]
    fn maps_to_disconnect_reason(error: ChainError) -> DisconnectReason {
        error.disconnect_reason()
    }

    #[test]
    fn storage_corruption_is_not_the_peers_fault() {
        assert!(!ChainError::StorageCorruption("x".into()).penalises_peer());
        assert!(ChainError::BadMessage("x".into()).penalises_peer());
        let unlinked = ChainError::UnlinkedBlock {
            parent: BlockId::new(BlockHash::default(), 3),
        };
        assert!(!unlinked.penalises_peer());
    }
}
