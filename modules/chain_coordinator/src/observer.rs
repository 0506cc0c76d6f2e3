//! Observer trait for chain coordinator events.

use agora_common::{Block, BlockId, ChainError};

/// Callback receiver for chain events.
///
/// The owning process implements this to drive propagation, indexing or
/// metrics. Callbacks run under the chain lock and must not block.
pub trait ChainObserver {
    /// A block became part of the canonical chain.
    ///
    /// Called in ascending block-number order, including for every block
    /// re-applied during a branch switch.
    fn block_applied(&self, block: &Block);

    /// The canonical chain was rolled back to `to`; `abandoned` lists the
    /// blocks taken off, highest first.
    fn rolled_back(&self, to: &BlockId, abandoned: &[BlockId]);

    /// A block failed validation and was dropped with its descendants.
    fn block_rejected(&self, id: &BlockId, error: &ChainError);

    /// `id` became irreversible and was written to durable storage.
    fn solidified(&self, id: &BlockId);
}

/// Observer that ignores every event.
pub struct NoOpObserver;

impl ChainObserver for NoOpObserver {
    fn block_applied(&self, _: &Block) {}
    fn rolled_back(&self, _: &BlockId, _: &[BlockId]) {}
    fn block_rejected(&self, _: &BlockId, _: &ChainError) {}
    fn solidified(&self, _: &BlockId) {}
}
