//! The read-only slice of the chain that sync negotiation needs

use agora_common::{BlockId, BlockNumber};
use agora_module_chain_coordinator::ChainCoordinator;
use tracing::warn;

pub trait ChainView {
    fn genesis(&self) -> BlockId;
    fn head(&self) -> BlockId;
    fn solid(&self) -> BlockId;

    /// Known anywhere: canonical, side branch or durable
    fn contains(&self, id: &BlockId) -> bool;

    fn is_canonical(&self, id: &BlockId) -> bool;

    fn canonical_id_at(&self, number: BlockNumber) -> Option<BlockId>;
}

impl ChainView for ChainCoordinator {
    fn genesis(&self) -> BlockId {
        ChainCoordinator::genesis(self)
    }

    fn head(&self) -> BlockId {
        ChainCoordinator::head(self)
    }

    fn solid(&self) -> BlockId {
        ChainCoordinator::solid(self)
    }

    fn contains(&self, id: &BlockId) -> bool {
        ChainCoordinator::contains(self, id)
    }

    fn is_canonical(&self, id: &BlockId) -> bool {
        ChainCoordinator::is_canonical(self, id)
    }

    fn canonical_id_at(&self, number: BlockNumber) -> Option<BlockId> {
        match ChainCoordinator::canonical_id_at(self, number) {
            Ok(id) => id,
            Err(error) => {
                warn!(number, "could not read canonical id: {error:#}");
                None
            }
        }
    }
}
