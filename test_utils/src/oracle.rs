use std::collections::HashSet;

use agora_common::collaborators::FinalityOracle;
use agora_common::{Block, BlockId, ProducerId};

/// Declares every block whose number is a multiple of `interval`
/// irreversible, and refuses signatures from a configurable set of producers
#[derive(Debug, Clone)]
pub struct CheckpointOracle {
    interval: u64,
    rejected_producers: HashSet<ProducerId>,
}

impl CheckpointOracle {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            rejected_producers: HashSet::new(),
        }
    }

    /// An oracle that never finalises anything
    pub fn never() -> Self {
        Self::new(0)
    }

    pub fn rejecting(mut self, producer: ProducerId) -> Self {
        self.rejected_producers.insert(producer);
        self
    }
}

impl FinalityOracle for CheckpointOracle {
    fn validate_producer_signature(&self, block: &Block) -> bool {
        !self.rejected_producers.contains(&block.header.producer)
    }

    fn is_newly_irreversible(&self, id: &BlockId) -> bool {
        self.interval != 0 && id.number > 0 && id.number % self.interval == 0
    }
}
