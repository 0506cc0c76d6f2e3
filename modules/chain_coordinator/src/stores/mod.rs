use std::path::PathBuf;
use std::sync::Arc;

use agora_common::{Block, BlockHash, TxHash};
use anyhow::Result;

pub mod fjall;
pub mod memory;

/// Durable record of irreversible blocks
pub trait BlockStore: Send + Sync {
    /// Store blocks (ascending) and their transaction references in one batch
    fn insert_blocks(&self, blocks: &[Arc<Block>]) -> Result<()>;

    fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>>;
    fn get_block_by_number(&self, number: u64) -> Result<Option<Block>>;
    fn get_hash_by_number(&self, number: u64) -> Result<Option<BlockHash>>;
    fn get_latest_block(&self) -> Result<Option<Block>>;
    fn get_tx_block_ref(&self, hash: &TxHash) -> Result<Option<TxBlockReference>>;
}

/// Where a transaction sits in the stored chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TxBlockReference {
    #[n(0)]
    pub block_hash: BlockHash,
    #[n(1)]
    pub index: u64,
}

#[derive(Clone, Copy, Debug, Default, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BlockStoreBackend {
    #[default]
    Fjall,
    Memory,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockStoreConfig {
    pub backend: BlockStoreBackend,
    pub database_path: PathBuf,
    pub clear_on_start: bool,
}

impl BlockStoreConfig {
    pub fn open(&self) -> Result<Arc<dyn BlockStore>> {
        Ok(match self.backend {
            BlockStoreBackend::Fjall => Arc::new(fjall::FjallBlockStore::new(
                &self.database_path,
                self.clear_on_start,
            )?),
            BlockStoreBackend::Memory => Arc::new(memory::MemoryBlockStore::new()),
        })
    }
}
