use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use agora_common::{Block, BlockHash, TxHash};
use anyhow::{anyhow, bail, Result};

use crate::stores::TxBlockReference;

#[derive(Default)]
struct Tables {
    blocks: HashMap<BlockHash, Block>,
    hashes_by_number: BTreeMap<u64, BlockHash>,
    txs: HashMap<TxHash, TxBlockReference>,
}

/// Block store held in memory, for tests and throw-away nodes
#[derive(Default)]
pub struct MemoryBlockStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("block store lock poisoned"))
    }
}

impl super::BlockStore for MemoryBlockStore {
    fn insert_blocks(&self, blocks: &[Arc<Block>]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory block store is refusing writes");
        }
        let mut tables = self.tables.write().map_err(|_| anyhow!("block store lock poisoned"))?;
        for block in blocks {
            let id = block.id();
            for (index, tx) in block.transactions.iter().enumerate() {
                tables.txs.insert(
                    tx.id(),
                    TxBlockReference {
                        block_hash: id.hash,
                        index: index as u64,
                    },
                );
            }
            tables.hashes_by_number.insert(id.number, id.hash);
            tables.blocks.insert(id.hash, Block::clone(block));
        }
        Ok(())
    }

    fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        Ok(self.read()?.blocks.get(hash).cloned())
    }

    fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let tables = self.read()?;
        Ok(tables.hashes_by_number.get(&number).and_then(|hash| tables.blocks.get(hash)).cloned())
    }

    fn get_hash_by_number(&self, number: u64) -> Result<Option<BlockHash>> {
        Ok(self.read()?.hashes_by_number.get(&number).copied())
    }

    fn get_latest_block(&self) -> Result<Option<Block>> {
        let tables = self.read()?;
        Ok(tables
            .hashes_by_number
            .last_key_value()
            .and_then(|(_, hash)| tables.blocks.get(hash))
            .cloned())
    }

    fn get_tx_block_ref(&self, hash: &TxHash) -> Result<Option<TxBlockReference>> {
        Ok(self.read()?.txs.get(hash).copied())
    }
}
