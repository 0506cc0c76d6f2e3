use std::{fs, path::Path, sync::Arc};

use agora_common::{Block, BlockHash, TxHash};
use anyhow::Result;
use fjall::{Database, Keyspace, OwnedWriteBatch, PersistMode};
use tracing::info;

use crate::stores::TxBlockReference;

pub struct FjallBlockStore {
    database: Database,
    blocks: BlockKeyspaces,
    txs: TxKeyspace,
}

const BLOCKS_KEYSPACE: &str = "blocks";
const BLOCK_HASHES_BY_NUMBER_KEYSPACE: &str = "block-hashes-by-number";
const TXS_KEYSPACE: &str = "txs";

impl FjallBlockStore {
    pub fn new(path: &Path, clear: bool) -> Result<Self> {
        info!("Storing blocks with Fjall on disk ({})", path.display());
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;
        let blocks = BlockKeyspaces::new(&database)?;
        let txs = TxKeyspace::new(&database)?;

        Ok(Self {
            database,
            blocks,
            txs,
        })
    }
}

impl super::BlockStore for FjallBlockStore {
    fn insert_blocks(&self, blocks: &[Arc<Block>]) -> Result<()> {
        let mut batch = self.database.batch();
        for block in blocks {
            let hash = block.id().hash;
            self.blocks.insert(&mut batch, hash, block);
            for (index, tx) in block.transactions.iter().enumerate() {
                let block_ref = TxBlockReference {
                    block_hash: hash,
                    index: index as u64,
                };
                self.txs.insert_tx(&mut batch, tx.id(), block_ref);
            }
        }
        batch.commit()?;
        self.database.persist(PersistMode::Buffer)?;
        Ok(())
    }

    fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        self.blocks.get_by_hash(hash.as_ref())
    }

    fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        self.blocks.get_by_number(number)
    }

    fn get_hash_by_number(&self, number: u64) -> Result<Option<BlockHash>> {
        self.blocks.get_hash_by_number(number)
    }

    fn get_latest_block(&self) -> Result<Option<Block>> {
        self.blocks.get_latest()
    }

    fn get_tx_block_ref(&self, hash: &TxHash) -> Result<Option<TxBlockReference>> {
        self.txs.get_by_hash(hash.as_ref())
    }
}

struct BlockKeyspaces {
    blocks: Keyspace,
    block_hashes_by_number: Keyspace,
}

impl BlockKeyspaces {
    fn new(database: &Database) -> Result<Self> {
        let blocks = database.keyspace(BLOCKS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let block_hashes_by_number = database.keyspace(
            BLOCK_HASHES_BY_NUMBER_KEYSPACE,
            fjall::KeyspaceCreateOptions::default,
        )?;

        Ok(Self {
            blocks,
            block_hashes_by_number,
        })
    }

    fn insert(&self, batch: &mut OwnedWriteBatch, hash: BlockHash, block: &Block) {
        let encoded = minicbor::to_vec(block).expect("infallible");
        batch.insert(&self.blocks, *hash, encoded);
        batch.insert(
            &self.block_hashes_by_number,
            block.number().to_be_bytes(),
            *hash,
        );
    }

    fn get_by_hash(&self, hash: &[u8]) -> Result<Option<Block>> {
        let Some(block) = self.blocks.get(hash)? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&block)?))
    }

    fn get_hash_by_number(&self, number: u64) -> Result<Option<BlockHash>> {
        let Some(hash) = self.block_hashes_by_number.get(number.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(BlockHash::try_from(&hash[..])?))
    }

    fn get_by_number(&self, number: u64) -> Result<Option<Block>> {
        let Some(hash) = self.block_hashes_by_number.get(number.to_be_bytes())? else {
            return Ok(None);
        };
        self.get_by_hash(&hash)
    }

    fn get_latest(&self) -> Result<Option<Block>> {
        let Some(res) = self.block_hashes_by_number.last_key_value() else {
            return Ok(None);
        };
        let hash = res.value()?;
        self.get_by_hash(&hash)
    }
}

struct TxKeyspace {
    txs: Keyspace,
}

impl TxKeyspace {
    fn new(database: &Database) -> Result<Self> {
        let txs = database.keyspace(TXS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        Ok(Self { txs })
    }

    fn insert_tx(&self, batch: &mut OwnedWriteBatch, hash: TxHash, block_ref: TxBlockReference) {
        let bytes = minicbor::to_vec(block_ref).expect("infallible");
        batch.insert(&self.txs, hash.as_ref(), bytes);
    }

    fn get_by_hash(&self, hash: &[u8]) -> Result<Option<TxBlockReference>> {
        let Some(block_ref) = self.txs.get(hash)? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&block_ref)?))
    }
}
