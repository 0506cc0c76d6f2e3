//! Agora chain coordinator.
//!
//! Owns the canonical chain: applies incoming blocks against versioned state,
//! keeps side branches in the fork index, switches branches when a longer one
//! appears and moves the solid block forward as the finality oracle allows.
//! Every canonical block above the solid block has exactly one revocable
//! layer in the versioned store.

use std::sync::Arc;

use agora_common::collaborators::{ExecutionError, FinalityOracle, TransactionExecutor};
use agora_common::{Block, BlockId, ChainError, Receipt, StoreKind, Transaction, TxHash};
use agora_module_fork_index::ForkIndex;
use agora_module_versioned_store::stores::DurableStore;
use agora_module_versioned_store::{SnapshotHandle, StoreError, StoreReader, VersionedStore};
use anyhow::{anyhow, bail, Context, Result};
use config::Config;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn};

pub mod configuration;
pub mod observer;
pub mod pending;
pub mod stores;

use crate::configuration::CoordinatorConfig;
use crate::observer::{ChainObserver, NoOpObserver};
use crate::pending::PendingPool;
use crate::stores::BlockStore;

/// The one lock around a chain instance
pub type SharedChain = Arc<Mutex<ChainCoordinator>>;

/// Properties key holding the id of the block the state reflects
const LATEST_BLOCK_KEY: &[u8] = b"latest-block";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The block extended the head
    Extended,
    /// Stored on a branch that is not (yet) preferred
    SideBranch,
    /// The canonical chain moved to another branch
    Switched {
        ancestor: BlockId,
        abandoned: Vec<BlockId>,
    },
    AlreadyKnown,
    /// At or below the solid block; ignored
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Queued(Receipt),
    Duplicate,
    PoolFull,
}

fn corruption(error: StoreError) -> ChainError {
    ChainError::StorageCorruption(error.to_string())
}

fn execution_error(error: ExecutionError) -> ChainError {
    match error {
        ExecutionError::State(e) => ChainError::StorageCorruption(e.to_string()),
        other => ChainError::ExecutionRejected(other.to_string()),
    }
}

pub struct ChainCoordinator {
    max_clock_drift: u64,
    store: VersionedStore,
    index: ForkIndex,
    blocks: Arc<dyn BlockStore>,
    executor: Arc<dyn TransactionExecutor>,
    oracle: Arc<dyn FinalityOracle>,
    observer: Box<dyn ChainObserver + Send>,
    genesis: BlockId,
    head: BlockId,
    /// Revocable layer of each canonical block above solid, ascending
    layers: Vec<(BlockId, SnapshotHandle)>,
    pending: PendingPool,
    halted: Option<String>,
}

impl ChainCoordinator {
    /// Build a coordinator over the given stores.
    ///
    /// An empty block store starts a fresh chain from `genesis`; otherwise
    /// the chain resumes from the latest durable block, which must descend
    /// from the same genesis.
    pub fn new(
        config: &CoordinatorConfig,
        genesis: Block,
        blocks: Arc<dyn BlockStore>,
        durable: Arc<dyn DurableStore>,
        executor: Arc<dyn TransactionExecutor>,
        oracle: Arc<dyn FinalityOracle>,
    ) -> Result<Self> {
        let genesis_id = genesis.id();
        let mut store = VersionedStore::new(durable);

        let root = match blocks.get_block_by_number(0)? {
            Some(stored) => {
                if stored.id() != genesis_id {
                    bail!(
                        "block store holds genesis {} but {} was configured",
                        stored.id(),
                        genesis_id
                    );
                }
                let latest = blocks.get_latest_block()?.unwrap_or(stored);
                info!(root = %latest.id(), "Resuming chain from durable block store");
                latest
            }
            None => {
                let handle = store.push_snapshot();
                for tx in &genesis.transactions {
                    let tx_handle = store.push_snapshot();
                    executor
                        .execute(tx, &mut store)
                        .with_context(|| format!("genesis transaction {} failed", tx.id()))?;
                    store.commit(tx_handle)?;
                }
                store.put(StoreKind::Properties, LATEST_BLOCK_KEY.to_vec(), encode_id(&genesis_id))?;
                store.commit(handle)?;
                blocks.insert_blocks(&[Arc::new(genesis.clone())])?;
                info!(genesis = %genesis_id, "Starting new chain");
                genesis
            }
        };

        let root_id = root.id();
        match store.get(StoreKind::Properties, LATEST_BLOCK_KEY)? {
            Some(bytes) => {
                let marked: BlockId = minicbor::decode(&bytes)
                    .map_err(|e| anyhow!("undecodable latest-block marker: {e}"))?;
                if marked != root_id {
                    warn!(state = %marked, blocks = %root_id, "State and block store disagree on the latest block");
                }
            }
            None => warn!(blocks = %root_id, "State has no latest-block marker"),
        }

        Ok(Self {
            max_clock_drift: config.max_clock_drift,
            store,
            index: ForkIndex::new(Arc::new(root), config.max_branch_length),
            blocks,
            executor,
            oracle,
            observer: Box::new(NoOpObserver),
            genesis: genesis_id,
            head: root_id,
            layers: Vec::new(),
            pending: PendingPool::new(config.pending_pool_capacity),
            halted: None,
        })
    }

    /// Load configuration, open the configured stores and build the
    /// coordinator
    pub fn from_config(
        config: &Config,
        genesis: Block,
        executor: Arc<dyn TransactionExecutor>,
        oracle: Arc<dyn FinalityOracle>,
    ) -> Result<Self> {
        let config = CoordinatorConfig::try_load(config)?;
        let blocks = config.block_store.open().context("opening block store")?;
        let durable = config.state.open().context("opening state store")?;
        Self::new(&config, genesis, blocks, durable, executor, oracle)
    }

    pub fn with_observer(mut self, observer: Box<dyn ChainObserver + Send>) -> Self {
        self.observer = observer;
        self
    }

    pub fn shared(self) -> SharedChain {
        Arc::new(Mutex::new(self))
    }

    pub fn head(&self) -> BlockId {
        self.head
    }

    pub fn solid(&self) -> BlockId {
        self.index.root()
    }

    pub fn genesis(&self) -> BlockId {
        self.genesis
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Blocks held in the fork index, the solid block included
    pub fn fork_index_len(&self) -> usize {
        self.index.len()
    }

    pub fn fork_tips(&self) -> Vec<BlockId> {
        self.index.tips()
    }

    pub fn state_reader(&self) -> StoreReader {
        self.store.reader()
    }

    pub fn apply_block(&mut self, block: Block, now: u64) -> Result<ApplyOutcome, ChainError> {
        let span = info_span!("apply_block", block = %block.id());
        let _entered = span.enter();

        let result = self.apply(block, now);
        if let Err(ChainError::StorageCorruption(reason)) = &result {
            self.halt(reason);
        }
        result
    }

    fn apply(&mut self, block: Block, now: u64) -> Result<ApplyOutcome, ChainError> {
        self.check_halted()?;
        let id = block.id();

        if block.header.timestamp > now.saturating_add(self.max_clock_drift) {
            return Err(ChainError::BadMessage(format!(
                "timestamp {} is more than {}ms ahead of {now}",
                block.header.timestamp, self.max_clock_drift
            )));
        }
        if id.number <= self.solid().number {
            debug!("Ignoring block at or below solid");
            return Ok(ApplyOutcome::Stale);
        }
        if self.index.contains(&id) {
            return Ok(ApplyOutcome::AlreadyKnown);
        }
        if !block.merkle_root_matches() {
            return Err(ChainError::BadMessage("merkle root does not match transactions".into()));
        }
        if !self.oracle.validate_producer_signature(&block) {
            return Err(ChainError::ExecutionRejected(format!(
                "producer signature refused for {}",
                block.header.producer.short()
            )));
        }
        let parent = block.parent();
        if !self.index.contains(&parent) {
            return Err(ChainError::UnlinkedBlock { parent });
        }

        let block = Arc::new(block);
        self.index.insert(block.clone())?;

        let outcome = if parent == self.head {
            self.extend(&block)?;
            ApplyOutcome::Extended
        } else {
            let preferred = self.index.preferred_tip(&self.head);
            if preferred == self.head {
                debug!(head = %self.head, "Stored side branch block");
                ApplyOutcome::SideBranch
            } else {
                self.switch_to(preferred)?
            }
        };

        self.advance_solid()?;
        Ok(outcome)
    }

    fn extend(&mut self, block: &Arc<Block>) -> Result<(), ChainError> {
        let id = block.id();
        match self.execute_block(block) {
            Ok(handle) => {
                self.layers.push((id, handle));
                self.head = id;
                self.evict_included(block);
                self.observer.block_applied(block);
                debug!(txs = block.transactions.len(), "Extended head");
                Ok(())
            }
            Err(error) => {
                self.reject(&id, &error);
                Err(error)
            }
        }
    }

    /// Move the canonical chain to the branch ending at `target`.
    ///
    /// All-or-nothing: if any block on the new branch fails, the old chain
    /// and its layers are put back and the failing block is dropped with its
    /// descendants.
    fn switch_to(&mut self, target: BlockId) -> Result<ApplyOutcome, ChainError> {
        let ancestor = match self.index.common_ancestor(&self.head, &target) {
            Ok(ancestor) => ancestor,
            Err(error) => {
                let error = ChainError::from(error);
                self.reject(&target, &error);
                return Err(error);
            }
        };
        let mut path = self.index.path_to_ancestor(&target, &ancestor)?;
        path.reverse();

        let split_at = self
            .layers
            .iter()
            .position(|(id, _)| id.number > ancestor.number)
            .unwrap_or(self.layers.len());
        let old_layers = self.layers.split_off(split_at);
        let detached = match old_layers.first() {
            Some((_, handle)) => Some(self.store.detach(*handle).map_err(corruption)?),
            None => None,
        };
        let old_head = self.head;
        self.head = ancestor;

        let mut applied = Vec::with_capacity(path.len());
        for id in &path {
            let block = self
                .index
                .get(id)
                .map(|node| node.block.clone())
                .ok_or_else(|| ChainError::StorageCorruption(format!("{id} vanished from the fork index")))?;
            match self.execute_block(&block) {
                Ok(handle) => {
                    self.layers.push((*id, handle));
                    self.head = *id;
                    applied.push(block);
                }
                Err(error) => {
                    if let Some((_, first_new)) = self.layers.get(split_at) {
                        self.store.rollback(*first_new).map_err(corruption)?;
                    }
                    self.layers.truncate(split_at);
                    if let Some(detached) = detached {
                        self.store.restore(detached).map_err(corruption)?;
                    }
                    self.layers.extend(old_layers);
                    self.head = old_head;
                    warn!(failed = %id, head = %old_head, "Branch switch failed, kept current chain");
                    self.reject(id, &error);
                    return Err(error);
                }
            }
        }

        let abandoned: Vec<BlockId> = old_layers.iter().rev().map(|(id, _)| *id).collect();
        info!(
            ancestor = %ancestor,
            from = %old_head,
            to = %self.head,
            depth = abandoned.len(),
            "Switched branch"
        );
        self.observer.rolled_back(&ancestor, &abandoned);

        for id in &abandoned {
            if let Some(node) = self.index.get(id) {
                for tx in &node.block.transactions {
                    self.pending.insert(tx.clone());
                }
            }
        }
        for block in &applied {
            self.evict_included(block);
            self.observer.block_applied(block);
        }

        Ok(ApplyOutcome::Switched {
            ancestor,
            abandoned,
        })
    }

    /// Execute a block's transactions in a fresh layer, one nested layer per
    /// transaction. On failure the block layer is gone again.
    fn execute_block(&mut self, block: &Block) -> Result<SnapshotHandle, ChainError> {
        let handle = self.store.push_snapshot();
        match self.execute_in_layer(block) {
            Ok(()) => Ok(handle),
            Err(error) => {
                self.store.rollback(handle).map_err(corruption)?;
                Err(error)
            }
        }
    }

    fn execute_in_layer(&mut self, block: &Block) -> Result<(), ChainError> {
        for tx in &block.transactions {
            let tx_handle = self.store.push_snapshot();
            self.executor.execute(tx, &mut self.store).map_err(execution_error)?;
            self.store.commit(tx_handle).map_err(corruption)?;
        }
        self.store
            .put(StoreKind::Properties, LATEST_BLOCK_KEY.to_vec(), encode_id(&block.id()))
            .map_err(corruption)
    }

    fn evict_included(&mut self, block: &Block) {
        let included: Vec<_> = block.transactions.iter().map(|tx| tx.id()).collect();
        self.pending.evict(&included);
    }

    /// Drop a block that failed and everything built on it
    fn reject(&mut self, id: &BlockId, error: &ChainError) {
        if matches!(error, ChainError::StorageCorruption(_)) {
            return;
        }
        if let ChainError::HardFork { .. } = error {
            error!(block = %id, "Rejected block beyond the branch limit: {error}");
        } else {
            warn!(block = %id, "Rejected block: {error}");
        }
        if let Err(e) = self.index.remove_branch(id) {
            warn!(block = %id, "could not remove rejected branch: {e}");
        }
        self.observer.block_rejected(id, error);
    }

    /// Move solid up to the highest canonical block the oracle calls
    /// irreversible, flushing blocks and state below it
    fn advance_solid(&mut self) -> Result<(), ChainError> {
        let Some(position) =
            self.layers.iter().rposition(|(id, _)| self.oracle.is_newly_irreversible(id))
        else {
            return Ok(());
        };
        let (solid, handle) = self.layers[position];

        let blocks = self.blocks.clone();
        let removed = self.index.prune_below(solid.number, &self.head, |spine| {
            blocks.insert_blocks(spine)
        })?;
        self.store.solidify(handle).map_err(corruption)?;
        self.layers.drain(..=position);

        info!(solid = %solid, pruned = removed, live = self.index.len(), "Advanced solid block");
        self.observer.solidified(&solid);
        Ok(())
    }

    /// Dry-run a transaction on top of head state and queue it for inclusion
    pub fn validate_transaction(&mut self, tx: Transaction) -> Result<TxOutcome, ChainError> {
        let result = self.dry_run(tx);
        if let Err(ChainError::StorageCorruption(reason)) = &result {
            self.halt(reason);
        }
        result
    }

    fn dry_run(&mut self, tx: Transaction) -> Result<TxOutcome, ChainError> {
        self.check_halted()?;
        let id = tx.id();
        if self.pending.contains(&id) || self.included_since_solid(&id) {
            return Ok(TxOutcome::Duplicate);
        }
        let included = self
            .blocks
            .get_tx_block_ref(&id)
            .map_err(|e| ChainError::StorageCorruption(format!("{e:#}")))?;
        if included.is_some() {
            return Ok(TxOutcome::Duplicate);
        }
        if self.pending.is_full() {
            return Ok(TxOutcome::PoolFull);
        }

        let handle = self.store.push_snapshot();
        let result = self.executor.execute(&tx, &mut self.store);
        self.store.rollback(handle).map_err(corruption)?;

        let receipt = result.map_err(execution_error)?;
        self.pending.insert(tx);
        Ok(TxOutcome::Queued(receipt))
    }

    /// Is the transaction pending or already on the canonical chain?
    pub fn knows_transaction(&self, id: &TxHash) -> bool {
        if self.pending.contains(id) || self.included_since_solid(id) {
            return true;
        }
        match self.blocks.get_tx_block_ref(id) {
            Ok(found) => found.is_some(),
            Err(error) => {
                warn!("could not read block store: {error:#}");
                false
            }
        }
    }

    fn included_since_solid(&self, id: &TxHash) -> bool {
        self.layers
            .iter()
            .filter_map(|(block, _)| self.index.get(block))
            .any(|node| node.block.transactions.iter().any(|tx| tx.id() == *id))
    }

    /// Transactions waiting for a block, oldest first
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending.transactions()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        if self.index.contains(id) {
            return true;
        }
        id.number <= self.solid().number && self.durable_hash_is(id)
    }

    /// Is `id` on the canonical chain?
    pub fn is_canonical(&self, id: &BlockId) -> bool {
        if id.number > self.solid().number {
            return self.index.chain_contains(id, &self.head);
        }
        self.durable_hash_is(id)
    }

    /// Canonical block id at `number`
    pub fn canonical_id_at(&self, number: u64) -> Result<Option<BlockId>> {
        if number > self.head.number {
            return Ok(None);
        }
        if number >= self.solid().number {
            return Ok(self.index.ancestor_at(&self.head, number));
        }
        Ok(self.blocks.get_hash_by_number(number)?.map(|hash| BlockId::new(hash, number)))
    }

    pub fn block_by_id(&self, id: &BlockId) -> Result<Option<Block>> {
        if let Some(node) = self.index.get(id) {
            return Ok(Some(Block::clone(&node.block)));
        }
        Ok(self.blocks.get_block_by_hash(&id.hash)?.filter(|block| block.number() == id.number))
    }

    /// Canonical block at `number`
    pub fn block_by_num(&self, number: u64) -> Result<Option<Block>> {
        match self.canonical_id_at(number)? {
            Some(id) if number >= self.solid().number => self.block_by_id(&id),
            Some(_) => self.blocks.get_block_by_number(number),
            None => Ok(None),
        }
    }

    fn durable_hash_is(&self, id: &BlockId) -> bool {
        match self.blocks.get_hash_by_number(id.number) {
            Ok(hash) => hash == Some(id.hash),
            Err(error) => {
                warn!("could not read block store: {error:#}");
                false
            }
        }
    }

    fn check_halted(&self) -> Result<(), ChainError> {
        match &self.halted {
            Some(reason) => Err(ChainError::StorageCorruption(format!("chain halted: {reason}"))),
            None => Ok(()),
        }
    }

    fn halt(&mut self, reason: &str) {
        if self.halted.is_none() {
            error!(head = %self.head, solid = %self.solid(), "Halting block application: {reason}");
            self.halted = Some(reason.to_string());
        }
    }
}

fn encode_id(id: &BlockId) -> Vec<u8> {
    minicbor::to_vec(id).expect("infallible")
}
