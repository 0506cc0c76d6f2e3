use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use agora_common::messages::{DisconnectReason, InventoryItem, PeerMessage};
use agora_common::peer::{NetworkEvent, PeerConnection, PeerId};
use agora_common::{Block, BlockId, ChainError, ProducerId, Transaction, TxHash};
use agora_module_chain_coordinator::{ApplyOutcome, ChainCoordinator, SharedChain};
use agora_module_propagation::PropagationService;
use agora_module_tx_ingest::TxIngestPipeline;
use anyhow::{bail, Result};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::configuration::InterfaceConfig;
use crate::fetch::FetchScheduler;
use crate::sync::{SyncError, SyncNegotiator, SyncStep};

/// Requests from the node that owns this manager
#[derive(Debug)]
pub enum NodeCommand {
    /// A transaction submitted locally
    SubmitTransaction(Transaction),
    /// A block this node produced; applied and relayed
    PublishBlock(Block),
}

struct PeerData {
    connection: PeerConnection,
}

impl PeerData {
    fn new(connection: PeerConnection) -> Self {
        Self { connection }
    }

    fn send(&self, message: PeerMessage) -> bool {
        let name = message.name();
        match self.connection.send(message) {
            Ok(()) => true,
            Err(error) => {
                warn!("could not send {name} to {}: {error:#}", self.connection.id);
                false
            }
        }
    }

    fn request_summary(&self, summary: Vec<BlockId>) {
        self.send(PeerMessage::ChainSummaryRequest { summary });
    }
}

/// One node's network event loop. Owns the per-peer sync and fetch state and
/// is the only writer of blocks into the chain.
pub struct NetworkManager {
    config: InterfaceConfig,
    chain: SharedChain,
    propagation: Arc<PropagationService>,
    ingest: TxIngestPipeline,
    sync: SyncNegotiator,
    fetch: FetchScheduler,
    peers: BTreeMap<PeerId, PeerData>,
    /// Blocks at most one past our head that peers announced, and who has them
    announcements: BTreeMap<BlockId, BTreeSet<PeerId>>,
    events: mpsc::Receiver<NetworkEvent>,
    commands: mpsc::Receiver<NodeCommand>,
    producer: Option<ProducerId>,
}

impl NetworkManager {
    pub fn new(
        config: InterfaceConfig,
        chain: SharedChain,
        propagation: Arc<PropagationService>,
        ingest: TxIngestPipeline,
        events: mpsc::Receiver<NetworkEvent>,
        commands: mpsc::Receiver<NodeCommand>,
        producer: Option<ProducerId>,
    ) -> Self {
        Self {
            sync: SyncNegotiator::new(config.sync.clone()),
            fetch: FetchScheduler::new(&config.fetch),
            config,
            chain,
            propagation,
            ingest,
            peers: BTreeMap::new(),
            announcements: BTreeMap::new(),
            events,
            commands,
            producer,
        }
    }

    /// Run until the command channel closes. Fails only when block
    /// application halts.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_network_event(event).await?,
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await?,
                    None => break,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        info!(peers = self.peers.len(), "Network manager stopped");
        Ok(())
    }

    // Implementation note: nothing here awaits while holding the chain lock,
    // and peer sends never wait. The validator tasks take the same lock and
    // write to our event queue, so either would risk a deadlock.
    async fn on_network_event(&mut self, event: NetworkEvent) -> Result<()> {
        match event {
            NetworkEvent::Connected { peer, connection } => {
                self.handle_new_connection(peer, connection).await;
            }
            NetworkEvent::Message { peer, message } => {
                if !self.peers.contains_key(&peer) {
                    debug!(%peer, "Ignoring {} from unknown peer", message.name());
                    return Ok(());
                }
                if let Err(error) = self.handle_message(peer, message).await {
                    self.on_peer_error(peer, error).await?;
                }
            }
            NetworkEvent::Disconnected { peer } => {
                self.handle_disconnect(peer);
            }
            NetworkEvent::Penalise { peer, reason } => {
                self.disconnect(peer, reason);
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, command: NodeCommand) -> Result<()> {
        match command {
            NodeCommand::SubmitTransaction(tx) => {
                let report = self.ingest.submit(tx, Instant::now());
                debug!(?report, "Submitted transaction");
            }
            NodeCommand::PublishBlock(block) => {
                let id = block.id();
                if let Err(error) = self.apply_and_relay(block, None, true).await {
                    if let ChainError::StorageCorruption(_) = error {
                        error!(block = %id, "{error}");
                        bail!("block application halted: {error}");
                    }
                    warn!(block = %id, "Own block refused: {error}");
                }
                self.on_chain_advanced().await;
            }
        }
        Ok(())
    }

    async fn handle_new_connection(&mut self, peer: PeerId, connection: PeerConnection) {
        let data = PeerData::new(connection.clone());
        self.propagation.register(peer, connection);
        let handshake = {
            let chain = self.chain.lock().await;
            PeerMessage::Handshake {
                genesis: chain.genesis(),
                head: chain.head(),
                solid: chain.solid(),
                producer: self.producer,
            }
        };
        data.send(handshake);
        self.peers.insert(peer, data);
        debug!(%peer, "Connected");
    }

    async fn handle_message(&mut self, peer: PeerId, message: PeerMessage) -> Result<(), ChainError> {
        let opening = matches!(
            message,
            PeerMessage::Handshake { .. } | PeerMessage::Disconnect { .. }
        );
        if !opening && !self.sync.is_known(peer) {
            return Err(SyncError::NoHandshake.into());
        }

        let chain = self.chain.clone();
        match message {
            PeerMessage::Handshake {
                genesis,
                head,
                producer,
                ..
            } => {
                let summary = {
                    let chain = chain.lock().await;
                    self.sync.on_handshake(peer, &*chain, genesis, head)?
                };
                self.propagation.set_producer(peer, producer);
                if let Some(summary) = summary {
                    self.send(peer, PeerMessage::ChainSummaryRequest { summary });
                }
            }
            PeerMessage::ChainSummaryRequest { summary } => {
                let (ids, remaining) = {
                    let chain = chain.lock().await;
                    self.sync.on_summary_request(peer, &*chain, &summary)?
                };
                self.send(peer, PeerMessage::ChainSummaryReply { ids, remaining });
            }
            PeerMessage::ChainSummaryReply { ids, remaining } => {
                let step = {
                    let chain = chain.lock().await;
                    self.sync.on_summary_reply(peer, &*chain, ids, remaining)?
                };
                match step {
                    SyncStep::RequestSummary(summary) => {
                        self.send(peer, PeerMessage::ChainSummaryRequest { summary });
                    }
                    SyncStep::Fetch => self.schedule_fetch(Instant::now()).await,
                    SyncStep::InSync => debug!(%peer, "In sync"),
                }
            }
            PeerMessage::Inventory { items } => {
                self.handle_inventory(peer, items).await?;
            }
            PeerMessage::FetchBlocks { ids } => {
                self.serve_blocks(peer, ids).await;
            }
            PeerMessage::FetchTransactions { ids } => {
                self.serve_transactions(peer, ids).await;
            }
            PeerMessage::Blocks { blocks } => {
                self.handle_blocks(peer, blocks).await?;
            }
            PeerMessage::Transactions { transactions } => {
                self.ingest.on_transactions(peer, transactions, Instant::now())?;
            }
            PeerMessage::Disconnect { reason } => {
                info!(%peer, %reason, "Peer disconnected us");
                self.handle_disconnect(peer);
            }
        }
        Ok(())
    }

    async fn handle_inventory(
        &mut self,
        peer: PeerId,
        items: Vec<InventoryItem>,
    ) -> Result<(), ChainError> {
        let now = Instant::now();
        let chain = self.chain.clone();
        let mut transactions = Vec::new();
        let mut fetch_now = false;
        {
            let chain = chain.lock().await;
            let wanted = self.propagation.on_inventory(peer, &items, now, |item| match item {
                InventoryItem::Block(id) => chain.contains(id),
                InventoryItem::Transaction(id) => chain.knows_transaction(id),
            });
            let head = chain.head().number;
            for item in wanted {
                match item {
                    InventoryItem::Block(id) if id.number <= head + 1 => {
                        self.announcements.entry(id).or_default().insert(peer);
                        fetch_now = true;
                    }
                    InventoryItem::Block(id) => {
                        if let Some(summary) = self.sync.note_head(peer, &*chain, id)? {
                            self.send(peer, PeerMessage::ChainSummaryRequest { summary });
                        }
                    }
                    InventoryItem::Transaction(id) => transactions.push(id),
                }
            }
        }

        if !transactions.is_empty() && self.ingest.is_busy() {
            debug!(%peer, count = transactions.len(), "Validators busy, not fetching transactions");
        }
        let fresh: Vec<TxHash> = self.ingest.fetchable(&transactions, now);
        if !fresh.is_empty() {
            self.ingest.record_request(peer, &fresh);
            self.send(peer, PeerMessage::FetchTransactions { ids: fresh });
        }
        if fetch_now {
            self.schedule_fetch(now).await;
        }
        Ok(())
    }

    async fn serve_blocks(&mut self, peer: PeerId, ids: Vec<BlockId>) {
        let items: Vec<InventoryItem> = ids.into_iter().map(InventoryItem::Block).collect();
        let response = self.propagation.on_fetch_request(peer, &items, Instant::now());
        let mut blocks = response.blocks;
        if !response.missing.is_empty() {
            let chain = self.chain.lock().await;
            for item in response.missing {
                let InventoryItem::Block(id) = item else {
                    continue;
                };
                match chain.block_by_id(&id) {
                    Ok(Some(block)) => blocks.push(block),
                    Ok(None) => debug!(%peer, block = %id, "Requested block is unknown"),
                    Err(error) => warn!(block = %id, "could not read block: {error:#}"),
                }
            }
        }
        if !blocks.is_empty() {
            blocks.sort_by_key(Block::number);
            self.send(peer, PeerMessage::Blocks { blocks });
        }
    }

    async fn serve_transactions(&mut self, peer: PeerId, ids: Vec<TxHash>) {
        let items: Vec<InventoryItem> = ids.into_iter().map(InventoryItem::Transaction).collect();
        let response = self.propagation.on_fetch_request(peer, &items, Instant::now());
        let mut transactions = response.transactions;
        if !response.missing.is_empty() {
            let pending = self.chain.lock().await.pending_transactions();
            let missing: BTreeSet<TxHash> = response.missing.iter().map(InventoryItem::hash).collect();
            transactions.extend(pending.into_iter().filter(|tx| missing.contains(&tx.id())));
        }
        if !transactions.is_empty() {
            self.send(peer, PeerMessage::Transactions { transactions });
        }
    }

    async fn handle_blocks(&mut self, peer: PeerId, blocks: Vec<Block>) -> Result<(), ChainError> {
        if blocks.is_empty() {
            return Err(ChainError::BadMessage("empty block batch".into()));
        }
        for block in blocks {
            let id = block.id();
            if !self.fetch.on_delivered(peer, id, Instant::now()) {
                debug!(%peer, block = %id, "Block outside the live fetch");
            }
            self.announcements.remove(&id);
            let relay = !self.sync.is_behind(id.number);
            self.apply_and_relay(block, Some(peer), relay).await?;
        }
        self.on_chain_advanced().await;
        self.schedule_fetch(Instant::now()).await;
        Ok(())
    }

    /// Apply `block`; when it lands on the canonical chain and `relay` is set,
    /// pass it on
    async fn apply_and_relay(
        &mut self,
        block: Block,
        origin: Option<PeerId>,
        relay: bool,
    ) -> Result<(), ChainError> {
        let outcome = {
            let mut chain = self.chain.lock().await;
            chain.apply_block(block.clone(), unix_millis())?
        };
        match outcome {
            ApplyOutcome::Extended | ApplyOutcome::Switched { .. } if relay => {
                self.propagation.broadcast_block(&block, origin, Instant::now());
            }
            ApplyOutcome::Extended | ApplyOutcome::Switched { .. } => {
                debug!(block = %block.id(), "Catching up, not relaying");
            }
            ApplyOutcome::SideBranch | ApplyOutcome::AlreadyKnown | ApplyOutcome::Stale => {}
        }
        Ok(())
    }

    /// Drop what the chain now holds from the backlogs and announcements,
    /// and restart negotiation with peers whose backlog ran dry
    async fn on_chain_advanced(&mut self) {
        let chain = self.chain.clone();
        let requests = {
            let chain = chain.lock().await;
            let solid = chain.solid().number;
            self.announcements.retain(|id, _| id.number > solid && !chain.contains(id));
            self.sync.on_chain_advanced(&*chain)
        };
        for (peer, summary) in requests {
            if let Some(data) = self.peers.get(&peer) {
                data.request_summary(summary);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.propagation.expire(now);
        self.schedule_fetch(now).await;
    }

    async fn schedule_fetch(&mut self, now: Instant) {
        let needed = {
            let chain = self.chain.clone();
            let chain = chain.lock().await;
            self.next_needed(&chain)
        };
        let needed = needed.as_ref().map(|(id, holders)| (*id, holders.as_slice()));
        let Some(request) = self.fetch.tick(needed, now) else {
            return;
        };
        if let Some(previous) = request.replaces {
            debug!(block = %request.id, from = %previous, to = %request.peer, "Reassigned fetch");
        }
        self.send(request.peer, PeerMessage::FetchBlocks { ids: vec![request.id] });
    }

    /// The next block to fetch: the lowest backlog entry we lack, else the
    /// lowest announced block that could extend our head
    fn next_needed(&self, chain: &ChainCoordinator) -> Option<(BlockId, Vec<PeerId>)> {
        if let Some(needed) = self.sync.next_needed(chain) {
            return Some(needed);
        }
        let head = chain.head().number;
        self.announcements
            .iter()
            .find(|(id, _)| id.number <= head + 1 && !chain.contains(id))
            .map(|(id, peers)| (*id, peers.iter().copied().collect()))
    }

    async fn on_peer_error(&mut self, peer: PeerId, error: ChainError) -> Result<()> {
        match error {
            ChainError::StorageCorruption(_) => {
                error!(%peer, "{error}");
                bail!("block application halted: {error}");
            }
            ChainError::UnlinkedBlock { parent } => {
                debug!(%peer, %parent, "Unlinked block, renegotiating");
                let chain = self.chain.clone();
                let summary = {
                    let chain = chain.lock().await;
                    self.sync.request_summary(peer, &*chain)
                };
                if let Some(summary) = summary {
                    self.send(peer, PeerMessage::ChainSummaryRequest { summary });
                }
            }
            ChainError::HardFork { .. } => {
                error!(%peer, "{error}");
                self.disconnect(peer, error.disconnect_reason());
            }
            error => {
                warn!(%peer, "{error}");
                self.disconnect(peer, error.disconnect_reason());
            }
        }
        Ok(())
    }

    fn send(&self, peer: PeerId, message: PeerMessage) {
        if let Some(data) = self.peers.get(&peer) {
            data.send(message);
        }
    }

    fn disconnect(&mut self, peer: PeerId, reason: DisconnectReason) {
        if let Some(data) = self.peers.get(&peer) {
            info!(%peer, %reason, "Disconnecting peer");
            if let Err(error) = data.connection.disconnect(reason) {
                debug!(%peer, "could not send disconnect: {error}");
            }
        }
        self.handle_disconnect(peer);
    }

    fn handle_disconnect(&mut self, peer: PeerId) {
        if self.peers.remove(&peer).is_none() {
            return;
        }
        self.sync.on_disconnect(peer);
        self.fetch.on_disconnect(peer);
        self.propagation.unregister(peer);
        self.ingest.on_disconnect(peer);
        self.announcements.retain(|_, holders| {
            holders.remove(&peer);
            !holders.is_empty()
        });
        info!(%peer, "Peer gone");
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
