//! Agora propagation service.
//!
//! New blocks go in full to the peers of the next few scheduled producers and
//! as an inventory announcement to everyone else. Transactions are only ever
//! announced; payloads travel on explicit fetch requests. Peers known to have
//! an item are skipped either way.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use agora_common::collaborators::ProducerSchedule;
use agora_common::messages::{InventoryItem, ItemType, PeerMessage};
use agora_common::peer::{PeerConnection, PeerId, SendError};
use agora_common::{Block, BlockHash, ProducerId, Transaction, TxHash};
use dashmap::DashMap;
use tracing::{debug, warn};

pub mod configuration;
pub mod inventory;

use crate::configuration::PropagationConfig;
use crate::inventory::InventoryCache;

struct PeerEntry {
    connection: PeerConnection,
    producer: Option<ProducerId>,
}

/// Bounded cache of recently seen payloads, oldest evicted first
struct RecentItems {
    blocks: HashMap<BlockHash, Block>,
    transactions: HashMap<TxHash, Transaction>,
    order: VecDeque<InventoryItem>,
    capacity: usize,
}

impl RecentItems {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            transactions: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert_block(&mut self, block: &Block) {
        let id = block.id();
        if self.blocks.insert(id.hash, block.clone()).is_none() {
            self.order.push_back(InventoryItem::Block(id));
            self.trim();
        }
    }

    fn insert_transaction(&mut self, tx: &Transaction) {
        let id = tx.id();
        if self.transactions.insert(id, tx.clone()).is_none() {
            self.order.push_back(InventoryItem::Transaction(id));
            self.trim();
        }
    }

    fn contains(&self, item: &InventoryItem) -> bool {
        match item {
            InventoryItem::Block(id) => self.blocks.contains_key(&id.hash),
            InventoryItem::Transaction(id) => self.transactions.contains_key(id),
        }
    }

    fn trim(&mut self) {
        while self.order.len() > self.capacity {
            match self.order.pop_front() {
                Some(InventoryItem::Block(id)) => {
                    self.blocks.remove(&id.hash);
                }
                Some(InventoryItem::Transaction(id)) => {
                    self.transactions.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Which peers a broadcast reached, and how
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sent the full payload
    pub full: Vec<PeerId>,
    /// Sent an inventory announcement
    pub announced: Vec<PeerId>,
    /// Outbound buffer full; nothing sent
    pub dropped: Vec<PeerId>,
}

impl BroadcastReport {
    fn sort(&mut self) {
        self.full.sort();
        self.announced.sort();
        self.dropped.sort();
    }
}

/// Payloads found for a fetch request
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    /// Not in the recent cache
    pub missing: Vec<InventoryItem>,
}

pub struct PropagationService {
    config: PropagationConfig,
    schedule: Arc<dyn ProducerSchedule>,
    peers: DashMap<PeerId, PeerEntry>,
    inventory: InventoryCache,
    recent: Mutex<RecentItems>,
}

impl PropagationService {
    pub fn new(config: PropagationConfig, schedule: Arc<dyn ProducerSchedule>) -> Self {
        let inventory = InventoryCache::new(config.inventory_expiry(), config.inventory_capacity);
        let recent = Mutex::new(RecentItems::new(config.recent_item_capacity));
        Self {
            config,
            schedule,
            peers: DashMap::new(),
            inventory,
            recent,
        }
    }

    pub fn register(&self, peer: PeerId, connection: PeerConnection) {
        self.peers.insert(
            peer,
            PeerEntry {
                connection,
                producer: None,
            },
        );
    }

    /// Note which producer a peer speaks for, from its handshake
    pub fn set_producer(&self, peer: PeerId, producer: Option<ProducerId>) {
        if let Some(mut entry) = self.peers.get_mut(&peer) {
            entry.producer = producer;
        }
    }

    pub fn unregister(&self, peer: PeerId) {
        self.peers.remove(&peer);
        self.inventory.forget_peer(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn knows(&self, peer: PeerId, item: &InventoryItem) -> bool {
        self.inventory.knows(peer, &item.hash())
    }

    /// Relay a block we just produced or accepted
    pub fn broadcast_block(
        &self,
        block: &Block,
        origin: Option<PeerId>,
        now: Instant,
    ) -> BroadcastReport {
        let id = block.id();
        let item = InventoryItem::Block(id);
        self.recent().insert_block(block);
        if let Some(origin) = origin {
            self.inventory.record(origin, id.hash, ItemType::Block, now);
        }

        let fast_forward = self.schedule.upcoming(&block.header.producer, self.config.fast_forward_count);
        let mut report = BroadcastReport::default();
        for entry in self.peers.iter() {
            let peer = *entry.key();
            if self.inventory.knows(peer, &id.hash) {
                continue;
            }
            let full = entry.producer.is_some_and(|p| fast_forward.contains(&p));
            let message = if full {
                PeerMessage::Blocks {
                    blocks: vec![block.clone()],
                }
            } else {
                PeerMessage::Inventory { items: vec![item] }
            };
            match self.send(&entry.connection, message) {
                Ok(()) => {
                    self.inventory.record(peer, id.hash, ItemType::Block, now);
                    if full {
                        report.full.push(peer);
                    } else {
                        report.announced.push(peer);
                    }
                }
                Err(_) => report.dropped.push(peer),
            }
        }
        report.sort();
        debug!(
            block = %id,
            full = report.full.len(),
            announced = report.announced.len(),
            "Broadcast block"
        );
        report
    }

    /// Announce a transaction we accepted
    pub fn broadcast_transaction(
        &self,
        tx: &Transaction,
        origin: Option<PeerId>,
        now: Instant,
    ) -> BroadcastReport {
        let id = tx.id();
        self.recent().insert_transaction(tx);
        if let Some(origin) = origin {
            self.inventory.record(origin, id, ItemType::Transaction, now);
        }

        let mut report = BroadcastReport::default();
        for entry in self.peers.iter() {
            let peer = *entry.key();
            if self.inventory.knows(peer, &id) {
                continue;
            }
            let message = PeerMessage::Inventory {
                items: vec![InventoryItem::Transaction(id)],
            };
            match self.send(&entry.connection, message) {
                Ok(()) => {
                    self.inventory.record(peer, id, ItemType::Transaction, now);
                    report.announced.push(peer);
                }
                Err(_) => report.dropped.push(peer),
            }
        }
        report.sort();
        report
    }

    /// Record what a peer announced; returns the items we still need.
    ///
    /// `have` tells whether the item is already known outside this service,
    /// e.g. in the chain or the pending pool.
    pub fn on_inventory(
        &self,
        peer: PeerId,
        items: &[InventoryItem],
        now: Instant,
        have: impl Fn(&InventoryItem) -> bool,
    ) -> Vec<InventoryItem> {
        let recent = self.recent();
        items
            .iter()
            .filter(|item| {
                self.inventory.record(peer, item.hash(), item.item_type(), now);
                !recent.contains(item) && !have(item)
            })
            .copied()
            .collect()
    }

    /// Serve a fetch request from the recent-item cache. Served items are
    /// recorded as known to the peer.
    pub fn on_fetch_request(
        &self,
        peer: PeerId,
        items: &[InventoryItem],
        now: Instant,
    ) -> FetchResponse {
        let recent = self.recent();
        let mut response = FetchResponse::default();
        for item in items {
            match item {
                InventoryItem::Block(id) => match recent.blocks.get(&id.hash) {
                    Some(block) => response.blocks.push(block.clone()),
                    None => {
                        response.missing.push(*item);
                        continue;
                    }
                },
                InventoryItem::Transaction(id) => match recent.transactions.get(id) {
                    Some(tx) => response.transactions.push(tx.clone()),
                    None => {
                        response.missing.push(*item);
                        continue;
                    }
                },
            }
            self.inventory.record(peer, item.hash(), item.item_type(), now);
        }
        if !response.missing.is_empty() {
            debug!(%peer, missing = response.missing.len(), "Fetch request not fully served from cache");
        }
        response
    }

    /// Evict inventory records past their age
    pub fn expire(&self, now: Instant) -> usize {
        let removed = self.inventory.expire(now);
        if removed > 0 {
            debug!(removed, remaining = self.inventory.len(), "Expired inventory");
        }
        removed
    }

    /// Send directly to one peer, through its outbound buffer
    pub fn send_to(&self, peer: PeerId, message: PeerMessage) -> Result<(), SendError> {
        match self.peers.get(&peer) {
            Some(entry) => self.send(&entry.connection, message),
            None => Err(SendError::Closed(peer)),
        }
    }

    fn send(&self, connection: &PeerConnection, message: PeerMessage) -> Result<(), SendError> {
        let name = message.name();
        connection.send(message).inspect_err(|error| match error {
            SendError::Full(peer) => warn!(%peer, "Dropped {name}: outbound buffer full"),
            SendError::Closed(peer) => debug!(%peer, "Dropped {name}: connection closed"),
        })
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentItems> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
