//! Who is known to have which item.
//!
//! A record means "this peer announced the item to us, or we sent it to
//! them". Records go away by age and, past a global cap, oldest first.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use agora_common::messages::ItemType;
use agora_common::peer::PeerId;
use agora_common::Hash;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryRecord {
    pub item_type: ItemType,
    pub timestamp: Instant,
}

type RecordKey = (PeerId, Hash<32>);

pub struct InventoryCache {
    records: DashMap<RecordKey, InventoryRecord>,
    /// Insertion order, for eviction. May hold superseded entries; those are
    /// recognised by their timestamp no longer matching the live record.
    order: Mutex<VecDeque<(RecordKey, Instant)>>,
    expiry: Duration,
    capacity: usize,
}

impl InventoryCache {
    pub fn new(expiry: Duration, capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            expiry,
            capacity,
        }
    }

    pub fn record(&self, peer: PeerId, hash: Hash<32>, item_type: ItemType, now: Instant) {
        self.records.insert(
            (peer, hash),
            InventoryRecord {
                item_type,
                timestamp: now,
            },
        );
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.push_back(((peer, hash), now));
        if self.records.len() > self.capacity {
            Self::evict_front(&self.records, &mut order, |_| true, self.capacity);
        }
    }

    pub fn knows(&self, peer: PeerId, hash: &Hash<32>) -> bool {
        self.records.contains_key(&(peer, *hash))
    }

    pub fn get(&self, peer: PeerId, hash: &Hash<32>) -> Option<InventoryRecord> {
        self.records.get(&(peer, *hash)).map(|record| *record)
    }

    /// Drop everything recorded for a peer
    pub fn forget_peer(&self, peer: PeerId) {
        self.records.retain(|(p, _), _| *p != peer);
    }

    /// Remove records older than the expiry; returns how many went
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.records.len();
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let expiry = self.expiry;
        Self::evict_front(
            &self.records,
            &mut order,
            |timestamp| now.saturating_duration_since(timestamp) > expiry,
            self.capacity,
        );
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pop order entries from the front while they are stale, or while the
    /// cache is over capacity
    fn evict_front(
        records: &DashMap<RecordKey, InventoryRecord>,
        order: &mut VecDeque<(RecordKey, Instant)>,
        stale: impl Fn(Instant) -> bool,
        capacity: usize,
    ) {
        while let Some((key, timestamp)) = order.front().copied() {
            let live = records.get(&key).map(|record| record.timestamp);
            if live != Some(timestamp) {
                // superseded or already forgotten
                order.pop_front();
                continue;
            }
            if !stale(timestamp) && records.len() <= capacity {
                break;
            }
            records.remove(&key);
            order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> Hash<32> {
        Hash::new([n; 32])
    }

    #[test]
    fn records_and_forgets_by_peer() {
        let cache = InventoryCache::new(Duration::from_secs(60), 100);
        let now = Instant::now();
        cache.record(PeerId(1), hash(1), ItemType::Block, now);
        cache.record(PeerId(2), hash(1), ItemType::Block, now);

        assert!(cache.knows(PeerId(1), &hash(1)));
        assert!(!cache.knows(PeerId(1), &hash(2)));

        cache.forget_peer(PeerId(1));
        assert!(!cache.knows(PeerId(1), &hash(1)));
        assert!(cache.knows(PeerId(2), &hash(1)));
    }

    #[test]
    fn expires_by_age() {
        let cache = InventoryCache::new(Duration::from_secs(10), 100);
        let start = Instant::now();
        cache.record(PeerId(1), hash(1), ItemType::Transaction, start);
        cache.record(PeerId(1), hash(2), ItemType::Transaction, start + Duration::from_secs(5));

        assert_eq!(cache.expire(start + Duration::from_secs(11)), 1);
        assert!(!cache.knows(PeerId(1), &hash(1)));
        assert!(cache.knows(PeerId(1), &hash(2)));
    }

    #[test]
    fn refreshed_record_survives_expiry_of_old_entry() {
        let cache = InventoryCache::new(Duration::from_secs(10), 100);
        let start = Instant::now();
        cache.record(PeerId(1), hash(1), ItemType::Block, start);
        cache.record(PeerId(1), hash(1), ItemType::Block, start + Duration::from_secs(8));

        assert_eq!(cache.expire(start + Duration::from_secs(12)), 0);
        assert!(cache.knows(PeerId(1), &hash(1)));
    }

    #[test]
    fn count_cap_evicts_oldest() {
        let cache = InventoryCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        for n in 1..=3 {
            cache.record(PeerId(1), hash(n), ItemType::Block, now);
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.knows(PeerId(1), &hash(1)));
        assert!(cache.knows(PeerId(1), &hash(3)));
    }
}
