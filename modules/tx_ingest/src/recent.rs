//! Recently seen transaction ids

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use agora_common::TxHash;

pub struct RecentTransactions {
    seen: HashMap<TxHash, Instant>,
    order: VecDeque<(TxHash, Instant)>,
    capacity: usize,
    expiry: Duration,
}

impl RecentTransactions {
    pub fn new(capacity: usize, expiry: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            expiry,
        }
    }

    /// Remember `id`; false if it was already seen and has not expired
    pub fn insert(&mut self, id: TxHash, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, now);
        self.order.push_back((id, now));
        while self.seen.len() > self.capacity {
            let Some((oldest, _)) = self.order.pop_front() else {
                break;
            };
            self.seen.remove(&oldest);
        }
        true
    }

    pub fn contains(&self, id: &TxHash, now: Instant) -> bool {
        self.seen
            .get(id)
            .is_some_and(|seen| now.saturating_duration_since(*seen) <= self.expiry)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((id, seen)) = self.order.front().copied() {
            if now.saturating_duration_since(seen) <= self.expiry {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::Hash;

    fn id(n: u8) -> TxHash {
        Hash::new([n; 32])
    }

    #[test]
    fn second_insert_is_a_duplicate() {
        let mut recent = RecentTransactions::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(recent.insert(id(1), now));
        assert!(!recent.insert(id(1), now));
        assert!(recent.contains(&id(1), now));
    }

    #[test]
    fn expired_ids_can_be_seen_again() {
        let mut recent = RecentTransactions::new(10, Duration::from_secs(5));
        let start = Instant::now();
        recent.insert(id(1), start);
        let later = start + Duration::from_secs(6);
        assert!(!recent.contains(&id(1), later));
        assert!(recent.insert(id(1), later));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut recent = RecentTransactions::new(2, Duration::from_secs(60));
        let now = Instant::now();
        for n in 1..=3 {
            recent.insert(id(n), now);
        }
        assert_eq!(recent.len(), 2);
        assert!(!recent.contains(&id(1), now));
        assert!(recent.contains(&id(3), now));
    }
}
