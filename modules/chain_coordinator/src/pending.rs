//! Transactions that passed a dry run and wait for inclusion in a block.

use std::collections::{HashMap, VecDeque};

use agora_common::{Transaction, TxHash};

pub struct PendingPool {
    order: VecDeque<TxHash>,
    transactions: HashMap<TxHash, Transaction>,
    capacity: usize,
}

impl PendingPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            transactions: HashMap::new(),
            capacity,
        }
    }

    pub fn contains(&self, id: &TxHash) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn is_full(&self) -> bool {
        self.transactions.len() >= self.capacity
    }

    /// Queue a transaction; false if it was already queued or the pool is
    /// full
    pub fn insert(&mut self, tx: Transaction) -> bool {
        let id = tx.id();
        if self.contains(&id) || self.is_full() {
            return false;
        }
        self.order.push_back(id);
        self.transactions.insert(id, tx);
        true
    }

    /// Drop transactions that made it into a block
    pub fn evict<'a>(&mut self, ids: impl IntoIterator<Item = &'a TxHash>) {
        let mut evicted = false;
        for id in ids {
            evicted |= self.transactions.remove(id).is_some();
        }
        if evicted {
            let transactions = &self.transactions;
            self.order.retain(|id| transactions.contains_key(id));
        }
    }

    /// Pending transactions, oldest first
    pub fn transactions(&self) -> Vec<Transaction> {
        self.order.iter().filter_map(|id| self.transactions.get(id)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
