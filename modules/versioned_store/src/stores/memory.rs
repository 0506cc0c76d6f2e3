//! In-memory durable floor, for tests and throw-away nodes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use agora_common::StoreKind;
use anyhow::{anyhow, bail, Result};

use super::{DurableStore, WriteBatch};

#[derive(Default)]
pub struct MemoryDurableStore {
    entries: Mutex<BTreeMap<(StoreKind, Vec<u8>), Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise failure paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory store is refusing writes");
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(StoreKind, Vec<u8>), Vec<u8>>>> {
        self.entries.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl DurableStore for MemoryDurableStore {
    fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(&(kind, key.to_vec())).cloned())
    }

    fn put(&self, kind: StoreKind, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.lock()?.insert((kind, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, kind: StoreKind, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.lock()?.remove(&(kind, key.to_vec()));
        Ok(())
    }

    fn iterate(&self, kind: StoreKind) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.lock()?;
        Ok(entries
            .range((kind, Vec::new())..)
            .take_while(|((k, _), _)| *k == kind)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.lock()?;
        for (kind, key, value) in batch.into_writes() {
            match value {
                Some(value) => entries.insert((kind, key), value),
                None => entries.remove(&(kind, key)),
            };
        }
        Ok(())
    }
}
