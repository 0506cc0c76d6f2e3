use agora_common::StoreKind;
use anyhow::Result;

pub mod fjall;
pub mod memory;

/// One write in a durable batch; `None` deletes the key
pub type DurableWrite = (StoreKind, Vec<u8>, Option<Vec<u8>>);

/// Writes applied together or not at all
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    writes: Vec<DurableWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, kind: StoreKind, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push((kind, key, Some(value)));
    }

    pub fn delete(&mut self, kind: StoreKind, key: Vec<u8>) {
        self.writes.push((kind, key, None));
    }

    pub fn push(&mut self, write: DurableWrite) {
        self.writes.push(write);
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<DurableWrite> {
        self.writes
    }
}

/// The ordered byte-key store underneath all snapshot layers.
///
/// Implementations use interior mutability; the versioned store is the only
/// writer.
pub trait DurableStore: Send + Sync {
    fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, kind: StoreKind, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, kind: StoreKind, key: &[u8]) -> Result<()>;

    /// All entries of one kind in key order
    fn iterate(&self, kind: StoreKind) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch atomically
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}
