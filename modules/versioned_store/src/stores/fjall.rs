//! On-disk durable floor using Fjall, one keyspace per store kind

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use agora_common::StoreKind;
use anyhow::{anyhow, Result};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use tracing::info;

use super::{DurableStore, WriteBatch};

pub struct FjallDurableStore {
    database: Database,
    keyspaces: BTreeMap<StoreKind, Keyspace>,
}

impl FjallDurableStore {
    pub fn new(path: &Path, clear: bool) -> Result<Self> {
        info!("Storing state with Fjall on disk ({})", path.display());
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }

        let database = Database::builder(path).open()?;
        let mut keyspaces = BTreeMap::new();
        for kind in StoreKind::ALL {
            let keyspace = database.keyspace(kind.keyspace_name(), KeyspaceCreateOptions::default)?;
            keyspaces.insert(kind, keyspace);
        }

        Ok(Self {
            database,
            keyspaces,
        })
    }

    /// Push buffered journal writes to the OS
    pub fn persist(&self) -> Result<()> {
        self.database.persist(PersistMode::Buffer)?;
        Ok(())
    }

    fn keyspace(&self, kind: StoreKind) -> Result<&Keyspace> {
        self.keyspaces.get(&kind).ok_or_else(|| anyhow!("no keyspace for {kind}"))
    }
}

impl DurableStore for FjallDurableStore {
    fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.keyspace(kind)?.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, kind: StoreKind, key: &[u8], value: &[u8]) -> Result<()> {
        self.keyspace(kind)?.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, kind: StoreKind, key: &[u8]) -> Result<()> {
        self.keyspace(kind)?.remove(key)?;
        Ok(())
    }

    fn iterate(&self, kind: StoreKind) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in self.keyspace(kind)?.iter() {
            let (key, value) = entry.into_inner()?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut fjall_batch = self.database.batch();
        for (kind, key, value) in batch.into_writes() {
            let keyspace = self.keyspace(kind)?;
            match value {
                Some(value) => fjall_batch.insert(keyspace, key, value),
                None => fjall_batch.remove(keyspace, key),
            }
        }
        fjall_batch.commit()?;
        self.persist()
    }
}
