//! Versioned key-value state.
//!
//! A stack of write layers sits on top of a durable ordered store. Each layer
//! holds the pending writes of one unit of work (a block, or a transaction
//! nested inside a block) and can be committed into its parent or revoked
//! without touching durable storage. Layers are identified by a generation
//! number that only ever increases, so a stale handle can never alias a newer
//! layer.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use agora_common::collaborators::{StateAccess, StateError};
use agora_common::StoreKind;
use imbl::OrdMap;
use thiserror::Error;
use tracing::debug;

pub mod configuration;
pub mod stores;

use crate::stores::{DurableStore, WriteBatch};

type StateKey = (StoreKind, Vec<u8>);
type Writes = OrdMap<StateKey, Option<Vec<u8>>>;

/// Names one snapshot layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotHandle(u64);

impl SnapshotHandle {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The handle is not where the stack discipline requires it to be
    #[error("Snapshot {handle:?} out of order: expected {expected}")]
    OutOfOrder {
        handle: SnapshotHandle,
        expected: &'static str,
    },

    #[error("Durable store failure: {0:#}")]
    Durable(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
struct Layer {
    generation: u64,
    writes: Writes,
}

/// Layers taken off the stack with their contents intact, for restoring
/// later
#[derive(Debug)]
pub struct DetachedLayers {
    layers: Vec<Layer>,
}

impl DetachedLayers {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Handles in stack order, oldest first
    pub fn handles(&self) -> Vec<SnapshotHandle> {
        self.layers.iter().map(|layer| SnapshotHandle(layer.generation)).collect()
    }
}

/// Immutable picture of the layer stack handed to readers
#[derive(Clone, Default)]
struct StoreView {
    layers: Vec<Layer>,
}

/// Newest visible write for a key: `Some(None)` is a tombstone, `None` means
/// no layer mentions the key
fn lookup(layers: &[Layer], kind: StoreKind, key: &[u8]) -> Option<Option<Vec<u8>>> {
    let state_key = (kind, key.to_vec());
    layers.iter().rev().find_map(|layer| layer.writes.get(&state_key).cloned())
}

/// Collapse layers (oldest first) into one set of writes; newer layers win
fn merge(layers: &[Layer]) -> Writes {
    layers.iter().fold(Writes::new(), |acc, layer| layer.writes.clone().union(acc))
}

fn batch_of(writes: &Writes) -> WriteBatch {
    let mut batch = WriteBatch::new();
    for ((kind, key), value) in writes.iter() {
        batch.push((*kind, key.clone(), value.clone()));
    }
    batch
}

fn scan_layers(
    durable: &dyn DurableStore,
    layers: &[Layer],
    kind: StoreKind,
) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
    let mut entries: BTreeMap<Vec<u8>, Vec<u8>> = durable.iterate(kind)?.into_iter().collect();
    for ((write_kind, key), value) in merge(layers).iter() {
        if *write_kind != kind {
            continue;
        }
        match value {
            Some(value) => entries.insert(key.clone(), value.clone()),
            None => entries.remove(key),
        };
    }
    Ok(entries)
}

pub struct VersionedStore {
    durable: Arc<dyn DurableStore>,
    layers: Vec<Layer>,
    next_generation: u64,
    published: Arc<RwLock<Arc<StoreView>>>,
}

impl VersionedStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            durable,
            layers: Vec::new(),
            next_generation: 0,
            published: Arc::new(RwLock::new(Arc::new(StoreView::default()))),
        }
    }

    pub fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match lookup(&self.layers, kind, key) {
            Some(value) => Ok(value),
            None => Ok(self.durable.get(kind, key)?),
        }
    }

    /// Write into the top layer, or straight through to durable storage when
    /// no layer is pushed
    pub fn put(&mut self, kind: StoreKind, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        match self.layers.last_mut() {
            Some(top) => {
                top.writes.insert((kind, key), Some(value));
            }
            None => self.durable.put(kind, &key, &value)?,
        }
        Ok(())
    }

    pub fn delete(&mut self, kind: StoreKind, key: Vec<u8>) -> Result<(), StoreError> {
        match self.layers.last_mut() {
            Some(top) => {
                top.writes.insert((kind, key), None);
            }
            None => self.durable.delete(kind, &key)?,
        }
        Ok(())
    }

    pub fn push_snapshot(&mut self) -> SnapshotHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.layers.push(Layer {
            generation,
            writes: Writes::new(),
        });
        self.publish();
        SnapshotHandle(generation)
    }

    /// Merge the top layer into its parent, or write it to durable storage
    /// as one batch when it is the only layer
    pub fn commit(&mut self, handle: SnapshotHandle) -> Result<(), StoreError> {
        self.check_top(handle)?;
        if self.layers.len() == 1 {
            self.durable.write_batch(batch_of(&self.layers[0].writes))?;
            self.layers.clear();
        } else if let Some(top) = self.layers.pop() {
            if let Some(parent) = self.layers.last_mut() {
                parent.writes = top.writes.union(std::mem::take(&mut parent.writes));
            }
        }
        self.publish();
        Ok(())
    }

    /// Discard `handle` and every layer above it
    pub fn rollback(&mut self, handle: SnapshotHandle) -> Result<(), StoreError> {
        let detached = self.detach(handle)?;
        debug!(
            generation = handle.0,
            layers = detached.len(),
            "Rolled back snapshot"
        );
        Ok(())
    }

    /// Take `handle` and every layer above it off the stack, keeping their
    /// contents
    pub fn detach(&mut self, handle: SnapshotHandle) -> Result<DetachedLayers, StoreError> {
        let position = self.position(handle)?;
        let layers = self.layers.split_off(position);
        self.publish();
        Ok(DetachedLayers { layers })
    }

    /// Push previously detached layers back on top. They must be newer than
    /// everything currently on the stack.
    pub fn restore(&mut self, detached: DetachedLayers) -> Result<(), StoreError> {
        let (Some(first), Some(top)) = (detached.layers.first(), self.layers.last()) else {
            self.layers.extend(detached.layers);
            self.publish();
            return Ok(());
        };
        if first.generation <= top.generation {
            return Err(StoreError::OutOfOrder {
                handle: SnapshotHandle(first.generation),
                expected: "newer than the current top layer",
            });
        }
        self.layers.extend(detached.layers);
        self.publish();
        Ok(())
    }

    /// Write the bottom layers up to and including `handle` to durable
    /// storage as one batch and drop them, leaving newer layers in place
    pub fn solidify(&mut self, handle: SnapshotHandle) -> Result<(), StoreError> {
        let position = self.position(handle)?;
        let batch = batch_of(&merge(&self.layers[..=position]));
        let writes = batch.len();
        self.durable.write_batch(batch)?;
        self.layers.drain(..=position);
        self.publish();
        debug!(generation = handle.0, writes, "Solidified snapshot layers");
        Ok(())
    }

    /// Write every layer to durable storage as one batch and empty the stack
    pub fn flush_to_durable(&mut self) -> Result<(), StoreError> {
        if self.layers.is_empty() {
            return Ok(());
        }
        self.durable.write_batch(batch_of(&merge(&self.layers)))?;
        self.layers.clear();
        self.publish();
        Ok(())
    }

    /// Merged, ordered contents of one store kind
    pub fn scan(&self, kind: StoreKind) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
        scan_layers(self.durable.as_ref(), &self.layers, kind)
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn top(&self) -> Option<SnapshotHandle> {
        self.layers.last().map(|layer| SnapshotHandle(layer.generation))
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader {
            durable: self.durable.clone(),
            published: self.published.clone(),
        }
    }

    fn position(&self, handle: SnapshotHandle) -> Result<usize, StoreError> {
        self.layers.iter().position(|layer| layer.generation == handle.0).ok_or(
            StoreError::OutOfOrder {
                handle,
                expected: "a live layer",
            },
        )
    }

    fn check_top(&self, handle: SnapshotHandle) -> Result<(), StoreError> {
        match self.layers.last() {
            Some(top) if top.generation == handle.0 => Ok(()),
            _ => Err(StoreError::OutOfOrder {
                handle,
                expected: "the top layer",
            }),
        }
    }

    fn publish(&self) {
        let view = Arc::new(StoreView {
            layers: self.layers.clone(),
        });
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = view;
    }
}

impl StateAccess for VersionedStore {
    fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        VersionedStore::get(self, kind, key).map_err(|e| StateError(e.to_string()))
    }

    fn put(&mut self, kind: StoreKind, key: Vec<u8>, value: Vec<u8>) -> Result<(), StateError> {
        VersionedStore::put(self, kind, key, value).map_err(|e| StateError(e.to_string()))
    }

    fn delete(&mut self, kind: StoreKind, key: Vec<u8>) -> Result<(), StateError> {
        VersionedStore::delete(self, kind, key).map_err(|e| StateError(e.to_string()))
    }
}

/// Read-only access to the last published state, usable from other tasks.
///
/// Sees layers as of the last push, commit, rollback, solidify, flush,
/// detach or restore; writes into a layer still being built are invisible.
#[derive(Clone)]
pub struct StoreReader {
    durable: Arc<dyn DurableStore>,
    published: Arc<RwLock<Arc<StoreView>>>,
}

impl StoreReader {
    fn view(&self) -> Arc<StoreView> {
        self.published.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let view = self.view();
        match lookup(&view.layers, kind, key) {
            Some(value) => Ok(value),
            None => Ok(self.durable.get(kind, key)?),
        }
    }

    pub fn scan(&self, kind: StoreKind) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
        let view = self.view();
        scan_layers(self.durable.as_ref(), &view.layers, kind)
    }

    /// Number of revocable layers in the published view
    pub fn depth(&self) -> usize {
        self.view().layers.len()
    }
}
