//! Boundaries to the parts of a node this engine does not own: transaction
//! execution, consensus finality and producer rotation.

use crate::hash::ProducerId;
use crate::types::{Block, BlockId, Receipt, StoreKind, Transaction};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("State access failed: {0}")]
pub struct StateError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The transaction is invalid against the current state
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// The transaction payload could not be interpreted
    #[error("Malformed transaction: {0}")]
    Malformed(String),

    /// Reading or writing state failed underneath the executor
    #[error(transparent)]
    State(#[from] StateError),
}

/// Read/write access to versioned state, as seen by the executor
pub trait StateAccess {
    fn get(&self, kind: StoreKind, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;
    fn put(&mut self, kind: StoreKind, key: Vec<u8>, value: Vec<u8>) -> Result<(), StateError>;
    fn delete(&mut self, kind: StoreKind, key: Vec<u8>) -> Result<(), StateError>;
}

/// Executes transactions against state. Deterministic: the same transaction
/// against the same state always yields the same writes.
pub trait TransactionExecutor: Send + Sync {
    fn execute(
        &self,
        tx: &Transaction,
        state: &mut dyn StateAccess,
    ) -> Result<Receipt, ExecutionError>;
}

/// Consensus decisions the engine defers to
pub trait FinalityOracle: Send + Sync {
    /// Is the block signed by its claimed producer in its slot?
    fn validate_producer_signature(&self, block: &Block) -> bool;

    /// Has this canonical, not yet solid block become irreversible?
    fn is_newly_irreversible(&self, id: &BlockId) -> bool;
}

/// Producer rotation
pub trait ProducerSchedule: Send + Sync {
    /// The `count` producers due after `current`, in rotation order
    fn upcoming(&self, current: &ProducerId, count: usize) -> Vec<ProducerId>;
}
