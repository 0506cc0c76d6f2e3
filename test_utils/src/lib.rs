//! Reference collaborators and fixtures shared by Agora's tests and the
//! in-process simulator.

pub mod fixtures;
pub mod ledger;
pub mod oracle;
pub mod schedule;

pub use fixtures::*;
pub use ledger::{LedgerExecutor, LedgerOp};
pub use oracle::CheckpointOracle;
pub use schedule::RoundRobinSchedule;
