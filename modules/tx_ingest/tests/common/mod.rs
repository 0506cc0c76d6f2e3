//! Shared setup for transaction ingestion tests.

use std::sync::Arc;
use std::time::Duration;

use agora_common::collaborators::ProducerSchedule;
use agora_common::peer::{NetworkEvent, NetworkEventSender};
use agora_common::Transaction;
use agora_module_chain_coordinator::configuration::CoordinatorConfig;
use agora_module_chain_coordinator::stores::memory::MemoryBlockStore;
use agora_module_chain_coordinator::{ChainCoordinator, SharedChain};
use agora_module_propagation::configuration::PropagationConfig;
use agora_module_propagation::PropagationService;
use agora_module_tx_ingest::configuration::TxIngestConfig;
use agora_module_tx_ingest::TxIngestPipeline;
use agora_module_versioned_store::stores::memory::MemoryDurableStore;
use agora_test_utils::{genesis, producer, CheckpointOracle, LedgerExecutor, RoundRobinSchedule};
use config::Config;
use tokio::sync::mpsc;

pub struct Node {
    pub chain: SharedChain,
    pub pipeline: TxIngestPipeline,
    pub events: mpsc::Receiver<NetworkEvent>,
}

/// A chain plus an ingestion pipeline with the given contract-queue settings
pub fn node(queue_capacity: usize, drain_interval_ms: u64) -> Node {
    node_with(&[
        ("contract-queue-capacity", queue_capacity as u64),
        ("contract-drain-interval", drain_interval_ms),
    ])
}

/// A chain plus an ingestion pipeline with `settings` over the defaults
pub fn node_with(settings: &[(&str, u64)]) -> Node {
    let coordinator = CoordinatorConfig::try_load(&Config::default()).unwrap();
    let chain = ChainCoordinator::new(
        &coordinator,
        genesis(),
        Arc::new(MemoryBlockStore::new()),
        Arc::new(MemoryDurableStore::new()),
        Arc::new(LedgerExecutor::new()),
        Arc::new(CheckpointOracle::never()),
    )
    .unwrap()
    .shared();

    let schedule: Arc<dyn ProducerSchedule> = Arc::new(RoundRobinSchedule::new(vec![producer(1)]));
    let propagation = Arc::new(PropagationService::new(
        PropagationConfig::try_load(&Config::default()).unwrap(),
        schedule,
    ));

    let mut overrides = Config::builder();
    for (key, value) in settings {
        overrides = overrides.set_override(*key, *value).unwrap();
    }
    let overrides = overrides.build().unwrap();
    let (sink, events) = mpsc::channel(64);
    let pipeline = TxIngestPipeline::new(
        &TxIngestConfig::try_load(&overrides).unwrap(),
        chain.clone(),
        propagation,
        NetworkEventSender::new(sink),
    );
    Node {
        chain,
        pipeline,
        events,
    }
}

/// Poll the pending pool until it holds `count` transactions or two seconds
/// pass
pub async fn wait_for_pending(chain: &SharedChain, count: usize) -> Vec<Transaction> {
    for _ in 0..200 {
        let pending = chain.lock().await.pending_transactions();
        if pending.len() >= count {
            return pending;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    chain.lock().await.pending_transactions()
}
