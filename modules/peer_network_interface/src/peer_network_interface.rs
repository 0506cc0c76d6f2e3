//! Agora peer network interface: chain-summary negotiation, single-slot
//! block fetch and the per-node event loop tying the peers to the chain.

pub mod chain_summary;
pub mod chain_view;
pub mod configuration;
pub mod fetch;
pub mod latency;
pub mod network;
pub mod sync;
pub mod transport;

use std::sync::Arc;

use agora_common::collaborators::ProducerSchedule;
use agora_common::peer::{NetworkEventSender, PeerId};
use agora_common::{Block, ProducerId, Transaction};
use agora_module_chain_coordinator::SharedChain;
use agora_module_propagation::configuration::PropagationConfig;
use agora_module_propagation::PropagationService;
use agora_module_tx_ingest::configuration::TxIngestConfig;
use agora_module_tx_ingest::TxIngestPipeline;
use anyhow::{Context as _, Result};
use config::Config;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::configuration::InterfaceConfig;
use crate::network::{NetworkManager, NodeCommand};

/// A running node: its chain, the queues feeding its network manager, and
/// the manager task
pub struct Node {
    pub id: PeerId,
    pub chain: SharedChain,
    pub propagation: Arc<PropagationService>,
    pub events: NetworkEventSender,
    commands: mpsc::Sender<NodeCommand>,
    outbound_buffer: usize,
    task: JoinHandle<Result<()>>,
}

impl Node {
    /// Wire a network manager around `chain` and start it. Module settings
    /// are read from `config`, over each module's defaults. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        id: PeerId,
        config: &Config,
        chain: SharedChain,
        schedule: Arc<dyn ProducerSchedule>,
        producer: Option<ProducerId>,
    ) -> Result<Self> {
        let interface = InterfaceConfig::try_load(config).context("network interface config")?;
        let propagation = Arc::new(PropagationService::new(
            PropagationConfig::try_load(config).context("propagation config")?,
            schedule,
        ));
        let ingest_config = TxIngestConfig::try_load(config).context("tx ingest config")?;

        let (sink, events) = mpsc::channel(interface.event_queue_capacity.max(1));
        let sink = NetworkEventSender::new(sink);
        let (commands, command_rx) = mpsc::channel(interface.event_queue_capacity.max(1));
        let ingest =
            TxIngestPipeline::new(&ingest_config, chain.clone(), propagation.clone(), sink.clone());

        let outbound_buffer = interface.outbound_buffer;
        let manager = NetworkManager::new(
            interface,
            chain.clone(),
            propagation.clone(),
            ingest,
            events,
            command_rx,
            producer,
        );
        let task = tokio::spawn(async move {
            let result = manager.run().await;
            if let Err(error) = &result {
                error!(node = %id, "network manager failed: {error:#}");
            }
            result
        });

        Ok(Self {
            id,
            chain,
            propagation,
            events: sink,
            commands,
            outbound_buffer,
            task,
        })
    }

    /// Connect to another in-process node
    pub async fn connect(&self, other: &Node) -> Result<()> {
        transport::link(
            &self.events,
            self.id,
            &other.events,
            other.id,
            self.outbound_buffer,
        )
        .await
    }

    pub async fn submit(&self, tx: Transaction) -> Result<()> {
        self.commands
            .send(NodeCommand::SubmitTransaction(tx))
            .await
            .context("network manager has shut down")
    }

    /// Apply a block this node produced and relay it
    pub async fn publish(&self, block: Block) -> Result<()> {
        self.commands
            .send(NodeCommand::PublishBlock(block))
            .await
            .context("network manager has shut down")
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the manager and wait for it
    pub async fn shutdown(self) -> Result<()> {
        drop(self.commands);
        self.task.await.context("network manager panicked")?
    }
}
