//! Shared setup for network interface tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agora_common::collaborators::ProducerSchedule;
use agora_common::messages::PeerMessage;
use agora_common::peer::{NetworkEvent, PeerConnection, PeerId};
use agora_common::{Block, BlockId, ProducerId};
use agora_module_chain_coordinator::configuration::CoordinatorConfig;
use agora_module_chain_coordinator::stores::memory::MemoryBlockStore;
use agora_module_chain_coordinator::{ChainCoordinator, SharedChain};
use agora_module_peer_network_interface::configuration::SyncConfig;
use agora_module_peer_network_interface::Node;
use agora_module_versioned_store::stores::memory::MemoryDurableStore;
use agora_test_utils::{genesis, now_after, producer, CheckpointOracle, LedgerExecutor, RoundRobinSchedule};
use config::Config;
use tokio::sync::mpsc;

/// Genesis plus `blocks`, applied in order
pub fn chain_with(blocks: &[Block]) -> ChainCoordinator {
    let config = CoordinatorConfig::try_load(&Config::default()).unwrap();
    let mut chain = ChainCoordinator::new(
        &config,
        genesis(),
        Arc::new(MemoryBlockStore::new()),
        Arc::new(MemoryDurableStore::new()),
        Arc::new(LedgerExecutor::new()),
        Arc::new(CheckpointOracle::never()),
    )
    .unwrap();
    for block in blocks {
        chain.apply_block(block.clone(), now_after(block)).unwrap();
    }
    chain
}

pub fn sync_config(batch_size: usize, backlog_threshold: usize) -> SyncConfig {
    SyncConfig {
        batch_size,
        backlog_threshold,
    }
}

pub fn schedule() -> Arc<dyn ProducerSchedule> {
    Arc::new(RoundRobinSchedule::new(vec![producer(1), producer(2), producer(3)]))
}

/// Start a node with a short scheduling tick
pub fn spawn(id: u64, chain: ChainCoordinator, role: Option<ProducerId>) -> Node {
    let config = Config::builder()
        .set_override("tick-interval", 10)
        .unwrap()
        .build()
        .unwrap();
    Node::spawn(PeerId(id), &config, chain.shared(), schedule(), role).unwrap()
}

/// Give freshly linked nodes time to exchange handshakes
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll until the node's head is `target`, for up to five seconds
pub async fn wait_for_head(node: &Node, target: BlockId) -> bool {
    for _ in 0..500 {
        if node.chain.lock().await.head() == target {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until the node's pending pool holds `count` transactions
pub async fn wait_for_pending(node: &Node, count: usize) -> bool {
    for _ in 0..500 {
        if node.chain.lock().await.pending_transactions().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A hand-driven peer connected straight to a node's event queue
pub struct FakePeer {
    pub id: PeerId,
    inbox: mpsc::Receiver<PeerMessage>,
}

impl FakePeer {
    pub async fn connect(node: &Node, id: u64) -> Self {
        let id = PeerId(id);
        let (connection, inbox) = PeerConnection::channel(id, 64);
        node.events
            .write(NetworkEvent::Connected { peer: id, connection })
            .await
            .unwrap();
        Self { id, inbox }
    }

    pub async fn send(&self, node: &Node, message: PeerMessage) {
        node.events.message(self.id, message).await.unwrap();
    }

    /// Next message from the node matching `wanted`, skipping others, or
    /// `None` after two seconds
    pub async fn expect(&mut self, wanted: impl Fn(&PeerMessage) -> bool) -> Option<PeerMessage> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let next = tokio::time::timeout_at(deadline, self.inbox.recv()).await;
            match next {
                Ok(Some(message)) if wanted(&message) => return Some(message),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }
}
