//! Messages exchanged between peers.
//!
//! Only the shapes are fixed here; framing and byte encoding belong to the
//! transport.

use crate::hash::{Hash, ProducerId, TxHash};
use crate::types::{Block, BlockId, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a peer is being disconnected, so it can tell garbage from divergence
/// from simply being behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    /// Malformed or unsolicited message
    BadProtocol,
    /// Chains share no ancestor within the branch limit
    Diverged,
    /// Sent a block we cannot link to our chain
    Unlinked,
    /// Sent a block or transaction that failed validation
    Rejected,
    /// Local failure; not the peer's fault
    Internal,
    /// Orderly shutdown
    Requested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::BadProtocol => "bad-protocol",
            DisconnectReason::Diverged => "diverged",
            DisconnectReason::Unlinked => "unlinked",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::Internal => "internal",
            DisconnectReason::Requested => "requested",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    Block,
    Transaction,
}

/// An announced or requested item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryItem {
    Block(BlockId),
    Transaction(TxHash),
}

impl InventoryItem {
    pub fn item_type(&self) -> ItemType {
        match self {
            InventoryItem::Block(_) => ItemType::Block,
            InventoryItem::Transaction(_) => ItemType::Transaction,
        }
    }

    /// Hash identifying the item regardless of its type
    pub fn hash(&self) -> Hash<32> {
        match self {
            InventoryItem::Block(id) => id.hash,
            InventoryItem::Transaction(id) => *id,
        }
    }
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryItem::Block(id) => write!(f, "block {id}"),
            InventoryItem::Transaction(id) => write!(f, "tx {}", id.short()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First message on a connection
    Handshake {
        genesis: BlockId,
        head: BlockId,
        solid: BlockId,
        /// Set when the sender produces blocks
        producer: Option<ProducerId>,
    },

    /// Block ids from our solid block towards our tip, ascending, with
    /// gaps halving towards the tip
    ChainSummaryRequest { summary: Vec<BlockId> },

    /// Contiguous ids starting at the highest shared entry of the request,
    /// and how many more the sender has beyond them
    ChainSummaryReply { ids: Vec<BlockId>, remaining: u64 },

    Inventory { items: Vec<InventoryItem> },

    FetchBlocks { ids: Vec<BlockId> },

    FetchTransactions { ids: Vec<TxHash> },

    Blocks { blocks: Vec<Block> },

    Transactions { transactions: Vec<Transaction> },

    Disconnect { reason: DisconnectReason },
}

impl PeerMessage {
    /// Short name for log lines
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Handshake { .. } => "handshake",
            PeerMessage::ChainSummaryRequest { .. } => "chain-summary-request",
            PeerMessage::ChainSummaryReply { .. } => "chain-summary-reply",
            PeerMessage::Inventory { .. } => "inventory",
            PeerMessage::FetchBlocks { .. } => "fetch-blocks",
            PeerMessage::FetchTransactions { .. } => "fetch-transactions",
            PeerMessage::Blocks { .. } => "blocks",
            PeerMessage::Transactions { .. } => "transactions",
            PeerMessage::Disconnect { .. } => "disconnect",
        }
    }
}
