//! Peer identities and the in-process transport boundary

use crate::messages::{DisconnectReason, PeerMessage};
use anyhow::{Context as _, Result};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound buffer for {0} is full")]
    Full(PeerId),
    #[error("connection to {0} is closed")]
    Closed(PeerId),
}

/// Outbound half of a connection: a bounded buffer of messages to one peer.
///
/// Sends never wait. A full buffer drops the message so one slow peer cannot
/// stall the node.
#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub id: PeerId,
    outbound: mpsc::Sender<PeerMessage>,
}

impl PeerConnection {
    pub fn new(id: PeerId, outbound: mpsc::Sender<PeerMessage>) -> Self {
        Self { id, outbound }
    }

    /// Make a connection and the receiver the transport drains it from
    pub fn channel(id: PeerId, capacity: usize) -> (Self, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(id, tx), rx)
    }

    pub fn send(&self, message: PeerMessage) -> Result<(), SendError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }

    pub fn disconnect(&self, reason: DisconnectReason) -> Result<(), SendError> {
        self.send(PeerMessage::Disconnect { reason })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Everything a node's network manager reacts to
#[derive(Debug)]
pub enum NetworkEvent {
    /// A transport connected a new peer
    Connected {
        peer: PeerId,
        connection: PeerConnection,
    },

    /// A message arrived from a peer
    Message { peer: PeerId, message: PeerMessage },

    /// The transport lost the peer
    Disconnected { peer: PeerId },

    /// A background validator found the peer at fault
    Penalise {
        peer: PeerId,
        reason: DisconnectReason,
    },
}

/// Handle given to transports and background workers to feed events to the
/// network manager
#[derive(Clone, Debug)]
pub struct NetworkEventSender {
    sink: mpsc::Sender<NetworkEvent>,
}

impl NetworkEventSender {
    pub fn new(sink: mpsc::Sender<NetworkEvent>) -> Self {
        Self { sink }
    }

    pub async fn write(&self, event: NetworkEvent) -> Result<()> {
        self.sink.send(event).await.context("network manager has shut down")
    }

    pub async fn message(&self, peer: PeerId, message: PeerMessage) -> Result<()> {
        self.write(NetworkEvent::Message { peer, message }).await
    }
}
