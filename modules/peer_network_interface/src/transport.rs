//! In-process transport: joins two nodes' event queues with a pair of
//! bounded channels, one per direction.

use agora_common::messages::PeerMessage;
use agora_common::peer::{NetworkEvent, NetworkEventSender, PeerConnection, PeerId};
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::debug;

/// Connect node `a` (known to its peers as `a_id`) with node `b`.
///
/// Each side receives a `Connected` event for the other. Closing either
/// outbound channel tears the link down in that direction and reports a
/// `Disconnected` to the receiving node.
pub async fn link(
    a: &NetworkEventSender,
    a_id: PeerId,
    b: &NetworkEventSender,
    b_id: PeerId,
    buffer: usize,
) -> Result<()> {
    let (to_b, a_to_b) = PeerConnection::channel(b_id, buffer);
    let (to_a, b_to_a) = PeerConnection::channel(a_id, buffer);

    a.write(NetworkEvent::Connected {
        peer: b_id,
        connection: to_b,
    })
    .await?;
    b.write(NetworkEvent::Connected {
        peer: a_id,
        connection: to_a,
    })
    .await?;

    tokio::spawn(
        Pump {
            from: a_id,
            sink: b.clone(),
        }
        .run(a_to_b),
    );
    tokio::spawn(
        Pump {
            from: b_id,
            sink: a.clone(),
        }
        .run(b_to_a),
    );
    Ok(())
}

/// Moves one direction of a link into the receiving node's event queue
struct Pump {
    from: PeerId,
    sink: NetworkEventSender,
}

impl Pump {
    async fn run(self, mut outbound: mpsc::Receiver<PeerMessage>) {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, PeerMessage::Disconnect { .. });
            if self.sink.message(self.from, message).await.is_err() {
                return;
            }
            if closing {
                break;
            }
        }
        debug!(peer = %self.from, "Link closed");
        let _ = self.sink.write(NetworkEvent::Disconnected { peer: self.from }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::messages::DisconnectReason;

    fn node() -> (NetworkEventSender, mpsc::Receiver<NetworkEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (NetworkEventSender::new(tx), rx)
    }

    #[tokio::test]
    async fn messages_arrive_tagged_with_the_sender() {
        let (a, mut a_events) = node();
        let (b, mut b_events) = node();
        link(&a, PeerId(1), &b, PeerId(2), 4).await.unwrap();

        let Some(NetworkEvent::Connected { peer, connection }) = a_events.recv().await else {
            panic!("expected a connection");
        };
        assert_eq!(peer, PeerId(2));
        assert!(matches!(
            b_events.recv().await,
            Some(NetworkEvent::Connected { peer: PeerId(1), .. })
        ));

        connection.send(PeerMessage::FetchBlocks { ids: vec![] }).unwrap();
        match b_events.recv().await {
            Some(NetworkEvent::Message { peer, message }) => {
                assert_eq!(peer, PeerId(1));
                assert_eq!(message, PeerMessage::FetchBlocks { ids: vec![] });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_message_closes_the_direction() {
        let (a, mut a_events) = node();
        let (b, mut b_events) = node();
        link(&a, PeerId(1), &b, PeerId(2), 4).await.unwrap();
        let Some(NetworkEvent::Connected { connection, .. }) = a_events.recv().await else {
            panic!("expected a connection");
        };
        b_events.recv().await;

        connection.disconnect(DisconnectReason::Requested).unwrap();
        assert!(matches!(
            b_events.recv().await,
            Some(NetworkEvent::Message {
                message: PeerMessage::Disconnect { .. },
                ..
            })
        ));
        assert!(matches!(
            b_events.recv().await,
            Some(NetworkEvent::Disconnected { peer: PeerId(1) })
        ));
    }

    #[tokio::test]
    async fn dropping_the_connection_reports_disconnect() {
        let (a, mut a_events) = node();
        let (b, mut b_events) = node();
        link(&a, PeerId(1), &b, PeerId(2), 4).await.unwrap();
        drop(a_events.recv().await);
        b_events.recv().await;

        assert!(matches!(
            b_events.recv().await,
            Some(NetworkEvent::Disconnected { peer: PeerId(1) })
        ));
    }
}
