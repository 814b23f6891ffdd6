//! Duplex message pipe between a replica and the coordinator.
//!
//! A [`Channel`] is the sending half; whoever owns the matching receiver
//! (a WebSocket writer task, an in-process client) drains it. Sends never
//! block, so the coordinator can fan out while holding a document lock.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Message, ProtocolError};

/// Sending half of a connection, identified for subscription bookkeeping.
#[derive(Debug, Clone)]
pub struct Channel {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

impl Channel {
    /// New channel plus the receiver its messages arrive on.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.tx.send(msg).map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send, logging instead of failing when the peer is gone.
    pub fn send_or_log(&self, msg: Message) {
        if self.send(msg).is_err() {
            log::debug!("Channel {} closed, dropping message", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let (channel, mut rx) = Channel::pair();
        channel.send(Message::handshake("a")).unwrap();
        channel.send(Message::new(MessageType::Sync)).unwrap();
        assert_eq!(rx.recv().await.unwrap().id.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.unwrap().msg_type, MessageType::Sync);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (channel, rx) = Channel::pair();
        drop(rx);
        assert!(channel.is_closed());
        assert_eq!(
            channel.send(Message::handshake("a")),
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let (a, _ra) = Channel::pair();
        let (b, _rb) = Channel::pair();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
