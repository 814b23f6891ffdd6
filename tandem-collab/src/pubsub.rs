//! Backplane fanning committed ops across server processes.
//!
//! Every process sharing one storage backend publishes the ops it commits
//! and applies the ops other processes publish. A process also hears its
//! own publishes back; the coordinator drops those echoes by op id.
//!
//! ```text
//!  SyncServer A ──publish──┐                ┌──► SyncServer A (echo, dropped)
//!                          ├──► PubSubHub ──┤
//!  SyncServer B ──publish──┘                └──► SyncServer B (applied)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::protocol::{Message, ProtocolError};

/// Encoded frame as carried by the backplane.
pub type Frame = Arc<String>;

/// Pub/sub backplane contract.
pub trait PubSub: Send + Sync {
    /// Attach to the backplane. With `subscribe` set, returns the stream of
    /// frames published by every attached process.
    fn init(&self, subscribe: bool) -> Option<broadcast::Receiver<Frame>>;

    /// Publish one message to every subscriber.
    fn publish<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, Result<(), ProtocolError>>;
}

/// Statistics for monitoring backplane health.
#[derive(Debug, Clone, Default)]
pub struct PubSubStats {
    pub messages_sent: u64,
    pub messages_unheard: u64,
    pub subscribers: usize,
}

/// In-process backplane over a tokio broadcast channel.
///
/// Clone the `Arc` into each `SyncServer` that should share it.
pub struct PubSubHub {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_unheard: AtomicU64,
}

impl PubSubHub {
    /// `capacity` bounds how far a slow subscriber may lag before it
    /// starts missing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_unheard: AtomicU64::new(0),
        }
    }

    /// Publish an already-encoded frame. Returns how many subscribers got it.
    pub fn publish_raw(&self, frame: Frame) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(frame) {
            Ok(count) => count,
            Err(_) => {
                self.messages_unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_unheard: self.messages_unheard.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

impl PubSub for PubSubHub {
    fn init(&self, subscribe: bool) -> Option<broadcast::Receiver<Frame>> {
        subscribe.then(|| self.subscribe())
    }

    fn publish<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, Result<(), ProtocolError>> {
        Box::pin(async move {
            let frame = Arc::new(msg.encode()?);
            self.publish_raw(frame);
            Ok(())
        })
    }
}
