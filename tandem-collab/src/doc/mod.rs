//! Document lifecycle variants.
//!
//! - [`LocalDoc`] — client-only collections (name starts with `_`), never synced
//! - [`RemoteDoc`] — client replica of a server document, reference-counted
//!   subscription, replay-after-reconcile on snapshots
//! - [`ServerDoc`] — authoritative copy: load-once, debounced optimistic
//!   saves, fan-out to subscribed channels

pub mod local;
pub mod remote;
pub mod server;

use tandem_core::Document;
use tokio::sync::broadcast;

pub use local::LocalDoc;
pub use remote::RemoteDoc;
pub use server::{ApplyOutcome, ServerDoc};

/// Capacity of each document's change channel.
pub(crate) const CHANGE_CAPACITY: usize = 64;

/// Prefix marking a client-only collection.
pub const LOCAL_PREFIX: char = '_';

pub fn is_local_collection(collection_name: &str) -> bool {
    collection_name.starts_with(LOCAL_PREFIX)
}

/// What changed a client document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocChange {
    /// An op made on this replica.
    Local { op_id: String },
    /// An op pushed by the server.
    Remote { op_id: String },
    /// State rebuilt from a snapshot or after a rejected op.
    Rebuilt,
}

/// A document held by the client model.
pub enum ClientDoc {
    Local(LocalDoc),
    Remote(RemoteDoc),
}

impl ClientDoc {
    /// The right variant for `collection_name`.
    pub fn new(collection_name: &str, doc_id: &str) -> Self {
        if is_local_collection(collection_name) {
            ClientDoc::Local(LocalDoc::new(collection_name, doc_id))
        } else {
            ClientDoc::Remote(RemoteDoc::new(collection_name, doc_id))
        }
    }

    pub fn document(&self) -> &Document {
        match self {
            ClientDoc::Local(doc) => doc.document(),
            ClientDoc::Remote(doc) => doc.document(),
        }
    }

    pub fn document_mut(&mut self) -> &mut Document {
        match self {
            ClientDoc::Local(doc) => doc.document_mut(),
            ClientDoc::Remote(doc) => doc.document_mut(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ClientDoc::Local(_))
    }

    pub fn changes(&self) -> broadcast::Receiver<DocChange> {
        match self {
            ClientDoc::Local(doc) => doc.changes(),
            ClientDoc::Remote(doc) => doc.changes(),
        }
    }

    pub fn notify(&self, change: DocChange) {
        match self {
            ClientDoc::Local(doc) => doc.notify(change),
            ClientDoc::Remote(doc) => doc.notify(change),
        }
    }
}
