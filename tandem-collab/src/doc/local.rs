//! Client-only document.

use tandem_core::Document;
use tokio::sync::broadcast;

use super::{DocChange, CHANGE_CAPACITY};

/// A document in a `_`-prefixed collection. It never leaves the replica,
/// so subscribing is a no-op.
pub struct LocalDoc {
    doc: Document,
    changes: broadcast::Sender<DocChange>,
}

impl LocalDoc {
    pub fn new(collection_name: &str, doc_id: &str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            doc: Document::new(collection_name, doc_id),
            changes,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn subscribe(&mut self) -> bool {
        false
    }

    pub fn unsubscribe(&mut self) -> bool {
        false
    }

    pub fn changes(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }

    pub fn notify(&self, change: DocChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}
