//! Client replica of a server document.
//!
//! ```text
//!  subscribe()   refs 0 → 1  ──► send `sub { version }`
//!  unsubscribe() refs 1 → 0  ──► send `unsub`
//!
//!  snapshot { version V, ops } ──► fold ops in
//!                              └─► resend own ops V does not dominate
//! ```

use tandem_core::{Document, Op, VersionVector};
use tokio::sync::broadcast;

use super::{DocChange, CHANGE_CAPACITY};

pub struct RemoteDoc {
    doc: Document,
    refs: usize,
    /// Version the server last reported for this document.
    server_version: Option<VersionVector>,
    changes: broadcast::Sender<DocChange>,
}

impl RemoteDoc {
    pub fn new(collection_name: &str, doc_id: &str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            doc: Document::new(collection_name, doc_id),
            refs: 0,
            server_version: None,
            changes,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    /// Add a reference. True on the 0 → 1 transition.
    pub fn subscribe(&mut self) -> bool {
        self.refs += 1;
        self.refs == 1
    }

    /// Drop a reference. True on the 1 → 0 transition.
    pub fn unsubscribe(&mut self) -> bool {
        if self.refs == 0 {
            return false;
        }
        self.refs -= 1;
        self.refs == 0
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn is_subscribed(&self) -> bool {
        self.refs > 0
    }

    pub fn server_version(&self) -> Option<&VersionVector> {
        self.server_version.as_ref()
    }

    /// Fold in a server snapshot. Returns the ops from `source` the server
    /// does not have yet, which the caller must resend.
    pub fn apply_snapshot(&mut self, version: VersionVector, ops: Vec<Op>, source: &str) -> Vec<Op> {
        let added = self.doc.apply_ops(ops);
        let resend = self
            .doc
            .ops()
            .iter()
            .filter(|op| op.source == source && !version.dominates(&op.source, op.date))
            .cloned()
            .collect();
        self.server_version = Some(version);
        log::debug!(
            "Snapshot for {}/{}: {added} new ops",
            self.doc.collection_name(),
            self.doc.doc_id()
        );
        self.notify(DocChange::Rebuilt);
        resend
    }

    /// Apply an op pushed by the server.
    pub fn apply_remote_op(&mut self, op: Op) -> bool {
        let op_id = op.id.clone();
        self.server_version
            .get_or_insert_with(VersionVector::new)
            .observe(&op.source, op.date);
        if !self.doc.apply_op(op) {
            return false;
        }
        self.notify(DocChange::Remote { op_id });
        true
    }

    /// Record that the server acknowledged one of our ops.
    pub fn acknowledge(&mut self, op: &Op) {
        self.server_version
            .get_or_insert_with(VersionVector::new)
            .observe(&op.source, op.date);
    }

    /// Ops from `source` not known to be on the server.
    pub fn pending_ops(&self, source: &str) -> Vec<Op> {
        let empty = VersionVector::new();
        let known = self.server_version.as_ref().unwrap_or(&empty);
        self.doc
            .ops()
            .iter()
            .filter(|op| op.source == source && !known.dominates(&op.source, op.date))
            .cloned()
            .collect()
    }

    /// Drop an op the server refused and rebuild.
    pub fn reject_op(&mut self, op_id: &str) -> bool {
        if !self.doc.remove_op(op_id) {
            return false;
        }
        log::warn!(
            "Op {op_id} rejected on {}/{}",
            self.doc.collection_name(),
            self.doc.doc_id()
        );
        self.notify(DocChange::Rebuilt);
        true
    }

    pub fn changes(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }

    pub fn notify(&self, change: DocChange) {
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::{Clock, Mutator};

    #[test]
    fn test_refcount_transitions() {
        let mut doc = RemoteDoc::new("users", "u1");
        assert!(doc.subscribe());
        assert!(!doc.subscribe());
        assert!(!doc.unsubscribe());
        assert!(doc.unsubscribe());
        assert!(!doc.unsubscribe());
        assert_eq!(doc.refs(), 0);
    }

    #[test]
    fn test_snapshot_returns_ops_server_lacks() {
        let mut server = Document::new("users", "u1");
        let mut server_clock = Clock::new("server");
        let server_ops = Mutator::new(&mut server, &mut server_clock)
            .add(json!({"name": "Ann"}))
            .unwrap();

        let mut doc = RemoteDoc::new("users", "u1");
        let mut clock = Clock::new("me");
        clock.observe(server_ops[0].date);
        // Offline edit made after the server's add.
        doc.apply_snapshot(server.version().clone(), server_ops.clone(), "me");
        let mine = Mutator::new(doc.document_mut(), &mut clock)
            .set(Some("name"), json!("Bo"))
            .unwrap();

        let resend = doc.apply_snapshot(server.version().clone(), Vec::new(), "me");
        assert_eq!(resend, mine);
        assert_eq!(doc.pending_ops("me"), mine);

        doc.acknowledge(&mine[0]);
        assert!(doc.pending_ops("me").is_empty());
    }

    #[test]
    fn test_reject_op_rebuilds() {
        let mut doc = RemoteDoc::new("users", "u1");
        let mut clock = Clock::new("me");
        let mut rx = doc.changes();
        let ops = {
            let mut m = Mutator::new(doc.document_mut(), &mut clock);
            let mut ops = m.add(json!({"age": 1})).unwrap();
            ops.extend(m.set(Some("age"), json!(2)).unwrap());
            ops
        };
        assert!(doc.reject_op(&ops[1].id));
        assert_eq!(doc.document().get(Some("age")), Some(json!(1)));
        assert_eq!(rx.try_recv().unwrap(), DocChange::Rebuilt);
        assert!(!doc.reject_op("missing"));
    }
}
