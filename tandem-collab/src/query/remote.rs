//! Client-side mirror of a live query.

use serde_json::Value;
use tandem_core::{apply_diffs, QueryDiff};
use tokio::sync::broadcast;

use super::{query_key, QueryKey};
use crate::protocol::QuerySnapshot;

const CHANGE_CAPACITY: usize = 64;

pub struct RemoteQuery {
    collection_name: String,
    expression: Value,
    refs: usize,
    result: Option<QuerySnapshot>,
    changes: broadcast::Sender<()>,
}

impl RemoteQuery {
    pub fn new(collection_name: &str, expression: Value) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            collection_name: collection_name.to_string(),
            expression,
            refs: 0,
            result: None,
            changes,
        }
    }

    pub fn key(&self) -> QueryKey {
        query_key(&self.collection_name, &self.expression)
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn expression(&self) -> &Value {
        &self.expression
    }

    /// True on the 0 → 1 transition.
    pub fn subscribe(&mut self) -> bool {
        self.refs += 1;
        self.refs == 1
    }

    /// True on the 1 → 0 transition.
    pub fn unsubscribe(&mut self) -> bool {
        if self.refs == 0 {
            return false;
        }
        self.refs -= 1;
        self.refs == 0
    }

    pub fn is_subscribed(&self) -> bool {
        self.refs > 0
    }

    pub fn result(&self) -> Option<&QuerySnapshot> {
        self.result.as_ref()
    }

    pub fn ids(&self) -> Option<&[String]> {
        match &self.result {
            Some(QuerySnapshot::Ids { ids }) => Some(ids),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.result {
            Some(QuerySnapshot::Value { value }) => Some(value),
            _ => None,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: QuerySnapshot) {
        self.result = Some(snapshot);
        let _ = self.changes.send(());
    }

    /// Apply a `qdiff`. Diffs for a result this replica never saw are dropped.
    pub fn apply_diffs(&mut self, diffs: &[QueryDiff]) -> bool {
        match &mut self.result {
            Some(QuerySnapshot::Ids { ids }) => {
                apply_diffs(ids, diffs);
                let _ = self.changes.send(());
                true
            }
            _ => {
                log::warn!(
                    "Dropping diff for query {} {} without an id result",
                    self.collection_name,
                    self.expression
                );
                false
            }
        }
    }

    pub fn changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}
