//! In-memory storage backend for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tandem_core::VersionVector;
use tokio::sync::{Mutex, RwLock};

use super::query::{DbQueries, JsonQueries};
use super::{QueryResult, Storage, StoreError, StoredDoc};

type Collection = BTreeMap<String, StoredDoc>;

/// Storage held in process memory with the same compare-and-set contract
/// as the persistent backends.
#[derive(Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, Collection>>,
    /// One-shot forced conflicts, keyed by (collection, doc id).
    conflicts: Mutex<HashSet<(String, String)>>,
    /// One-shot forced read failures, keyed by (collection, doc id).
    read_failures: Mutex<HashSet<(String, String)>>,
    /// Artificial latency of single-document reads.
    read_delay_ms: AtomicU64,
    saves: AtomicU64,
    queries: JsonQueries,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next save of this document fail with a version conflict.
    pub async fn inject_conflict(&self, collection: &str, doc_id: &str) {
        self.conflicts
            .lock()
            .await
            .insert((collection.to_string(), doc_id.to_string()));
    }

    /// Make the next read of this document fail.
    pub async fn inject_read_failure(&self, collection: &str, doc_id: &str) {
        self.read_failures
            .lock()
            .await
            .insert((collection.to_string(), doc_id.to_string()));
    }

    /// Delay every single-document read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub async fn doc_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |docs| docs.len())
    }
}

impl Storage for MemoryStorage {
    fn init(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn get_doc_by_id<'a>(
        &'a self,
        collection: &'a str,
        doc_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredDoc>, StoreError>> {
        Box::pin(async move {
            let failed = self
                .read_failures
                .lock()
                .await
                .remove(&(collection.to_string(), doc_id.to_string()));
            if failed {
                return Err(StoreError::IoError(format!("forced read failure of {collection}/{doc_id}")));
            }
            let delay = self.read_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let collections = self.collections.read().await;
            Ok(collections
                .get(collection)
                .and_then(|docs| docs.get(doc_id))
                .cloned())
        })
    }

    fn get_docs_by_query<'a>(
        &'a self,
        collection: &'a str,
        expression: &'a Value,
    ) -> BoxFuture<'a, Result<QueryResult, StoreError>> {
        Box::pin(async move {
            let docs: Vec<StoredDoc> = {
                let collections = self.collections.read().await;
                collections
                    .get(collection)
                    .map(|docs| docs.values().cloned().collect())
                    .unwrap_or_default()
            };
            Ok(self.queries.evaluate(expression, docs))
        })
    }

    fn save_doc<'a>(
        &'a self,
        collection: &'a str,
        doc: StoredDoc,
        prev_version: Option<VersionVector>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let conflict = StoreError::VersionConflict {
                collection: collection.to_string(),
                doc_id: doc.id.clone(),
            };
            let forced = self
                .conflicts
                .lock()
                .await
                .remove(&(collection.to_string(), doc.id.clone()));
            if forced {
                log::debug!("Forced conflict for {collection}/{}", doc.id);
                return Err(conflict);
            }

            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.to_string()).or_default();
            let stored_version = docs.get(&doc.id).map(|d| &d.version);
            if stored_version != prev_version.as_ref() {
                return Err(conflict);
            }
            docs.insert(doc.id.clone(), doc);
            self.saves.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn get_collection_names(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn db_queries(&self) -> &dyn DbQueries {
        &self.queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(id: &str, state: Value, version: &[(&str, u64)]) -> StoredDoc {
        let mut v = VersionVector::new();
        for (source, date) in version {
            v.observe(source, *date);
        }
        StoredDoc {
            id: id.into(),
            state: Some(state),
            ops: Vec::new(),
            version: v,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = MemoryStorage::new();
        storage.init().await.unwrap();
        let doc = stored("n1", json!({"_id": "n1"}), &[("a", 1)]);
        storage.save_doc("notes", doc.clone(), None).await.unwrap();
        assert_eq!(storage.get_doc_by_id("notes", "n1").await.unwrap(), Some(doc));
        assert_eq!(storage.get_doc_by_id("notes", "n2").await.unwrap(), None);
        assert_eq!(storage.save_count(), 1);
        assert_eq!(storage.doc_count("notes").await, 1);
    }

    #[tokio::test]
    async fn test_stale_prev_version_conflicts() {
        let storage = MemoryStorage::new();
        let first = stored("n1", json!({"v": 1}), &[("a", 1)]);
        storage.save_doc("notes", first.clone(), None).await.unwrap();

        // A second writer that never saw `first`.
        let err = storage
            .save_doc("notes", stored("n1", json!({"v": 2}), &[("b", 1)]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let next = stored("n1", json!({"v": 3}), &[("a", 2)]);
        storage
            .save_doc("notes", next, Some(first.version))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_injected_conflict_is_one_shot() {
        let storage = MemoryStorage::new();
        storage.inject_conflict("notes", "n1").await;
        let doc = stored("n1", json!({}), &[("a", 1)]);
        assert!(storage.save_doc("notes", doc.clone(), None).await.is_err());
        assert!(storage.save_doc("notes", doc, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_and_collection_names() {
        let storage = MemoryStorage::new();
        for (id, done) in [("a", true), ("b", false), ("c", false)] {
            let doc = stored(id, json!({"_id": id, "done": done}), &[("s", 1)]);
            storage.save_doc("todos", doc, None).await.unwrap();
        }
        storage
            .save_doc("notes", stored("n", json!({}), &[("s", 1)]), None)
            .await
            .unwrap();

        let result = storage
            .get_docs_by_query("todos", &json!({"done": false}))
            .await
            .unwrap();
        assert_eq!(result.ids(), vec!["b", "c"]);
        let empty = storage.get_docs_by_query("missing", &json!({})).await.unwrap();
        assert_eq!(empty, QueryResult::Docs(Vec::new()));
        assert_eq!(
            storage.get_collection_names().await.unwrap(),
            vec!["notes", "todos"]
        );
    }

    #[tokio::test]
    async fn test_injected_read_failure_is_one_shot() {
        let storage = MemoryStorage::new();
        storage.inject_read_failure("notes", "n1").await;
        let err = storage.get_doc_by_id("notes", "n1").await.unwrap_err();
        assert!(matches!(err, StoreError::IoError(_)));
        assert_eq!(storage.get_doc_by_id("notes", "n1").await.unwrap(), None);
    }
}
