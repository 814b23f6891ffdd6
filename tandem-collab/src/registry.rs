//! Registries of loaded server documents and live queries.
//!
//! ```text
//!   get_or_create(key) ──► read lock hit ───────────────────┐
//!          │ miss                                           │
//!          ▼                                                ▼
//!   write lock, re-check, insert ──► entry.load().await ──► Arc<entry>
//! ```
//!
//! There is at most one instance per key; a second reference arriving
//! mid-load waits on the same load. Idle entries are torn down after a
//! grace delay unless something attaches first, and a later reference
//! always creates a fresh instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tandem_core::Projection;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::doc::ServerDoc;
use crate::error::SyncError;
use crate::query::{query_key, QueryEnv, QueryKey, QueryKind, ServerQuery};
use crate::storage::{Storage, StoreError};

/// (backing collection, doc id)
pub type DocKey = (String, String);

// ─── Documents ──────────────────────────────────────────────────

struct DocSetInner {
    docs: RwLock<HashMap<DocKey, Arc<ServerDoc>>>,
    storage: Arc<dyn Storage>,
    save_debounce: Duration,
    unload_delay: Duration,
}

/// Loaded server documents keyed by backing collection and id.
#[derive(Clone)]
pub struct DocSet {
    inner: Arc<DocSetInner>,
}

impl DocSet {
    pub fn new(storage: Arc<dyn Storage>, save_debounce: Duration, unload_delay: Duration) -> Self {
        Self {
            inner: Arc::new(DocSetInner {
                docs: RwLock::new(HashMap::new()),
                storage,
                save_debounce,
                unload_delay,
            }),
        }
    }

    pub async fn get(&self, collection_name: &str, doc_id: &str) -> Option<Arc<ServerDoc>> {
        let key = (collection_name.to_string(), doc_id.to_string());
        self.inner.docs.read().await.get(&key).cloned()
    }

    /// The single instance for this key, loaded.
    pub async fn get_or_create(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<Arc<ServerDoc>, StoreError> {
        let key = (collection_name.to_string(), doc_id.to_string());
        let existing = self.inner.docs.read().await.get(&key).cloned();
        let doc = match existing {
            Some(doc) => doc,
            None => {
                let mut docs = self.inner.docs.write().await;
                docs.entry(key)
                    .or_insert_with(|| {
                        ServerDoc::new(
                            collection_name,
                            doc_id,
                            Arc::clone(&self.inner.storage),
                            self.inner.save_debounce,
                        )
                    })
                    .clone()
            }
        };
        if let Err(e) = doc.load().await {
            self.evict_failed(&doc).await;
            return Err(e);
        }
        Ok(doc)
    }

    /// Drop the entry of a document whose load failed, so the next
    /// reference starts from a fresh instance.
    async fn evict_failed(&self, doc: &Arc<ServerDoc>) {
        let key = (doc.collection_name().to_string(), doc.doc_id().to_string());
        let mut docs = self.inner.docs.write().await;
        if docs.get(&key).is_some_and(|current| Arc::ptr_eq(current, doc))
            && doc.try_discard_failed().await
        {
            docs.remove(&key);
            log::debug!("Dropped {}/{} after failed load", key.0, key.1);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Arc<ServerDoc>> {
        self.inner.docs.read().await.values().cloned().collect()
    }

    /// Loaded documents of one backing collection.
    pub async fn loaded_in(&self, collection_name: &str) -> Vec<Arc<ServerDoc>> {
        self.inner
            .docs
            .read()
            .await
            .iter()
            .filter(|((collection, _), doc)| collection == collection_name && doc.is_loaded())
            .map(|(_, doc)| Arc::clone(doc))
            .collect()
    }

    /// Detach a channel from one document, scheduling teardown if idle.
    pub async fn unsubscribe(&self, doc: &Arc<ServerDoc>, channel_id: Uuid) {
        if doc.unsubscribe(channel_id).await {
            self.schedule_unload(doc).await;
        }
    }

    /// Detach a channel from every document it is attached to.
    pub async fn unsubscribe_channel(&self, channel_id: Uuid) {
        for doc in self.all().await {
            if doc.has_subscriber(channel_id).await {
                self.unsubscribe(&doc, channel_id).await;
            }
        }
    }

    /// Schedule teardown for a document nobody is attached to.
    pub async fn release_if_idle(&self, doc: &Arc<ServerDoc>) {
        if doc.subscriber_count().await == 0 {
            self.schedule_unload(doc).await;
        }
    }

    /// Save every dirty document now.
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        for doc in self.all().await {
            doc.flush().await?;
        }
        Ok(())
    }

    async fn schedule_unload(&self, doc: &Arc<ServerDoc>) {
        let set = self.clone();
        let target = Arc::clone(doc);
        let delay = self.inner.unload_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            set.unload(target).await;
        });
        doc.set_unload_timer(timer).await;
    }

    async fn unload(&self, doc: Arc<ServerDoc>) {
        if !doc.is_idle().await {
            return;
        }
        if let Err(e) = doc.flush().await {
            log::error!(
                "Failed to save {}/{} before unload: {e}",
                doc.collection_name(),
                doc.doc_id()
            );
            return;
        }
        let key = (doc.collection_name().to_string(), doc.doc_id().to_string());
        let mut docs = self.inner.docs.write().await;
        if !docs.get(&key).is_some_and(|current| Arc::ptr_eq(current, &doc)) {
            return;
        }
        if doc.try_destroy().await {
            docs.remove(&key);
            log::info!("Unloaded {}/{}", key.0, key.1);
        }
    }
}

// ─── Queries ────────────────────────────────────────────────────

struct QuerySetInner {
    queries: RwLock<HashMap<QueryKey, Arc<ServerQuery>>>,
    env: QueryEnv,
    unload_delay: Duration,
}

/// Live queries keyed by public collection (or resolver) name and
/// canonical expression.
#[derive(Clone)]
pub struct QuerySet {
    inner: Arc<QuerySetInner>,
}

impl QuerySet {
    pub fn new(env: QueryEnv, unload_delay: Duration) -> Self {
        Self {
            inner: Arc::new(QuerySetInner {
                queries: RwLock::new(HashMap::new()),
                env,
                unload_delay,
            }),
        }
    }

    pub async fn get(&self, collection_name: &str, expression: &Value) -> Option<Arc<ServerQuery>> {
        let key = query_key(collection_name, expression);
        self.inner.queries.read().await.get(&key).cloned()
    }

    /// The single instance for this query, evaluated at least once.
    ///
    /// `collection_name` names a resolver, a projection or a collection;
    /// `projection` is set for the second case.
    pub async fn get_or_create(
        &self,
        collection_name: &str,
        expression: &Value,
        projection: Option<Arc<Projection>>,
    ) -> Result<Arc<ServerQuery>, SyncError> {
        let key = query_key(collection_name, expression);
        let existing = self.inner.queries.read().await.get(&key).cloned();
        let query = match existing {
            Some(query) => query,
            None => {
                let kind = self.kind_of(collection_name, expression).await;
                let mut queries = self.inner.queries.write().await;
                queries
                    .entry(key)
                    .or_insert_with(|| {
                        ServerQuery::new(
                            collection_name,
                            expression.clone(),
                            kind,
                            projection,
                            self.inner.env.clone(),
                        )
                    })
                    .clone()
            }
        };
        if let Err(e) = query.load().await {
            self.evict_failed(&query).await;
            return Err(e);
        }
        Ok(query)
    }

    async fn evict_failed(&self, query: &Arc<ServerQuery>) {
        let key = query.key();
        let mut queries = self.inner.queries.write().await;
        if queries.get(&key).is_some_and(|current| Arc::ptr_eq(current, query))
            && !query.is_loaded()
            && query.try_destroy().await
        {
            queries.remove(&key);
            log::debug!("Dropped query {} after failed load", query.describe());
        }
    }

    async fn kind_of(&self, collection_name: &str, expression: &Value) -> QueryKind {
        let env = &self.inner.env;
        if env.resolvers.read().await.contains_key(collection_name) {
            QueryKind::Computed(collection_name.to_string())
        } else if env.storage.db_queries().is_join_query(expression) {
            QueryKind::Join
        } else {
            QueryKind::Plain
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.queries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Arc<ServerQuery>> {
        self.inner.queries.read().await.values().cloned().collect()
    }

    /// Re-evaluate, in the background, every query that read from this
    /// document or its collection.
    pub async fn on_op(&self, collection_name: &str, doc_id: &str) {
        for query in self.all().await {
            if query.depends_on(collection_name, doc_id).await {
                log::trace!("Op on {collection_name}/{doc_id} refreshes {}", query.describe());
                tokio::spawn(async move { query.refresh().await });
            }
        }
    }

    pub async fn unsubscribe(&self, query: &Arc<ServerQuery>, channel_id: Uuid) {
        if query.unsubscribe(channel_id).await {
            self.schedule_unload(query).await;
        }
    }

    pub async fn unsubscribe_channel(&self, channel_id: Uuid) {
        for query in self.all().await {
            if query.has_subscriber(channel_id).await {
                self.unsubscribe(&query, channel_id).await;
            }
        }
    }

    pub async fn release_if_idle(&self, query: &Arc<ServerQuery>) {
        if query.subscriber_count().await == 0 {
            self.schedule_unload(query).await;
        }
    }

    async fn schedule_unload(&self, query: &Arc<ServerQuery>) {
        let set = self.clone();
        let target = Arc::clone(query);
        let delay = self.inner.unload_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            set.unload(target).await;
        });
        query.set_unload_timer(timer).await;
    }

    async fn unload(&self, query: Arc<ServerQuery>) {
        let key = query.key();
        let mut queries = self.inner.queries.write().await;
        if !queries.get(&key).is_some_and(|current| Arc::ptr_eq(current, &query)) {
            return;
        }
        if query.try_destroy().await {
            queries.remove(&key);
            log::info!("Unloaded query {}", query.describe());
        }
    }
}
