//! Server-side live query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tandem_core::{diff_ids, Projection};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::computed::ResolveContext;
use super::{query_key, run_expression, Dependencies, QueryEnv, QueryKey, QueryKind};
use crate::channel::Channel;
use crate::error::SyncError;
use crate::load::{Claim, LoadGate};
use crate::protocol::{Message, MessageType, QuerySnapshot};

/// Attempts at attaching a channel to a document that keeps being torn down.
const MAX_ATTACH_ATTEMPTS: usize = 3;

struct QueryInner {
    result: Option<QuerySnapshot>,
    deps: Dependencies,
    subscribers: HashMap<Uuid, Channel>,
    refreshing: bool,
    /// An op arrived while a refresh was running; run one more.
    refresh_pending: bool,
    unload_timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

/// One live query and the channels subscribed to it.
pub struct ServerQuery {
    /// Name the client used: a collection, a projection or a resolver.
    collection_name: String,
    /// Collection the documents live in.
    backing: String,
    expression: Value,
    kind: QueryKind,
    projection: Option<Arc<Projection>>,
    env: QueryEnv,
    gate: LoadGate<SyncError>,
    inner: Mutex<QueryInner>,
}

impl ServerQuery {
    pub fn new(
        collection_name: &str,
        expression: Value,
        kind: QueryKind,
        projection: Option<Arc<Projection>>,
        env: QueryEnv,
    ) -> Arc<Self> {
        let backing = projection
            .as_deref()
            .map_or(collection_name, Projection::backing)
            .to_string();
        Arc::new(Self {
            collection_name: collection_name.to_string(),
            backing,
            expression,
            kind,
            projection,
            env,
            gate: LoadGate::new(),
            inner: Mutex::new(QueryInner {
                result: None,
                deps: Dependencies::default(),
                subscribers: HashMap::new(),
                refreshing: false,
                refresh_pending: false,
                unload_timer: None,
                destroyed: false,
            }),
        })
    }

    pub fn key(&self) -> QueryKey {
        query_key(&self.collection_name, &self.expression)
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    pub fn expression(&self) -> &Value {
        &self.expression
    }

    pub fn is_loaded(&self) -> bool {
        self.gate.is_loaded()
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.collection_name, self.expression)
    }

    pub async fn result(&self) -> Option<QuerySnapshot> {
        self.inner.lock().await.result.clone()
    }

    pub async fn depends_on(&self, collection_name: &str, doc_id: &str) -> bool {
        self.inner.lock().await.deps.touches(collection_name, doc_id)
    }

    // ─── Evaluation ───────────────────────────────────────────

    async fn evaluate(&self) -> Result<(QuerySnapshot, Dependencies), SyncError> {
        match &self.kind {
            QueryKind::Plain | QueryKind::Join => {
                let (result, deps) = run_expression(&self.env, &self.backing, &self.expression).await?;
                Ok((result.into(), deps))
            }
            QueryKind::Computed(name) => {
                let mut ctx = ResolveContext::new(self.env.clone());
                let value = ctx.resolve(name, &self.expression).await?;
                Ok((QuerySnapshot::Value { value }, ctx.into_dependencies()))
            }
        }
    }

    /// First evaluation; concurrent callers share it.
    pub async fn load(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.gate.claim().await? == Claim::Ready {
            return Ok(());
        }
        let query = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = query.evaluate().await;
            let result = match outcome {
                Ok((snapshot, deps)) => {
                    let mut inner = query.inner.lock().await;
                    inner.result = Some(snapshot);
                    inner.deps = deps;
                    Ok(())
                }
                Err(e) => Err(e),
            };
            query.gate.finish(&result);
            result
        });
        task.await
            .unwrap_or_else(|e| Err(SyncError::Unavailable(format!("query task ({e})"))))
    }

    /// Re-evaluate and push the difference to subscribers. Calls that land
    /// while a refresh runs collapse into one follow-up run.
    pub async fn refresh(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return;
            }
            if inner.refreshing {
                inner.refresh_pending = true;
                return;
            }
            inner.refreshing = true;
        }
        loop {
            match self.evaluate().await {
                Ok((snapshot, deps)) => self.publish(snapshot, deps).await,
                Err(e) => log::error!("Failed to refresh query {}: {e}", self.describe()),
            }
            let mut inner = self.inner.lock().await;
            if !inner.refresh_pending || inner.destroyed {
                inner.refreshing = false;
                return;
            }
            inner.refresh_pending = false;
        }
    }

    async fn publish(self: &Arc<Self>, next: QuerySnapshot, deps: Dependencies) {
        let (msg, inserted, subscribers) = {
            let mut inner = self.inner.lock().await;
            inner.deps = deps;
            let prev = inner.result.replace(next.clone());
            let (msg, inserted) = match (prev, &next) {
                (Some(QuerySnapshot::Ids { ids: old }), QuerySnapshot::Ids { ids }) => {
                    let diffs = diff_ids(&old, ids);
                    if diffs.is_empty() {
                        return;
                    }
                    let known: HashSet<&String> = old.iter().collect();
                    let inserted: Vec<String> =
                        ids.iter().filter(|id| !known.contains(id)).cloned().collect();
                    let msg = Message::qdiff(&self.collection_name, self.expression.clone(), diffs);
                    (msg, inserted)
                }
                (Some(prev), next) if prev == *next => return,
                (_, next) => {
                    let msg = match Message::query_snapshot(
                        MessageType::Qsub,
                        &self.collection_name,
                        self.expression.clone(),
                        next,
                    ) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::error!("Failed to encode query {}: {e}", self.describe());
                            return;
                        }
                    };
                    let inserted = match next {
                        QuerySnapshot::Ids { ids } => ids.clone(),
                        QuerySnapshot::Value { .. } => Vec::new(),
                    };
                    (msg, inserted)
                }
            };
            let subscribers: Vec<Channel> = inner.subscribers.values().cloned().collect();
            (msg, inserted, subscribers)
        };

        // Documents first, so the ids a client reads already resolve.
        for channel in &subscribers {
            for doc_id in &inserted {
                if let Err(e) = self.attach_doc(channel, doc_id).await {
                    log::warn!("Failed to attach {}/{doc_id}: {e}", self.backing);
                }
            }
        }
        log::debug!(
            "Query {} changed, notifying {} channels",
            self.describe(),
            subscribers.len()
        );
        for channel in &subscribers {
            channel.send_or_log(msg.clone());
        }
    }

    // ─── Subscriptions ────────────────────────────────────────

    /// Subscribe `channel` to a result document unless it already is.
    async fn attach_doc(&self, channel: &Channel, doc_id: &str) -> Result<(), SyncError> {
        for _ in 0..MAX_ATTACH_ATTEMPTS {
            let doc = self.env.docs.get_or_create(&self.backing, doc_id).await?;
            if doc.has_subscriber(channel.id()).await {
                return Ok(());
            }
            if doc
                .subscribe(channel.clone(), self.projection.clone(), None, None)
                .await
            {
                return Ok(());
            }
        }
        Err(SyncError::Unavailable(format!("{}/{doc_id}", self.backing)))
    }

    /// Attach `channel`: its result documents first, then the result itself,
    /// acking `ack_id`. False when the query was torn down meanwhile.
    ///
    /// The channel joins the subscriber list in the same lock scope that
    /// sends its snapshot, so every diff it receives is relative to that
    /// snapshot. Results that change while documents are being attached
    /// send the newly listed documents before the snapshot goes out.
    pub async fn subscribe(&self, channel: Channel, ack_id: Option<String>) -> Result<bool, SyncError> {
        let mut attached: HashSet<String> = HashSet::new();
        loop {
            let pending: Vec<String> = {
                let mut inner = self.inner.lock().await;
                if inner.destroyed {
                    return Ok(false);
                }
                if let Some(timer) = inner.unload_timer.take() {
                    timer.abort();
                }
                let snapshot = inner
                    .result
                    .clone()
                    .unwrap_or(QuerySnapshot::Ids { ids: Vec::new() });
                let pending: Vec<String> = match &snapshot {
                    QuerySnapshot::Ids { ids } => ids
                        .iter()
                        .filter(|id| !attached.contains(*id))
                        .cloned()
                        .collect(),
                    QuerySnapshot::Value { .. } => Vec::new(),
                };
                if pending.is_empty() {
                    let mut msg = Message::query_snapshot(
                        MessageType::Qsub,
                        &self.collection_name,
                        self.expression.clone(),
                        &snapshot,
                    )?;
                    msg.ack_id = ack_id;
                    inner.subscribers.insert(channel.id(), channel.clone());
                    channel.send_or_log(msg);
                    log::debug!("Channel {} subscribed to query {}", channel.id(), self.describe());
                    return Ok(true);
                }
                pending
            };
            for doc_id in pending {
                self.attach_doc(&channel, &doc_id).await?;
                attached.insert(doc_id);
            }
        }
    }

    /// One-off result plus every op of every result document.
    pub async fn fetch(&self) -> Result<Message, SyncError> {
        let snapshot = self
            .result()
            .await
            .unwrap_or(QuerySnapshot::Ids { ids: Vec::new() });
        let mut ops = Vec::new();
        if let QuerySnapshot::Ids { ids } = &snapshot {
            for doc_id in ids {
                let doc = self.env.docs.get_or_create(&self.backing, doc_id).await?;
                ops.extend(doc.visible_ops(self.projection.as_deref()).await);
                self.env.docs.release_if_idle(&doc).await;
            }
        }
        let mut msg = Message::query_snapshot(
            MessageType::Qfetch,
            &self.collection_name,
            self.expression.clone(),
            &snapshot,
        )?;
        msg.ops = Some(ops);
        Ok(msg)
    }

    /// Detach a channel. True when no subscribers remain.
    pub async fn unsubscribe(&self, channel_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&channel_id);
        inner.subscribers.is_empty()
    }

    pub async fn has_subscriber(&self, channel_id: Uuid) -> bool {
        self.inner.lock().await.subscribers.contains_key(&channel_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    // ─── Teardown ─────────────────────────────────────────────

    pub async fn set_unload_timer(&self, timer: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            timer.abort();
            return;
        }
        if let Some(old) = inner.unload_timer.replace(timer) {
            old.abort();
        }
    }

    pub async fn try_destroy(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed || !inner.subscribers.is_empty() || self.gate.is_loading() {
            return false;
        }
        inner.destroyed = true;
        inner.unload_timer.take();
        true
    }
}
