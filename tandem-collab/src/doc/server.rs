//! Server-authoritative document.
//!
//! ```text
//!                 ┌──────── ServerDoc ─────────┐
//!  storage ─load─►│ Document (op log)          │──fan-out──► other subscribers
//!                 │ prev_version ──────────────│──save(prev)──► storage
//!  client op ────►│ dirty + debounce timer     │      │
//!                 │ subscribers (channel, proj)│      └─ VersionConflict ─► reload, retry
//!                 └────────────────────────────┘
//! ```
//!
//! Incoming ops fan out to every subscriber except the channel they came
//! from, projected for subscribers that attached through a projection.
//! Saves are debounced: a burst of ops produces one write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tandem_core::{Document, Op, Projection, VersionVector};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::Channel;
use crate::load::{Claim, LoadGate};
use crate::protocol::{Message, MessageType};
use crate::storage::{Storage, StoreError, StoredDoc};

/// Upper bound on reload-and-retry rounds for one save.
const MAX_SAVE_ATTEMPTS: usize = 8;

/// Result of [`ServerDoc::apply_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    New,
    Duplicate,
    /// The document was torn down; fetch a fresh instance and retry.
    Destroyed,
}

struct Subscriber {
    channel: Channel,
    projection: Option<Arc<Projection>>,
}

/// The op as a reader through `projection` sees it, if it sees it at all.
fn view(projection: Option<&Projection>, op: &Op) -> Option<Op> {
    match projection {
        Some(projection) => projection.project_op(op),
        None => Some(op.clone()),
    }
}

struct DocInner {
    doc: Document,
    /// Version the storage backend holds; `None` until first stored.
    prev_version: Option<VersionVector>,
    subscribers: HashMap<Uuid, Subscriber>,
    dirty: bool,
    save_timer: Option<JoinHandle<()>>,
    unload_timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl DocInner {
    fn broadcast(&self, backing: &str, op: &Op, origin: Option<Uuid>) {
        for (id, subscriber) in &self.subscribers {
            if Some(*id) == origin {
                continue;
            }
            let Some(visible) = view(subscriber.projection.as_deref(), op) else {
                log::trace!("Op {} hidden from channel {id}", op.id);
                continue;
            };
            match Message::from_op(&visible) {
                Ok(msg) => subscriber.channel.send_or_log(msg),
                Err(e) => log::error!("Failed to encode op {} for {backing}: {e}", op.id),
            }
        }
    }

    fn snapshot(
        &self,
        msg_type: MessageType,
        projection: Option<&Projection>,
        backing: &str,
        version: Option<&VersionVector>,
    ) -> Message {
        let empty = VersionVector::new();
        let ops = self
            .doc
            .ops_to_send(version.unwrap_or(&empty))
            .iter()
            .filter_map(|op| view(projection, op))
            .collect();
        Message::snapshot(
            msg_type,
            projection.map_or(backing, Projection::name),
            self.doc.doc_id(),
            self.doc.version().clone(),
            ops,
        )
    }
}

/// One loaded document on the server.
pub struct ServerDoc {
    collection_name: String,
    doc_id: String,
    storage: Arc<dyn Storage>,
    save_debounce: Duration,
    gate: LoadGate,
    /// Serializes saves so two writes never race on `prev_version`.
    save_lock: Mutex<()>,
    inner: Mutex<DocInner>,
}

impl ServerDoc {
    pub fn new(
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        save_debounce: Duration,
    ) -> Arc<Self> {
        let collection_name = collection_name.into();
        let doc_id = doc_id.into();
        Arc::new(Self {
            inner: Mutex::new(DocInner {
                doc: Document::new(collection_name.clone(), doc_id.clone()),
                prev_version: None,
                subscribers: HashMap::new(),
                dirty: false,
                save_timer: None,
                unload_timer: None,
                destroyed: false,
            }),
            collection_name,
            doc_id,
            storage,
            save_debounce,
            gate: LoadGate::new(),
            save_lock: Mutex::new(()),
        })
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn is_loaded(&self) -> bool {
        self.gate.is_loaded()
    }

    pub fn is_loading(&self) -> bool {
        self.gate.is_loading()
    }

    // ─── Loading ──────────────────────────────────────────────

    /// Load from storage once; concurrent callers share the in-flight load.
    ///
    /// The load runs on its own task so a caller that goes away mid-load
    /// does not leave the document stuck in `Loading`.
    pub async fn load(self: &Arc<Self>) -> Result<(), StoreError> {
        if self.gate.claim().await? == Claim::Ready {
            return Ok(());
        }
        let doc = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = doc.load_from_storage().await;
            doc.gate.finish(&result);
            result
        });
        task.await
            .unwrap_or_else(|e| Err(StoreError::DatabaseError(format!("load task failed: {e}"))))
    }

    async fn load_from_storage(&self) -> Result<(), StoreError> {
        let stored = self
            .storage
            .get_doc_by_id(&self.collection_name, &self.doc_id)
            .await
            .inspect_err(|e| {
                log::error!("Failed to load {}/{}: {e}", self.collection_name, self.doc_id)
            })?;

        let mut inner = self.inner.lock().await;
        if let Some(stored) = stored {
            let count = stored.ops.len();
            inner.doc.apply_ops(stored.ops);
            inner.doc.observe_version(&stored.version);
            inner.prev_version = Some(stored.version);
            log::debug!("Loaded {}/{} ({count} ops)", self.collection_name, self.doc_id);
        }
        // Channels that subscribed before the load finished get current state.
        for subscriber in inner.subscribers.values() {
            let msg = inner.snapshot(
                MessageType::Sub,
                subscriber.projection.as_deref(),
                &self.collection_name,
                None,
            );
            subscriber.channel.send_or_log(msg);
        }
        Ok(())
    }

    // ─── Subscriptions ────────────────────────────────────────

    /// Attach a channel and send it the ops it lacks relative to `version`.
    ///
    /// The snapshot acks `ack_id` when given. Returns false when the
    /// document was torn down and the caller must fetch a fresh instance.
    pub async fn subscribe(
        &self,
        channel: Channel,
        projection: Option<Arc<Projection>>,
        version: Option<&VersionVector>,
        ack_id: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return false;
        }
        if let Some(timer) = inner.unload_timer.take() {
            timer.abort();
        }
        let mut msg = inner.snapshot(
            MessageType::Sub,
            projection.as_deref(),
            &self.collection_name,
            version,
        );
        msg.ack_id = ack_id;
        channel.send_or_log(msg);
        let subscriber = Subscriber {
            channel,
            projection,
        };
        log::debug!(
            "Channel {} subscribed to {}/{}",
            subscriber.channel.id(),
            self.collection_name,
            self.doc_id
        );
        inner.subscribers.insert(subscriber.channel.id(), subscriber);
        true
    }

    /// Detach a channel. Returns true when no subscribers remain.
    pub async fn unsubscribe(&self, channel_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.subscribers.remove(&channel_id).is_some() {
            log::debug!(
                "Channel {channel_id} unsubscribed from {}/{}",
                self.collection_name,
                self.doc_id
            );
        }
        inner.subscribers.is_empty()
    }

    pub async fn has_subscriber(&self, channel_id: Uuid) -> bool {
        self.inner.lock().await.subscribers.contains_key(&channel_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Snapshot for a one-off `fetch`.
    pub async fn fetch(
        &self,
        projection: Option<&Projection>,
        version: Option<&VersionVector>,
    ) -> Message {
        let inner = self.inner.lock().await;
        inner.snapshot(MessageType::Fetch, projection, &self.collection_name, version)
    }

    // ─── Ops ──────────────────────────────────────────────────

    /// Apply an op and fan it out to every subscriber except `origin`.
    ///
    /// With `persist` set the document is marked dirty and a debounced save
    /// is scheduled. Ops relayed from another process skip persistence:
    /// that process already owns the write.
    pub async fn apply_op(
        self: &Arc<Self>,
        op: Op,
        origin: Option<Uuid>,
        persist: bool,
    ) -> ApplyOutcome {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return ApplyOutcome::Destroyed;
        }
        if !inner.doc.apply_op(op.clone()) {
            log::debug!("Duplicate op {} on {}/{}", op.id, self.collection_name, self.doc_id);
            return ApplyOutcome::Duplicate;
        }
        inner.broadcast(&self.collection_name, &op, origin);
        if persist {
            inner.dirty = true;
            self.schedule_save(&mut inner);
        }
        ApplyOutcome::New
    }

    pub async fn get(&self, field: Option<&str>) -> Option<Value> {
        self.inner.lock().await.doc.get(field)
    }

    pub async fn version(&self) -> VersionVector {
        self.inner.lock().await.doc.version().clone()
    }

    pub async fn ops(&self) -> Vec<Op> {
        self.inner.lock().await.doc.ops().to_vec()
    }

    /// Every op, as seen through `projection`.
    pub async fn visible_ops(&self, projection: Option<&Projection>) -> Vec<Op> {
        let inner = self.inner.lock().await;
        match projection {
            Some(projection) => inner
                .doc
                .ops()
                .iter()
                .filter_map(|op| projection.project_op(op))
                .collect(),
            None => inner.doc.ops().to_vec(),
        }
    }

    /// Current state in storage shape, for query evaluation.
    pub async fn to_stored(&self) -> StoredDoc {
        let inner = self.inner.lock().await;
        StoredDoc {
            id: self.doc_id.clone(),
            state: inner.doc.get(None),
            ops: Vec::new(),
            version: inner.doc.version().clone(),
        }
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.dirty
    }

    // ─── Persistence ──────────────────────────────────────────

    fn schedule_save(self: &Arc<Self>, inner: &mut DocInner) {
        if let Some(timer) = inner.save_timer.take() {
            timer.abort();
        }
        let doc = Arc::clone(self);
        let delay = self.save_debounce;
        inner.save_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach so resetting the timer cannot abort a write in progress.
            tokio::spawn(async move {
                if let Err(e) = doc.save().await {
                    log::error!("Failed to save {}/{}: {e}", doc.collection_name, doc.doc_id);
                }
            });
        }));
    }

    /// Run [`ServerDoc::save`] on its own task and wait for it.
    pub async fn flush(self: &Arc<Self>) -> Result<(), StoreError> {
        let doc = Arc::clone(self);
        tokio::spawn(async move { doc.save().await })
            .await
            .unwrap_or_else(|e| Err(StoreError::DatabaseError(format!("save task failed: {e}"))))
    }

    /// Write the distilled log if dirty, reloading and retrying on conflict.
    pub async fn save(&self) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().await;
        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let (record, prev_version) = {
                let mut inner = self.inner.lock().await;
                if !inner.dirty {
                    return Ok(());
                }
                inner.doc.distill_ops();
                inner.dirty = false;
                let record = StoredDoc {
                    id: self.doc_id.clone(),
                    state: inner.doc.get(None),
                    ops: inner.doc.ops().to_vec(),
                    version: inner.doc.version().clone(),
                };
                (record, inner.prev_version.clone())
            };
            let version = record.version.clone();

            match self
                .storage
                .save_doc(&self.collection_name, record, prev_version)
                .await
            {
                Ok(()) => {
                    self.inner.lock().await.prev_version = Some(version);
                    log::debug!("Saved {}/{} at {version}", self.collection_name, self.doc_id);
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    log::warn!(
                        "Version conflict saving {}/{} (attempt {attempt}), reloading",
                        self.collection_name,
                        self.doc_id
                    );
                    self.inner.lock().await.dirty = true;
                    self.reload().await?;
                }
                Err(e) => {
                    self.inner.lock().await.dirty = true;
                    return Err(e);
                }
            }
        }
        Err(StoreError::VersionConflict {
            collection: self.collection_name.clone(),
            doc_id: self.doc_id.clone(),
        })
    }

    /// Merge the authoritative stored log into memory and adopt its version
    /// as the save precondition. Ops this replica had not seen fan out to
    /// every subscriber.
    async fn reload(&self) -> Result<(), StoreError> {
        let stored = self
            .storage
            .get_doc_by_id(&self.collection_name, &self.doc_id)
            .await?;
        let mut inner = self.inner.lock().await;
        match stored {
            Some(stored) => {
                let unseen: Vec<Op> = stored
                    .ops
                    .iter()
                    .filter(|op| !inner.doc.has_op(&op.id))
                    .cloned()
                    .collect();
                inner.doc.apply_ops(stored.ops);
                inner.doc.observe_version(&stored.version);
                for op in &unseen {
                    inner.broadcast(&self.collection_name, op, None);
                }
                inner.prev_version = Some(stored.version);
                log::info!(
                    "Reloaded {}/{} ({} concurrent ops)",
                    self.collection_name,
                    self.doc_id,
                    unseen.len()
                );
            }
            None => inner.prev_version = None,
        }
        Ok(())
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

    /// Loaded, not destroyed, and nobody attached.
    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.destroyed && inner.subscribers.is_empty() && self.gate.is_loaded()
    }

    /// Mark destroyed if idle and clean. The caller removes the registry entry.
    pub async fn try_destroy(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed
            || !inner.subscribers.is_empty()
            || inner.dirty
            || !self.gate.is_loaded()
        {
            return false;
        }
        inner.destroyed = true;
        if let Some(timer) = inner.save_timer.take() {
            timer.abort();
        }
        // The unload task itself may be the caller; detach rather than abort.
        inner.unload_timer.take();
        true
    }

    /// Mark destroyed after a failed load, unless a retry or a subscriber
    /// got to it first. The caller removes the registry entry.
    pub async fn try_discard_failed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed
            || !inner.subscribers.is_empty()
            || self.gate.is_loaded()
            || self.gate.is_loading()
        {
            return false;
        }
        inner.destroyed = true;
        if let Some(timer) = inner.unload_timer.take() {
            timer.abort();
        }
        true
    }
}
