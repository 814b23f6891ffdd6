//! Client model: local replicas kept in sync with one coordinator.
//!
//! ```text
//!  mutate() ──► Mutator ──► local doc (applied at once, optimistic)
//!                               │ connected & remote
//!                               ▼
//!                         op / ops message ──► ack │ error ack (op removed)
//!
//!  reader task ◄── sub/fetch snapshots, pushed ops, qsub, qdiff, acks
//!
//!  reconnect ──► handshake (clock sync) ──► pending ops of unsubscribed docs
//!            └─► sync { docs + versions, queries } ──► snapshots ──► resend
//! ```
//!
//! Mutations never wait for the network to change local state. An op the
//! server rejects is dropped from its document, which rebuilds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tandem_core::{mutation, new_id, Clock, Mutator, Op, VersionVector};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::Channel;
use crate::doc::{ClientDoc, DocChange};
use crate::error::SyncError;
use crate::protocol::{Message, MessageType, ProtocolError, QuerySnapshot, SyncDoc, SyncQuery, SyncRequest};
use crate::query::{query_key, QueryKey, RemoteQuery};
use crate::registry::DocKey;

/// How long a request waits for its ack.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ModelState {
    clock: Clock,
    docs: HashMap<DocKey, ClientDoc>,
    queries: HashMap<QueryKey, RemoteQuery>,
}

impl ModelState {
    fn doc_entry(&mut self, collection_name: &str, doc_id: &str) -> &mut ClientDoc {
        self.docs
            .entry((collection_name.to_string(), doc_id.to_string()))
            .or_insert_with(|| ClientDoc::new(collection_name, doc_id))
    }

    /// The op with this id and the remote doc holding it.
    fn find_op(&mut self, op_id: &str) -> Option<(&mut ClientDoc, Op)> {
        self.docs.values_mut().find_map(|doc| {
            let op = doc.document().ops().iter().find(|op| op.id == op_id).cloned()?;
            Some((doc, op))
        })
    }

    fn reject_op(&mut self, op_id: &str) -> bool {
        self.docs.values_mut().any(|doc| match doc {
            ClientDoc::Remote(remote) => remote.reject_op(op_id),
            ClientDoc::Local(_) => false,
        })
    }

    fn acknowledge(&mut self, op_id: &str) {
        if let Some((ClientDoc::Remote(remote), op)) = self.find_op(op_id) {
            remote.acknowledge(&op);
        }
    }

    fn apply_remote_op(&mut self, op: Op) {
        self.clock.observe(op.date);
        match self.doc_entry(&op.collection_name, &op.doc_id) {
            ClientDoc::Remote(remote) => {
                remote.apply_remote_op(op);
            }
            ClientDoc::Local(_) => log::warn!("Ignoring server op {} for a local document", op.id),
        }
    }
}

struct ModelInner {
    source: String,
    state: Mutex<ModelState>,
    outbound: Mutex<Option<Channel>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    connection: watch::Sender<ConnectionState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Bumped per connection so a stale reader cannot tear down a newer one.
    generation: AtomicU64,
}

/// A client replica set. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self::with_source(Uuid::new_v4().to_string())
    }

    /// Model whose ops carry `source`.
    pub fn with_source(source: impl Into<String>) -> Self {
        let source = source.into();
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ModelInner {
                state: Mutex::new(ModelState {
                    clock: Clock::new(source.clone()),
                    docs: HashMap::new(),
                    queries: HashMap::new(),
                }),
                source,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                connection,
                reader: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    // ─── Connection ───────────────────────────────────────────

    /// Attach to a coordinator: `channel` carries requests, `rx` delivers
    /// replies and pushes. Handshakes, then resubscribes everything and
    /// resends ops the server has not acknowledged.
    pub async fn connect(&self, channel: Channel, mut rx: UnboundedReceiver<Message>) -> Result<(), SyncError> {
        self.disconnect().await;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.outbound.lock().await = Some(channel);
        self.inner.connection.send_replace(ConnectionState::Connecting);

        let weak: Weak<ModelInner> = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                Model { inner }.handle_message(msg).await;
            }
            if let Some(inner) = weak.upgrade() {
                Model { inner }.on_disconnected(generation).await;
            }
        });
        *self.inner.reader.lock().await = Some(reader);

        let ack = match self.request(Message::handshake(new_id())).await {
            Ok(ack) => ack,
            Err(e) => {
                self.disconnect().await;
                return Err(e);
            }
        };
        if let Some(date) = ack.value.as_ref().and_then(|v| v.get("date")).and_then(Value::as_u64) {
            let mut state = self.inner.state.lock().await;
            state.clock.sync_with(date);
            log::debug!("Clock offset against server: {}ms", state.clock.offset());
        }
        self.inner.connection.send_replace(ConnectionState::Connected);
        log::info!("Model {} connected", self.inner.source);
        self.resync().await
    }

    /// Drop the connection. Local state and pending ops are kept.
    pub async fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = self.inner.reader.lock().await.take() {
            reader.abort();
        }
        self.close().await;
    }

    async fn on_disconnected(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.inner.reader.lock().await.take();
        self.close().await;
        log::warn!("Model {} lost its connection", self.inner.source);
    }

    async fn close(&self) {
        self.inner.outbound.lock().await.take();
        // Dropped senders fail every waiting request.
        self.inner.pending.lock().await.clear();
        self.inner.connection.send_replace(ConnectionState::Disconnected);
    }

    async fn send(&self, msg: Message) -> Result<(), SyncError> {
        let outbound = self.inner.outbound.lock().await;
        let channel = outbound.as_ref().ok_or(SyncError::NotConnected)?;
        channel.send(msg)?;
        Ok(())
    }

    /// Send and wait for the reply acking `msg.id`.
    async fn request(&self, msg: Message) -> Result<Message, SyncError> {
        let id = msg
            .id
            .clone()
            .ok_or_else(|| SyncError::InvalidMessage("request without id".into()))?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id.clone(), tx);
        if let Err(e) = self.send(msg).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }
        let reply = match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SyncError::NotConnected),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                return Err(ProtocolError::Timeout.into());
            }
        };
        match &reply.error {
            Some(error) => Err(SyncError::Rejected(error.clone())),
            None => Ok(reply),
        }
    }

    async fn resync(&self) -> Result<(), SyncError> {
        let (request, unsent) = {
            let state = self.inner.state.lock().await;
            let mut request = SyncRequest::default();
            let mut unsent = Vec::new();
            for ((collection_name, doc_id), doc) in &state.docs {
                let ClientDoc::Remote(remote) = doc else {
                    continue;
                };
                if remote.is_subscribed() {
                    request.docs.push(SyncDoc {
                        collection_name: collection_name.clone(),
                        doc_id: doc_id.clone(),
                        version: remote.server_version().cloned(),
                    });
                } else {
                    unsent.extend(remote.pending_ops(&self.inner.source));
                }
            }
            for query in state.queries.values().filter(|q| q.is_subscribed()) {
                request.queries.push(SyncQuery {
                    collection_name: query.collection_name().to_string(),
                    expression: query.expression().clone(),
                });
            }
            (request, unsent)
        };

        if !unsent.is_empty() {
            log::info!("Resending {} ops for unsubscribed documents", unsent.len());
            self.send_ops(&unsent).await?;
        }
        if !request.docs.is_empty() || !request.queries.is_empty() {
            let mut msg = Message::new(MessageType::Sync);
            msg.id = Some(new_id());
            msg.value = Some(
                serde_json::to_value(&request)
                    .map_err(|e| ProtocolError::SerializationError(e.to_string()))?,
            );
            self.request(msg).await?;
            log::debug!(
                "Resynced {} documents and {} queries",
                request.docs.len(),
                request.queries.len()
            );
        }
        Ok(())
    }

    /// Send ops and record the ones the server kept.
    async fn send_ops(&self, ops: &[Op]) -> Result<(), SyncError> {
        let result = match ops {
            [op] => self.request(Message::from_op(op)?).await,
            _ => self.request(Message::ops(new_id(), ops.to_vec())).await,
        };
        if matches!(result, Ok(_) | Err(SyncError::Rejected(_))) {
            let mut state = self.inner.state.lock().await;
            for op in ops {
                state.acknowledge(&op.id);
            }
        }
        result.map(|_| ())
    }

    // ─── Incoming ─────────────────────────────────────────────

    async fn handle_message(&self, msg: Message) {
        log::trace!("{:?} for model {}", msg.msg_type, self.inner.source);
        let mut resend = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            match msg.msg_type {
                t if t.is_op() && msg.ack_id.is_some() => {
                    let op_id = msg.ack_id.as_deref().unwrap_or_default();
                    if msg.error.is_some() {
                        state.reject_op(op_id);
                    } else {
                        state.acknowledge(op_id);
                    }
                }
                t if t.is_op() => match msg.to_op() {
                    Ok(op) => state.apply_remote_op(op),
                    Err(e) => log::warn!("Dropping malformed op push: {e}"),
                },
                MessageType::Sub | MessageType::Fetch if msg.error.is_none() => {
                    resend = self.apply_doc_snapshot(&mut state, &msg);
                }
                MessageType::Qsub | MessageType::Qfetch if msg.error.is_none() => {
                    self.apply_query_snapshot(&mut state, &msg);
                }
                MessageType::Qdiff => {
                    if let (Some(collection_name), Some(expression), Some(diffs)) =
                        (&msg.collection_name, &msg.expression, &msg.diffs)
                    {
                        let key = query_key(collection_name, expression);
                        if let Some(query) = state.queries.get_mut(&key) {
                            query.apply_diffs(diffs);
                        }
                    }
                }
                _ => {}
            }
        }

        // Fire-and-forget: their acks come back as op acks.
        for op in resend {
            match Message::from_op(&op) {
                Ok(msg) => {
                    if let Err(e) = self.send(msg).await {
                        log::debug!("Resend of {} deferred: {e}", op.id);
                    }
                }
                Err(e) => log::error!("Failed to encode op {}: {e}", op.id),
            }
        }

        if let Some(ack_id) = &msg.ack_id {
            if let Some(waiter) = self.inner.pending.lock().await.remove(ack_id) {
                let _ = waiter.send(msg);
            }
        }
    }

    fn apply_doc_snapshot(&self, state: &mut ModelState, msg: &Message) -> Vec<Op> {
        let (Some(collection_name), Some(doc_id)) = (&msg.collection_name, &msg.doc_id) else {
            return Vec::new();
        };
        let version = msg.version.clone().unwrap_or_else(VersionVector::new);
        let ops = msg.ops.clone().unwrap_or_default();
        if let Some(date) = ops.iter().map(|op| op.date).max() {
            state.clock.observe(date);
        }
        match state.doc_entry(collection_name, doc_id) {
            ClientDoc::Remote(remote) => remote.apply_snapshot(version, ops, &self.inner.source),
            ClientDoc::Local(_) => Vec::new(),
        }
    }

    fn apply_query_snapshot(&self, state: &mut ModelState, msg: &Message) {
        let (Some(collection_name), Some(expression)) = (&msg.collection_name, &msg.expression) else {
            return;
        };
        let snapshot = match msg.query_snapshot_value() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Dropping malformed query snapshot: {e}");
                return;
            }
        };
        for op in msg.ops.iter().flatten() {
            state.apply_remote_op(op.clone());
        }
        state
            .queries
            .entry(query_key(collection_name, expression))
            .or_insert_with(|| RemoteQuery::new(collection_name, expression.clone()))
            .apply_snapshot(snapshot);
    }

    // ─── Mutations ────────────────────────────────────────────

    /// Apply a mutation locally, then send its ops if the document syncs.
    ///
    /// Fails only when the mutation itself is invalid or the server
    /// rejects it; offline ops stay pending and go out on reconnect.
    pub async fn mutate<F>(&self, collection_name: &str, doc_id: &str, f: F) -> Result<Vec<Op>, SyncError>
    where
        F: FnOnce(&mut Mutator<'_>) -> mutation::Result<Vec<Op>>,
    {
        let (ops, remote) = {
            let mut state = self.inner.state.lock().await;
            let ModelState { clock, docs, .. } = &mut *state;
            let doc = docs
                .entry((collection_name.to_string(), doc_id.to_string()))
                .or_insert_with(|| ClientDoc::new(collection_name, doc_id));
            let ops = f(&mut Mutator::new(doc.document_mut(), clock))?;
            for op in &ops {
                doc.notify(DocChange::Local { op_id: op.id.clone() });
            }
            (ops, !doc.is_local())
        };
        if !remote || ops.is_empty() || !self.is_connected() {
            return Ok(ops);
        }
        match self.send_ops(&ops).await {
            Ok(()) => Ok(ops),
            Err(e @ SyncError::Rejected(_)) => Err(e),
            Err(e) => {
                log::debug!("Ops on {collection_name}/{doc_id} stay pending: {e}");
                Ok(ops)
            }
        }
    }

    pub async fn add(&self, collection_name: &str, doc_id: &str, value: Value) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.add(value)).await
    }

    pub async fn set(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: Option<&str>,
        value: Value,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.set(field, value)).await
    }

    pub async fn del(&self, collection_name: &str, doc_id: &str, field: Option<&str>) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.del(field)).await
    }

    pub async fn increment(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        by: f64,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.increment(field, by)).await
    }

    pub async fn invert(&self, collection_name: &str, doc_id: &str, field: &str) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.invert(field)).await
    }

    pub async fn push(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        value: Value,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.push(field, value)).await
    }

    pub async fn unshift(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        value: Value,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.unshift(field, value)).await
    }

    pub async fn pop(&self, collection_name: &str, doc_id: &str, field: &str) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.pop(field)).await
    }

    pub async fn shift(&self, collection_name: &str, doc_id: &str, field: &str) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.shift(field)).await
    }

    pub async fn insert(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        values: Vec<Value>,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.insert(field, index, values)).await
    }

    pub async fn remove(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        count: usize,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.remove(field, index, count)).await
    }

    pub async fn move_items(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        from: usize,
        to: usize,
        count: usize,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.move_items(field, from, to, count))
            .await
    }

    pub async fn set_array(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.set_array(field, values)).await
    }

    /// Rewrite an array field to `values` with item-level ops.
    pub async fn array_diff(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.array_diff(field, values)).await
    }

    pub async fn set_string(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        text: &str,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.set_string(field, text)).await
    }

    pub async fn insert_into_string(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        text: &str,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.insert_into_string(field, index, text))
            .await
    }

    pub async fn remove_from_string(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        count: usize,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.remove_from_string(field, index, count))
            .await
    }

    /// Rewrite a string field to `text` with the fewest char ops.
    pub async fn string_diff(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        text: &str,
    ) -> Result<Vec<Op>, SyncError> {
        self.mutate(collection_name, doc_id, |m| m.string_diff(field, text)).await
    }

    // ─── Documents ────────────────────────────────────────────

    /// Subscribe to a document. Only the first reference goes to the server.
    pub async fn subscribe_doc(&self, collection_name: &str, doc_id: &str) -> Result<(), SyncError> {
        let version = {
            let mut state = self.inner.state.lock().await;
            match state.doc_entry(collection_name, doc_id) {
                ClientDoc::Local(_) => return Ok(()),
                ClientDoc::Remote(remote) => {
                    if !remote.subscribe() {
                        return Ok(());
                    }
                    remote.server_version().cloned()
                }
            }
        };
        if !self.is_connected() {
            return Ok(());
        }
        let msg = Message::doc_request(MessageType::Sub, new_id(), collection_name, doc_id, version);
        self.request(msg).await.map(|_| ())
    }

    /// Drop a reference. The last one unsubscribes on the server.
    pub async fn unsubscribe_doc(&self, collection_name: &str, doc_id: &str) -> Result<(), SyncError> {
        let last = {
            let mut state = self.inner.state.lock().await;
            let key = (collection_name.to_string(), doc_id.to_string());
            match state.docs.get_mut(&key) {
                Some(ClientDoc::Remote(remote)) => remote.unsubscribe(),
                _ => false,
            }
        };
        if !last || !self.is_connected() {
            return Ok(());
        }
        let msg = Message::doc_request(MessageType::Unsub, new_id(), collection_name, doc_id, None);
        self.request(msg).await.map(|_| ())
    }

    /// One-off read from the server, folded into the local replica.
    pub async fn fetch_doc(&self, collection_name: &str, doc_id: &str) -> Result<Option<Value>, SyncError> {
        let version = {
            let mut state = self.inner.state.lock().await;
            match state.doc_entry(collection_name, doc_id) {
                ClientDoc::Local(local) => return Ok(local.document().get(None)),
                ClientDoc::Remote(remote) => remote.server_version().cloned(),
            }
        };
        let msg = Message::doc_request(MessageType::Fetch, new_id(), collection_name, doc_id, version);
        self.request(msg).await?;
        Ok(self.get(collection_name, doc_id, None).await)
    }

    /// Current local state of a document (or one field of it).
    pub async fn get(&self, collection_name: &str, doc_id: &str, field: Option<&str>) -> Option<Value> {
        let state = self.inner.state.lock().await;
        let key = (collection_name.to_string(), doc_id.to_string());
        state.docs.get(&key)?.document().get(field)
    }

    pub async fn doc_changes(&self, collection_name: &str, doc_id: &str) -> broadcast::Receiver<DocChange> {
        self.inner
            .state
            .lock()
            .await
            .doc_entry(collection_name, doc_id)
            .changes()
    }

    /// Ops of a synced document the server has not acknowledged.
    pub async fn pending_ops(&self, collection_name: &str, doc_id: &str) -> Vec<Op> {
        let state = self.inner.state.lock().await;
        let key = (collection_name.to_string(), doc_id.to_string());
        match state.docs.get(&key) {
            Some(ClientDoc::Remote(remote)) => remote.pending_ops(&self.inner.source),
            _ => Vec::new(),
        }
    }

    // ─── Queries ──────────────────────────────────────────────

    pub async fn subscribe_query(&self, collection_name: &str, expression: Value) -> Result<(), SyncError> {
        let first = {
            let mut state = self.inner.state.lock().await;
            state
                .queries
                .entry(query_key(collection_name, &expression))
                .or_insert_with(|| RemoteQuery::new(collection_name, expression.clone()))
                .subscribe()
        };
        if !first || !self.is_connected() {
            return Ok(());
        }
        let msg = Message::query_request(MessageType::Qsub, new_id(), collection_name, expression);
        self.request(msg).await.map(|_| ())
    }

    pub async fn unsubscribe_query(&self, collection_name: &str, expression: Value) -> Result<(), SyncError> {
        let last = {
            let mut state = self.inner.state.lock().await;
            state
                .queries
                .get_mut(&query_key(collection_name, &expression))
                .is_some_and(RemoteQuery::unsubscribe)
        };
        if !last || !self.is_connected() {
            return Ok(());
        }
        let msg = Message::query_request(MessageType::Qunsub, new_id(), collection_name, expression);
        self.request(msg).await.map(|_| ())
    }

    /// One-off query; result documents are folded into the local replica.
    pub async fn fetch_query(
        &self,
        collection_name: &str,
        expression: Value,
    ) -> Result<Option<QuerySnapshot>, SyncError> {
        let key = query_key(collection_name, &expression);
        let msg = Message::query_request(MessageType::Qfetch, new_id(), collection_name, expression);
        self.request(msg).await?;
        let state = self.inner.state.lock().await;
        Ok(state.queries.get(&key).and_then(|q| q.result().cloned()))
    }

    pub async fn query_ids(&self, collection_name: &str, expression: &Value) -> Option<Vec<String>> {
        let state = self.inner.state.lock().await;
        state
            .queries
            .get(&query_key(collection_name, expression))?
            .ids()
            .map(<[String]>::to_vec)
    }

    pub async fn query_value(&self, collection_name: &str, expression: &Value) -> Option<Value> {
        let state = self.inner.state.lock().await;
        state
            .queries
            .get(&query_key(collection_name, expression))?
            .value()
            .cloned()
    }

    /// Result documents of an id query, in result order.
    pub async fn query_docs(&self, collection_name: &str, expression: &Value) -> Vec<Value> {
        let state = self.inner.state.lock().await;
        let Some(ids) = state
            .queries
            .get(&query_key(collection_name, expression))
            .and_then(RemoteQuery::ids)
        else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                let key = (collection_name.to_string(), id.clone());
                state.docs.get(&key)?.document().get(None)
            })
            .collect()
    }

    pub async fn query_changes(&self, collection_name: &str, expression: Value) -> broadcast::Receiver<()> {
        let mut state = self.inner.state.lock().await;
        state
            .queries
            .entry(query_key(collection_name, &expression))
            .or_insert_with(|| RemoteQuery::new(collection_name, expression.clone()))
            .changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_offline_mutation_stays_pending() {
        let model = Model::with_source("alice");
        model.add("notes", "n1", json!({"title": "draft"})).await.unwrap();
        model
            .set("notes", "n1", Some("title"), json!("final"))
            .await
            .unwrap();
        assert_eq!(model.get("notes", "n1", Some("title")).await, Some(json!("final")));
        assert_eq!(model.pending_ops("notes", "n1").await.len(), 2);
        assert_eq!(model.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_local_collection_never_pending() {
        let model = Model::new();
        model.add("_session", "s", json!({"tab": 1})).await.unwrap();
        model.increment("_session", "s", "tab", 2.0).await.unwrap();
        assert_eq!(model.get("_session", "s", Some("tab")).await, Some(json!(3)));
        assert!(model.pending_ops("_session", "s").await.is_empty());
        assert!(model.subscribe_doc("_session", "s").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_mutation_is_an_error() {
        let model = Model::new();
        let err = model.del("notes", "missing", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Mutation(_)));
    }

    #[tokio::test]
    async fn test_local_changes_are_announced() {
        let model = Model::new();
        let mut changes = model.doc_changes("notes", "n1").await;
        let ops = model.add("notes", "n1", json!({})).await.unwrap();
        assert_eq!(
            changes.recv().await.unwrap(),
            DocChange::Local { op_id: ops[0].id.clone() }
        );
    }

    #[tokio::test]
    async fn test_array_and_string_edits() {
        let model = Model::new();
        model.add("notes", "n1", json!({})).await.unwrap();
        model
            .set_array("notes", "n1", "tags", vec![json!(1), json!(2), json!(3)])
            .await
            .unwrap();
        model.unshift("notes", "n1", "tags", json!(0)).await.unwrap();
        model.push("notes", "n1", "tags", json!(4)).await.unwrap();
        model.pop("notes", "n1", "tags").await.unwrap();
        model.shift("notes", "n1", "tags").await.unwrap();
        model
            .insert("notes", "n1", "tags", 1, vec![json!("a"), json!("b")])
            .await
            .unwrap();
        model.remove("notes", "n1", "tags", 0, 1).await.unwrap();
        assert_eq!(
            model.get("notes", "n1", Some("tags")).await,
            Some(json!(["a", "b", 2, 3]))
        );

        model.move_items("notes", "n1", "tags", 0, 2, 2).await.unwrap();
        assert_eq!(
            model.get("notes", "n1", Some("tags")).await,
            Some(json!([2, 3, "a", "b"]))
        );
        model
            .array_diff("notes", "n1", "tags", vec![json!(3), json!("a"), json!("x")])
            .await
            .unwrap();
        assert_eq!(
            model.get("notes", "n1", Some("tags")).await,
            Some(json!([3, "a", "x"]))
        );

        model.set_string("notes", "n1", "body", "hello").await.unwrap();
        model.remove_from_string("notes", "n1", "body", 0, 1).await.unwrap();
        assert_eq!(model.get("notes", "n1", Some("body")).await, Some(json!("ello")));

        let err = model.remove("notes", "n1", "tags", 2, 5).await.unwrap_err();
        assert!(matches!(err, SyncError::Mutation(_)));
    }

    #[tokio::test]
    async fn test_requests_fail_while_disconnected() {
        let model = Model::new();
        let err = model.fetch_doc("notes", "n1").await.unwrap_err();
        assert_eq!(err, SyncError::NotConnected);
    }
}
