//! Coordinator: routes channel messages to documents and queries.
//!
//! Architecture:
//! ```text
//! Channel A ──┐                        ┌── DocSet ───── ServerDoc ── Storage
//!             ├── SyncServer ──────────┤                   │
//! Channel B ──┘   handle_message       └── QuerySet ── ServerQuery
//!                    │    ▲                                │
//!    pre-op hook ◄───┤    │ echo dedup (sent-op ids)       │ qdiff / qsub
//!    post-op hook ◄──┘    │                                ▼
//!                      PubSub backplane ◄──publish──   subscribers
//! ```
//!
//! An op from a channel goes through projection validation, the pre-op
//! hook, the document (apply, fan-out, debounced save), the backplane,
//! dependent queries and finally the post-op hook. Errors before the
//! document is touched come back to the origin channel only.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture};
use serde_json::{json, Map, Value};
use tandem_core::{Clock, Op, Projection, ProjectionError, VersionVector};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::channel::Channel;
use crate::doc::{ApplyOutcome, ServerDoc};
use crate::error::SyncError;
use crate::protocol::{Message, MessageType, PROTOCOL_VERSION};
use crate::pubsub::PubSub;
use crate::query::{QueryEnv, Resolver, Resolvers, ServerQuery};
use crate::registry::{DocSet, QuerySet};
use crate::storage::{MemoryStorage, Storage};

/// Attempts at reaching a document that keeps being torn down underneath.
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Quiet period before a dirty document is written
    pub save_debounce: Duration,
    /// Grace period before an idle document or query is torn down
    pub unload_delay: Duration,
    /// How long a published op id waits for its backplane echo
    pub sent_ops_ttl: Duration,
    /// Backplane buffer for a hub this server creates
    pub pubsub_capacity: usize,
    /// Source id stamped on server clock reads
    pub server_source: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            save_debounce: Duration::from_millis(100),
            unload_delay: Duration::from_secs(5),
            sent_ops_ttl: Duration::from_secs(10),
            pubsub_capacity: 256,
            server_source: Uuid::new_v4().to_string(),
        }
    }
}

impl ServerConfig {
    /// Short timers so tests observe saves and teardown quickly.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            save_debounce: Duration::from_millis(10),
            unload_delay: Duration::from_millis(50),
            sent_ops_ttl: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_messages: u64,
    pub ops_applied: u64,
    pub ops_rejected: u64,
    pub ops_from_pubsub: u64,
    pub echoes_dropped: u64,
    pub loaded_docs: usize,
    pub live_queries: usize,
}

/// Validation hook run before an op is applied. `Err` rejects the op with
/// that message; the channel id is `None` for server-side writes.
pub type PreOpHook = Arc<dyn Fn(&Op, Option<Uuid>) -> Result<(), String> + Send + Sync>;

/// Side-effect hook run after an op committed. Errors are only logged.
pub type PostOpHook = Arc<dyn Fn(&Op) -> Result<(), String> + Send + Sync>;

struct Shared {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    docs: DocSet,
    queries: QuerySet,
    resolvers: Resolvers,
    projections: RwLock<HashMap<String, Arc<Projection>>>,
    pre_op_hook: RwLock<Option<PreOpHook>>,
    post_op_hook: RwLock<Option<PostOpHook>>,
    pubsub: Option<Arc<dyn PubSub>>,
    /// Ids of ops this process published, awaiting their echo.
    sent_ops: Mutex<HashMap<String, Instant>>,
    clock: Mutex<Clock>,
    stats: RwLock<ServerStats>,
}

/// The sync coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        Self::build(config, storage, None)
    }

    /// Server over in-memory storage.
    pub fn with_memory(config: ServerConfig) -> Self {
        Self::new(config, Arc::new(MemoryStorage::new()))
    }

    /// Server that publishes committed ops to, and applies ops from, a
    /// backplane shared with other processes.
    pub fn with_pubsub(config: ServerConfig, storage: Arc<dyn Storage>, pubsub: Arc<dyn PubSub>) -> Self {
        let server = Self::build(config, storage, Some(Arc::clone(&pubsub)));
        if let Some(rx) = pubsub.init(true) {
            server.spawn_pubsub_listener(rx);
        }
        server
    }

    fn build(config: ServerConfig, storage: Arc<dyn Storage>, pubsub: Option<Arc<dyn PubSub>>) -> Self {
        let docs = DocSet::new(Arc::clone(&storage), config.save_debounce, config.unload_delay);
        let resolvers: Resolvers = Arc::new(RwLock::new(HashMap::new()));
        let queries = QuerySet::new(
            QueryEnv {
                storage: Arc::clone(&storage),
                docs: docs.clone(),
                resolvers: Arc::clone(&resolvers),
            },
            config.unload_delay,
        );
        let clock = Clock::new(config.server_source.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                storage,
                docs,
                queries,
                resolvers,
                projections: RwLock::new(HashMap::new()),
                pre_op_hook: RwLock::new(None),
                post_op_hook: RwLock::new(None),
                pubsub,
                sent_ops: Mutex::new(HashMap::new()),
                clock: Mutex::new(clock),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Prepare the storage backend.
    pub async fn init(&self) -> Result<(), SyncError> {
        self.shared.storage.init().await?;
        log::info!("Sync server ready (source {})", self.shared.config.server_source);
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.storage
    }

    pub fn docs(&self) -> &DocSet {
        &self.shared.docs
    }

    pub fn queries(&self) -> &QuerySet {
        &self.shared.queries
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.loaded_docs = self.shared.docs.len().await;
        stats.live_queries = self.shared.queries.len().await;
        stats
    }

    // ─── Configuration ────────────────────────────────────────

    /// Expose `backing` under `name`, restricted to `fields` (all `true` to
    /// allow-list, all `false` to deny-list).
    pub async fn add_projection(
        &self,
        name: &str,
        backing: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ProjectionError> {
        let projection = Projection::from_json(name, backing, fields)?;
        self.add_projection_def(projection).await;
        Ok(())
    }

    pub async fn add_projection_def(&self, projection: Projection) {
        log::info!("Projection {} over {}", projection.name(), projection.backing());
        self.shared
            .projections
            .write()
            .await
            .insert(projection.name().to_string(), Arc::new(projection));
    }

    pub async fn register_resolver(&self, name: &str, resolver: Arc<dyn Resolver>) {
        self.shared
            .resolvers
            .write()
            .await
            .insert(name.to_string(), resolver);
    }

    pub async fn set_pre_op_hook(&self, hook: PreOpHook) {
        *self.shared.pre_op_hook.write().await = Some(hook);
    }

    pub async fn set_post_op_hook(&self, hook: PostOpHook) {
        *self.shared.post_op_hook.write().await = Some(hook);
    }

    async fn projection(&self, collection_name: &str) -> Option<Arc<Projection>> {
        self.shared.projections.read().await.get(collection_name).cloned()
    }

    // ─── Message dispatch ─────────────────────────────────────

    /// Handle one message from `channel`. Replies go back on the channel.
    pub async fn handle_message(&self, channel: &Channel, msg: Message) {
        self.shared.stats.write().await.total_messages += 1;
        log::debug!("{:?} from channel {}", msg.msg_type, channel.id());

        let msg_type = msg.msg_type;
        let reply = match msg_type {
            MessageType::Handshake => self.on_handshake(&msg).await,
            MessageType::Sync => self.on_sync(channel, &msg).await,
            MessageType::Fetch => self.on_fetch(&msg).await,
            MessageType::Sub => self.on_sub(channel, &msg).await,
            MessageType::Unsub => self.on_unsub(channel, &msg).await,
            MessageType::Qfetch => self.on_qfetch(&msg).await,
            MessageType::Qsub => self.on_qsub(channel, &msg).await,
            MessageType::Qunsub => self.on_qunsub(channel, &msg).await,
            MessageType::Ops => self.on_ops(channel, &msg).await,
            t if t.is_op() => self.on_op(channel, &msg).await,
            _ => {
                log::trace!("Ignoring {msg_type:?} from channel {}", channel.id());
                return;
            }
        };

        match reply {
            Ok(Some(reply)) => channel.send_or_log(reply),
            Ok(None) => {}
            Err(e) => {
                log::warn!("{msg_type:?} from channel {} failed: {e}", channel.id());
                if let Some(id) = msg.id {
                    channel.send_or_log(Message::ack_error(msg_type, id, e.to_string()));
                }
            }
        }
    }

    /// Detach a closed channel from everything it was attached to.
    pub async fn close_channel(&self, channel_id: Uuid) {
        self.shared.docs.unsubscribe_channel(channel_id).await;
        self.shared.queries.unsubscribe_channel(channel_id).await;
        log::debug!("Channel {channel_id} closed");
    }

    async fn on_handshake(&self, msg: &Message) -> Result<Option<Message>, SyncError> {
        let date = self.shared.clock.lock().await.now();
        Ok(msg.id.clone().map(|id| {
            let mut ack = Message::ack(MessageType::Handshake, id);
            ack.value = Some(json!({"date": date, "protocol": PROTOCOL_VERSION}));
            ack
        }))
    }

    async fn on_sync(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let request = msg.sync_request()?;
        let mut pending: Vec<BoxFuture<'_, Result<(), SyncError>>> = Vec::new();
        for doc in &request.docs {
            pending.push(Box::pin(self.subscribe_doc(
                channel,
                &doc.collection_name,
                &doc.doc_id,
                doc.version.as_ref(),
                None,
            )));
        }
        for query in &request.queries {
            pending.push(Box::pin(self.subscribe_query(
                channel,
                &query.collection_name,
                &query.expression,
                None,
            )));
        }
        let total = pending.len();
        let failed = join_all(pending)
            .await
            .into_iter()
            .filter_map(Result::err)
            .inspect(|e| log::warn!("Resync entry for channel {} failed: {e}", channel.id()))
            .count();
        log::debug!("Channel {} resynced {}/{total} entries", channel.id(), total - failed);
        Ok(msg.id.clone().map(|id| Message::ack(MessageType::Sync, id)))
    }

    async fn on_fetch(&self, msg: &Message) -> Result<Option<Message>, SyncError> {
        let (collection_name, doc_id) = doc_target(msg)?;
        let projection = self.projection(collection_name).await;
        let backing = projection.as_deref().map_or(collection_name, Projection::backing);
        let doc = self.shared.docs.get_or_create(backing, doc_id).await?;
        let mut reply = doc.fetch(projection.as_deref(), msg.version.as_ref()).await;
        self.shared.docs.release_if_idle(&doc).await;
        reply.ack_id = msg.id.clone();
        Ok(Some(reply))
    }

    async fn on_sub(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let (collection_name, doc_id) = doc_target(msg)?;
        self.subscribe_doc(channel, collection_name, doc_id, msg.version.as_ref(), msg.id.clone())
            .await?;
        Ok(None)
    }

    async fn on_unsub(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let (collection_name, doc_id) = doc_target(msg)?;
        let projection = self.projection(collection_name).await;
        let backing = projection.as_deref().map_or(collection_name, Projection::backing);
        if let Some(doc) = self.shared.docs.get(backing, doc_id).await {
            self.shared.docs.unsubscribe(&doc, channel.id()).await;
        }
        Ok(msg.id.clone().map(|id| Message::ack(MessageType::Unsub, id)))
    }

    async fn on_qfetch(&self, msg: &Message) -> Result<Option<Message>, SyncError> {
        let (collection_name, expression) = query_target(msg)?;
        let query = self.query(collection_name, expression).await?;
        let mut reply = query.fetch().await?;
        self.shared.queries.release_if_idle(&query).await;
        reply.ack_id = msg.id.clone();
        Ok(Some(reply))
    }

    async fn on_qsub(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let (collection_name, expression) = query_target(msg)?;
        self.subscribe_query(channel, collection_name, expression, msg.id.clone())
            .await?;
        Ok(None)
    }

    async fn on_qunsub(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let (collection_name, expression) = query_target(msg)?;
        if let Some(query) = self.shared.queries.get(collection_name, expression).await {
            self.shared.queries.unsubscribe(&query, channel.id()).await;
        }
        Ok(msg.id.clone().map(|id| Message::ack(MessageType::Qunsub, id)))
    }

    /// Batch of ops: each rejection is acked on its own, keyed by op id,
    /// and the batch ack carries the first rejection.
    async fn on_ops(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let ops = msg.ops.clone().unwrap_or_default();
        let mut first_error = None;
        for op in ops {
            let op_id = op.id.clone();
            let op_type = MessageType::for_op(&op);
            if let Err(e) = self.process_op(op, Some(channel.id())).await {
                channel.send_or_log(Message::ack_error(op_type, op_id, e.to_string()));
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(msg.id.clone().map(|id| Message::ack(MessageType::Ops, id))),
        }
    }

    async fn on_op(&self, channel: &Channel, msg: &Message) -> Result<Option<Message>, SyncError> {
        let op = msg.to_op()?;
        self.process_op(op, Some(channel.id())).await?;
        Ok(msg.id.clone().map(|id| Message::ack(msg.msg_type, id)))
    }

    // ─── Subscriptions ────────────────────────────────────────

    async fn subscribe_doc(
        &self,
        channel: &Channel,
        collection_name: &str,
        doc_id: &str,
        version: Option<&VersionVector>,
        ack_id: Option<String>,
    ) -> Result<(), SyncError> {
        let projection = self.projection(collection_name).await;
        let backing = projection.as_deref().map_or(collection_name, Projection::backing);
        for _ in 0..MAX_ATTACH_ATTEMPTS {
            let doc = self.shared.docs.get_or_create(backing, doc_id).await?;
            if doc
                .subscribe(channel.clone(), projection.clone(), version, ack_id.clone())
                .await
            {
                return Ok(());
            }
        }
        Err(SyncError::Unavailable(format!("{collection_name}/{doc_id}")))
    }

    async fn query(&self, collection_name: &str, expression: &Value) -> Result<Arc<ServerQuery>, SyncError> {
        let projection = self.projection(collection_name).await;
        self.shared
            .queries
            .get_or_create(collection_name, expression, projection)
            .await
    }

    async fn subscribe_query(
        &self,
        channel: &Channel,
        collection_name: &str,
        expression: &Value,
        ack_id: Option<String>,
    ) -> Result<(), SyncError> {
        for _ in 0..MAX_ATTACH_ATTEMPTS {
            let query = self.query(collection_name, expression).await?;
            if query.subscribe(channel.clone(), ack_id.clone()).await? {
                return Ok(());
            }
        }
        Err(SyncError::Unavailable(format!("query {collection_name} {expression}")))
    }

    // ─── Ops ──────────────────────────────────────────────────

    /// Apply an op originating on the server itself (no channel).
    pub async fn submit_op(&self, op: Op) -> Result<(), SyncError> {
        self.process_op(op, None).await
    }

    async fn process_op(&self, op: Op, origin: Option<Uuid>) -> Result<(), SyncError> {
        let op = match self.projection(&op.collection_name).await {
            Some(projection) => {
                if let Err(e) = projection.validate_op(&op) {
                    self.shared.stats.write().await.ops_rejected += 1;
                    return Err(e.into());
                }
                projection.unproject_op(op)
            }
            None => op,
        };

        let pre_op_hook = self.shared.pre_op_hook.read().await.clone();
        if let Some(hook) = pre_op_hook {
            if let Err(reason) = hook(&op, origin) {
                self.shared.stats.write().await.ops_rejected += 1;
                log::debug!("Op {} rejected by pre-op hook: {reason}", op.id);
                return Err(SyncError::Rejected(reason));
            }
        }

        self.shared.clock.lock().await.observe(op.date);
        if !self.apply_to_doc(&op, origin, true).await? {
            return Ok(());
        }
        self.shared.stats.write().await.ops_applied += 1;

        self.publish(&op).await;
        self.shared
            .queries
            .on_op(&op.collection_name, &op.doc_id)
            .await;

        let post_op_hook = self.shared.post_op_hook.read().await.clone();
        if let Some(hook) = post_op_hook {
            if let Err(e) = hook(&op) {
                log::error!("Post-op hook failed for {}: {e}", op.id);
            }
        }
        Ok(())
    }

    /// Apply to the loaded document, loading it first. False for duplicates.
    async fn apply_to_doc(&self, op: &Op, origin: Option<Uuid>, persist: bool) -> Result<bool, SyncError> {
        for _ in 0..MAX_ATTACH_ATTEMPTS {
            let doc = self
                .shared
                .docs
                .get_or_create(&op.collection_name, &op.doc_id)
                .await?;
            match doc.apply_op(op.clone(), origin, persist).await {
                ApplyOutcome::New => {
                    self.shared.docs.release_if_idle(&doc).await;
                    return Ok(true);
                }
                ApplyOutcome::Duplicate => return Ok(false),
                ApplyOutcome::Destroyed => continue,
            }
        }
        Err(SyncError::Unavailable(format!("{}/{}", op.collection_name, op.doc_id)))
    }

    // ─── Backplane ────────────────────────────────────────────

    async fn publish(&self, op: &Op) {
        let Some(pubsub) = &self.shared.pubsub else {
            return;
        };
        let msg = match Message::from_op(op) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Failed to encode op {} for pubsub: {e}", op.id);
                return;
            }
        };
        {
            let now = Instant::now();
            let ttl = self.shared.config.sent_ops_ttl;
            let mut sent = self.shared.sent_ops.lock().await;
            sent.retain(|_, at| now.duration_since(*at) < ttl);
            sent.insert(op.id.clone(), now);
        }
        if let Err(e) = pubsub.publish(&msg).await {
            log::error!("Failed to publish op {}: {e}", op.id);
        }
    }

    fn spawn_pubsub_listener(&self, mut rx: tokio::sync::broadcast::Receiver<crate::pubsub::Frame>) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                let frame = match rx.recv().await {
                    Ok(frame) => frame,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Pubsub listener lagged by {n} messages");
                        continue;
                    }
                    Err(_) => break,
                };
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                SyncServer { shared }.on_pubsub_frame(&frame).await;
            }
            log::debug!("Pubsub listener stopped");
        });
    }

    async fn on_pubsub_frame(&self, frame: &str) {
        let op = match Message::decode(frame).and_then(|msg| msg.to_op()) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("Dropping malformed pubsub frame: {e}");
                return;
            }
        };
        if self.shared.sent_ops.lock().await.remove(&op.id).is_some() {
            self.shared.stats.write().await.echoes_dropped += 1;
            log::trace!("Dropped own echo {}", op.id);
            return;
        }
        self.shared.clock.lock().await.observe(op.date);
        // The publishing process persists the op; only a loaded copy here
        // needs it, and an unloaded one reads it from storage later.
        if let Some(doc) = self.shared.docs.get(&op.collection_name, &op.doc_id).await {
            if doc.apply_op(op.clone(), None, false).await != ApplyOutcome::New {
                return;
            }
        }
        self.shared.stats.write().await.ops_from_pubsub += 1;
        self.shared
            .queries
            .on_op(&op.collection_name, &op.doc_id)
            .await;
    }
}

fn doc_target(msg: &Message) -> Result<(&str, &str), SyncError> {
    let collection_name = msg
        .collection_name
        .as_deref()
        .ok_or_else(|| SyncError::InvalidMessage("missing collectionName".into()))?;
    let doc_id = msg
        .doc_id
        .as_deref()
        .ok_or_else(|| SyncError::InvalidMessage("missing docId".into()))?;
    Ok((collection_name, doc_id))
}

fn query_target(msg: &Message) -> Result<(&str, &Value), SyncError> {
    let collection_name = msg
        .collection_name
        .as_deref()
        .ok_or_else(|| SyncError::InvalidMessage("missing collectionName".into()))?;
    let expression = msg
        .expression
        .as_ref()
        .ok_or_else(|| SyncError::InvalidMessage("missing expression".into()))?;
    Ok((collection_name, expression))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{Document, Mutator};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn server() -> SyncServer {
        SyncServer::with_memory(ServerConfig::for_testing())
    }

    fn add_op(collection: &str, id: &str, value: Value) -> Op {
        let mut doc = Document::new(collection, id);
        let mut clock = Clock::new("client");
        Mutator::new(&mut doc, &mut clock).add(value).unwrap().remove(0)
    }

    async fn recv(rx: &mut UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.save_debounce, Duration::from_millis(100));
        assert_eq!(config.unload_delay, Duration::from_secs(5));
        assert_eq!(config.pubsub_capacity, 256);
        assert_ne!(config.server_source, ServerConfig::default().server_source);
    }

    #[tokio::test]
    async fn test_handshake_ack_carries_date_and_protocol() {
        let server = server();
        let (channel, mut rx) = Channel::pair();
        server.handle_message(&channel, Message::handshake("h1")).await;
        let ack = recv(&mut rx).await;
        assert_eq!(ack.ack_id.as_deref(), Some("h1"));
        let value = ack.value.unwrap();
        assert_eq!(value["protocol"], json!(PROTOCOL_VERSION));
        assert!(value["date"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_op_ack_and_fan_out() {
        let server = server();
        let (a, mut rx_a) = Channel::pair();
        let (b, mut rx_b) = Channel::pair();
        for (channel, rx) in [(&a, &mut rx_a), (&b, &mut rx_b)] {
            let sub = Message::doc_request(MessageType::Sub, "s", "users", "42", None);
            server.handle_message(channel, sub).await;
            assert_eq!(recv(rx).await.msg_type, MessageType::Sub);
        }

        let op = add_op("users", "42", json!({"name": "Ann"}));
        server.handle_message(&a, Message::from_op(&op).unwrap()).await;
        let ack = recv(&mut rx_a).await;
        assert_eq!(ack.ack_id.as_deref(), Some(op.id.as_str()));
        assert!(ack.error.is_none());
        let pushed = recv(&mut rx_b).await;
        assert_eq!(pushed.to_op().unwrap(), op);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(server.stats().await.ops_applied, 1);
    }

    #[tokio::test]
    async fn test_pre_op_hook_rejects_to_origin_only() {
        let server = server();
        server
            .set_pre_op_hook(Arc::new(|op: &Op, _: Option<Uuid>| {
                if op.collection_name == "locked" {
                    Err("collection is read only".to_string())
                } else {
                    Ok(())
                }
            }))
            .await;
        let (a, mut rx_a) = Channel::pair();
        let op = add_op("locked", "1", json!({}));
        server.handle_message(&a, Message::from_op(&op).unwrap()).await;
        let ack = recv(&mut rx_a).await;
        assert_eq!(ack.error.as_deref(), Some("collection is read only"));
        assert!(server.docs().get("locked", "1").await.is_none());
        assert_eq!(server.stats().await.ops_rejected, 1);
    }

    #[tokio::test]
    async fn test_post_op_hook_failure_is_not_surfaced() {
        let server = server();
        server
            .set_post_op_hook(Arc::new(|_: &Op| Err("audit sink down".to_string())))
            .await;
        let (a, mut rx_a) = Channel::pair();
        let op = add_op("notes", "1", json!({}));
        server.handle_message(&a, Message::from_op(&op).unwrap()).await;
        assert!(recv(&mut rx_a).await.error.is_none());
    }

    #[tokio::test]
    async fn test_missing_fields_and_unknown_types() {
        let server = server();
        let (a, mut rx_a) = Channel::pair();
        let mut bad = Message::new(MessageType::Sub);
        bad.id = Some("x".into());
        server.handle_message(&a, bad).await;
        let ack = recv(&mut rx_a).await;
        assert_eq!(ack.error.as_deref(), Some("Invalid message: missing collectionName"));

        server.handle_message(&a, Message::new(MessageType::Unknown)).await;
        server.handle_message(&a, Message::new(MessageType::Qdiff)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fetch_replies_with_snapshot() {
        let server = server();
        server.submit_op(add_op("users", "1", json!({"name": "Ann"}))).await.unwrap();
        let (a, mut rx_a) = Channel::pair();
        let fetch = Message::doc_request(MessageType::Fetch, "f1", "users", "1", None);
        server.handle_message(&a, fetch).await;
        let reply = recv(&mut rx_a).await;
        assert_eq!(reply.msg_type, MessageType::Fetch);
        assert_eq!(reply.ack_id.as_deref(), Some("f1"));
        assert_eq!(reply.ops.unwrap().len(), 1);
    }
}
