//! JSON wire protocol shared by the coordinator and client replicas.
//!
//! Every frame is one flat JSON object:
//! ```text
//! { "type": "sub" | "set" | …,  "id"?, "ackId"?,
//!   "collectionName"?, "docId"?, "field"?, "value"?, "version"?,
//!   "expression"?, "ops"?, "error"?, "diffs"?,
//!   "source"?, "date"?, "itemId"?, "charId"?, "positionId"? }
//! ```
//!
//! An op travels as a message whose `type` is its op type and whose `id` is
//! its op id, so a single-op message and its ack correlate on the op id.
//! Every client message carrying an `id` gets exactly one reply whose
//! `ackId` equals that id, with `error` set on failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Op, OpKind, QueryDiff, VersionVector};

/// Version of the message vocabulary announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message types: control messages plus one per op type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Handshake,
    /// Bulk resubscribe after reconnect
    Sync,
    Fetch,
    Sub,
    Unsub,
    Qfetch,
    Qsub,
    Qunsub,
    /// Batch of ops in `ops`
    Ops,
    /// Live query id-list diff push
    Qdiff,
    Add,
    Set,
    Del,
    Push,
    Unshift,
    Pop,
    Shift,
    Insert,
    Remove,
    Move,
    ArraySet,
    Invert,
    Increment,
    StringInsert,
    StringRemove,
    StringSet,
    /// Anything this build does not know; ignored by both ends.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Whether this type carries a single op.
    pub fn is_op(&self) -> bool {
        matches!(
            self,
            MessageType::Add
                | MessageType::Set
                | MessageType::Del
                | MessageType::Push
                | MessageType::Unshift
                | MessageType::Pop
                | MessageType::Shift
                | MessageType::Insert
                | MessageType::Remove
                | MessageType::Move
                | MessageType::ArraySet
                | MessageType::Invert
                | MessageType::Increment
                | MessageType::StringInsert
                | MessageType::StringRemove
                | MessageType::StringSet
        )
    }

    /// Message type carrying `op`.
    pub fn for_op(op: &Op) -> MessageType {
        match op.kind {
            OpKind::Add { .. } => MessageType::Add,
            OpKind::Set { .. } => MessageType::Set,
            OpKind::Del => MessageType::Del,
            OpKind::Push { .. } => MessageType::Push,
            OpKind::Unshift { .. } => MessageType::Unshift,
            OpKind::Pop => MessageType::Pop,
            OpKind::Shift => MessageType::Shift,
            OpKind::Insert { .. } => MessageType::Insert,
            OpKind::Remove { .. } => MessageType::Remove,
            OpKind::Move { .. } => MessageType::Move,
            OpKind::ArraySet { .. } => MessageType::ArraySet,
            OpKind::Invert => MessageType::Invert,
            OpKind::Increment { .. } => MessageType::Increment,
            OpKind::StringInsert { .. } => MessageType::StringInsert,
            OpKind::StringRemove { .. } => MessageType::StringRemove,
            OpKind::StringSet { .. } => MessageType::StringSet,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionVector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops: Option<Vec<Op>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffs: Option<Vec<QueryDiff>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

impl Message {
    /// Empty message of the given type.
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            id: None,
            ack_id: None,
            collection_name: None,
            doc_id: None,
            field: None,
            value: None,
            version: None,
            expression: None,
            ops: None,
            error: None,
            diffs: None,
            source: None,
            date: None,
            item_id: None,
            char_id: None,
            position_id: None,
        }
    }

    /// Successful reply to the message with id `ack_id`.
    pub fn ack(msg_type: MessageType, ack_id: impl Into<String>) -> Self {
        Self {
            ack_id: Some(ack_id.into()),
            ..Self::new(msg_type)
        }
    }

    /// Failed reply to the message with id `ack_id`.
    pub fn ack_error(
        msg_type: MessageType,
        ack_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            ack_id: Some(ack_id.into()),
            error: Some(error.into()),
            ..Self::new(msg_type)
        }
    }

    /// Client greeting.
    pub fn handshake(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(MessageType::Handshake)
        }
    }

    /// `fetch`/`sub`/`unsub` request for one document.
    pub fn doc_request(
        msg_type: MessageType,
        id: impl Into<String>,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        version: Option<VersionVector>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            collection_name: Some(collection_name.into()),
            doc_id: Some(doc_id.into()),
            version,
            ..Self::new(msg_type)
        }
    }

    /// `qfetch`/`qsub`/`qunsub` request for one query.
    pub fn query_request(
        msg_type: MessageType,
        id: impl Into<String>,
        collection_name: impl Into<String>,
        expression: Value,
    ) -> Self {
        Self {
            id: Some(id.into()),
            collection_name: Some(collection_name.into()),
            expression: Some(expression),
            ..Self::new(msg_type)
        }
    }

    /// Document snapshot: the server's version plus the ops the peer lacks.
    pub fn snapshot(
        msg_type: MessageType,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        version: VersionVector,
        ops: Vec<Op>,
    ) -> Self {
        Self {
            collection_name: Some(collection_name.into()),
            doc_id: Some(doc_id.into()),
            version: Some(version),
            ops: Some(ops),
            ..Self::new(msg_type)
        }
    }

    /// Live query id-list diff push.
    pub fn qdiff(collection_name: impl Into<String>, expression: Value, diffs: Vec<QueryDiff>) -> Self {
        Self {
            collection_name: Some(collection_name.into()),
            expression: Some(expression),
            diffs: Some(diffs),
            ..Self::new(MessageType::Qdiff)
        }
    }

    /// Live query snapshot (ids or aggregate value).
    pub fn query_snapshot(
        msg_type: MessageType,
        collection_name: impl Into<String>,
        expression: Value,
        snapshot: &QuerySnapshot,
    ) -> Result<Self, ProtocolError> {
        let value = serde_json::to_value(snapshot)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            collection_name: Some(collection_name.into()),
            expression: Some(expression),
            value: Some(value),
            ..Self::new(msg_type)
        })
    }

    /// Batch of ops.
    pub fn ops(id: impl Into<String>, ops: Vec<Op>) -> Self {
        Self {
            id: Some(id.into()),
            ops: Some(ops),
            ..Self::new(MessageType::Ops)
        }
    }

    /// Carry a single op; the op id doubles as the message id.
    pub fn from_op(op: &Op) -> Result<Self, ProtocolError> {
        let value =
            serde_json::to_value(op).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Extract the op carried by a single-op message.
    pub fn to_op(&self) -> Result<Op, ProtocolError> {
        if !self.msg_type.is_op() {
            return Err(ProtocolError::InvalidMessageType);
        }
        let mut value = serde_json::to_value(self)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("ackId");
            // `"value": null` is dropped on the way in; op payloads need it back.
            map.entry("value").or_insert(Value::Null);
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse the `sync` payload carried in `value`.
    pub fn sync_request(&self) -> Result<SyncRequest, ProtocolError> {
        if self.msg_type != MessageType::Sync {
            return Err(ProtocolError::InvalidMessageType);
        }
        match &self.value {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
            None => Ok(SyncRequest::default()),
        }
    }

    /// Parse the query snapshot carried in `value`.
    pub fn query_snapshot_value(&self) -> Result<QuerySnapshot, ProtocolError> {
        let value = self
            .value
            .clone()
            .ok_or_else(|| ProtocolError::DeserializationError("missing query value".into()))?;
        serde_json::from_value(value).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn is_ack(&self) -> bool {
        self.ack_id.is_some()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// `sync` payload: everything a reconnecting replica was subscribed to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub docs: Vec<SyncDoc>,
    #[serde(default)]
    pub queries: Vec<SyncQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDoc {
    pub collection_name: String,
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    pub collection_name: String,
    pub expression: Value,
}

/// Result of a live query as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QuerySnapshot {
    /// Document query: ordered ids.
    Ids { ids: Vec<String> },
    /// Aggregate or computed query.
    Value { value: Value },
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
