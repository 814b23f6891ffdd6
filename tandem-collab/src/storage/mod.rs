//! Persistent storage contract and the bundled backends.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  load / save(prevVersion)  ┌────────────────────────┐
//! │ ServerDoc   │ ─────────────────────────► │ dyn Storage            │
//! │ ServerQuery │ ◄── StoredDoc / result ─── │  MemoryStorage (tests) │
//! └─────────────┘                            │  RocksStorage (LZ4)    │
//!                                            └───────────┬────────────┘
//!                                                        │ db_queries()
//!                                                        ▼
//!                                            ┌────────────────────────┐
//!                                            │ JsonQueries            │
//!                                            │ filter/order/skip/limit│
//!                                            │ $count, $$join refs    │
//!                                            └────────────────────────┘
//! ```
//!
//! Saves are optimistic: a backend refuses a write whose `prev_version`
//! differs from the version it currently holds, and the document reloads
//! and retries.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 7
//! (compare-and-set)

pub mod memory;
pub mod query;
pub mod rocks;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Op, VersionVector};

pub use memory::MemoryStorage;
pub use query::{DbQueries, JoinField, JsonQueries};
pub use rocks::{RocksConfig, RocksStorage};

/// A document as persisted: materialized state, retained ops, version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: String,
    /// `None` when the document was deleted.
    pub state: Option<Value>,
    pub ops: Vec<Op>,
    pub version: VersionVector,
}

/// What a storage-evaluated query returns.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Matching documents, in result order.
    Docs(Vec<StoredDoc>),
    /// Aggregate such as `$count`.
    Value(Value),
}

impl QueryResult {
    /// Ids of a document result; empty for aggregates.
    pub fn ids(&self) -> Vec<String> {
        match self {
            QueryResult::Docs(docs) => docs.iter().map(|d| d.id.clone()).collect(),
            QueryResult::Value(_) => Vec::new(),
        }
    }
}

/// Persistence backend contract.
pub trait Storage: Send + Sync {
    fn init(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    fn get_doc_by_id<'a>(
        &'a self,
        collection: &'a str,
        doc_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredDoc>, StoreError>>;

    fn get_docs_by_query<'a>(
        &'a self,
        collection: &'a str,
        expression: &'a Value,
    ) -> BoxFuture<'a, Result<QueryResult, StoreError>>;

    /// Write `doc` if the stored version still equals `prev_version`
    /// (`None` = not stored yet); otherwise fail with
    /// [`StoreError::VersionConflict`].
    fn save_doc<'a>(
        &'a self,
        collection: &'a str,
        doc: StoredDoc,
        prev_version: Option<VersionVector>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get_collection_names(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;

    /// Expression helpers matching this backend's query language.
    fn db_queries(&self) -> &dyn DbQueries;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Document not found
    NotFound(String),
    /// Stored version differs from the expected previous version
    VersionConflict { collection: String, doc_id: String },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::VersionConflict { collection, doc_id } => {
                write!(f, "Version conflict saving {collection}/{doc_id}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::VersionConflict {
            collection: "notes".into(),
            doc_id: "n1".into(),
        };
        assert_eq!(err.to_string(), "Version conflict saving notes/n1");
        assert_eq!(
            StoreError::NotFound("n1".into()).to_string(),
            "Document not found: n1"
        );
    }

    #[test]
    fn test_query_result_ids() {
        let doc = StoredDoc {
            id: "a".into(),
            state: Some(json!({"_id": "a"})),
            ops: Vec::new(),
            version: VersionVector::new(),
        };
        assert_eq!(QueryResult::Docs(vec![doc]).ids(), vec!["a"]);
        assert!(QueryResult::Value(json!(1)).ids().is_empty());
    }
}
