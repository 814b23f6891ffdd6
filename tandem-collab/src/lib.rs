//! # tandem-collab — Multi-client sync engine over tandem-core documents
//!
//! A coordinator keeps one authoritative copy of every document and live
//! query in use, persists documents with optimistic version checks, and
//! fans ops out to every subscribed channel. Client models hold replicas,
//! mutate optimistically and reconcile after reconnecting.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Channel / WebSocket   ┌──────────────┐
//! │ Model       │ ◄─────────────────────► │ SyncServer   │ ◄──► PubSub
//! │ (per user)  │     JSON messages       │ (coordinator)│      backplane
//! └──────┬──────┘                         └──────┬───────┘
//!        │                                 ┌─────┴──────┐
//!        ▼                                 ▼            ▼
//! ┌─────────────┐                   ┌──────────┐ ┌─────────────┐
//! │ RemoteDoc   │                   │ DocSet   │ │ QuerySet    │
//! │ LocalDoc    │                   │ ServerDoc│ │ ServerQuery │
//! │ RemoteQuery │                   └────┬─────┘ └─────────────┘
//! └─────────────┘                        │ debounced CAS saves
//!                                        ▼
//!                                 ┌──────────────┐
//!                                 │ Storage      │ memory │ RocksDB
//!                                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`channel`] — per-connection message pipe
//! - [`doc`] — local, remote and server document lifecycles
//! - [`query`] — plain, join and computed live queries
//! - [`registry`] — one instance per document / query, idle teardown
//! - [`server`] — coordinator, projections, hooks, backplane dedup
//! - [`client`] — client model
//! - [`transport`] — in-process and WebSocket connections
//! - [`storage`] — storage contract, in-memory and RocksDB backends
//! - [`pubsub`] — cross-process op backplane

pub mod channel;
pub mod client;
pub mod doc;
pub mod error;
pub mod load;
pub mod protocol;
pub mod pubsub;
pub mod query;
pub mod registry;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use channel::Channel;
pub use client::{ConnectionState, Model};
pub use doc::{ClientDoc, DocChange, LocalDoc, RemoteDoc, ServerDoc};
pub use error::SyncError;
pub use protocol::{Message, MessageType, ProtocolError, QuerySnapshot, PROTOCOL_VERSION};
pub use pubsub::{PubSub, PubSubHub, PubSubStats};
pub use query::{ResolveContext, Resolver, RemoteQuery, ServerQuery};
pub use registry::{DocSet, QuerySet};
pub use server::{PostOpHook, PreOpHook, ServerConfig, ServerStats, SyncServer};
pub use storage::{
    MemoryStorage, QueryResult, RocksConfig, RocksStorage, Storage, StoreError, StoredDoc,
};
pub use transport::{connect, connect_local, serve, serve_listener};
