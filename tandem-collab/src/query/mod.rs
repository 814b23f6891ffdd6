//! Live queries.
//!
//! ```text
//!            ┌──────────── evaluate ─────────────┐
//!  Plain     │ storage candidates (filter only)  │
//!            │   + loaded in-memory doc states   │──► ids │ value
//!            │   → db_queries().evaluate(expr)   │
//!  Join      │ resolve "$$c.d.f" refs first      │
//!  Computed  │ resolver graph via ResolveContext │──► value
//!            └───────────────────────────────────┘
//!  ids change   ──► subscribe channels to inserted docs, then `qdiff`
//!  value change ──► `qsub` push (deep equality)
//! ```
//!
//! Any op on a collection (or document) a query read from re-evaluates it.

pub mod computed;
pub mod join;
pub mod remote;
pub mod server;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::protocol::QuerySnapshot;
use crate::registry::DocSet;
use crate::storage::{QueryResult, Storage, StoreError, StoredDoc};

pub use computed::{ResolveContext, Resolver};
pub use remote::RemoteQuery;
pub use server::ServerQuery;

/// Registered resolvers by name.
pub type Resolvers = Arc<RwLock<HashMap<String, Arc<dyn Resolver>>>>;

/// (collection or resolver name, canonical expression)
pub type QueryKey = (String, String);

/// Registry key for a query. `serde_json` maps keep keys sorted, so equal
/// expressions always render the same.
pub fn query_key(collection_name: &str, expression: &Value) -> QueryKey {
    (collection_name.to_string(), expression.to_string())
}

/// What a query evaluation needs from the server.
#[derive(Clone)]
pub struct QueryEnv {
    pub storage: Arc<dyn Storage>,
    pub docs: DocSet,
    pub resolvers: Resolvers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Plain,
    Join,
    /// Runs the named resolver with the expression as parameters.
    Computed(String),
}

/// Sources a query result was derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub collections: HashSet<String>,
    pub docs: HashSet<(String, String)>,
}

impl Dependencies {
    pub fn touches(&self, collection_name: &str, doc_id: &str) -> bool {
        self.collections.contains(collection_name)
            || self
                .docs
                .contains(&(collection_name.to_string(), doc_id.to_string()))
    }

    pub fn extend(&mut self, other: Dependencies) {
        self.collections.extend(other.collections);
        self.docs.extend(other.docs);
    }
}

impl From<QueryResult> for QuerySnapshot {
    fn from(result: QueryResult) -> Self {
        match result {
            QueryResult::Docs(_) => QuerySnapshot::Ids { ids: result.ids() },
            QueryResult::Value(value) => QuerySnapshot::Value { value },
        }
    }
}

/// Evaluate a plain expression over `collection_name`.
///
/// Storage supplies candidates; documents loaded in memory override their
/// stored copies, so results reflect writes still waiting on a save.
pub async fn run_plain(
    env: &QueryEnv,
    collection_name: &str,
    expression: &Value,
) -> Result<QueryResult, StoreError> {
    let queries = env.storage.db_queries();
    let candidates = env
        .storage
        .get_docs_by_query(collection_name, &queries.filter_only(expression))
        .await?;
    let mut by_id: BTreeMap<String, StoredDoc> = match candidates {
        QueryResult::Docs(docs) => docs.into_iter().map(|d| (d.id.clone(), d)).collect(),
        QueryResult::Value(_) => BTreeMap::new(),
    };
    for doc in env.docs.loaded_in(collection_name).await {
        let stored = doc.to_stored().await;
        by_id.insert(stored.id.clone(), stored);
    }
    Ok(queries.evaluate(expression, by_id.into_values().collect()))
}

/// Evaluate a plain or join expression, recording what it read.
pub async fn run_expression(
    env: &QueryEnv,
    collection_name: &str,
    expression: &Value,
) -> Result<(QueryResult, Dependencies), StoreError> {
    let mut deps = Dependencies::default();
    deps.collections.insert(collection_name.to_string());
    if env.storage.db_queries().is_join_query(expression) {
        let (resolved, join_deps) = join::resolve_joins(env, expression).await?;
        deps.extend(join_deps);
        Ok((run_plain(env, collection_name, &resolved).await?, deps))
    } else {
        Ok((run_plain(env, collection_name, expression).await?, deps))
    }
}
