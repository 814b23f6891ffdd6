//! Computed queries: named resolvers evaluated server-side.
//!
//! A resolver reads documents, queries and other resolvers through a
//! [`ResolveContext`]. Every read is recorded, and an op touching any
//! recorded source re-runs the query. Resolvers may call each other but
//! never recursively:
//!
//! ```text
//!   resolve("a") ─► a ─► ctx.resolve("b") ─► b ─► ctx.resolve("a")
//!                                                   └─► Err("cyclic resolver: a -> b -> a")
//! ```

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::{run_expression, Dependencies, QueryEnv};
use crate::error::SyncError;
use crate::storage::QueryResult;

/// A server-side function producing a query value.
pub trait Resolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        ctx: &'a mut ResolveContext,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<Value, SyncError>>;
}

/// Read access for resolvers, recording dependencies as it goes.
pub struct ResolveContext {
    env: QueryEnv,
    stack: Vec<String>,
    deps: Dependencies,
}

impl ResolveContext {
    pub fn new(env: QueryEnv) -> Self {
        Self {
            env,
            stack: Vec::new(),
            deps: Dependencies::default(),
        }
    }

    /// Current state of a document, `None` when it does not exist.
    pub async fn doc(&mut self, collection_name: &str, doc_id: &str) -> Result<Option<Value>, SyncError> {
        self.deps
            .docs
            .insert((collection_name.to_string(), doc_id.to_string()));
        let doc = self.env.docs.get_or_create(collection_name, doc_id).await?;
        let state = doc.get(None).await;
        self.env.docs.release_if_idle(&doc).await;
        Ok(state)
    }

    /// Run an expression. Document results come back as an array of
    /// document states in result order; aggregates as their value.
    pub async fn query(&mut self, collection_name: &str, expression: &Value) -> Result<Value, SyncError> {
        let (result, deps) = run_expression(&self.env, collection_name, expression).await?;
        self.deps.extend(deps);
        Ok(match result {
            QueryResult::Docs(docs) => {
                Value::Array(docs.into_iter().filter_map(|doc| doc.state).collect())
            }
            QueryResult::Value(value) => value,
        })
    }

    /// Run another resolver by name.
    pub fn resolve<'a>(
        &'a mut self,
        name: &'a str,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<Value, SyncError>> {
        Box::pin(async move {
            if self.stack.iter().any(|entry| entry == name) {
                let mut chain = self.stack.clone();
                chain.push(name.to_string());
                return Err(SyncError::CyclicResolver(chain.join(" -> ")));
            }
            let resolver = self
                .env
                .resolvers
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| SyncError::UnknownResolver(name.to_string()))?;
            self.stack.push(name.to_string());
            let result = resolver.resolve(self, params).await;
            self.stack.pop();
            result
        })
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.deps
    }

    pub fn into_dependencies(self) -> Dependencies {
        self.deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::RwLock;

    use crate::registry::DocSet;
    use crate::storage::{MemoryStorage, Storage, StoredDoc};
    use tandem_core::VersionVector;

    /// Calls the resolver named in its params.
    struct Forward;

    impl Resolver for Forward {
        fn resolve<'a>(
            &'a self,
            ctx: &'a mut ResolveContext,
            params: &'a Value,
        ) -> BoxFuture<'a, Result<Value, SyncError>> {
            Box::pin(async move {
                let next = params["next"].as_str().unwrap_or_default().to_string();
                ctx.resolve(&next, &params["then"]).await
            })
        }
    }

    struct CountTodos;

    impl Resolver for CountTodos {
        fn resolve<'a>(
            &'a self,
            ctx: &'a mut ResolveContext,
            _params: &'a Value,
        ) -> BoxFuture<'a, Result<Value, SyncError>> {
            Box::pin(async move {
                let todos = ctx.query("todos", &serde_json::json!({"done": false})).await?;
                Ok(Value::from(todos.as_array().map_or(0, Vec::len)))
            })
        }
    }

    async fn env() -> QueryEnv {
        let storage = Arc::new(MemoryStorage::new());
        for (id, done) in [("t1", false), ("t2", true), ("t3", false)] {
            let doc = StoredDoc {
                id: id.into(),
                state: Some(json!({"_id": id, "done": done})),
                ops: Vec::new(),
                version: VersionVector::new(),
            };
            storage.save_doc("todos", doc, None).await.unwrap();
        }
        let storage: Arc<dyn Storage> = storage;
        let mut resolvers: HashMap<String, Arc<dyn Resolver>> = HashMap::new();
        resolvers.insert("a".into(), Arc::new(Forward));
        resolvers.insert("b".into(), Arc::new(Forward));
        resolvers.insert("open".into(), Arc::new(CountTodos));
        QueryEnv {
            docs: DocSet::new(Arc::clone(&storage), Duration::from_millis(10), Duration::from_millis(50)),
            storage,
            resolvers: Arc::new(RwLock::new(resolvers)),
        }
    }

    #[tokio::test]
    async fn test_nested_resolve_records_dependencies() {
        let mut ctx = ResolveContext::new(env().await);
        let params = json!({"next": "open"});
        let value = ctx.resolve("a", &params).await.unwrap();
        assert_eq!(value, json!(2));
        assert!(ctx.dependencies().collections.contains("todos"));
    }

    #[tokio::test]
    async fn test_cycle_is_reported_with_chain() {
        let mut ctx = ResolveContext::new(env().await);
        let params = json!({"next": "b", "then": {"next": "a"}});
        let err = ctx.resolve("a", &params).await.unwrap_err();
        assert_eq!(err.to_string(), "cyclic resolver: a -> b -> a");
    }

    #[tokio::test]
    async fn test_unknown_resolver() {
        let mut ctx = ResolveContext::new(env().await);
        let err = ctx.resolve("nope", &Value::Null).await.unwrap_err();
        assert_eq!(err, SyncError::UnknownResolver("nope".into()));
    }

    #[tokio::test]
    async fn test_doc_read_records_dependency() {
        let mut ctx = ResolveContext::new(env().await);
        // Stored without ops, so the loaded replica has nothing to replay.
        let state = ctx.doc("todos", "t2").await.unwrap();
        assert_eq!(state, None);
        assert!(ctx
            .into_dependencies()
            .docs
            .contains(&("todos".to_string(), "t2".to_string())));
    }
}
