//! Join references: `"$$<collection>.<docId>.<field>"` strings inside an
//! expression are replaced by the current value of that field before the
//! expression runs. A missing document or field resolves to `null`.

use std::collections::HashMap;

use serde_json::Value;

use super::{Dependencies, QueryEnv};
use crate::storage::query::substitute_joins;
use crate::storage::StoreError;

/// Substitute every join reference in `expression`.
pub async fn resolve_joins(
    env: &QueryEnv,
    expression: &Value,
) -> Result<(Value, Dependencies), StoreError> {
    let mut deps = Dependencies::default();
    let mut values = HashMap::new();
    for field in env.storage.db_queries().join_fields(expression) {
        let doc = env.docs.get_or_create(&field.collection, &field.doc_id).await?;
        let value = doc.get(Some(&field.field)).await.unwrap_or(Value::Null);
        env.docs.release_if_idle(&doc).await;
        deps.docs
            .insert((field.collection.clone(), field.doc_id.clone()));
        values.insert(field.reference(), value);
    }
    let resolved = substitute_joins(expression, &|field| {
        values.get(&field.reference()).cloned().unwrap_or(Value::Null)
    });
    Ok((resolved, deps))
}
