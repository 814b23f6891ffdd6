//! The JSON predicate language evaluated by the bundled backends.
//!
//! ```text
//! { "done": false,                    field equality (dot paths allowed)
//!   "owner": "$$users.u1.teamId",     join reference, resolved before evaluation
//!   "$orderby": { "rank": -1 },       sort (ties broken by id)
//!   "$skip": 10, "$limit": 5,         paging
//!   "$count": true }                  aggregate: a number instead of documents
//! ```

use std::cmp::Ordering;

use serde_json::{Map, Value};
use tandem_core::value::json_path;

use super::{QueryResult, StoredDoc};

const JOIN_PREFIX: &str = "$$";

/// A `"$$collection.docId.field"` reference inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinField {
    pub collection: String,
    pub doc_id: String,
    pub field: String,
}

impl JoinField {
    pub fn parse(reference: &str) -> Option<Self> {
        let rest = reference.strip_prefix(JOIN_PREFIX)?;
        let mut parts = rest.splitn(3, '.');
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let doc_id = parts.next().filter(|s| !s.is_empty())?;
        let field = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            field: field.to_string(),
        })
    }

    /// The reference string this field was parsed from.
    pub fn reference(&self) -> String {
        format!("{JOIN_PREFIX}{}.{}.{}", self.collection, self.doc_id, self.field)
    }
}

/// Expression helpers a backend exposes to the query engine.
pub trait DbQueries: Send + Sync {
    fn is_query(&self, expression: &Value) -> bool;
    fn is_join_query(&self, expression: &Value) -> bool;
    fn join_fields(&self, expression: &Value) -> Vec<JoinField>;
    /// Expression minus paging and aggregation, for candidate fetches.
    fn filter_only(&self, expression: &Value) -> Value;
    /// Evaluate an expression over candidate documents.
    fn evaluate(&self, expression: &Value, docs: Vec<StoredDoc>) -> QueryResult;
}

/// Evaluator for the predicate language above.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonQueries;

impl DbQueries for JsonQueries {
    fn is_query(&self, expression: &Value) -> bool {
        expression.is_object()
    }

    fn is_join_query(&self, expression: &Value) -> bool {
        !self.join_fields(expression).is_empty()
    }

    fn join_fields(&self, expression: &Value) -> Vec<JoinField> {
        let mut fields = Vec::new();
        collect_join_fields(expression, &mut fields);
        fields
    }

    fn filter_only(&self, expression: &Value) -> Value {
        match expression {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "$skip" | "$limit" | "$count"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn evaluate(&self, expression: &Value, docs: Vec<StoredDoc>) -> QueryResult {
        evaluate(expression, docs)
    }
}

fn collect_join_fields(value: &Value, out: &mut Vec<JoinField>) {
    match value {
        Value::String(s) => {
            if let Some(field) = JoinField::parse(s) {
                if !out.contains(&field) {
                    out.push(field);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_join_fields(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_join_fields(v, out)),
        _ => {}
    }
}

/// Replace every join reference with the value `lookup` yields for it.
pub fn substitute_joins(expression: &Value, lookup: &impl Fn(&JoinField) -> Value) -> Value {
    match expression {
        Value::String(s) => match JoinField::parse(s) {
            Some(field) => lookup(&field),
            None => expression.clone(),
        },
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_joins(v, lookup)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_joins(v, lookup)))
                .collect(),
        ),
        _ => expression.clone(),
    }
}

/// Filter, order, page and optionally count `docs`.
pub fn evaluate(expression: &Value, docs: Vec<StoredDoc>) -> QueryResult {
    let empty = Map::new();
    let filter = expression.as_object().unwrap_or(&empty);

    let mut matched: Vec<StoredDoc> = docs
        .into_iter()
        .filter(|doc| match &doc.state {
            Some(state) => matches(filter, state),
            None => false,
        })
        .collect();

    let order: Vec<(String, bool)> = filter
        .get("$orderby")
        .and_then(Value::as_object)
        .map(|fields| {
            fields
                .iter()
                .map(|(field, dir)| (field.clone(), dir.as_i64() != Some(-1)))
                .collect()
        })
        .unwrap_or_default();
    matched.sort_by(|a, b| {
        for (field, ascending) in &order {
            let left = a.state.as_ref().and_then(|s| json_path(s, field));
            let right = b.state.as_ref().and_then(|s| json_path(s, field));
            let ord = compare_json(left, right);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    });

    let skip = filter.get("$skip").and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = filter.get("$limit").and_then(Value::as_u64).map(|n| n as usize);
    let paged: Vec<StoredDoc> = matched
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    if filter.get("$count").and_then(Value::as_bool) == Some(true) {
        return QueryResult::Value(Value::from(paged.len() as u64));
    }
    QueryResult::Docs(paged)
}

fn matches(filter: &Map<String, Value>, state: &Value) -> bool {
    filter.iter()
        .filter(|(key, _)| !key.starts_with('$'))
        .all(|(key, expected)| match json_path(state, key) {
            Some(actual) => actual == expected,
            None => expected.is_null(),
        })
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
