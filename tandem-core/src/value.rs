//! Document field values.
//!
//! A document's state is a tree whose leaves are either plain JSON scalars
//! or embedded containers. Containers are explicit variants, so replay and
//! the mutation façade match on the type instead of inspecting values.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::scalar::{Counter, Flag};
use crate::sequence::Sequence;

/// One node of a document's state tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    Object(BTreeMap<String, FieldValue>),
    Array(Sequence<Value>),
    Text(Sequence<char>),
    Counter(Counter),
    Flag(Flag),
}

impl FieldValue {
    /// Lift a plain JSON value. Objects become navigable nodes so nested
    /// fields can later hold containers; everything else stays scalar.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => FieldValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::from_json(v)))
                    .collect(),
            ),
            other => FieldValue::Scalar(other),
        }
    }

    /// Materialize this subtree as plain JSON.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Scalar(v) => v.clone(),
            FieldValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            FieldValue::Array(seq) => Value::Array(seq.values()),
            FieldValue::Text(seq) => Value::String(seq.text()),
            FieldValue::Counter(c) => c.to_json(),
            FieldValue::Flag(f) => Value::Bool(f.value()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Scalar(_) => "scalar",
            FieldValue::Object(_) => "object",
            FieldValue::Array(_) => "array",
            FieldValue::Text(_) => "string",
            FieldValue::Counter(_) => "counter",
            FieldValue::Flag(_) => "flag",
        }
    }

    /// Node at a dot path below this one.
    pub fn get_path(&self, path: &str) -> Option<&FieldValue> {
        let mut node = self;
        for segment in path.split('.') {
            node = match node {
                FieldValue::Object(map) => map.get(segment)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Node at a dot path, creating intermediate objects as needed.
    ///
    /// Non-object intermediates are replaced by empty objects. The leaf is
    /// created as `Scalar(Null)` when absent.
    pub fn get_or_create_path(&mut self, path: &str) -> &mut FieldValue {
        let mut node = self;
        for segment in path.split('.') {
            if !matches!(node, FieldValue::Object(_)) {
                *node = FieldValue::Object(BTreeMap::new());
            }
            node = match node {
                FieldValue::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert(FieldValue::Scalar(Value::Null)),
                _ => unreachable!("node was just made an object"),
            };
        }
        node
    }

    /// Remove the leaf at a dot path. Returns whether something was removed.
    ///
    /// Intermediates are created (or replaced by objects) exactly as a write
    /// to the same path would, so a delete leaves the same shape behind
    /// whether or not earlier writes under the path were applied.
    pub fn delete_path(&mut self, path: &str) -> bool {
        let (container, leaf) = match path.rsplit_once('.') {
            Some((parent, leaf)) => (self.get_or_create_path(parent), leaf),
            None => (self, path),
        };
        if !matches!(container, FieldValue::Object(_)) {
            *container = FieldValue::Object(BTreeMap::new());
        }
        match container {
            FieldValue::Object(map) => map.remove(leaf).is_some(),
            _ => false,
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Object(BTreeMap::new())
    }
}

/// Read a dot path out of plain JSON.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = value;
    for segment in path.split('.') {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip() {
        let raw = json!({"_id": "1", "profile": {"name": "Ann", "tags": ["a"]}, "age": 3});
        let node = FieldValue::from_json(raw.clone());
        assert_eq!(node.to_json(), raw);
        assert_eq!(node.get_path("profile.name").unwrap().to_json(), json!("Ann"));
        assert!(node.get_path("profile.tags.0").is_none());
    }

    #[test]
    fn test_get_or_create_path_builds_objects() {
        let mut node = FieldValue::from_json(json!({"a": 5}));
        *node.get_or_create_path("a.b.c") = FieldValue::Scalar(json!(1));
        assert_eq!(node.to_json(), json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_delete_path() {
        let mut node = FieldValue::from_json(json!({"a": {"b": 1, "c": 2}, "n": 5}));
        assert!(node.delete_path("a.b"));
        assert!(!node.delete_path("a.b"));
        assert!(!node.delete_path("x.y"));
        assert!(!node.delete_path("n.z"));
        assert_eq!(node.to_json(), json!({"a": {"c": 2}, "x": {}, "n": {}}));
    }

    #[test]
    fn test_containers_materialize() {
        let mut node = FieldValue::default();
        *node.get_or_create_path("list") =
            FieldValue::Array(Sequence::from_values("o", vec![json!(1), json!(2)]));
        *node.get_or_create_path("body") = FieldValue::Text(Sequence::from_text("t", "hi"));
        *node.get_or_create_path("n") = FieldValue::Counter(Counter::new(4.0));
        *node.get_or_create_path("done") = FieldValue::Flag(Flag::new(true));
        assert_eq!(
            node.to_json(),
            json!({"list": [1, 2], "body": "hi", "n": 4, "done": true})
        );
    }

    #[test]
    fn test_json_path() {
        let raw = json!({"a": {"b": [1]}});
        assert_eq!(json_path(&raw, "a.b"), Some(&json!([1])));
        assert_eq!(json_path(&raw, "a.c"), None);
    }
}
