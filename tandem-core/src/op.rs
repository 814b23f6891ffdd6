//! Operation records — the unit of change, persistence and replication.
//!
//! Every mutation is captured as an immutable [`Op`] stamped with a unique
//! id, the originating replica (`source`) and a date from that replica's
//! [`Clock`](crate::clock::Clock). Ops are append-only: a document's state
//! is always a pure function of the ops it retains.
//!
//! JSON shape (flat, `type` tag plus type-specific payload):
//! ```text
//! { "id": "…", "source": "…", "date": 1700000000000,
//!   "type": "stringInsert", "collectionName": "notes", "docId": "n1",
//!   "field": "body", "positionId": "…", "charId": "…", "value": "x" }
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;

/// Type-specific op payload over the fixed op vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OpKind {
    /// Create the document (whole-document value).
    Add { value: Value },
    /// Assign a value at `field` (or replace the whole document).
    Set { value: Value },
    /// Delete `field` (or the whole document).
    Del,
    Push { item_id: String, value: Value },
    Unshift { item_id: String, value: Value },
    Pop,
    Shift,
    /// Insert after `position_id` (`None` = at the start).
    Insert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position_id: Option<String>,
        item_id: String,
        value: Value,
    },
    Remove { item_id: String },
    /// Move `item_id` to just after `position_id` (`None` = to the start).
    Move {
        item_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position_id: Option<String>,
    },
    /// Replace the whole sequence with fresh position ids.
    ArraySet { value: Vec<Value> },
    Invert,
    Increment { value: f64 },
    StringInsert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position_id: Option<String>,
        char_id: String,
        value: char,
    },
    StringRemove { char_id: String },
    /// Replace the whole string with fresh char ids.
    StringSet { value: String },
}

impl OpKind {
    /// Wire name of this op type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OpKind::Add { .. } => "add",
            OpKind::Set { .. } => "set",
            OpKind::Del => "del",
            OpKind::Push { .. } => "push",
            OpKind::Unshift { .. } => "unshift",
            OpKind::Pop => "pop",
            OpKind::Shift => "shift",
            OpKind::Insert { .. } => "insert",
            OpKind::Remove { .. } => "remove",
            OpKind::Move { .. } => "move",
            OpKind::ArraySet { .. } => "arraySet",
            OpKind::Invert => "invert",
            OpKind::Increment { .. } => "increment",
            OpKind::StringInsert { .. } => "stringInsert",
            OpKind::StringRemove { .. } => "stringRemove",
            OpKind::StringSet { .. } => "stringSet",
        }
    }

    /// Rewriting ops replace everything at their path; older ops on the
    /// same path (or below it) no longer contribute to state.
    pub fn is_rewriting(&self) -> bool {
        match self {
            OpKind::Add { .. }
            | OpKind::Set { .. }
            | OpKind::Del
            | OpKind::ArraySet { .. }
            | OpKind::StringSet { .. } => true,
            OpKind::Push { .. }
            | OpKind::Unshift { .. }
            | OpKind::Pop
            | OpKind::Shift
            | OpKind::Insert { .. }
            | OpKind::Remove { .. }
            | OpKind::Move { .. }
            | OpKind::Invert
            | OpKind::Increment { .. }
            | OpKind::StringInsert { .. }
            | OpKind::StringRemove { .. } => false,
        }
    }
}

/// An immutable, uniquely identified mutation of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Op {
    pub id: String,
    pub source: String,
    pub date: u64,
    pub collection_name: String,
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Op {
    /// Build an op stamped with a fresh id and the next date from `clock`.
    pub fn new(
        clock: &mut Clock,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        field: Option<&str>,
        kind: OpKind,
    ) -> Self {
        Self {
            id: new_id(),
            source: clock.source().to_string(),
            date: clock.now(),
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            field: field.map(str::to_string),
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn is_rewriting(&self) -> bool {
        self.kind.is_rewriting()
    }

    /// Replay order: date, then source, then id.
    pub fn replay_cmp(&self, other: &Op) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Top-level segment of the field path, if any.
    pub fn top_field(&self) -> Option<&str> {
        self.field
            .as_deref()
            .map(|f| f.split('.').next().unwrap_or(f))
    }
}

/// Fresh globally-unique id (ops, position ids, messages).
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `prefix` addresses `field` or an ancestor of it.
///
/// `None` is the document root and covers every path; a field op is never
/// an ancestor of a root op. Matching is per dot-segment (`a` covers `a.b`
/// but not `ab`).
pub fn path_covers(prefix: Option<&str>, field: Option<&str>) -> bool {
    match (prefix, field) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(p), Some(f)) => {
            f == p || (f.len() > p.len() && f.starts_with(p) && f.as_bytes()[p.len()] == b'.')
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(kind: OpKind) -> Op {
        Op {
            id: "op1".into(),
            source: "s1".into(),
            date: 42,
            collection_name: "notes".into(),
            doc_id: "n1".into(),
            field: Some("body".into()),
            kind,
        }
    }

    #[test]
    fn test_wire_shape_is_flat() {
        let op = sample(OpKind::StringInsert {
            position_id: Some("c0".into()),
            char_id: "c1".into(),
            value: 'x',
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            json!({
                "id": "op1", "source": "s1", "date": 42,
                "collectionName": "notes", "docId": "n1", "field": "body",
                "type": "stringInsert", "positionId": "c0", "charId": "c1", "value": "x"
            })
        );
    }

    #[test]
    fn test_deserialize_del_without_field() {
        let raw = json!({
            "id": "o", "source": "s", "date": 1,
            "collectionName": "users", "docId": "42", "type": "del"
        });
        let op: Op = serde_json::from_value(raw).unwrap();
        assert_eq!(op.kind, OpKind::Del);
        assert!(op.field.is_none());
    }

    #[test]
    fn test_insert_at_start_omits_position() {
        let op = sample(OpKind::Insert {
            position_id: None,
            item_id: "i1".into(),
            value: json!(1),
        });
        let json = serde_json::to_value(&op).unwrap();
        assert!(json.get("positionId").is_none());
        let back: Op = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_rewriting_vocabulary() {
        assert!(OpKind::Add { value: json!({}) }.is_rewriting());
        assert!(OpKind::Set { value: json!(1) }.is_rewriting());
        assert!(OpKind::Del.is_rewriting());
        assert!(OpKind::ArraySet { value: vec![] }.is_rewriting());
        assert!(OpKind::StringSet { value: "".into() }.is_rewriting());
        assert!(!OpKind::Pop.is_rewriting());
        assert!(!OpKind::Increment { value: 1.0 }.is_rewriting());
    }

    #[test]
    fn test_type_names_match_serde_tags() {
        let kinds = vec![
            OpKind::ArraySet { value: vec![] },
            OpKind::StringRemove { char_id: "c".into() },
            OpKind::Unshift { item_id: "i".into(), value: json!(null) },
        ];
        for kind in kinds {
            let json = serde_json::to_value(sample(kind.clone())).unwrap();
            assert_eq!(json["type"], kind.type_name());
        }
    }

    #[test]
    fn test_path_covers() {
        assert!(path_covers(None, None));
        assert!(path_covers(None, Some("a.b")));
        assert!(path_covers(Some("a"), Some("a")));
        assert!(path_covers(Some("a"), Some("a.b")));
        assert!(!path_covers(Some("a"), Some("ab")));
        assert!(!path_covers(Some("a.b"), Some("a")));
        assert!(!path_covers(Some("a"), None));
    }

    #[test]
    fn test_replay_cmp_tiebreaks_on_source() {
        let mut a = sample(OpKind::Pop);
        let mut b = sample(OpKind::Pop);
        a.source = "a".into();
        b.source = "b".into();
        assert_eq!(a.replay_cmp(&b), Ordering::Less);
        b.date = 41;
        assert_eq!(a.replay_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn test_new_stamps_clock() {
        let mut clock = Clock::new("me");
        let op = Op::new(&mut clock, "c", "d", Some("f"), OpKind::Invert);
        assert_eq!(op.source, "me");
        assert_eq!(op.date, clock.last());
        assert_eq!(op.field.as_deref(), Some("f"));
        assert_eq!(op.top_field(), Some("f"));
    }
}
