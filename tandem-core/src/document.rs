//! Operation-log document state machine.
//!
//! ```text
//!   apply_op(op)
//!        │
//!        ├── duplicate id? ──────────────► ignored
//!        │
//!        ├── non-rewriting and newer than ──► fold into state (cheap path)
//!        │   the last folded op?
//!        │
//!        └── otherwise ──► distill log ──► replay from empty (rebuild path)
//! ```
//!
//! Invariant: `state` always equals replaying the retained ops in
//! `(date, source)` order from an empty document. Distillation only drops
//! duplicates and ops shadowed by a newer rewriting op on the same path or
//! an ancestor of it.
//!
//! Reference: Shapiro et al. — A comprehensive study of CRDTs (op-based replay)

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::op::{path_covers, Op, OpKind};
use crate::scalar::{Counter, Flag};
use crate::sequence::Sequence;
use crate::value::FieldValue;
use crate::version::VersionVector;

/// Portable snapshot of a document's op log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocBundle {
    pub ops: Vec<Op>,
    pub version: VersionVector,
}

type OpKey = (u64, String, String);

fn op_key(op: &Op) -> OpKey {
    (op.date, op.source.clone(), op.id.clone())
}

/// A document replica: op log plus derived state.
#[derive(Debug, Clone)]
pub struct Document {
    collection_name: String,
    doc_id: String,
    ops: Vec<Op>,
    /// Every op id applied, including ops distillation has since dropped.
    op_ids: HashSet<String>,
    state: Option<FieldValue>,
    /// Key of the newest op folded into `state`.
    state_key: Option<OpKey>,
    version: VersionVector,
}

impl Document {
    pub fn new(collection_name: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            ops: Vec::new(),
            op_ids: HashSet::new(),
            state: None,
            state_key: None,
            version: VersionVector::new(),
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Apply one op. Returns false when the op id was already applied.
    pub fn apply_op(&mut self, op: Op) -> bool {
        if self.op_ids.contains(&op.id) {
            return false;
        }
        self.version.observe(&op.source, op.date);
        self.op_ids.insert(op.id.clone());

        let key = op_key(&op);
        let incremental =
            !op.is_rewriting() && self.state_key.as_ref().map_or(true, |last| key > *last);
        if incremental {
            apply_to_state(&mut self.state, &op);
            self.state_key = Some(key);
            self.ops.push(op);
        } else {
            self.ops.push(op);
            self.refresh_state();
        }
        true
    }

    /// Apply a batch, rebuilding at most once. Returns how many were new.
    pub fn apply_ops(&mut self, ops: impl IntoIterator<Item = Op>) -> usize {
        let mut added = 0;
        for op in ops {
            if self.op_ids.insert(op.id.clone()) {
                self.version.observe(&op.source, op.date);
                self.ops.push(op);
                added += 1;
            }
        }
        if added > 0 {
            self.refresh_state();
        }
        added
    }

    /// Drop an op (for example one the server rejected) and rebuild.
    pub fn remove_op(&mut self, op_id: &str) -> bool {
        let before = self.ops.len();
        self.ops.retain(|op| op.id != op_id);
        if self.ops.len() == before {
            return false;
        }
        self.op_ids.remove(op_id);
        self.refresh_state();
        true
    }

    /// Compact the log and rebuild state from scratch.
    pub fn refresh_state(&mut self) {
        self.ops = distill(&self.ops);
        self.state = replay(&self.ops);
        self.state_key = self.ops.last().map(op_key);
    }

    /// Compact the log in place (state is unchanged by construction).
    pub fn distill_ops(&mut self) {
        self.refresh_state();
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn has_op(&self, op_id: &str) -> bool {
        self.op_ids.contains(op_id)
    }

    pub fn state(&self) -> Option<&FieldValue> {
        self.state.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.state.is_some()
    }

    /// Date of the newest op folded into state.
    pub fn state_date(&self) -> Option<u64> {
        self.state_key.as_ref().map(|(date, _, _)| *date)
    }

    /// State node at `field` (root when `None`).
    pub fn field(&self, field: Option<&str>) -> Option<&FieldValue> {
        let root = self.state.as_ref()?;
        match field {
            None => Some(root),
            Some(path) => root.get_path(path),
        }
    }

    /// Materialized JSON at `field` (root when `None`).
    pub fn get(&self, field: Option<&str>) -> Option<Value> {
        self.field(field).map(FieldValue::to_json)
    }

    /// High-water mark of every source this replica has incorporated.
    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Fold in a version recorded elsewhere, such as the one stored next to
    /// a distilled log whose shadowed ops are gone.
    pub fn observe_version(&mut self, version: &VersionVector) {
        self.version.merge(version);
    }

    /// Ops the holder of `version` has not seen yet.
    pub fn ops_to_send(&self, version: &VersionVector) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|op| !version.dominates(&op.source, op.date))
            .cloned()
            .collect()
    }

    pub fn bundle(&self) -> DocBundle {
        DocBundle {
            ops: self.ops.clone(),
            version: self.version.clone(),
        }
    }

    /// Replace the log with a bundle and rebuild.
    pub fn restore(&mut self, bundle: DocBundle) {
        self.ops.clear();
        self.op_ids.clear();
        self.version = bundle.version;
        for op in bundle.ops {
            self.version.observe(&op.source, op.date);
            if self.op_ids.insert(op.id.clone()) {
                self.ops.push(op);
            }
        }
        self.refresh_state();
    }
}

/// Minimal op set reproducing the same state as the full log, ascending.
pub fn distill(ops: &[Op]) -> Vec<Op> {
    let mut newest_first: Vec<&Op> = ops.iter().collect();
    newest_first.sort_by(|a, b| b.replay_cmp(a));

    let mut seen: HashSet<&str> = HashSet::new();
    let mut rewritten: Vec<Option<&str>> = Vec::new();
    let mut kept: Vec<Op> = Vec::with_capacity(ops.len());

    for op in newest_first {
        if !seen.insert(op.id.as_str()) {
            continue;
        }
        let field = op.field.as_deref();
        if rewritten.iter().any(|prefix| path_covers(*prefix, field)) {
            continue;
        }
        if op.is_rewriting() {
            rewritten.push(field);
        }
        kept.push(op.clone());
    }

    kept.reverse();
    kept
}

/// Replay ops (already in replay order) onto an empty document.
pub fn replay(ops: &[Op]) -> Option<FieldValue> {
    let mut state = None;
    for op in ops {
        apply_to_state(&mut state, op);
    }
    state
}

/// Fold a single op into `state`.
pub fn apply_to_state(state: &mut Option<FieldValue>, op: &Op) {
    let Some(field) = op.field.as_deref() else {
        match &op.kind {
            OpKind::Add { value } | OpKind::Set { value } => {
                *state = Some(FieldValue::from_json(value.clone()));
            }
            OpKind::Del => *state = None,
            other => {
                log::warn!(
                    "ignoring {} op {} without a field on {}/{}",
                    other.type_name(),
                    op.id,
                    op.collection_name,
                    op.doc_id
                );
            }
        }
        return;
    };

    let root = state.get_or_insert_with(FieldValue::default);
    match &op.kind {
        OpKind::Add { value } | OpKind::Set { value } => {
            *root.get_or_create_path(field) = FieldValue::from_json(value.clone());
        }
        OpKind::Del => {
            root.delete_path(field);
        }
        OpKind::Push { item_id, value } => {
            array_at(root, field, &op.id).push(item_id.clone(), value.clone());
        }
        OpKind::Unshift { item_id, value } => {
            array_at(root, field, &op.id).unshift(item_id.clone(), value.clone());
        }
        OpKind::Pop => {
            array_at(root, field, &op.id).pop();
        }
        OpKind::Shift => {
            array_at(root, field, &op.id).shift();
        }
        OpKind::Insert { position_id, item_id, value } => {
            array_at(root, field, &op.id).insert_after(
                position_id.as_deref(),
                item_id.clone(),
                value.clone(),
            );
        }
        OpKind::Remove { item_id } => {
            array_at(root, field, &op.id).remove(item_id);
        }
        OpKind::Move { item_id, position_id } => {
            array_at(root, field, &op.id).move_after(item_id, position_id.as_deref());
        }
        OpKind::ArraySet { value } => {
            *root.get_or_create_path(field) =
                FieldValue::Array(Sequence::from_values(&op.id, value.iter().cloned()));
        }
        OpKind::Invert => {
            flag_at(root, field).invert();
        }
        OpKind::Increment { value } => {
            counter_at(root, field).increment(*value);
        }
        OpKind::StringInsert { position_id, char_id, value } => {
            text_at(root, field, &op.id).insert_after(
                position_id.as_deref(),
                char_id.clone(),
                *value,
            );
        }
        OpKind::StringRemove { char_id } => {
            text_at(root, field, &op.id).remove(char_id);
        }
        OpKind::StringSet { value } => {
            *root.get_or_create_path(field) = FieldValue::Text(Sequence::from_text(&op.id, value));
        }
    }
}

fn array_at<'a>(root: &'a mut FieldValue, field: &str, op_id: &str) -> &'a mut Sequence<Value> {
    let node = root.get_or_create_path(field);
    if !matches!(node, FieldValue::Array(_)) {
        let promoted = match &*node {
            FieldValue::Scalar(Value::Array(values)) => {
                Sequence::from_values(op_id, values.iter().cloned())
            }
            FieldValue::Scalar(Value::Null) => Sequence::new(),
            other => {
                log::debug!("replacing {} at {field} with an array", other.kind_name());
                Sequence::new()
            }
        };
        *node = FieldValue::Array(promoted);
    }
    match node {
        FieldValue::Array(seq) => seq,
        _ => unreachable!("node was just promoted to an array"),
    }
}

fn text_at<'a>(root: &'a mut FieldValue, field: &str, op_id: &str) -> &'a mut Sequence<char> {
    let node = root.get_or_create_path(field);
    if !matches!(node, FieldValue::Text(_)) {
        let promoted = match &*node {
            FieldValue::Scalar(Value::String(text)) => Sequence::from_text(op_id, text),
            FieldValue::Scalar(Value::Null) => Sequence::new(),
            other => {
                log::debug!("replacing {} at {field} with a string", other.kind_name());
                Sequence::new()
            }
        };
        *node = FieldValue::Text(promoted);
    }
    match node {
        FieldValue::Text(seq) => seq,
        _ => unreachable!("node was just promoted to a string"),
    }
}

fn counter_at<'a>(root: &'a mut FieldValue, field: &str) -> &'a mut Counter {
    let node = root.get_or_create_path(field);
    if !matches!(node, FieldValue::Counter(_)) {
        let promoted = match node {
            FieldValue::Scalar(value) => Counter::from_value(value),
            _ => Counter::default(),
        };
        *node = FieldValue::Counter(promoted);
    }
    match node {
        FieldValue::Counter(counter) => counter,
        _ => unreachable!("node was just promoted to a counter"),
    }
}

fn flag_at<'a>(root: &'a mut FieldValue, field: &str) -> &'a mut Flag {
    let node = root.get_or_create_path(field);
    if !matches!(node, FieldValue::Flag(_)) {
        let promoted = match node {
            FieldValue::Scalar(value) => Flag::from_value(value),
            _ => Flag::default(),
        };
        *node = FieldValue::Flag(promoted);
    }
    match node {
        FieldValue::Flag(flag) => flag,
        _ => unreachable!("node was just promoted to a flag"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: &str, source: &str, date: u64, field: Option<&str>, kind: OpKind) -> Op {
        Op {
            id: id.into(),
            source: source.into(),
            date,
            collection_name: "users".into(),
            doc_id: "1".into(),
            field: field.map(str::to_string),
            kind,
        }
    }

    #[test]
    fn test_add_then_set_field() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o1", "a", 1, None, OpKind::Add { value: json!({"_id": "1", "name": "Ann"}) }));
        doc.apply_op(op("o2", "a", 2, Some("age"), OpKind::Set { value: json!(30) }));
        assert_eq!(doc.get(None), Some(json!({"_id": "1", "name": "Ann", "age": 30})));
        assert_eq!(doc.get(Some("age")), Some(json!(30)));
        assert_eq!(doc.state_date(), Some(2));
    }

    #[test]
    fn test_duplicate_op_is_ignored() {
        let mut doc = Document::new("users", "1");
        let increment = op("o1", "a", 1, Some("n"), OpKind::Increment { value: 2.0 });
        assert!(doc.apply_op(increment.clone()));
        assert!(!doc.apply_op(increment));
        assert_eq!(doc.get(Some("n")), Some(json!(2)));
        assert_eq!(doc.ops().len(), 1);
    }

    #[test]
    fn test_late_op_triggers_rebuild_in_order() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o2", "a", 20, Some("name"), OpKind::Set { value: json!("new") }));
        doc.apply_op(op("o1", "b", 10, Some("name"), OpKind::Set { value: json!("old") }));
        assert_eq!(doc.get(Some("name")), Some(json!("new")));
        // The older set is shadowed and compacted away.
        assert_eq!(doc.ops().len(), 1);
    }

    #[test]
    fn test_resent_shadowed_op_is_a_duplicate() {
        let mut doc = Document::new("users", "1");
        let old = op("o1", "a", 10, Some("name"), OpKind::Set { value: json!("old") });
        doc.apply_op(old.clone());
        doc.apply_op(op("o2", "a", 20, Some("name"), OpKind::Set { value: json!("new") }));
        assert_eq!(doc.ops().len(), 1);
        assert!(doc.has_op("o1"));
        assert!(!doc.apply_op(old.clone()));
        assert_eq!(doc.apply_ops([old]), 0);
        assert_eq!(doc.get(Some("name")), Some(json!("new")));
    }

    #[test]
    fn test_observe_version_keeps_sources_of_distilled_ops() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o2", "a", 20, None, OpKind::Add { value: json!({"_id": "1"}) }));
        let stored: VersionVector = "a 20|c 7".parse().unwrap();
        doc.observe_version(&stored);
        assert_eq!(doc.version().to_string(), "a 20|c 7");
        assert!(doc.ops_to_send(&stored).is_empty());
    }

    #[test]
    fn test_delete_document() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o1", "a", 1, None, OpKind::Add { value: json!({"_id": "1"}) }));
        doc.apply_op(op("o2", "a", 2, None, OpKind::Del));
        assert!(!doc.exists());
        assert_eq!(doc.get(None), None);
    }

    #[test]
    fn test_distill_keeps_latest_root_rewrite() {
        let ops = vec![
            op("o1", "a", 1, None, OpKind::Add { value: json!({"x": 1}) }),
            op("o2", "a", 2, Some("y"), OpKind::Set { value: json!(2) }),
            op("o3", "a", 3, None, OpKind::Set { value: json!({"z": 3}) }),
            op("o4", "a", 4, Some("w"), OpKind::Increment { value: 1.0 }),
        ];
        let ids: Vec<String> = distill(&ops).into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["o3", "o4"]);
    }

    #[test]
    fn test_distill_prefix_shadowing() {
        let ops = vec![
            op("o1", "a", 1, Some("a.b"), OpKind::Set { value: json!(1) }),
            op("o2", "a", 2, Some("ab"), OpKind::Set { value: json!(2) }),
            op("o3", "a", 3, Some("a"), OpKind::Set { value: json!({}) }),
            op("o4", "a", 4, Some("a.c"), OpKind::Increment { value: 1.0 }),
        ];
        let ids: Vec<String> = distill(&ops).into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["o2", "o3", "o4"]);
        assert_eq!(
            replay(&distill(&ops)).map(|s| s.to_json()),
            replay(&ops).map(|s| s.to_json())
        );
    }

    #[test]
    fn test_distill_drops_duplicate_ids() {
        let a = op("o1", "a", 1, Some("n"), OpKind::Increment { value: 1.0 });
        let ops = vec![a.clone(), a];
        assert_eq!(distill(&ops).len(), 1);
    }

    #[test]
    fn test_array_ops() {
        let mut doc = Document::new("lists", "1");
        doc.apply_op(op("o1", "a", 1, Some("items"), OpKind::ArraySet { value: vec![json!("x"), json!("y")] }));
        doc.apply_op(op("o2", "a", 2, Some("items"), OpKind::Push { item_id: "p".into(), value: json!("z") }));
        doc.apply_op(op("o3", "a", 3, Some("items"), OpKind::Insert {
            position_id: Some("o1.0".into()),
            item_id: "i".into(),
            value: json!("w"),
        }));
        doc.apply_op(op("o4", "a", 4, Some("items"), OpKind::Remove { item_id: "o1.1".into() }));
        doc.apply_op(op("o5", "a", 5, Some("items"), OpKind::Move { item_id: "p".into(), position_id: None }));
        assert_eq!(doc.get(Some("items")), Some(json!(["z", "x", "w"])));
        doc.apply_op(op("o6", "a", 6, Some("items"), OpKind::Shift));
        doc.apply_op(op("o7", "a", 7, Some("items"), OpKind::Pop));
        assert_eq!(doc.get(Some("items")), Some(json!(["x"])));
    }

    #[test]
    fn test_push_promotes_plain_array() {
        let mut doc = Document::new("lists", "1");
        doc.apply_op(op("o1", "a", 1, Some("items"), OpKind::Set { value: json!([1, 2]) }));
        doc.apply_op(op("o2", "a", 2, Some("items"), OpKind::Push { item_id: "p".into(), value: json!(3) }));
        assert_eq!(doc.get(Some("items")), Some(json!([1, 2, 3])));
        assert!(matches!(doc.field(Some("items")), Some(FieldValue::Array(_))));
    }

    #[test]
    fn test_string_ops() {
        let mut doc = Document::new("notes", "1");
        doc.apply_op(op("o1", "a", 1, Some("body"), OpKind::StringSet { value: "ac".into() }));
        doc.apply_op(op("o2", "a", 2, Some("body"), OpKind::StringInsert {
            position_id: Some("o1.0".into()),
            char_id: "c".into(),
            value: 'b',
        }));
        assert_eq!(doc.get(Some("body")), Some(json!("abc")));
        doc.apply_op(op("o3", "a", 3, Some("body"), OpKind::StringRemove { char_id: "o1.0".into() }));
        assert_eq!(doc.get(Some("body")), Some(json!("bc")));
    }

    #[test]
    fn test_counter_and_flag_promotion() {
        let mut doc = Document::new("stats", "1");
        doc.apply_op(op("o1", "a", 1, Some("n"), OpKind::Set { value: json!(5) }));
        doc.apply_op(op("o2", "a", 2, Some("n"), OpKind::Increment { value: 2.0 }));
        doc.apply_op(op("o3", "b", 2, Some("n"), OpKind::Increment { value: 3.0 }));
        doc.apply_op(op("o4", "a", 3, Some("on"), OpKind::Invert));
        assert_eq!(doc.get(Some("n")), Some(json!(10)));
        assert_eq!(doc.get(Some("on")), Some(json!(true)));
    }

    #[test]
    fn test_ops_to_send() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o1", "a", 1, Some("x"), OpKind::Increment { value: 1.0 }));
        doc.apply_op(op("o2", "a", 2, Some("x"), OpKind::Increment { value: 1.0 }));
        doc.apply_op(op("o3", "b", 1, Some("x"), OpKind::Increment { value: 1.0 }));

        let remote: VersionVector = "a 1".parse().unwrap();
        let ids: Vec<String> = doc.ops_to_send(&remote).into_iter().map(|o| o.id).collect();
        // The late (1, "b") op rebuilt the log into replay order.
        assert_eq!(ids, vec!["o3", "o2"]);
        assert_eq!(doc.version().to_string(), "a 2|b 1");
    }

    #[test]
    fn test_remove_op_rebuilds() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o1", "a", 1, Some("x"), OpKind::Set { value: json!(1) }));
        doc.apply_op(op("o2", "a", 2, Some("y"), OpKind::Set { value: json!(2) }));
        assert!(doc.remove_op("o2"));
        assert!(!doc.remove_op("o2"));
        assert_eq!(doc.get(None), Some(json!({"x": 1})));
    }

    #[test]
    fn test_bundle_restore() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o1", "a", 1, None, OpKind::Add { value: json!({"_id": "1"}) }));
        doc.apply_op(op("o2", "a", 2, Some("n"), OpKind::Increment { value: 4.0 }));
        let bundle = doc.bundle();
        let json = serde_json::to_string(&bundle).unwrap();

        let mut copy = Document::new("users", "1");
        copy.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(copy.get(None), doc.get(None));
        assert_eq!(copy.version(), doc.version());
    }

    #[test]
    fn test_root_container_op_is_ignored() {
        let mut doc = Document::new("users", "1");
        doc.apply_op(op("o1", "a", 1, None, OpKind::Pop));
        assert!(!doc.exists());
    }
}
