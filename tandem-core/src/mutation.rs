//! Field-path-addressed mutators over a [`Document`].
//!
//! Each call coerces the target field into the container it needs,
//! resolves numeric indices into position ids against the current state,
//! stamps ops from the replica [`Clock`], applies them locally and returns
//! them so the caller can persist, notify and send them.
//!
//! Index resolution happens op by op: a multi-item insert anchors every new
//! item on the one before it, and a multi-item remove re-resolves the index
//! after each tombstone.

use serde_json::Value;
use thiserror::Error;

use crate::clock::Clock;
use crate::diff::{edit_script, string_edit, EditOp};
use crate::document::Document;
use crate::op::{new_id, Op, OpKind};
use crate::projection::ID_FIELD;
use crate::value::FieldValue;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("field {field:?} holds {found}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("index {index} (count {count}) out of range for field {field:?} of length {len}")]
    IndexOutOfRange {
        field: String,
        index: usize,
        count: usize,
        len: usize,
    },
    #[error("document {collection}/{doc_id} does not exist")]
    MissingDocument { collection: String, doc_id: String },
}

pub type Result<T> = std::result::Result<T, MutationError>;

/// Short-lived mutation handle borrowing a document and its replica clock.
pub struct Mutator<'a> {
    doc: &'a mut Document,
    clock: &'a mut Clock,
}

impl<'a> Mutator<'a> {
    pub fn new(doc: &'a mut Document, clock: &'a mut Clock) -> Self {
        Self { doc, clock }
    }

    // ─── Whole-document and scalar ops ────────────────────────

    /// Create the document. Objects get `_id` filled in from the doc id.
    pub fn add(&mut self, value: Value) -> Result<Vec<Op>> {
        let value = match value {
            Value::Object(mut map) => {
                map.entry(ID_FIELD.to_string())
                    .or_insert_with(|| Value::String(self.doc.doc_id().to_string()));
                Value::Object(map)
            }
            other => other,
        };
        Ok(vec![self.emit(None, OpKind::Add { value })])
    }

    pub fn set(&mut self, field: Option<&str>, value: Value) -> Result<Vec<Op>> {
        Ok(vec![self.emit(field, OpKind::Set { value })])
    }

    /// Delete a field, or the whole document when `field` is `None`.
    pub fn del(&mut self, field: Option<&str>) -> Result<Vec<Op>> {
        if field.is_none() && !self.doc.exists() {
            return Err(MutationError::MissingDocument {
                collection: self.doc.collection_name().to_string(),
                doc_id: self.doc.doc_id().to_string(),
            });
        }
        Ok(vec![self.emit(field, OpKind::Del)])
    }

    pub fn increment(&mut self, field: &str, by: f64) -> Result<Vec<Op>> {
        match self.doc.field(Some(field)) {
            None
            | Some(FieldValue::Counter(_))
            | Some(FieldValue::Scalar(Value::Null))
            | Some(FieldValue::Scalar(Value::Number(_))) => {}
            Some(other) => return Err(mismatch(field, "counter", other)),
        }
        Ok(vec![self.emit(Some(field), OpKind::Increment { value: by })])
    }

    pub fn invert(&mut self, field: &str) -> Result<Vec<Op>> {
        match self.doc.field(Some(field)) {
            None
            | Some(FieldValue::Flag(_))
            | Some(FieldValue::Scalar(Value::Null))
            | Some(FieldValue::Scalar(Value::Bool(_))) => {}
            Some(other) => return Err(mismatch(field, "flag", other)),
        }
        Ok(vec![self.emit(Some(field), OpKind::Invert)])
    }

    // ─── Arrays ───────────────────────────────────────────────

    pub fn push(&mut self, field: &str, value: Value) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        ops.push(self.emit(Some(field), OpKind::Push { item_id: new_id(), value }));
        Ok(ops)
    }

    pub fn unshift(&mut self, field: &str, value: Value) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        ops.push(self.emit(Some(field), OpKind::Unshift { item_id: new_id(), value }));
        Ok(ops)
    }

    pub fn pop(&mut self, field: &str) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        ops.push(self.emit(Some(field), OpKind::Pop));
        Ok(ops)
    }

    pub fn shift(&mut self, field: &str) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        ops.push(self.emit(Some(field), OpKind::Shift));
        Ok(ops)
    }

    /// Insert `values` so the first lands at live `index`.
    pub fn insert(&mut self, field: &str, index: usize, values: Vec<Value>) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        let len = self.array_ids(field).len();
        if index > len {
            return Err(out_of_range(field, index, 0, len));
        }
        let mut anchor = self.array_ids(field).get(index.wrapping_sub(1)).cloned();
        for value in values {
            let item_id = new_id();
            ops.push(self.emit(
                Some(field),
                OpKind::Insert {
                    position_id: anchor.clone(),
                    item_id: item_id.clone(),
                    value,
                },
            ));
            anchor = Some(item_id);
        }
        Ok(ops)
    }

    /// Remove `count` live items starting at `index`.
    pub fn remove(&mut self, field: &str, index: usize, count: usize) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        let len = self.array_ids(field).len();
        range_end(field, index, count, len)?;
        for _ in 0..count {
            let Some(item_id) = self.array_ids(field).get(index).cloned() else {
                break;
            };
            ops.push(self.emit(Some(field), OpKind::Remove { item_id }));
        }
        Ok(ops)
    }

    /// Move `count` items at `from` so they start at `to` in the result.
    pub fn move_items(&mut self, field: &str, from: usize, to: usize, count: usize) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        let ids = self.array_ids(field);
        let end = range_end(field, from, count, ids.len())?;
        range_end(field, to, count, ids.len())?;
        if from == to || count == 0 {
            return Ok(ops);
        }
        let block: Vec<String> = ids[from..end].to_vec();
        let remaining: Vec<&String> = ids
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < from || *i >= end)
            .map(|(_, id)| id)
            .collect();
        let mut anchor = if to == 0 {
            None
        } else {
            Some(remaining[to - 1].clone())
        };
        for item_id in block {
            ops.push(self.emit(
                Some(field),
                OpKind::Move {
                    item_id: item_id.clone(),
                    position_id: anchor.clone(),
                },
            ));
            anchor = Some(item_id);
        }
        Ok(ops)
    }

    /// Replace the whole array with fresh position ids.
    pub fn set_array(&mut self, field: &str, values: Vec<Value>) -> Result<Vec<Op>> {
        Ok(vec![self.emit(Some(field), OpKind::ArraySet { value: values })])
    }

    /// Turn the current array into `values` with fine-grained ops.
    pub fn array_diff(&mut self, field: &str, values: Vec<Value>) -> Result<Vec<Op>> {
        let mut ops = self.coerce_array(field)?;
        let current = match self.doc.field(Some(field)) {
            Some(FieldValue::Array(seq)) => seq.values(),
            _ => Vec::new(),
        };
        for step in edit_script(&current, &values) {
            let emitted = match step {
                EditOp::Insert { index, values } => self.insert(field, index, values)?,
                EditOp::Remove { index, count } => self.remove(field, index, count)?,
                EditOp::Move { from, to, count } => self.move_items(field, from, to, count)?,
            };
            ops.extend(emitted);
        }
        Ok(ops)
    }

    // ─── Strings ──────────────────────────────────────────────

    /// Replace the whole string with fresh char ids.
    pub fn set_string(&mut self, field: &str, text: &str) -> Result<Vec<Op>> {
        Ok(vec![self.emit(
            Some(field),
            OpKind::StringSet { value: text.to_string() },
        )])
    }

    pub fn insert_into_string(&mut self, field: &str, index: usize, text: &str) -> Result<Vec<Op>> {
        let mut ops = self.coerce_text(field)?;
        let ids = self.char_ids(field);
        if index > ids.len() {
            return Err(out_of_range(field, index, 0, ids.len()));
        }
        let mut anchor = ids.get(index.wrapping_sub(1)).cloned();
        for value in text.chars() {
            let char_id = new_id();
            ops.push(self.emit(
                Some(field),
                OpKind::StringInsert {
                    position_id: anchor.clone(),
                    char_id: char_id.clone(),
                    value,
                },
            ));
            anchor = Some(char_id);
        }
        Ok(ops)
    }

    pub fn remove_from_string(&mut self, field: &str, index: usize, count: usize) -> Result<Vec<Op>> {
        let mut ops = self.coerce_text(field)?;
        let len = self.char_ids(field).len();
        range_end(field, index, count, len)?;
        for _ in 0..count {
            let Some(char_id) = self.char_ids(field).get(index).cloned() else {
                break;
            };
            ops.push(self.emit(Some(field), OpKind::StringRemove { char_id }));
        }
        Ok(ops)
    }

    /// Turn the current string into `text` with a single splice.
    pub fn string_diff(&mut self, field: &str, text: &str) -> Result<Vec<Op>> {
        let mut ops = self.coerce_text(field)?;
        let current = match self.doc.field(Some(field)) {
            Some(FieldValue::Text(seq)) => seq.text(),
            _ => String::new(),
        };
        if let Some(edit) = string_edit(&current, text) {
            if edit.remove > 0 {
                ops.extend(self.remove_from_string(field, edit.index, edit.remove)?);
            }
            if !edit.insert.is_empty() {
                ops.extend(self.insert_into_string(field, edit.index, &edit.insert)?);
            }
        }
        Ok(ops)
    }

    // ─── Internals ────────────────────────────────────────────

    fn emit(&mut self, field: Option<&str>, kind: OpKind) -> Op {
        let op = Op::new(
            self.clock,
            self.doc.collection_name().to_string(),
            self.doc.doc_id().to_string(),
            field,
            kind,
        );
        self.doc.apply_op(op.clone());
        op
    }

    /// Plain arrays become containers through an `arraySet` carrying the
    /// same values. Absent fields are promoted at replay.
    fn coerce_array(&mut self, field: &str) -> Result<Vec<Op>> {
        let values = match self.doc.field(Some(field)) {
            None | Some(FieldValue::Array(_)) | Some(FieldValue::Scalar(Value::Null)) => {
                return Ok(Vec::new())
            }
            Some(FieldValue::Scalar(Value::Array(values))) => values.clone(),
            Some(other) => return Err(mismatch(field, "array", other)),
        };
        Ok(vec![self.emit(Some(field), OpKind::ArraySet { value: values })])
    }

    fn coerce_text(&mut self, field: &str) -> Result<Vec<Op>> {
        let text = match self.doc.field(Some(field)) {
            None | Some(FieldValue::Text(_)) | Some(FieldValue::Scalar(Value::Null)) => {
                return Ok(Vec::new())
            }
            Some(FieldValue::Scalar(Value::String(text))) => text.clone(),
            Some(other) => return Err(mismatch(field, "string", other)),
        };
        Ok(vec![self.emit(Some(field), OpKind::StringSet { value: text })])
    }

    fn array_ids(&self, field: &str) -> Vec<String> {
        match self.doc.field(Some(field)) {
            Some(FieldValue::Array(seq)) => seq.live_ids(),
            _ => Vec::new(),
        }
    }

    fn char_ids(&self, field: &str) -> Vec<String> {
        match self.doc.field(Some(field)) {
            Some(FieldValue::Text(seq)) => seq.live_ids(),
            _ => Vec::new(),
        }
    }
}

fn mismatch(field: &str, expected: &'static str, found: &FieldValue) -> MutationError {
    let found = match found {
        FieldValue::Scalar(Value::Bool(_)) => "boolean",
        FieldValue::Scalar(Value::Number(_)) => "number",
        FieldValue::Scalar(Value::String(_)) => "plain string",
        FieldValue::Scalar(Value::Array(_)) => "plain array",
        other => other.kind_name(),
    };
    MutationError::TypeMismatch {
        field: field.to_string(),
        expected,
        found,
    }
}

fn out_of_range(field: &str, index: usize, count: usize, len: usize) -> MutationError {
    MutationError::IndexOutOfRange {
        field: field.to_string(),
        index,
        count,
        len,
    }
}

/// End of `count` items from `index`, when that stays within `len`.
fn range_end(field: &str, index: usize, count: usize, len: usize) -> Result<usize> {
    index
        .checked_add(count)
        .filter(|end| *end <= len)
        .ok_or_else(|| out_of_range(field, index, count, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (Document, Clock) {
        (Document::new("notes", "n1"), Clock::new("a"))
    }

    #[test]
    fn test_add_fills_identity() {
        let (mut doc, mut clock) = fixture();
        let ops = Mutator::new(&mut doc, &mut clock).add(json!({"title": "x"})).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(doc.get(None), Some(json!({"_id": "n1", "title": "x"})));
    }

    #[test]
    fn test_del_missing_document_fails() {
        let (mut doc, mut clock) = fixture();
        let err = Mutator::new(&mut doc, &mut clock).del(None).unwrap_err();
        assert!(matches!(err, MutationError::MissingDocument { .. }));
    }

    #[test]
    fn test_insert_remove_move() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.insert("tags", 0, vec![json!("a"), json!("b"), json!("c")]).unwrap();
        m.insert("tags", 1, vec![json!("x")]).unwrap();
        m.remove("tags", 2, 1).unwrap();
        m.move_items("tags", 0, 2, 1).unwrap();
        assert_eq!(doc.get(Some("tags")), Some(json!(["x", "c", "a"])));
    }

    #[test]
    fn test_index_out_of_range() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.push("tags", json!(1)).unwrap();
        assert!(matches!(
            m.insert("tags", 3, vec![json!(2)]),
            Err(MutationError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            m.remove("tags", 0, 2),
            Err(MutationError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_huge_count_is_out_of_range() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.push("tags", json!(1)).unwrap();
        m.set_string("body", "ab").unwrap();
        for result in [
            m.remove("tags", 1, usize::MAX),
            m.move_items("tags", 0, 1, usize::MAX),
            m.move_items("tags", usize::MAX, 0, 1),
            m.remove_from_string("body", 1, usize::MAX),
        ] {
            assert!(matches!(result, Err(MutationError::IndexOutOfRange { .. })));
        }
        assert_eq!(doc.get(None), Some(json!({"tags": [1], "body": "ab"})));
    }

    #[test]
    fn test_plain_array_is_coerced() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.set(Some("tags"), json!(["a", "b"])).unwrap();
        let ops = m.push("tags", json!("c")).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].type_name(), "arraySet");
        assert_eq!(doc.get(Some("tags")), Some(json!(["a", "b", "c"])));
    }

    #[test]
    fn test_type_mismatch() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.set(Some("title"), json!({"nested": true})).unwrap();
        assert!(matches!(
            m.push("title", json!(1)),
            Err(MutationError::TypeMismatch { expected: "array", found: "object", .. })
        ));
        m.set(Some("n"), json!("text")).unwrap();
        assert!(m.increment("n", 1.0).is_err());
    }

    #[test]
    fn test_string_ops() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.set(Some("body"), json!("hello")).unwrap();
        m.insert_into_string("body", 5, " world").unwrap();
        m.remove_from_string("body", 0, 1).unwrap();
        m.insert_into_string("body", 0, "J").unwrap();
        assert_eq!(doc.get(Some("body")), Some(json!("Jello world")));
    }

    #[test]
    fn test_string_diff() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.set_string("body", "kitten").unwrap();
        let ops = m.string_diff("body", "sitting").unwrap();
        assert!(ops.iter().all(|op| matches!(
            op.kind,
            OpKind::StringInsert { .. } | OpKind::StringRemove { .. }
        )));
        assert_eq!(doc.get(Some("body")), Some(json!("sitting")));
    }

    #[test]
    fn test_array_diff_uses_fine_grained_ops() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.set_array("list", vec![json!(1), json!(2), json!(3), json!(4)]).unwrap();
        let ops = m
            .array_diff("list", vec![json!(4), json!(1), json!(3), json!(5)])
            .unwrap();
        assert!(ops.iter().all(|op| !op.is_rewriting()));
        assert_eq!(doc.get(Some("list")), Some(json!([4, 1, 3, 5])));
    }

    #[test]
    fn test_counter_and_flag() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.increment("views", 3.0).unwrap();
        m.increment("views", 1.5).unwrap();
        m.invert("done").unwrap();
        assert_eq!(doc.get(Some("views")), Some(json!(4.5)));
        assert_eq!(doc.get(Some("done")), Some(json!(true)));
    }

    #[test]
    fn test_move_block() {
        let (mut doc, mut clock) = fixture();
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.set_array("l", (0..5).map(|i| json!(i)).collect()).unwrap();
        m.move_items("l", 0, 3, 2).unwrap();
        assert_eq!(doc.get(Some("l")), Some(json!([2, 3, 4, 0, 1])));
        let mut m = Mutator::new(&mut doc, &mut clock);
        m.move_items("l", 3, 0, 2).unwrap();
        assert_eq!(doc.get(Some("l")), Some(json!([0, 1, 2, 3, 4])));
    }
}
