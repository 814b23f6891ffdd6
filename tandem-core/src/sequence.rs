//! Tombstoned sequence container backing collaborative arrays and strings.
//!
//! Items are addressed by immutable position ids assigned at insertion and
//! chained by "insert after <position id>" semantics. A numeric index is only
//! a momentary projection over the live (non-tombstoned) items.
//!
//! ```text
//!  physical: [a] [b]† [c] [d]       († = tombstone)
//!  live:      a        c   d         index 1 ──► "c"
//!  insert_after("b", x) ──► [a] [b]† [x] [c] [d]
//! ```
//!
//! Removed items keep their position id so concurrent ops can still anchor
//! on them. `move_after` physically splices the moved item, so an anchor on
//! a moved item follows it to its new place.

use serde::{Deserialize, Serialize};

/// A single container slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqItem<T> {
    pub id: String,
    pub value: T,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

/// Ordered, tombstoned, position-id-addressed collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence<T> {
    items: Vec<SeqItem<T>>,
}

impl<T> Default for Sequence<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

/// Deterministic position id for the `index`-th element of a bulk value.
pub fn bulk_item_id(op_id: &str, index: usize) -> String {
    format!("{op_id}.{index}")
}

impl<T: Clone> Sequence<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a container from plain values, deriving ids from `op_id`.
    pub fn from_values(op_id: &str, values: impl IntoIterator<Item = T>) -> Self {
        let mut seq = Self::new();
        seq.set_values(op_id, values);
        seq
    }

    /// Atomically replace every item with fresh position ids.
    pub fn set_values(&mut self, op_id: &str, values: impl IntoIterator<Item = T>) {
        self.items = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| SeqItem {
                id: bulk_item_id(op_id, i),
                value,
                removed: false,
            })
            .collect();
    }

    /// Append at the physical end.
    pub fn push(&mut self, id: impl Into<String>, value: T) {
        let id = id.into();
        if self.position(&id).is_some() {
            return;
        }
        self.items.push(SeqItem { id, value, removed: false });
    }

    /// Prepend at the physical start.
    pub fn unshift(&mut self, id: impl Into<String>, value: T) {
        let id = id.into();
        if self.position(&id).is_some() {
            return;
        }
        self.items.insert(0, SeqItem { id, value, removed: false });
    }

    /// Tombstone the last live item.
    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.iter_mut().rev().find(|item| !item.removed)?;
        item.removed = true;
        Some(item.value.clone())
    }

    /// Tombstone the first live item.
    pub fn shift(&mut self) -> Option<T> {
        let item = self.items.iter_mut().find(|item| !item.removed)?;
        item.removed = true;
        Some(item.value.clone())
    }

    /// Insert right after `anchor` (`None` = at the start).
    ///
    /// An anchor this container does not hold appends at the end.
    pub fn insert_after(&mut self, anchor: Option<&str>, id: impl Into<String>, value: T) {
        let id = id.into();
        if self.position(&id).is_some() {
            return;
        }
        let at = self.slot_after(anchor);
        self.items.insert(at, SeqItem { id, value, removed: false });
    }

    /// Tombstone the item with `id`. Returns false if unknown or already removed.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) if !item.removed => {
                item.removed = true;
                true
            }
            _ => false,
        }
    }

    /// Splice the item with `id` to just after `anchor` (`None` = start).
    pub fn move_after(&mut self, id: &str, anchor: Option<&str>) -> bool {
        if anchor == Some(id) {
            return false;
        }
        let Some(from) = self.position(id) else {
            return false;
        };
        if self.items[from].removed {
            return false;
        }
        let item = self.items.remove(from);
        let at = self.slot_after(anchor);
        self.items.insert(at, item);
        true
    }

    /// Live values in order.
    pub fn values(&self) -> Vec<T> {
        self.live().map(|item| item.value.clone()).collect()
    }

    /// Live position ids in order.
    pub fn live_ids(&self) -> Vec<String> {
        self.live().map(|item| item.id.clone()).collect()
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical slot count including tombstones.
    pub fn physical_len(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.live().nth(index).map(|item| &item.value)
    }

    /// Anchor for an insert at live `index`: the live item just before it.
    ///
    /// Only valid at call time; concurrent changes shift indices.
    pub fn index_to_insert_anchor(&self, index: usize) -> Option<String> {
        if index == 0 {
            return None;
        }
        let ids = self.live_ids();
        let at = index.min(ids.len());
        if at == 0 {
            None
        } else {
            Some(ids[at - 1].clone())
        }
    }

    /// Position id of the live item at `index`.
    pub fn index_to_remove_target(&self, index: usize) -> Option<String> {
        self.live().nth(index).map(|item| item.id.clone())
    }

    pub fn items(&self) -> &[SeqItem<T>] {
        &self.items
    }

    fn live(&self) -> impl Iterator<Item = &SeqItem<T>> {
        self.items.iter().filter(|item| !item.removed)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn slot_after(&self, anchor: Option<&str>) -> usize {
        match anchor {
            None => 0,
            Some(anchor) => match self.position(anchor) {
                Some(pos) => pos + 1,
                None => {
                    log::debug!("unknown sequence anchor {anchor}, appending");
                    self.items.len()
                }
            },
        }
    }
}

impl Sequence<char> {
    /// Materialize a text container.
    pub fn text(&self) -> String {
        self.live().map(|item| item.value).collect()
    }

    pub fn from_text(op_id: &str, text: &str) -> Self {
        Self::from_values(op_id, text.chars())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Sequence<char> {
        Sequence::from_text("init", "abc")
    }

    #[test]
    fn test_bulk_ids_are_deterministic() {
        let seq = abc();
        assert_eq!(seq.live_ids(), vec!["init.0", "init.1", "init.2"]);
        assert_eq!(seq, abc());
    }

    #[test]
    fn test_insert_after_null_is_start() {
        let mut seq = abc();
        seq.insert_after(None, "x", 'x');
        assert_eq!(seq.text(), "xabc");
    }

    #[test]
    fn test_insert_after_anchor() {
        let mut seq = abc();
        seq.insert_after(Some("init.0"), "x", 'x');
        assert_eq!(seq.text(), "axbc");
    }

    #[test]
    fn test_concurrent_inserts_same_anchor_both_kept() {
        let mut left = abc();
        left.insert_after(Some("init.0"), "x", 'X');
        left.insert_after(Some("init.0"), "y", 'Y');

        let mut right = abc();
        right.insert_after(Some("init.0"), "y", 'Y');
        right.insert_after(Some("init.0"), "x", 'X');

        for seq in [&left, &right] {
            let text = seq.text();
            assert_eq!(text.len(), 5);
            assert!(text.contains('X') && text.contains('Y'));
            assert!(text.starts_with('a') && text.ends_with("bc"));
        }
        // Later application lands directly after the anchor.
        assert_eq!(left.text(), "aYXbc");
        assert_eq!(right.text(), "aXYbc");
    }

    #[test]
    fn test_remove_tombstones_and_keeps_anchor() {
        let mut seq = abc();
        assert!(seq.remove("init.1"));
        assert!(!seq.remove("init.1"));
        assert_eq!(seq.text(), "ac");
        assert_eq!(seq.physical_len(), 3);

        seq.insert_after(Some("init.1"), "x", 'x');
        assert_eq!(seq.text(), "axc");
    }

    #[test]
    fn test_unknown_anchor_appends() {
        let mut seq = abc();
        seq.insert_after(Some("missing"), "x", 'x');
        assert_eq!(seq.text(), "abcx");
    }

    #[test]
    fn test_push_unshift_pop_shift() {
        let mut seq: Sequence<i32> = Sequence::new();
        seq.push("a", 1);
        seq.push("b", 2);
        seq.unshift("c", 0);
        assert_eq!(seq.values(), vec![0, 1, 2]);
        assert_eq!(seq.pop(), Some(2));
        assert_eq!(seq.shift(), Some(0));
        assert_eq!(seq.values(), vec![1]);
        assert_eq!(seq.pop(), Some(1));
        assert_eq!(seq.pop(), None);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_duplicate_id_ignored() {
        let mut seq: Sequence<i32> = Sequence::new();
        seq.push("a", 1);
        seq.push("a", 2);
        assert_eq!(seq.values(), vec![1]);
    }

    #[test]
    fn test_move_after() {
        let mut seq = abc();
        assert!(seq.move_after("init.0", Some("init.2")));
        assert_eq!(seq.text(), "bca");
        assert!(seq.move_after("init.2", None));
        assert_eq!(seq.text(), "cba");
        assert!(!seq.move_after("missing", None));
        assert!(!seq.move_after("init.1", Some("init.1")));
    }

    #[test]
    fn test_index_translation_skips_tombstones() {
        let mut seq = abc();
        seq.remove("init.0");
        assert_eq!(seq.index_to_remove_target(0).as_deref(), Some("init.1"));
        assert_eq!(seq.index_to_insert_anchor(0), None);
        assert_eq!(seq.index_to_insert_anchor(1).as_deref(), Some("init.1"));
        assert_eq!(seq.index_to_insert_anchor(9).as_deref(), Some("init.2"));
        assert_eq!(seq.index_to_remove_target(2), None);
    }

    #[test]
    fn test_set_values_replaces_everything() {
        let mut seq = abc();
        seq.remove("init.1");
        seq.set_values("next", "xy".chars());
        assert_eq!(seq.text(), "xy");
        assert_eq!(seq.physical_len(), 2);
        assert!(!seq.contains("init.0"));
    }

    #[test]
    fn test_serde_transparent() {
        let mut seq: Sequence<i32> = Sequence::from_values("o", [1, 2]);
        seq.remove("o.0");
        let json = serde_json::to_value(&seq).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"id": "o.0", "value": 1, "removed": true}, {"id": "o.1", "value": 2}])
        );
        let back: Sequence<i32> = serde_json::from_value(json).unwrap();
        assert_eq!(back, seq);
    }
}
