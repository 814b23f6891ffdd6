//! Edit scripts between two ordered lists, and between two strings.
//!
//! ```text
//!   old ──trim common prefix/suffix──► LCS on the middle
//!                                        │
//!        unmatched old with an equal ◄───┤
//!        unmatched new ──► move          │
//!        other unmatched old ──► remove (descending, coalesced)
//!        other unmatched new ──► insert (runs)
//! ```
//!
//! Applying the ops of a script in order to `old` (see [`apply_edit_script`])
//! yields `new`. The same engine drives collaborative array diffs and live
//! query id-list diffs.

use serde::{Deserialize, Serialize};

/// One step of an edit script. Indices are relative to the list as it
/// stands after every previous step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EditOp<T> {
    Insert { index: usize, values: Vec<T> },
    Remove { index: usize, count: usize },
    /// Take `count` items at `from`; they end up at `to` in the result.
    Move { from: usize, to: usize, count: usize },
}

/// Diff entry of a live query's id list.
pub type QueryDiff = EditOp<String>;

#[derive(Clone, Copy, PartialEq)]
enum Slot {
    Old(usize),
    Inserted,
}

/// Compute an edit script turning `old` into `new`.
pub fn edit_script<T: PartialEq + Clone>(old: &[T], new: &[T]) -> Vec<EditOp<T>> {
    if old == new {
        return Vec::new();
    }

    // new index ──► old index it keeps or moves
    let mut source: Vec<Option<usize>> = vec![None; new.len()];
    let mut old_used = vec![false; old.len()];

    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    for i in 0..prefix {
        source[i] = Some(i);
        old_used[i] = true;
    }
    for k in 0..suffix {
        let (o, n) = (old.len() - 1 - k, new.len() - 1 - k);
        source[n] = Some(o);
        old_used[o] = true;
    }

    let old_mid = prefix..old.len() - suffix;
    let new_mid = prefix..new.len() - suffix;
    for (o, n) in lcs_pairs(&old[old_mid.clone()], &new[new_mid.clone()]) {
        source[prefix + n] = Some(prefix + o);
        old_used[prefix + o] = true;
    }

    // Pair leftovers with equal values into moves.
    for n in new_mid {
        if source[n].is_some() {
            continue;
        }
        if let Some(o) = old_mid
            .clone()
            .find(|&o| !old_used[o] && old[o] == new[n])
        {
            source[n] = Some(o);
            old_used[o] = true;
        }
    }

    let mut ops = removals(&old_used);

    let mut current: Vec<Slot> = (0..old.len())
        .filter(|&o| old_used[o])
        .map(Slot::Old)
        .collect();

    let mut i = 0;
    while i < new.len() {
        match source[i] {
            Some(o) => {
                let pos = current
                    .iter()
                    .position(|slot| *slot == Slot::Old(o))
                    .unwrap_or(i);
                if pos != i {
                    let slot = current.remove(pos);
                    current.insert(i, slot);
                    ops.push(EditOp::Move { from: pos, to: i, count: 1 });
                }
                i += 1;
            }
            None => {
                let start = i;
                while i < new.len() && source[i].is_none() {
                    i += 1;
                }
                let values = new[start..i].to_vec();
                for offset in 0..values.len() {
                    current.insert(start + offset, Slot::Inserted);
                }
                ops.push(EditOp::Insert { index: start, values });
            }
        }
    }

    ops
}

/// Descending, coalesced removals of every unused old index.
fn removals<T>(old_used: &[bool]) -> Vec<EditOp<T>> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for (index, used) in old_used.iter().enumerate() {
        if *used {
            continue;
        }
        match runs.last_mut() {
            Some((start, count)) if *start + *count == index => *count += 1,
            _ => runs.push((index, 1)),
        }
    }
    runs.into_iter()
        .rev()
        .map(|(index, count)| EditOp::Remove { index, count })
        .collect()
}

/// Index pairs of a longest common subsequence of `a` and `b`.
fn lcs_pairs<T: PartialEq>(a: &[T], b: &[T]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return Vec::new();
    }
    // table[i][j] = LCS length of a[i..] and b[j..]
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// Apply an edit script in place. Out-of-range indices are clamped.
pub fn apply_edit_script<T: Clone>(items: &mut Vec<T>, ops: &[EditOp<T>]) {
    for op in ops {
        match op {
            EditOp::Insert { index, values } => {
                let at = (*index).min(items.len());
                items.splice(at..at, values.iter().cloned());
            }
            EditOp::Remove { index, count } => {
                let start = (*index).min(items.len());
                let end = (start + count).min(items.len());
                items.drain(start..end);
            }
            EditOp::Move { from, to, count } => {
                let start = (*from).min(items.len());
                let end = (start + count).min(items.len());
                let block: Vec<T> = items.drain(start..end).collect();
                let at = (*to).min(items.len());
                items.splice(at..at, block);
            }
        }
    }
}

/// Id-list diff for live queries.
pub fn diff_ids(prev: &[String], next: &[String]) -> Vec<QueryDiff> {
    edit_script(prev, next)
}

/// Apply a query diff to a client-side id list.
pub fn apply_diffs(ids: &mut Vec<String>, diffs: &[QueryDiff]) {
    apply_edit_script(ids, diffs);
}

/// Single splice turning one string into another, in char indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringEdit {
    pub index: usize,
    pub remove: usize,
    pub insert: String,
}

/// Common-prefix/common-suffix trim. `None` when the strings are equal.
pub fn string_edit(old: &str, new: &str) -> Option<StringEdit> {
    if old == new {
        return None;
    }
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Some(StringEdit {
        index: prefix,
        remove: old.len() - prefix - suffix,
        insert: new[prefix..new.len() - suffix].iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(old: &[i32], new: &[i32]) -> Vec<EditOp<i32>> {
        let ops = edit_script(old, new);
        let mut applied = old.to_vec();
        apply_edit_script(&mut applied, &ops);
        assert_eq!(applied, new, "script {ops:?}");
        ops
    }

    #[test]
    fn test_equal_lists_produce_nothing() {
        assert!(check(&[1, 2, 3], &[1, 2, 3]).is_empty());
    }

    #[test]
    fn test_single_insert() {
        let ops = check(&[1, 3], &[1, 2, 3]);
        assert_eq!(ops, vec![EditOp::Insert { index: 1, values: vec![2] }]);
    }

    #[test]
    fn test_coalesced_removals_descend() {
        let ops = check(&[1, 2, 3, 4, 5, 6], &[1, 4, 6]);
        assert_eq!(
            ops,
            vec![
                EditOp::Remove { index: 4, count: 1 },
                EditOp::Remove { index: 1, count: 2 },
            ]
        );
    }

    #[test]
    fn test_reorder_becomes_move() {
        let ops = check(&[1, 2, 3], &[3, 1, 2]);
        assert_eq!(ops, vec![EditOp::Move { from: 2, to: 0, count: 1 }]);
    }

    #[test]
    fn test_mixed_scripts() {
        check(&[], &[1, 2]);
        check(&[1, 2], &[]);
        check(&[1, 2, 3, 4], &[4, 3, 2, 1]);
        check(&[1, 1, 2, 2], &[2, 1, 2, 1, 3]);
        check(&[5, 6, 7], &[8, 9]);
        check(&[1, 2, 3, 4, 5], &[2, 9, 4, 1, 5, 5]);
    }

    #[test]
    fn test_diff_ids_insert_into_empty() {
        let diffs = diff_ids(&[], &["a".to_string()]);
        assert_eq!(
            diffs,
            vec![QueryDiff::Insert { index: 0, values: vec!["a".to_string()] }]
        );
        let mut ids = Vec::new();
        apply_diffs(&mut ids, &diffs);
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_query_diff_wire_shape() {
        let diff = QueryDiff::Move { from: 2, to: 0, count: 1 };
        assert_eq!(
            serde_json::to_value(&diff).unwrap(),
            serde_json::json!({"type": "move", "from": 2, "to": 0, "count": 1})
        );
    }

    #[test]
    fn test_string_edit() {
        assert_eq!(string_edit("abc", "abc"), None);
        assert_eq!(
            string_edit("abc", "aXbc"),
            Some(StringEdit { index: 1, remove: 0, insert: "X".into() })
        );
        assert_eq!(
            string_edit("hello", ""),
            Some(StringEdit { index: 0, remove: 5, insert: String::new() })
        );
        assert_eq!(
            string_edit("aaa", "aa"),
            Some(StringEdit { index: 2, remove: 1, insert: String::new() })
        );
        assert_eq!(
            string_edit("héllo", "hallo"),
            Some(StringEdit { index: 1, remove: 1, insert: "a".into() })
        );
    }
}
