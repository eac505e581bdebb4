//! Causal node store backing replicated arrays and text.
//!
//! Every element is a [`CausalNode`] naming the node it was inserted after.
//! Nodes are never removed; deletion sets a tombstone flag. The visible
//! order is a pure function of the node set:
//!
//! - nodes inserted at the front (empty predecessor list) form the root level
//! - each node is immediately followed by the nodes inserted after it,
//!   together with their descendants
//! - siblings sharing a predecessor are ordered by id, greatest first
//! - nodes whose predecessor is not (yet) known form detached groups
//!   appended after the rooted tree, by predecessor key ascending
//!
//! With time-ordered ids, an insert made after the element at alive index
//! `i - 1` therefore lands at alive index `i` on every replica that has
//! seen the same nodes.

use crate::ids::{IdGenerator, TimeOrderedIds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use thiserror::Error;

/// A single element of a causal sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalNode<T> {
    /// Unique node id
    pub id: String,
    /// Element value
    pub value: T,
    /// Predecessor ids; empty means "first position"
    pub after: Vec<String>,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

impl<T> CausalNode<T> {
    /// Key grouping siblings: empty for root, the single predecessor id,
    /// or a comma-joined composite key.
    #[must_use]
    pub fn after_key(&self) -> String {
        match self.after.as_slice() {
            [] => String::new(),
            [single] => single.clone(),
            many => many.join(","),
        }
    }
}

/// Errors raised by index-based sequence operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// Index beyond the alive length
    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Alive length at the time of the call
        len: usize,
    },
}

/// A replicated sequence of values.
///
/// Local mutations append the nodes they create or tombstone to a change
/// journal, drained with [`Sequence::take_changes`]. Remote nodes enter
/// through [`Sequence::merge`] and are never journaled.
#[derive(Debug, Clone)]
pub struct Sequence<T> {
    /// Nodes in linear order
    nodes: Vec<CausalNode<T>>,
    /// Node id -> position in `nodes`
    positions: HashMap<String, usize>,
    /// Number of non-deleted nodes
    alive: usize,
    /// Nodes produced by local mutations since the last drain
    journal: Vec<CausalNode<T>>,
    ids: Arc<dyn IdGenerator>,
}

impl<T: Clone> Default for Sequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Sequence<T> {
    /// Create an empty sequence using time-ordered ids.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ids(Arc::new(TimeOrderedIds))
    }

    /// Create an empty sequence with a custom id generator.
    #[must_use]
    pub fn with_ids(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
            alive: 0,
            journal: Vec::new(),
            ids,
        }
    }

    /// Rebuild a sequence from a snapshot. Duplicate ids keep the first copy.
    #[must_use]
    pub fn from_snapshot(nodes: Vec<CausalNode<T>>, ids: Arc<dyn IdGenerator>) -> Self {
        let mut seq = Self::with_ids(ids);
        seq.merge(nodes);
        seq
    }

    /// Number of alive elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alive
    }

    /// Whether there are no alive elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alive == 0
    }

    /// All nodes, tombstones included, in linear order.
    #[must_use]
    pub fn nodes(&self) -> &[CausalNode<T>] {
        &self.nodes
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&CausalNode<T>> {
        self.positions.get(id).map(|&pos| &self.nodes[pos])
    }

    /// Copy of every node in linear order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CausalNode<T>> {
        self.nodes.clone()
    }

    /// Drain the nodes produced by local mutations.
    pub fn take_changes(&mut self) -> Vec<CausalNode<T>> {
        std::mem::take(&mut self.journal)
    }

    /// Insert `value` after `predecessor` (or at the front when `None`).
    ///
    /// The predecessor does not need to be alive or even known.
    pub fn insert_after(&mut self, predecessor: Option<&str>, value: T) -> CausalNode<T> {
        let node = CausalNode {
            id: self.ids.next_id(),
            value,
            after: predecessor.map(|p| vec![p.to_string()]).unwrap_or_default(),
            deleted: false,
        };
        self.nodes.push(node.clone());
        self.alive += 1;
        self.relinearize();
        self.journal.push(node.clone());
        node
    }

    /// Tombstone the node with `id`.
    ///
    /// Returns `false` when the node is unknown or already deleted.
    pub fn mark_deleted(&mut self, id: &str) -> bool {
        let Some(&pos) = self.positions.get(id) else {
            return false;
        };
        let node = &mut self.nodes[pos];
        if node.deleted {
            return false;
        }
        node.deleted = true;
        self.alive -= 1;
        self.journal.push(node.clone());
        true
    }

    /// Merge remote nodes, returning the ones that changed local state.
    ///
    /// Unknown ids are inserted, known ids only move from alive to
    /// deleted. Everything else is a duplicate and ignored.
    pub fn merge(&mut self, remote: impl IntoIterator<Item = CausalNode<T>>) -> Vec<CausalNode<T>> {
        let mut changed = Vec::new();
        let mut inserted = false;

        for node in remote {
            if let Some(&pos) = self.positions.get(&node.id) {
                let local = &mut self.nodes[pos];
                if node.deleted && !local.deleted {
                    local.deleted = true;
                    self.alive -= 1;
                    changed.push(local.clone());
                }
                continue;
            }

            if !node.deleted {
                self.alive += 1;
            }
            // Register the position so later duplicates in this batch are seen
            self.positions.insert(node.id.clone(), self.nodes.len());
            self.nodes.push(node.clone());
            changed.push(node);
            inserted = true;
        }

        if inserted {
            self.relinearize();
        }
        changed
    }

    /// Alive values in order.
    #[must_use]
    pub fn linearize(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Iterate over alive values in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.nodes.iter().filter(|n| !n.deleted).map(|n| &n.value)
    }

    /// Value at alive `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.alive_position(index).map(|pos| &self.nodes[pos].value)
    }

    /// Insert `value` so that it ends up at alive `index`.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::IndexOutOfBounds`] if `index > len()`.
    pub fn insert_at(&mut self, index: usize, value: T) -> Result<(), SequenceError> {
        if index > self.alive {
            return Err(self.out_of_bounds(index));
        }
        let predecessor = self.predecessor_for(index);
        self.insert_after(predecessor.as_deref(), value);
        Ok(())
    }

    /// Delete the value at alive `index`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::IndexOutOfBounds`] if `index >= len()`.
    pub fn delete_at(&mut self, index: usize) -> Result<T, SequenceError> {
        let pos = self
            .alive_position(index)
            .ok_or_else(|| self.out_of_bounds(index))?;
        let id = self.nodes[pos].id.clone();
        self.mark_deleted(&id);
        Ok(self.nodes[pos].value.clone())
    }

    /// Replace the value at alive `index` (tombstone plus insert).
    ///
    /// `index == len()` appends.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::IndexOutOfBounds`] if `index > len()`.
    pub fn set_at(&mut self, index: usize, value: T) -> Result<(), SequenceError> {
        if index > self.alive {
            return Err(self.out_of_bounds(index));
        }
        if index < self.alive {
            self.delete_at(index)?;
        }
        self.insert_at(index, value)
    }

    /// Append a value, returning the new length.
    pub fn push(&mut self, value: T) -> usize {
        self.push_all([value])
    }

    /// Append several values in order, returning the new length.
    pub fn push_all(&mut self, values: impl IntoIterator<Item = T>) -> usize {
        let mut after = self.last_alive_id();
        for value in values {
            after = Some(self.insert_after(after.as_deref(), value).id);
        }
        self.alive
    }

    /// Prepend a value, returning the new length.
    pub fn unshift(&mut self, value: T) -> usize {
        self.unshift_all([value])
    }

    /// Prepend several values, keeping their relative order.
    pub fn unshift_all(&mut self, values: impl IntoIterator<Item = T>) -> usize {
        let mut after: Option<String> = None;
        for value in values {
            after = Some(self.insert_after(after.as_deref(), value).id);
        }
        self.alive
    }

    /// Remove and return the last value.
    pub fn pop(&mut self) -> Option<T> {
        match self.alive {
            0 => None,
            len => self.delete_at(len - 1).ok(),
        }
    }

    /// Remove and return the first value.
    pub fn shift(&mut self) -> Option<T> {
        self.delete_at(0).ok()
    }

    /// Copy of the alive values within `range`, clamped to the length.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Vec<T> {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(self.alive);
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => self.alive,
        }
        .min(self.alive);

        if end <= start {
            return Vec::new();
        }
        self.iter().skip(start).take(end - start).cloned().collect()
    }

    /// Alive index of the first value equal to `value`.
    pub fn index_of(&self, value: &T) -> Option<usize>
    where
        T: PartialEq,
    {
        self.iter().position(|v| v == value)
    }

    /// Whether an alive value equals `value`.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.iter().any(|v| v == value)
    }

    fn out_of_bounds(&self, index: usize) -> SequenceError {
        SequenceError::IndexOutOfBounds {
            index,
            len: self.alive,
        }
    }

    fn alive_position(&self, index: usize) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted)
            .nth(index)
            .map(|(pos, _)| pos)
    }

    fn predecessor_for(&self, index: usize) -> Option<String> {
        if index == 0 {
            return None;
        }
        self.alive_position(index - 1)
            .map(|pos| self.nodes[pos].id.clone())
    }

    fn last_alive_id(&self) -> Option<String> {
        self.nodes
            .iter()
            .rev()
            .find(|n| !n.deleted)
            .map(|n| n.id.clone())
    }

    /// Recompute the linear order from the predecessor tree.
    fn relinearize(&mut self) {
        let mut children: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (pos, node) in self.nodes.iter().enumerate() {
            children.entry(node.after_key()).or_default().push(pos);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|&a, &b| self.nodes[b].id.cmp(&self.nodes[a].id));
        }

        let known: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = vec![false; self.nodes.len()];

        let visit = |roots: &[usize], order: &mut Vec<usize>, visited: &mut Vec<bool>| {
            let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
            while let Some(pos) = stack.pop() {
                if visited[pos] {
                    continue;
                }
                visited[pos] = true;
                order.push(pos);
                if let Some(kids) = children.get(&self.nodes[pos].id) {
                    stack.extend(kids.iter().rev().copied());
                }
            }
        };

        if let Some(roots) = children.get("") {
            visit(roots, &mut order, &mut visited);
        }
        // Detached groups hang off predecessors we have not seen
        for (key, group) in &children {
            if !key.is_empty() && !known.contains(key.as_str()) {
                visit(group, &mut order, &mut visited);
            }
        }
        // Anything still unvisited sits on a predecessor cycle
        for group in children.values() {
            let pending: Vec<usize> = group.iter().copied().filter(|&p| !visited[p]).collect();
            if !pending.is_empty() {
                visit(&pending, &mut order, &mut visited);
            }
        }

        let mut slots: Vec<Option<CausalNode<T>>> =
            std::mem::take(&mut self.nodes).into_iter().map(Some).collect();
        self.nodes = order
            .into_iter()
            .filter_map(|pos| slots[pos].take())
            .collect();
        self.positions = self
            .nodes
            .iter()
            .enumerate()
            .map(|(pos, n)| (n.id.clone(), pos))
            .collect();
    }
}

impl Sequence<String> {
    /// Concatenate alive characters.
    #[must_use]
    pub fn text(&self) -> String {
        self.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic ids: `prefix-000001`, `prefix-000002`, ...
    #[derive(Debug)]
    struct CounterIds {
        prefix: String,
        next: AtomicU64,
    }

    impl CounterIds {
        fn shared(prefix: &str) -> Arc<dyn IdGenerator> {
            Arc::new(Self {
                prefix: prefix.to_string(),
                next: AtomicU64::new(1),
            })
        }
    }

    impl IdGenerator for CounterIds {
        fn next_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("{n:08}-{}", self.prefix)
        }
    }

    fn node(id: &str, value: char, after: &[&str]) -> CausalNode<char> {
        CausalNode {
            id: id.to_string(),
            value,
            after: after.iter().map(|s| (*s).to_string()).collect(),
            deleted: false,
        }
    }

    #[test]
    fn push_pop_shift_unshift() {
        let mut seq: Sequence<i32> = Sequence::with_ids(CounterIds::shared("a"));
        seq.push(1);
        seq.push_all([2, 3]);
        seq.unshift_all([-1, 0]);
        assert_eq!(seq.linearize(), vec![-1, 0, 1, 2, 3]);

        assert_eq!(seq.pop(), Some(3));
        assert_eq!(seq.shift(), Some(-1));
        assert_eq!(seq.linearize(), vec![0, 1, 2]);
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn root_siblings_order_by_id_descending() {
        let seq = Sequence::from_snapshot(
            vec![node("a", 'a', &[]), node("c", 'c', &[]), node("b", 'b', &[])],
            CounterIds::shared("x"),
        );
        assert_eq!(seq.linearize(), vec!['c', 'b', 'a']);
    }

    #[test]
    fn children_follow_their_predecessor() {
        let seq = Sequence::from_snapshot(
            vec![
                node("2", 'y', &["1"]),
                node("1", 'x', &[]),
                node("3", 'z', &["2"]),
                node("4", 'w', &["1"]),
            ],
            CounterIds::shared("x"),
        );
        // 1, then its children 4 and 2 (descending), 3 under 2
        assert_eq!(seq.linearize(), vec!['x', 'w', 'y', 'z']);
    }

    #[test]
    fn detached_nodes_sort_after_rooted_tree() {
        let mut seq = Sequence::from_snapshot(
            vec![node("m", 'm', &["missing"]), node("r", 'r', &[])],
            CounterIds::shared("x"),
        );
        assert_eq!(seq.linearize(), vec!['r', 'm']);

        // Once the predecessor arrives the group reattaches
        seq.merge(vec![node("missing", 'p', &[])]);
        assert_eq!(seq.linearize(), vec!['r', 'p', 'm']);
    }

    #[test]
    fn composite_predecessor_is_a_detached_group() {
        let seq = Sequence::from_snapshot(
            vec![node("a", 'a', &[]), node("b", 'b', &["a", "x"])],
            CounterIds::shared("x"),
        );
        assert_eq!(seq.nodes()[1].after_key(), "a,x");
        assert_eq!(seq.linearize(), vec!['a', 'b']);
    }

    #[test]
    fn predecessor_cycle_is_still_visible() {
        let seq = Sequence::from_snapshot(
            vec![node("a", 'a', &["b"]), node("b", 'b', &["a"])],
            CounterIds::shared("x"),
        );
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.linearize().len(), 2);
    }

    #[test]
    fn merge_is_first_seen_wins() {
        let mut seq = Sequence::from_snapshot(vec![node("a", 'a', &[])], CounterIds::shared("x"));

        // Same id with a different value is a duplicate
        assert!(seq.merge(vec![node("a", 'z', &[])]).is_empty());
        assert_eq!(seq.linearize(), vec!['a']);

        let mut tomb = node("a", 'a', &[]);
        tomb.deleted = true;
        assert_eq!(seq.merge(vec![tomb.clone()]).len(), 1);
        assert!(seq.is_empty());

        // Deleted never comes back
        assert!(seq.merge(vec![node("a", 'a', &[])]).is_empty());
        assert!(seq.merge(vec![tomb]).is_empty());
        assert!(seq.is_empty());
    }

    #[test]
    fn merge_ignores_duplicates_within_a_batch() {
        let mut seq: Sequence<char> = Sequence::with_ids(CounterIds::shared("x"));
        let changed = seq.merge(vec![node("a", 'a', &[]), node("a", 'b', &[])]);
        assert_eq!(changed.len(), 1);
        assert_eq!(seq.linearize(), vec!['a']);
    }

    #[test]
    fn journal_captures_local_mutations_only() {
        let mut seq: Sequence<i32> = Sequence::with_ids(CounterIds::shared("a"));
        seq.push(1);
        seq.push(2);
        let changes = seq.take_changes();
        assert_eq!(changes.len(), 2);
        assert!(seq.take_changes().is_empty());

        let mut other: Sequence<i32> = Sequence::with_ids(CounterIds::shared("b"));
        other.merge(changes);
        assert!(other.take_changes().is_empty());
        assert_eq!(other.linearize(), vec![1, 2]);
    }

    #[test]
    fn set_at_produces_tombstone_and_insert() {
        let mut seq: Sequence<i32> = Sequence::with_ids(CounterIds::shared("a"));
        seq.push_all([1, 2, 3]);
        seq.take_changes();

        seq.set_at(1, 20).unwrap();
        let changes = seq.take_changes();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].deleted);
        assert!(!changes[1].deleted);
        assert_eq!(seq.linearize(), vec![1, 20, 3]);

        seq.set_at(3, 4).unwrap();
        assert_eq!(seq.take_changes().len(), 1);
        assert_eq!(seq.linearize(), vec![1, 20, 3, 4]);
    }

    #[test]
    fn out_of_bounds_indices() {
        let mut seq: Sequence<i32> = Sequence::new();
        seq.push(1);
        assert_eq!(
            seq.insert_at(2, 5),
            Err(SequenceError::IndexOutOfBounds { index: 2, len: 1 })
        );
        assert!(seq.delete_at(1).is_err());
        assert!(seq.set_at(2, 0).is_err());
        assert_eq!(seq.get(1), None);
        assert!(seq.take_changes().len() == 1);
    }

    #[test]
    fn slice_clamps_range() {
        let mut seq: Sequence<i32> = Sequence::new();
        seq.push_all([1, 2, 3, 4]);
        assert_eq!(seq.slice(1..3), vec![2, 3]);
        assert_eq!(seq.slice(2..), vec![3, 4]);
        assert_eq!(seq.slice(..=0), vec![1]);
        assert_eq!(seq.slice(3..10), vec![4]);
        assert!(seq.slice(5..9).is_empty());
        assert_eq!(seq.index_of(&3), Some(2));
        assert!(seq.contains(&4));
        assert!(!seq.contains(&9));
    }

    #[test]
    fn text_concatenates_chars() {
        let mut seq: Sequence<String> = Sequence::new();
        for (i, ch) in "hello".chars().enumerate() {
            seq.insert_at(i, ch.to_string()).unwrap();
        }
        seq.delete_at(0).unwrap();
        seq.insert_at(0, "j".to_string()).unwrap();
        assert_eq!(seq.text(), "jello");
    }

    #[test]
    fn concurrent_inserts_converge() {
        let ids_a = CounterIds::shared("a");
        let ids_b = CounterIds::shared("b");
        let mut a: Sequence<char> = Sequence::with_ids(ids_a);
        a.push_all(['x', 'y']);
        let base = a.take_changes();

        let mut b: Sequence<char> = Sequence::from_snapshot(base, ids_b);
        a.insert_at(1, 'A').unwrap();
        b.insert_at(1, 'B').unwrap();
        b.delete_at(0).unwrap();

        let from_a = a.take_changes();
        let from_b = b.take_changes();
        a.merge(from_b);
        b.merge(from_a);

        assert_eq!(a.linearize(), b.linearize());
        assert_eq!(a.len(), 3);
    }

    #[derive(Debug, Clone)]
    enum ListOp {
        Push(i32),
        Unshift(i32),
        Pop,
        Shift,
        InsertAt(usize, i32),
        DeleteAt(usize),
        SetAt(usize, i32),
    }

    fn list_op() -> impl Strategy<Value = ListOp> {
        prop_oneof![
            any::<i32>().prop_map(ListOp::Push),
            any::<i32>().prop_map(ListOp::Unshift),
            Just(ListOp::Pop),
            Just(ListOp::Shift),
            (0usize..64, any::<i32>()).prop_map(|(i, v)| ListOp::InsertAt(i, v)),
            (0usize..64).prop_map(ListOp::DeleteAt),
            (0usize..64, any::<i32>()).prop_map(|(i, v)| ListOp::SetAt(i, v)),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_vec(ops in proptest::collection::vec(list_op(), 0..80)) {
            let mut seq: Sequence<i32> = Sequence::with_ids(CounterIds::shared("a"));
            let mut replica: Sequence<i32> = Sequence::with_ids(CounterIds::shared("b"));
            let mut model: Vec<i32> = Vec::new();

            for op in ops {
                match op {
                    ListOp::Push(v) => {
                        seq.push(v);
                        model.push(v);
                    }
                    ListOp::Unshift(v) => {
                        seq.unshift(v);
                        model.insert(0, v);
                    }
                    ListOp::Pop => prop_assert_eq!(seq.pop(), model.pop()),
                    ListOp::Shift => {
                        let expected = if model.is_empty() { None } else { Some(model.remove(0)) };
                        prop_assert_eq!(seq.shift(), expected);
                    }
                    ListOp::InsertAt(i, v) => {
                        let i = i % (model.len() + 1);
                        seq.insert_at(i, v).unwrap();
                        model.insert(i, v);
                    }
                    ListOp::DeleteAt(i) => {
                        if model.is_empty() {
                            prop_assert!(seq.delete_at(i).is_err());
                        } else {
                            let i = i % model.len();
                            prop_assert_eq!(seq.delete_at(i).unwrap(), model.remove(i));
                        }
                    }
                    ListOp::SetAt(i, v) => {
                        let i = i % (model.len() + 1);
                        seq.set_at(i, v).unwrap();
                        if i == model.len() {
                            model.push(v);
                        } else {
                            model[i] = v;
                        }
                    }
                }
                prop_assert_eq!(seq.linearize(), model.clone());
                replica.merge(seq.take_changes());
                prop_assert_eq!(replica.linearize(), model.clone());
            }
        }

        #[test]
        fn merge_order_does_not_matter(
            edits_a in proptest::collection::vec((0usize..16, any::<u8>(), any::<bool>()), 1..20),
            edits_b in proptest::collection::vec((0usize..16, any::<u8>(), any::<bool>()), 1..20),
        ) {
            let apply = |seq: &mut Sequence<u8>, edits: &[(usize, u8, bool)]| {
                for &(i, v, delete) in edits {
                    if delete && !seq.is_empty() {
                        let len = seq.len();
                        seq.delete_at(i % len).unwrap();
                    } else {
                        let len = seq.len();
                        seq.insert_at(i % (len + 1), v).unwrap();
                    }
                }
                seq.take_changes()
            };

            let mut a: Sequence<u8> = Sequence::with_ids(CounterIds::shared("a"));
            let mut b: Sequence<u8> = Sequence::with_ids(CounterIds::shared("b"));
            let ops_a = apply(&mut a, &edits_a);
            let ops_b = apply(&mut b, &edits_b);

            let mut forward: Sequence<u8> = Sequence::new();
            forward.merge(ops_a.clone());
            forward.merge(ops_b.clone());

            let mut backward: Sequence<u8> = Sequence::new();
            let mut reversed: Vec<_> = ops_b.into_iter().chain(ops_a).collect();
            reversed.reverse();
            backward.merge(reversed.clone());
            // Idempotent
            backward.merge(reversed);

            prop_assert_eq!(forward.linearize(), backward.linearize());
            prop_assert_eq!(forward.snapshot(), backward.snapshot());
        }
    }
}
