//! Collection CRDT primitives.
//!
//! Provides a Last-Writer-Wins register keyed on HLC stamps, and add-wins
//! observed-remove collections (set, map, record) built from op-tagged
//! nodes. A removal names the add ops it has observed; adds it has not
//! seen survive it. Map and record writes also retract the bindings they
//! observed, so only writes that did not see each other coexist. When
//! several adds for one key survive, the add with the greatest op id is
//! visible.

use crate::canonical::canonical_json;
use crate::hlc::Timestamp;
use crate::ids::{IdGenerator, TimeOrderedIds};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// A stamped register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry<V> {
    /// The stored value
    pub value: V,
    /// Stamp of the op that wrote it
    pub stamp: Timestamp,
}

/// A Last-Writer-Wins register.
///
/// Until the first write it reads as its initial value, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Register<V> {
    initial: Option<V>,
    entry: Option<RegisterEntry<V>>,
}

impl<V> Default for Register<V> {
    fn default() -> Self {
        Self {
            initial: None,
            entry: None,
        }
    }
}

impl<V: Clone> Register<V> {
    /// Create an empty register.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a register that reads as `initial` until written.
    #[must_use]
    pub fn with_initial(initial: V) -> Self {
        Self {
            initial: Some(initial),
            entry: None,
        }
    }

    /// Update the register value if `stamp` is newer than the stored one.
    ///
    /// Returns `true` if the value was updated.
    pub fn set(&mut self, value: V, stamp: Timestamp) -> bool {
        match &self.entry {
            Some(current) if current.stamp >= stamp => false,
            _ => {
                self.entry = Some(RegisterEntry { value, stamp });
                true
            }
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> Option<&V> {
        self.entry
            .as_ref()
            .map(|e| &e.value)
            .or(self.initial.as_ref())
    }

    /// Stamp of the last accepted write.
    #[must_use]
    pub fn stamp(&self) -> Option<&Timestamp> {
        self.entry.as_ref().map(|e| &e.stamp)
    }

    /// Last accepted write.
    #[must_use]
    pub fn snapshot(&self) -> Option<RegisterEntry<V>> {
        self.entry.clone()
    }

    /// Rebuild a register from a snapshot.
    #[must_use]
    pub fn from_snapshot(entry: Option<RegisterEntry<V>>) -> Self {
        Self {
            initial: None,
            entry,
        }
    }
}

/// Node of a replicated set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SetNode {
    /// Add `value`, identified structurally by `key`
    Add {
        /// Op id
        id: String,
        /// Canonical JSON of `value`
        key: String,
        /// Member value
        value: Value,
    },
    /// Retract the add ops in `targets`
    Rem {
        /// Op id
        id: String,
        /// Canonical JSON of the removed value
        key: String,
        /// Observed add op ids
        targets: Vec<String>,
    },
}

/// Node of a replicated map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapNode {
    /// Bind `key` to `value`
    Set {
        /// Op id
        id: String,
        /// Logical key
        key: Value,
        /// Canonical JSON of `key`
        #[serde(rename = "keyId")]
        key_id: String,
        /// Bound value
        value: Value,
        /// Observed set op ids this binding replaces
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        targets: Vec<String>,
    },
    /// Retract the bindings in `targets`
    Del {
        /// Op id
        id: String,
        /// Canonical JSON of the key
        #[serde(rename = "keyId")]
        key_id: String,
        /// Observed set op ids
        targets: Vec<String>,
    },
}

/// Node of a replicated record (string-keyed map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RecordNode {
    /// Set property `prop`
    Set {
        /// Op id
        id: String,
        /// Property name
        prop: String,
        /// Property value
        value: Value,
        /// Observed set op ids this write replaces
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        targets: Vec<String>,
    },
    /// Retract the property writes in `targets`
    Del {
        /// Op id
        id: String,
        /// Property name
        prop: String,
        /// Observed set op ids
        targets: Vec<String>,
    },
}

/// How an op node affects the add-wins state.
enum Effect<'a> {
    /// Add under a key, retracting `replaces`
    Add { key: &'a str, replaces: &'a [String] },
    Remove(&'a [String]),
}

trait OpNode: Clone {
    fn id(&self) -> &str;
    fn effect(&self) -> Effect<'_>;
}

impl OpNode for SetNode {
    fn id(&self) -> &str {
        match self {
            SetNode::Add { id, .. } | SetNode::Rem { id, .. } => id,
        }
    }

    fn effect(&self) -> Effect<'_> {
        match self {
            SetNode::Add { key, .. } => Effect::Add { key, replaces: &[] },
            SetNode::Rem { targets, .. } => Effect::Remove(targets),
        }
    }
}

impl SetNode {
    /// Whether the structural key matches the carried value.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match self {
            SetNode::Add { key, value, .. } => *key == canonical_json(value),
            SetNode::Rem { .. } => true,
        }
    }
}

impl OpNode for MapNode {
    fn id(&self) -> &str {
        match self {
            MapNode::Set { id, .. } | MapNode::Del { id, .. } => id,
        }
    }

    fn effect(&self) -> Effect<'_> {
        match self {
            MapNode::Set { key_id, targets, .. } => Effect::Add {
                key: key_id,
                replaces: targets,
            },
            MapNode::Del { targets, .. } => Effect::Remove(targets),
        }
    }
}

impl MapNode {
    /// Whether `keyId` matches the carried key.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match self {
            MapNode::Set { key, key_id, .. } => *key_id == canonical_json(key),
            MapNode::Del { .. } => true,
        }
    }
}

impl OpNode for RecordNode {
    fn id(&self) -> &str {
        match self {
            RecordNode::Set { id, .. } | RecordNode::Del { id, .. } => id,
        }
    }

    fn effect(&self) -> Effect<'_> {
        match self {
            RecordNode::Set { prop, targets, .. } => Effect::Add {
                key: prop,
                replaces: targets,
            },
            RecordNode::Del { targets, .. } => Effect::Remove(targets),
        }
    }
}

/// Shared add-wins bookkeeping for the collection types.
#[derive(Debug, Clone)]
struct Observed<N> {
    /// Every op seen, by id
    nodes: BTreeMap<String, N>,
    /// Key -> add ids not yet retracted
    live: BTreeMap<String, BTreeSet<String>>,
    /// Retracted add ids, including ones whose add has not arrived
    retired: HashSet<String>,
    /// Locally produced nodes since the last drain
    journal: Vec<N>,
    ids: Arc<dyn IdGenerator>,
}

impl<N: OpNode> Observed<N> {
    fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            live: BTreeMap::new(),
            retired: HashSet::new(),
            journal: Vec::new(),
            ids,
        }
    }

    fn apply(&mut self, node: N) -> bool {
        if self.nodes.contains_key(node.id()) {
            return false;
        }
        match node.effect() {
            Effect::Add { key, replaces } => {
                self.retire(replaces);
                if !self.retired.contains(node.id()) {
                    self.live
                        .entry(key.to_string())
                        .or_default()
                        .insert(node.id().to_string());
                }
            }
            Effect::Remove(targets) => self.retire(targets),
        }
        self.nodes.insert(node.id().to_string(), node);
        true
    }

    fn retire(&mut self, targets: &[String]) {
        for target in targets {
            self.retired.insert(target.clone());
            let key = match self.nodes.get(target).map(OpNode::effect) {
                Some(Effect::Add { key, .. }) => key.to_string(),
                _ => continue,
            };
            if let Some(ids) = self.live.get_mut(&key) {
                ids.remove(target);
                if ids.is_empty() {
                    self.live.remove(&key);
                }
            }
        }
    }

    fn merge(&mut self, nodes: impl IntoIterator<Item = N>) -> Vec<N> {
        nodes
            .into_iter()
            .filter(|node| self.apply(node.clone()))
            .collect()
    }

    fn local(&mut self, node: N) {
        self.journal.push(node.clone());
        self.apply(node);
    }

    fn next_id(&self) -> String {
        self.ids.next_id()
    }

    fn winner(&self, key: &str) -> Option<&N> {
        self.live
            .get(key)
            .and_then(BTreeSet::last)
            .and_then(|id| self.nodes.get(id))
    }

    fn live_ids(&self, key: &str) -> Vec<String> {
        self.live
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Winning nodes ordered by winning op id.
    fn winners(&self) -> Vec<&N> {
        let mut winners: Vec<&N> = self.live.keys().filter_map(|k| self.winner(k)).collect();
        winners.sort_by(|a, b| a.id().cmp(b.id()));
        winners
    }

    fn live_keys(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    fn snapshot(&self) -> Vec<N> {
        self.nodes.values().cloned().collect()
    }
}

macro_rules! collection_common {
    ($name:ident, $node:ty) => {
        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Create an empty collection using time-ordered ids.
            #[must_use]
            pub fn new() -> Self {
                Self::with_ids(Arc::new(TimeOrderedIds))
            }

            /// Create an empty collection with a custom id generator.
            #[must_use]
            pub fn with_ids(ids: Arc<dyn IdGenerator>) -> Self {
                Self {
                    state: Observed::new(ids),
                }
            }

            /// Rebuild from a snapshot of nodes.
            #[must_use]
            pub fn from_snapshot(nodes: Vec<$node>, ids: Arc<dyn IdGenerator>) -> Self {
                let mut this = Self::with_ids(ids);
                this.merge(nodes);
                this
            }

            /// Merge remote nodes, returning the ones not seen before.
            pub fn merge(&mut self, nodes: impl IntoIterator<Item = $node>) -> Vec<$node> {
                self.state.merge(nodes)
            }

            /// Every node seen, sorted by op id.
            #[must_use]
            pub fn snapshot(&self) -> Vec<$node> {
                self.state.snapshot()
            }

            /// Drain the nodes produced by local mutations.
            pub fn take_changes(&mut self) -> Vec<$node> {
                std::mem::take(&mut self.state.journal)
            }

            /// Number of visible entries.
            #[must_use]
            pub fn len(&self) -> usize {
                self.state.live.len()
            }

            /// Whether no entries are visible.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.state.live.is_empty()
            }
        }
    };
}

/// Add-wins observed-remove set of JSON values.
#[derive(Debug, Clone)]
pub struct CrSet {
    state: Observed<SetNode>,
}

collection_common!(CrSet, SetNode);

impl CrSet {
    /// Add `value`. Returns `false` if it is already present.
    pub fn add(&mut self, value: Value) -> bool {
        let key = canonical_json(&value);
        if self.state.live.contains_key(&key) {
            return false;
        }
        let id = self.state.next_id();
        self.state.local(SetNode::Add { id, key, value });
        true
    }

    /// Remove `value`. Returns `false` if it was absent.
    pub fn delete(&mut self, value: &Value) -> bool {
        let key = canonical_json(value);
        let targets = self.state.live_ids(&key);
        if targets.is_empty() {
            return false;
        }
        let id = self.state.next_id();
        self.state.local(SetNode::Rem { id, key, targets });
        true
    }

    /// Remove every visible value.
    pub fn clear(&mut self) {
        for key in self.state.live_keys() {
            let targets = self.state.live_ids(&key);
            let id = self.state.next_id();
            self.state.local(SetNode::Rem { id, key, targets });
        }
    }

    /// Whether `value` is present.
    #[must_use]
    pub fn has(&self, value: &Value) -> bool {
        self.state.live.contains_key(&canonical_json(value))
    }

    /// Visible values, ordered by the op that added them.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.state
            .winners()
            .into_iter()
            .filter_map(|node| match node {
                SetNode::Add { value, .. } => Some(value.clone()),
                SetNode::Rem { .. } => None,
            })
            .collect()
    }
}

/// Add-wins observed-remove map with JSON keys and values.
#[derive(Debug, Clone)]
pub struct CrMap {
    state: Observed<MapNode>,
}

collection_common!(CrMap, MapNode);

impl CrMap {
    /// Bind `key` to `value`, superseding every observed binding.
    pub fn set(&mut self, key: Value, value: Value) {
        let key_id = canonical_json(&key);
        let targets = self.state.live_ids(&key_id);
        let id = self.state.next_id();
        self.state.local(MapNode::Set {
            id,
            key,
            key_id,
            value,
            targets,
        });
    }

    /// Remove `key`. Returns `false` if it was absent.
    pub fn delete(&mut self, key: &Value) -> bool {
        let key_id = canonical_json(key);
        let targets = self.state.live_ids(&key_id);
        if targets.is_empty() {
            return false;
        }
        let id = self.state.next_id();
        self.state.local(MapNode::Del {
            id,
            key_id,
            targets,
        });
        true
    }

    /// Remove every visible key.
    pub fn clear(&mut self) {
        for key_id in self.state.live_keys() {
            let targets = self.state.live_ids(&key_id);
            let id = self.state.next_id();
            self.state.local(MapNode::Del {
                id,
                key_id,
                targets,
            });
        }
    }

    /// Value bound to `key`.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match self.state.winner(&canonical_json(key)) {
            Some(MapNode::Set { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Whether `key` is bound.
    #[must_use]
    pub fn has(&self, key: &Value) -> bool {
        self.state.live.contains_key(&canonical_json(key))
    }

    /// Visible `(key, value)` pairs, ordered by the op that bound them.
    #[must_use]
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.state
            .winners()
            .into_iter()
            .filter_map(|node| match node {
                MapNode::Set { key, value, .. } => Some((key.clone(), value.clone())),
                MapNode::Del { .. } => None,
            })
            .collect()
    }
}

/// Add-wins record of named properties.
#[derive(Debug, Clone)]
pub struct CrRecord {
    state: Observed<RecordNode>,
}

collection_common!(CrRecord, RecordNode);

impl CrRecord {
    /// Set property `prop`, superseding every observed write to it.
    pub fn set(&mut self, prop: impl Into<String>, value: Value) {
        let prop = prop.into();
        let targets = self.state.live_ids(&prop);
        let id = self.state.next_id();
        self.state.local(RecordNode::Set {
            id,
            prop,
            value,
            targets,
        });
    }

    /// Remove property `prop`. Returns `false` if it was absent.
    pub fn delete(&mut self, prop: &str) -> bool {
        let targets = self.state.live_ids(prop);
        if targets.is_empty() {
            return false;
        }
        let id = self.state.next_id();
        self.state.local(RecordNode::Del {
            id,
            prop: prop.to_string(),
            targets,
        });
        true
    }

    /// Remove every property.
    pub fn clear(&mut self) {
        for prop in self.state.live_keys() {
            let targets = self.state.live_ids(&prop);
            let id = self.state.next_id();
            self.state.local(RecordNode::Del { id, prop, targets });
        }
    }

    /// Value of `prop`.
    #[must_use]
    pub fn get(&self, prop: &str) -> Option<&Value> {
        match self.state.winner(prop) {
            Some(RecordNode::Set { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Whether `prop` is set.
    #[must_use]
    pub fn has(&self, prop: &str) -> bool {
        self.state.live.contains_key(prop)
    }

    /// Visible properties, by name.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.state
            .live
            .keys()
            .filter_map(|prop| self.get(prop).map(|v| (prop.clone(), v.clone())))
            .collect()
    }
}
