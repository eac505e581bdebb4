//! Field CRDTs: construction, local patch capture, and remote merge.

use crate::error::DocError;
use quill_core::{
    canonical_json, CausalNode, CrMap, CrRecord, CrSet, CrdtKind, FieldSchema, IdGenerator,
    MapNode, RecordNode, Register, Sequence, SetNode, Timestamp,
};
use quill_proto::{NodesPatch, OpPayload};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The read view of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Register value, `None` before the first write
    Register(Option<Value>),
    /// Text content
    Text(String),
    /// Array elements
    Array(Vec<Value>),
    /// Set members
    Set(Vec<Value>),
    /// Map entries
    Map(Vec<(Value, Value)>),
    /// Record properties
    Record(BTreeMap<String, Value>),
}

impl FieldValue {
    /// Render as plain JSON: maps become `[key, value]` pair lists.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Register(value) => value.clone().unwrap_or(Value::Null),
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Array(items) | FieldValue::Set(items) => Value::Array(items.clone()),
            FieldValue::Map(entries) => Value::Array(
                entries
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.clone(), v.clone()]))
                    .collect(),
            ),
            FieldValue::Record(props) => {
                Value::Object(props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
        }
    }
}

/// A visible change produced by merging a remote op.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub(crate) method: &'static str,
    pub(crate) data: Value,
}

impl Change {
    fn new(method: &'static str, data: Value) -> Self {
        Self { method, data }
    }
}

/// Live CRDT backing one field.
#[derive(Debug, Clone)]
pub(crate) enum FieldCrdt {
    Register(Register<Value>),
    Text(Sequence<String>),
    Array(Sequence<Value>),
    Set(CrSet),
    Map(CrMap),
    Record(CrRecord),
}

impl FieldCrdt {
    pub(crate) fn empty(kind: CrdtKind, ids: &Arc<dyn IdGenerator>) -> Self {
        match kind {
            CrdtKind::Register => FieldCrdt::Register(Register::new()),
            CrdtKind::Text => FieldCrdt::Text(Sequence::with_ids(Arc::clone(ids))),
            CrdtKind::Array => FieldCrdt::Array(Sequence::with_ids(Arc::clone(ids))),
            CrdtKind::Set => FieldCrdt::Set(CrSet::with_ids(Arc::clone(ids))),
            CrdtKind::Map => FieldCrdt::Map(CrMap::with_ids(Arc::clone(ids))),
            CrdtKind::Record => FieldCrdt::Record(CrRecord::with_ids(Arc::clone(ids))),
        }
    }

    /// A CRDT holding the schema's initial value, built with local
    /// mutations so its change journal carries the seeding nodes.
    ///
    /// Registers read as the initial value (or null) without a journal.
    pub(crate) fn seeded(schema: &FieldSchema, ids: &Arc<dyn IdGenerator>) -> Self {
        let initial = schema.initial.as_ref();
        if schema.crdt == CrdtKind::Register {
            return FieldCrdt::Register(Register::with_initial(
                initial.cloned().unwrap_or(Value::Null),
            ));
        }

        let mut crdt = Self::empty(schema.crdt, ids);
        match &mut crdt {
            FieldCrdt::Register(_) => {}
            FieldCrdt::Text(seq) => {
                if let Some(text) = initial.and_then(Value::as_str) {
                    seq.push_all(text.chars().map(String::from));
                }
            }
            FieldCrdt::Array(seq) => {
                if let Some(items) = initial.and_then(Value::as_array) {
                    seq.push_all(items.iter().cloned());
                }
            }
            FieldCrdt::Set(set) => {
                for value in initial.and_then(Value::as_array).into_iter().flatten() {
                    set.add(value.clone());
                }
            }
            FieldCrdt::Map(map) => {
                for entry in initial.and_then(Value::as_array).into_iter().flatten() {
                    if let Some([key, value]) = entry.as_array().map(Vec::as_slice) {
                        map.set(key.clone(), value.clone());
                    }
                }
            }
            FieldCrdt::Record(record) => {
                for (prop, value) in initial.and_then(Value::as_object).into_iter().flatten() {
                    record.set(prop.clone(), value.clone());
                }
            }
        }
        crdt
    }

    /// Drain the local change journal into a `{ nodes }` patch.
    ///
    /// Returns `None` when the mutation produced nothing.
    pub(crate) fn take_patch(&mut self) -> Result<Option<Value>, DocError> {
        fn patch<N: Serialize>(nodes: Vec<N>) -> Result<Option<Value>, DocError> {
            if nodes.is_empty() {
                return Ok(None);
            }
            Ok(Some(serde_json::to_value(NodesPatch { nodes })?))
        }

        match self {
            FieldCrdt::Register(_) => Ok(None),
            FieldCrdt::Text(seq) => patch(seq.take_changes()),
            FieldCrdt::Array(seq) => patch(seq.take_changes()),
            FieldCrdt::Set(set) => patch(set.take_changes()),
            FieldCrdt::Map(map) => patch(map.take_changes()),
            FieldCrdt::Record(record) => patch(record.take_changes()),
        }
    }

    pub(crate) fn value(&self) -> FieldValue {
        match self {
            FieldCrdt::Register(reg) => FieldValue::Register(reg.get().cloned()),
            FieldCrdt::Text(seq) => FieldValue::Text(seq.text()),
            FieldCrdt::Array(seq) => FieldValue::Array(seq.linearize()),
            FieldCrdt::Set(set) => FieldValue::Set(set.values()),
            FieldCrdt::Map(map) => FieldValue::Map(map.entries()),
            FieldCrdt::Record(record) => FieldValue::Record(record.entries()),
        }
    }

    pub(crate) fn as_register(&self) -> Option<&Register<Value>> {
        match self {
            FieldCrdt::Register(reg) => Some(reg),
            _ => None,
        }
    }

    pub(crate) fn as_text(&self) -> Option<&Sequence<String>> {
        match self {
            FieldCrdt::Text(seq) => Some(seq),
            _ => None,
        }
    }

    pub(crate) fn as_text_mut(&mut self) -> Option<&mut Sequence<String>> {
        match self {
            FieldCrdt::Text(seq) => Some(seq),
            _ => None,
        }
    }

    pub(crate) fn as_array(&self) -> Option<&Sequence<Value>> {
        match self {
            FieldCrdt::Array(seq) => Some(seq),
            _ => None,
        }
    }

    pub(crate) fn as_array_mut(&mut self) -> Option<&mut Sequence<Value>> {
        match self {
            FieldCrdt::Array(seq) => Some(seq),
            _ => None,
        }
    }

    pub(crate) fn as_set(&self) -> Option<&CrSet> {
        match self {
            FieldCrdt::Set(set) => Some(set),
            _ => None,
        }
    }

    pub(crate) fn as_set_mut(&mut self) -> Option<&mut CrSet> {
        match self {
            FieldCrdt::Set(set) => Some(set),
            _ => None,
        }
    }

    pub(crate) fn as_map(&self) -> Option<&CrMap> {
        match self {
            FieldCrdt::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut CrMap> {
        match self {
            FieldCrdt::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_record(&self) -> Option<&CrRecord> {
        match self {
            FieldCrdt::Record(record) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn as_record_mut(&mut self) -> Option<&mut CrRecord> {
        match self {
            FieldCrdt::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Validate and merge a remote field op, returning visible changes.
    ///
    /// `Err` carries the rejection reason; nothing is applied in that case.
    pub(crate) fn merge_remote(
        &mut self,
        schema: &FieldSchema,
        payload: &OpPayload,
    ) -> Result<Vec<Change>, String> {
        if schema.crdt.op_kind() != payload.kind {
            return Err(format!(
                "op kind {} does not match {} field",
                payload.kind, schema.crdt
            ));
        }

        match self {
            FieldCrdt::Register(reg) => merge_register(reg, schema, &payload.patch, &payload.stamp),
            FieldCrdt::Text(seq) => {
                let nodes: Vec<CausalNode<Value>> = nodes_of(payload)?;
                let nodes = nodes
                    .into_iter()
                    .map(|node| match node.value {
                        Value::String(ch) if ch.chars().count() == 1 => Ok(CausalNode {
                            id: node.id,
                            value: ch,
                            after: node.after,
                            deleted: node.deleted,
                        }),
                        _ => Err("text node value is not a single character".to_string()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(merge_sequence(seq, nodes, true, |s| Value::String(s.clone())))
            }
            FieldCrdt::Array(seq) => {
                let nodes: Vec<CausalNode<Value>> = nodes_of(payload)?;
                if !nodes.iter().all(|n| schema.accepts(&n.value)) {
                    return Err("array node value has the wrong type".to_string());
                }
                Ok(merge_sequence(seq, nodes, false, Clone::clone))
            }
            FieldCrdt::Set(set) => {
                let nodes: Vec<SetNode> = nodes_of(payload)?;
                for node in &nodes {
                    if let SetNode::Add { value, .. } = node {
                        if !schema.accepts(value) {
                            return Err("set value has the wrong type".to_string());
                        }
                    }
                    if !node.is_consistent() {
                        return Err("set key does not match value".to_string());
                    }
                }
                let before = set.values();
                if set.merge(nodes).is_empty() {
                    return Ok(Vec::new());
                }
                Ok(diff_set(&before, &set.values()))
            }
            FieldCrdt::Map(map) => {
                let nodes: Vec<MapNode> = nodes_of(payload)?;
                for node in &nodes {
                    if let MapNode::Set { value, .. } = node {
                        if !schema.accepts(value) {
                            return Err("map value has the wrong type".to_string());
                        }
                    }
                    if !node.is_consistent() {
                        return Err("map keyId does not match key".to_string());
                    }
                }
                let before = map.entries();
                if map.merge(nodes).is_empty() {
                    return Ok(Vec::new());
                }
                Ok(diff_map(&before, &map.entries()))
            }
            FieldCrdt::Record(record) => {
                let nodes: Vec<RecordNode> = nodes_of(payload)?;
                for node in &nodes {
                    if let RecordNode::Set { value, .. } = node {
                        if !schema.accepts(value) {
                            return Err("record value has the wrong type".to_string());
                        }
                    }
                }
                let before = record.entries();
                if record.merge(nodes).is_empty() {
                    return Ok(Vec::new());
                }
                Ok(diff_record(&before, &record.entries()))
            }
        }
    }
}

fn nodes_of<N: serde::de::DeserializeOwned>(payload: &OpPayload) -> Result<Vec<N>, String> {
    payload
        .patch_as::<NodesPatch<N>>()
        .map(|p| p.nodes)
        .map_err(|e| e.to_string())
}

fn merge_register(
    reg: &mut Register<Value>,
    schema: &FieldSchema,
    patch: &Value,
    stamp: &Timestamp,
) -> Result<Vec<Change>, String> {
    let value = patch
        .get("value")
        .ok_or_else(|| "register patch has no value".to_string())?;
    if !schema.accepts(value) {
        return Err("register value rejected by schema".to_string());
    }
    let before = reg.get().cloned();
    reg.set(value.clone(), stamp.clone());
    let after = reg.get().cloned();
    if before == after {
        return Ok(Vec::new());
    }
    Ok(vec![Change::new("set", json!({ "value": after }))])
}

/// Node id -> alive index; tombstones map to the index of the next alive node.
fn index_map<T>(nodes: &[CausalNode<T>]) -> HashMap<String, usize> {
    let mut alive = 0;
    let mut map = HashMap::with_capacity(nodes.len());
    for node in nodes {
        map.insert(node.id.clone(), alive);
        if !node.deleted {
            alive += 1;
        }
    }
    map
}

fn merge_sequence<T: Clone>(
    seq: &mut Sequence<T>,
    nodes: Vec<CausalNode<T>>,
    text: bool,
    to_value: impl Fn(&T) -> Value,
) -> Vec<Change> {
    let before_index = index_map(seq.nodes());
    let before_len = seq.len();
    let changed = seq.merge(nodes);
    if changed.is_empty() {
        return Vec::new();
    }
    let after_index = index_map(seq.nodes());

    let mut deletes: Vec<usize> = Vec::new();
    let mut inserts: Vec<(usize, Value)> = Vec::new();
    for node in &changed {
        if node.deleted {
            if let Some(&index) = before_index.get(&node.id) {
                deletes.push(index);
            }
        } else if let Some(&index) = after_index.get(&node.id) {
            inserts.push((index, to_value(&node.value)));
        }
    }
    deletes.sort_unstable_by(|a, b| b.cmp(a));
    inserts.sort_by_key(|(index, _)| *index);

    let mut changes = Vec::with_capacity(deletes.len() + inserts.len());
    for index in deletes {
        let change = if text {
            Change::new("deleteAt", json!({ "index": index }))
        } else if index == 0 {
            Change::new("shift", Value::Null)
        } else if index + 1 == before_len {
            Change::new("pop", Value::Null)
        } else {
            Change::new("deleteAt", json!({ "index": index }))
        };
        changes.push(change);
    }
    for (index, value) in inserts {
        let change = if text {
            Change::new("insertAt", json!({ "index": index, "value": value }))
        } else if index == 0 {
            Change::new("unshift", json!({ "value": value }))
        } else if index >= before_len {
            Change::new("push", json!({ "value": value }))
        } else {
            Change::new("insertAt", json!({ "index": index, "value": value }))
        };
        changes.push(change);
    }
    changes
}

fn diff_set(before: &[Value], after: &[Value]) -> Vec<Change> {
    let before_keys: HashMap<String, &Value> = before.iter().map(|v| (canonical_json(v), v)).collect();
    let after_keys: HashMap<String, &Value> = after.iter().map(|v| (canonical_json(v), v)).collect();

    let added = after
        .iter()
        .filter(|v| !before_keys.contains_key(&canonical_json(v)))
        .map(|v| Change::new("add", json!({ "value": v })));
    let removed = before
        .iter()
        .filter(|v| !after_keys.contains_key(&canonical_json(v)))
        .map(|v| Change::new("delete", json!({ "value": v })));
    added.chain(removed).collect()
}

fn diff_map(before: &[(Value, Value)], after: &[(Value, Value)]) -> Vec<Change> {
    let before_by_key: HashMap<String, &Value> =
        before.iter().map(|(k, v)| (canonical_json(k), v)).collect();
    let after_keys: HashMap<String, ()> = after.iter().map(|(k, _)| (canonical_json(k), ())).collect();

    let mut changes = Vec::new();
    for (key, value) in after {
        if before_by_key.get(&canonical_json(key)) != Some(&value) {
            changes.push(Change::new("set", json!({ "key": key, "value": value })));
        }
    }
    for (key, _) in before {
        if !after_keys.contains_key(&canonical_json(key)) {
            changes.push(Change::new("delete", json!({ "key": key })));
        }
    }
    changes
}

fn diff_record(before: &BTreeMap<String, Value>, after: &BTreeMap<String, Value>) -> Vec<Change> {
    let mut changes = Vec::new();
    for (prop, value) in after {
        if before.get(prop) != Some(value) {
            changes.push(Change::new("set", json!({ "key": prop, "value": value })));
        }
    }
    for prop in before.keys() {
        if !after.contains_key(prop) {
            changes.push(Change::new("delete", json!({ "key": prop })));
        }
    }
    changes
}

/// Type-check a list of values against a field.
pub(crate) fn check_values<'a>(
    field: &str,
    schema: &FieldSchema,
    values: impl IntoIterator<Item = &'a Value>,
) -> Result<(), DocError> {
    for value in values {
        if !schema.accepts(value) {
            return Err(DocError::Validation(format!("invalid value for '{field}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{OpKind, TimeOrderedIds, ValueType};

    fn ids() -> Arc<dyn IdGenerator> {
        Arc::new(TimeOrderedIds)
    }

    fn payload(kind: OpKind, patch: Value) -> OpPayload {
        OpPayload {
            iss: "bob".to_string(),
            sub: "doc".to_string(),
            iat: 0,
            stamp: Timestamp::new(10, 0, "bob"),
            kind,
            schema: "s".to_string(),
            field: Some("f".to_string()),
            patch,
        }
    }

    #[test]
    fn seeded_fields_carry_initial_values() {
        let text = FieldSchema::text().with_initial(json!("hey"));
        let mut crdt = FieldCrdt::seeded(&text, &ids());
        assert_eq!(crdt.value(), FieldValue::Text("hey".to_string()));
        let patch = crdt.take_patch().unwrap().unwrap();
        assert_eq!(patch["nodes"].as_array().unwrap().len(), 3);

        let map = FieldSchema::map(ValueType::Number).with_initial(json!([["a", 1], [{"k": 2}, 2]]));
        let crdt = FieldCrdt::seeded(&map, &ids());
        assert_eq!(crdt.value().to_json(), json!([["a", 1], [{"k": 2}, 2]]));

        let reg = FieldSchema::register();
        let mut crdt = FieldCrdt::seeded(&reg, &ids());
        assert_eq!(crdt.value(), FieldValue::Register(Some(Value::Null)));
        assert!(crdt.take_patch().unwrap().is_none());
    }

    #[test]
    fn remote_array_merge_reports_list_methods() {
        let schema = FieldSchema::array(ValueType::Number);
        let mut source = Sequence::<Value>::new();
        source.push_all([json!(1), json!(2)]);
        let nodes = source.take_changes();

        let mut crdt = FieldCrdt::empty(CrdtKind::Array, &ids());
        let changes = crdt
            .merge_remote(&schema, &payload(OpKind::ArrayPatch, json!({ "nodes": nodes })))
            .unwrap();
        assert_eq!(changes[0], Change::new("unshift", json!({"value": 1})));
        assert_eq!(changes[1], Change::new("push", json!({"value": 2})));

        source.pop();
        let changes = crdt
            .merge_remote(
                &schema,
                &payload(OpKind::ArrayPatch, json!({ "nodes": source.take_changes() })),
            )
            .unwrap();
        assert_eq!(changes, vec![Change::new("pop", Value::Null)]);
    }

    #[test]
    fn remote_merge_rejects_wrong_types() {
        let schema = FieldSchema::array(ValueType::Number);
        let mut crdt = FieldCrdt::empty(CrdtKind::Array, &ids());
        let bad = json!({"nodes": [{"id": "1", "value": "x", "after": []}]});
        assert!(crdt.merge_remote(&schema, &payload(OpKind::ArrayPatch, bad)).is_err());

        let wrong_kind = payload(OpKind::SetPatch, json!({"nodes": []}));
        assert!(crdt.merge_remote(&schema, &wrong_kind).is_err());
        assert_eq!(crdt.value(), FieldValue::Array(Vec::new()));
    }

    #[test]
    fn remote_text_nodes_hold_one_character() {
        let schema = FieldSchema::text();
        let mut crdt = FieldCrdt::empty(CrdtKind::Text, &ids());
        let wide = json!({"nodes": [{"id": "1", "value": "ab", "after": []}]});
        assert!(crdt.merge_remote(&schema, &payload(OpKind::TextPatch, wide)).is_err());
        let empty = json!({"nodes": [{"id": "1", "value": "", "after": []}]});
        assert!(crdt.merge_remote(&schema, &payload(OpKind::TextPatch, empty)).is_err());
        assert_eq!(crdt.value(), FieldValue::Text(String::new()));

        let single = json!({"nodes": [{"id": "1", "value": "é", "after": []}]});
        assert!(crdt.merge_remote(&schema, &payload(OpKind::TextPatch, single)).is_ok());
        assert_eq!(crdt.value(), FieldValue::Text("é".to_string()));
    }

    #[test]
    fn remote_map_requires_consistent_key_ids() {
        let schema = FieldSchema::map(ValueType::Any);
        let mut crdt = FieldCrdt::empty(CrdtKind::Map, &ids());
        let forged = json!({"nodes": [{"id": "1", "op": "set", "key": "a", "keyId": "\"b\"", "value": 1}]});
        assert!(crdt.merge_remote(&schema, &payload(OpKind::MapPatch, forged)).is_err());

        let good = json!({"nodes": [{"id": "1", "op": "set", "key": "a", "keyId": "\"a\"", "value": 1}]});
        let changes = crdt.merge_remote(&schema, &payload(OpKind::MapPatch, good)).unwrap();
        assert_eq!(changes, vec![Change::new("set", json!({"key": "a", "value": 1}))]);
    }

    #[test]
    fn register_merge_checks_regex() {
        let schema = FieldSchema::register().with_regex("^ok").unwrap();
        let mut crdt = FieldCrdt::empty(CrdtKind::Register, &ids());
        let bad = payload(OpKind::RegisterSet, json!({"value": "nope"}));
        assert!(crdt.merge_remote(&schema, &bad).is_err());
        let missing = payload(OpKind::RegisterSet, json!({}));
        assert!(crdt.merge_remote(&schema, &missing).is_err());

        let good = payload(OpKind::RegisterSet, json!({"value": "okay"}));
        assert_eq!(crdt.merge_remote(&schema, &good).unwrap().len(), 1);
        // Same op again changes nothing
        assert!(crdt.merge_remote(&schema, &good).unwrap().is_empty());
    }
}
