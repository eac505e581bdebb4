//! Typed field handles.
//!
//! Handles borrow the document mutably. Reads reflect merged state (or the
//! schema initial while revoked); writes go through the shadow-commit
//! pipeline and only become visible once their tokens are merged back.

use crate::document::Document;
use crate::error::DocError;
use crate::fields::FieldCrdt;
use quill_core::{AclAssignment, CrMap, CrRecord, CrSet, CrdtKind, Role, Sequence};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::RangeBounds;

fn kind_mismatch(name: &str) -> DocError {
    DocError::Validation(format!("field '{name}' has an unexpected kind"))
}

/// A handle to any field, by kind.
#[derive(Debug)]
pub enum FieldHandle<'a> {
    /// Register field
    Register(RegisterHandle<'a>),
    /// Text field
    Text(TextHandle<'a>),
    /// Array field
    Array(ArrayHandle<'a>),
    /// Set field
    Set(SetHandle<'a>),
    /// Map field
    Map(MapHandle<'a>),
    /// Record field
    Record(RecordHandle<'a>),
}

impl FieldHandle<'_> {
    /// Kind of the underlying field.
    #[must_use]
    pub fn kind(&self) -> CrdtKind {
        match self {
            FieldHandle::Register(_) => CrdtKind::Register,
            FieldHandle::Text(_) => CrdtKind::Text,
            FieldHandle::Array(_) => CrdtKind::Array,
            FieldHandle::Set(_) => CrdtKind::Set,
            FieldHandle::Map(_) => CrdtKind::Map,
            FieldHandle::Record(_) => CrdtKind::Record,
        }
    }
}

/// Last-writer-wins register.
#[derive(Debug)]
pub struct RegisterHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl<'a> RegisterHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document, name: String) -> Self {
        Self { doc, name }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.doc
            .read(&self.name)
            .and_then(FieldCrdt::as_register)
            .and_then(|reg| reg.get().cloned())
    }

    /// Write `value`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the value has the wrong type or fails
    /// the field regex, [`DocError::Unauthorized`] if the local role cannot
    /// write.
    pub fn set(&mut self, value: Value) -> Result<(), DocError> {
        self.doc.commit_register(&self.name, value)
    }
}

/// Replicated text.
#[derive(Debug)]
pub struct TextHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl<'a> TextHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document, name: String) -> Self {
        Self { doc, name }
    }

    fn seq(&self) -> Option<&Sequence<String>> {
        self.doc.read(&self.name).and_then(FieldCrdt::as_text)
    }

    fn commit<R>(
        &mut self,
        mutate: impl FnOnce(&mut Sequence<String>) -> Result<R, DocError>,
    ) -> Result<R, DocError> {
        let name = self.name.clone();
        self.doc.commit_field(&self.name, CrdtKind::Text, &[], |crdt| {
            mutate(crdt.as_text_mut().ok_or_else(|| kind_mismatch(&name))?)
        })
    }

    /// Number of characters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seq().map_or(0, Sequence::len)
    }

    /// Whether the text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full text.
    #[must_use]
    pub fn text(&self) -> String {
        self.seq().map(Sequence::text).unwrap_or_default()
    }

    /// Character at `index`.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<String> {
        self.seq().and_then(|seq| seq.get(index).cloned())
    }

    /// Insert `text` so that it starts at `index`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `index` is past the end.
    pub fn insert_at(&mut self, index: usize, text: &str) -> Result<(), DocError> {
        self.commit(|seq| {
            for (offset, ch) in text.chars().enumerate() {
                seq.insert_at(index + offset, ch.to_string())?;
            }
            Ok(())
        })
    }

    /// Append `text`.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn push_str(&mut self, text: &str) -> Result<(), DocError> {
        self.commit(|seq| {
            seq.push_all(text.chars().map(String::from));
            Ok(())
        })
    }

    /// Delete `count` characters starting at `index`, returning them.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the range is past the end.
    pub fn delete_at(&mut self, index: usize, count: usize) -> Result<String, DocError> {
        self.commit(|seq| {
            let mut removed = String::new();
            for _ in 0..count {
                removed.push_str(&seq.delete_at(index)?);
            }
            Ok(removed)
        })
    }
}

/// Replicated array.
#[derive(Debug)]
pub struct ArrayHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl<'a> ArrayHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document, name: String) -> Self {
        Self { doc, name }
    }

    fn seq(&self) -> Option<&Sequence<Value>> {
        self.doc.read(&self.name).and_then(FieldCrdt::as_array)
    }

    fn commit<R>(
        &mut self,
        values: &[&Value],
        mutate: impl FnOnce(&mut Sequence<Value>) -> Result<R, DocError>,
    ) -> Result<R, DocError> {
        let name = self.name.clone();
        self.doc.commit_field(&self.name, CrdtKind::Array, values, |crdt| {
            mutate(crdt.as_array_mut().ok_or_else(|| kind_mismatch(&name))?)
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seq().map_or(0, Sequence::len)
    }

    /// Whether the array is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<Value> {
        self.seq().and_then(|seq| seq.get(index).cloned())
    }

    /// All elements.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.seq().map(Sequence::linearize).unwrap_or_default()
    }

    /// Elements in `range`, clamped to the array.
    #[must_use]
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Vec<Value> {
        self.seq().map(|seq| seq.slice(range)).unwrap_or_default()
    }

    /// Whether `value` is an element.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        self.seq().is_some_and(|seq| seq.contains(value))
    }

    /// Index of the first element equal to `value`.
    #[must_use]
    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.seq().and_then(|seq| seq.index_of(value))
    }

    /// Append `value`, returning the new length.
    ///
    /// # Errors
    ///
    /// Returns a validation error for values of the wrong type,
    /// [`DocError::Unauthorized`] if the local role cannot write.
    pub fn push(&mut self, value: Value) -> Result<usize, DocError> {
        self.commit(&[&value.clone()], |seq| Ok(seq.push(value)))
    }

    /// Prepend `value`, returning the new length.
    ///
    /// # Errors
    ///
    /// Returns a validation error for values of the wrong type,
    /// [`DocError::Unauthorized`] if the local role cannot write.
    pub fn unshift(&mut self, value: Value) -> Result<usize, DocError> {
        self.commit(&[&value.clone()], |seq| Ok(seq.unshift(value)))
    }

    /// Remove and return the last element.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn pop(&mut self) -> Result<Option<Value>, DocError> {
        self.commit(&[], |seq| Ok(seq.pop()))
    }

    /// Remove and return the first element.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn shift(&mut self) -> Result<Option<Value>, DocError> {
        self.commit(&[], |seq| Ok(seq.shift()))
    }

    /// Insert `value` at `index`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad index or value.
    pub fn insert_at(&mut self, index: usize, value: Value) -> Result<(), DocError> {
        self.commit(&[&value.clone()], |seq| Ok(seq.insert_at(index, value)?))
    }

    /// Replace the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad index or value.
    pub fn set_at(&mut self, index: usize, value: Value) -> Result<(), DocError> {
        self.commit(&[&value.clone()], |seq| Ok(seq.set_at(index, value)?))
    }

    /// Remove and return the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad index.
    pub fn delete_at(&mut self, index: usize) -> Result<Value, DocError> {
        self.commit(&[], |seq| Ok(seq.delete_at(index)?))
    }
}

/// Add-wins set.
#[derive(Debug)]
pub struct SetHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl<'a> SetHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document, name: String) -> Self {
        Self { doc, name }
    }

    fn crdt(&self) -> Option<&CrSet> {
        self.doc.read(&self.name).and_then(FieldCrdt::as_set)
    }

    fn commit<R>(
        &mut self,
        values: &[&Value],
        mutate: impl FnOnce(&mut CrSet) -> R,
    ) -> Result<R, DocError> {
        let name = self.name.clone();
        self.doc.commit_field(&self.name, CrdtKind::Set, values, |crdt| {
            Ok(mutate(crdt.as_set_mut().ok_or_else(|| kind_mismatch(&name))?))
        })
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.crdt().map_or(0, CrSet::len)
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `value` is a member.
    #[must_use]
    pub fn has(&self, value: &Value) -> bool {
        self.crdt().is_some_and(|set| set.has(value))
    }

    /// All members.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.crdt().map(CrSet::values).unwrap_or_default()
    }

    /// Add `value`. Returns `false` if it was already present.
    ///
    /// # Errors
    ///
    /// Returns a validation error for values of the wrong type,
    /// [`DocError::Unauthorized`] if the local role cannot write.
    pub fn add(&mut self, value: Value) -> Result<bool, DocError> {
        self.commit(&[&value.clone()], |set| set.add(value))
    }

    /// Remove `value`. Returns `false` if it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn delete(&mut self, value: &Value) -> Result<bool, DocError> {
        self.commit(&[], |set| set.delete(value))
    }

    /// Remove every member.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn clear(&mut self) -> Result<(), DocError> {
        self.commit(&[], CrSet::clear)
    }
}

/// Add-wins map with JSON keys.
#[derive(Debug)]
pub struct MapHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl<'a> MapHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document, name: String) -> Self {
        Self { doc, name }
    }

    fn crdt(&self) -> Option<&CrMap> {
        self.doc.read(&self.name).and_then(FieldCrdt::as_map)
    }

    fn commit<R>(
        &mut self,
        values: &[&Value],
        mutate: impl FnOnce(&mut CrMap) -> R,
    ) -> Result<R, DocError> {
        let name = self.name.clone();
        self.doc.commit_field(&self.name, CrdtKind::Map, values, |crdt| {
            Ok(mutate(crdt.as_map_mut().ok_or_else(|| kind_mismatch(&name))?))
        })
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.crdt().map_or(0, CrMap::len)
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value bound to `key`.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.crdt().and_then(|map| map.get(key).cloned())
    }

    /// Whether `key` is bound.
    #[must_use]
    pub fn has(&self, key: &Value) -> bool {
        self.crdt().is_some_and(|map| map.has(key))
    }

    /// All `(key, value)` pairs.
    #[must_use]
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.crdt().map(CrMap::entries).unwrap_or_default()
    }

    /// Bind `key` to `value`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for values of the wrong type,
    /// [`DocError::Unauthorized`] if the local role cannot write.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), DocError> {
        self.commit(&[&value.clone()], |map| map.set(key, value))
    }

    /// Remove `key`. Returns `false` if it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn delete(&mut self, key: &Value) -> Result<bool, DocError> {
        self.commit(&[], |map| map.delete(key))
    }

    /// Remove every key.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn clear(&mut self) -> Result<(), DocError> {
        self.commit(&[], CrMap::clear)
    }
}

/// Add-wins record of named properties.
#[derive(Debug)]
pub struct RecordHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl<'a> RecordHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document, name: String) -> Self {
        Self { doc, name }
    }

    fn crdt(&self) -> Option<&CrRecord> {
        self.doc.read(&self.name).and_then(FieldCrdt::as_record)
    }

    fn commit<R>(
        &mut self,
        values: &[&Value],
        mutate: impl FnOnce(&mut CrRecord) -> R,
    ) -> Result<R, DocError> {
        let name = self.name.clone();
        self.doc.commit_field(&self.name, CrdtKind::Record, values, |crdt| {
            Ok(mutate(crdt.as_record_mut().ok_or_else(|| kind_mismatch(&name))?))
        })
    }

    /// Number of properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.crdt().map_or(0, CrRecord::len)
    }

    /// Whether no property is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of `prop`.
    #[must_use]
    pub fn get(&self, prop: &str) -> Option<Value> {
        self.crdt().and_then(|record| record.get(prop).cloned())
    }

    /// Whether `prop` is set.
    #[must_use]
    pub fn has(&self, prop: &str) -> bool {
        self.crdt().is_some_and(|record| record.has(prop))
    }

    /// All properties by name.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.crdt().map(CrRecord::entries).unwrap_or_default()
    }

    /// Set `prop` to `value`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for values of the wrong type,
    /// [`DocError::Unauthorized`] if the local role cannot write.
    pub fn set(&mut self, prop: &str, value: Value) -> Result<(), DocError> {
        self.commit(&[&value.clone()], |record| record.set(prop, value))
    }

    /// Remove `prop`. Returns `false` if it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn delete(&mut self, prop: &str) -> Result<bool, DocError> {
        self.commit(&[], |record| record.delete(prop))
    }

    /// Remove every property.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot write.
    pub fn clear(&mut self) -> Result<(), DocError> {
        self.commit(&[], CrRecord::clear)
    }
}

/// The access-control log.
#[derive(Debug)]
pub struct AclHandle<'a> {
    doc: &'a mut Document,
}

impl<'a> AclHandle<'a> {
    pub(crate) fn new(doc: &'a mut Document) -> Self {
        Self { doc }
    }

    /// Grant `role` to `actor_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role at the grant's
    /// stamp may not grant `role`.
    pub fn set_role(&mut self, actor_id: &str, role: Role) -> Result<(), DocError> {
        self.doc.commit_grant(actor_id, role)
    }

    /// Current role of `actor_id`.
    #[must_use]
    pub fn get_role(&self, actor_id: &str) -> Role {
        self.doc.acl_log().current_role(actor_id)
    }

    /// Actors that ever received a grant.
    #[must_use]
    pub fn known_actors(&self) -> Vec<String> {
        self.doc.acl_log().known_actors()
    }

    /// Every grant sorted by (stamp, id).
    #[must_use]
    pub fn snapshot(&self) -> Vec<AclAssignment> {
        self.doc.acl_log().snapshot()
    }
}
