//! Document schemas.
//!
//! A schema names each field of a document, the CRDT backing it, the type
//! of values it holds, and an optional initial value. Its id is a hash of
//! the structural parts only, so replicas agree on it without sharing
//! initial values.

use crate::canonical::canonical_json;
use crate::merge::CrdtKind;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Field names clashing with document operations.
pub const RESERVED_FIELDS: &[&str] = &[
    "ack", "acks", "acl", "field", "flush", "merge", "snapshot", "subscribe", "value", "values",
];

/// Errors raised while building or validating a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Field name is reserved
    #[error("schema field '{0}' is reserved")]
    Reserved(String),

    /// Initial value does not fit the field
    #[error("invalid initial value for '{0}'")]
    InvalidInitial(String),

    /// Register constraint failed to compile
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        /// Offending pattern
        pattern: String,
        /// Compiler message
        reason: String,
    },
}

/// Value types a field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Any JSON value
    #[default]
    Any,
    /// Any JSON value (explicitly JSON-compatible)
    Json,
    /// JSON strings
    String,
    /// JSON numbers
    Number,
    /// JSON booleans
    Boolean,
}

impl ValueType {
    /// Wire name of the type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Any => "any",
            ValueType::Json => "json",
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
        }
    }

    /// Whether `value` is of this type.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Any | ValueType::Json => true,
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
        }
    }
}

/// Definition of one document field.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    /// Backing CRDT
    pub crdt: CrdtKind,
    /// Accepted value type
    pub value_type: ValueType,
    /// Register-only string constraint
    regex: Option<Regex>,
    /// Initial value written by the document creator
    pub initial: Option<Value>,
}

impl FieldSchema {
    fn new(crdt: CrdtKind, value_type: ValueType) -> Self {
        Self {
            crdt,
            value_type,
            regex: None,
            initial: None,
        }
    }

    /// A last-writer-wins register accepting any value.
    #[must_use]
    pub fn register() -> Self {
        Self::new(CrdtKind::Register, ValueType::Any)
    }

    /// Replicated text.
    #[must_use]
    pub fn text() -> Self {
        Self::new(CrdtKind::Text, ValueType::String)
    }

    /// Replicated array of `value_type` values.
    #[must_use]
    pub fn array(value_type: ValueType) -> Self {
        Self::new(CrdtKind::Array, value_type)
    }

    /// Add-wins set of `value_type` values.
    #[must_use]
    pub fn set(value_type: ValueType) -> Self {
        Self::new(CrdtKind::Set, value_type)
    }

    /// Add-wins map with JSON keys and `value_type` values.
    #[must_use]
    pub fn map(value_type: ValueType) -> Self {
        Self::new(CrdtKind::Map, value_type)
    }

    /// Add-wins record of `value_type` properties.
    #[must_use]
    pub fn record(value_type: ValueType) -> Self {
        Self::new(CrdtKind::Record, value_type)
    }

    /// Set the accepted value type.
    #[must_use]
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Constrain string values with a regular expression.
    ///
    /// Only registers enforce the constraint.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidRegex`] if the pattern does not compile.
    pub fn with_regex(mut self, pattern: &str) -> Result<Self, SchemaError> {
        let regex = Regex::new(pattern).map_err(|e| SchemaError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.regex = Some(regex);
        Ok(self)
    }

    /// Set the initial value.
    ///
    /// Registers take a value, text a string, arrays and sets a list,
    /// maps a list of `[key, value]` pairs and records an object.
    #[must_use]
    pub fn with_initial(mut self, initial: Value) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Regex source, if constrained.
    #[must_use]
    pub fn regex(&self) -> Option<&str> {
        self.regex.as_ref().map(Regex::as_str)
    }

    /// Whether `value` may be stored in this field.
    ///
    /// Register regexes apply to string values only.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        if !self.value_type.accepts(value) {
            return false;
        }
        match (&self.regex, self.crdt, value) {
            (Some(regex), CrdtKind::Register, Value::String(s)) => regex.is_match(s),
            _ => true,
        }
    }

    /// Whether the initial value (if any) fits this field.
    #[must_use]
    pub fn initial_is_valid(&self) -> bool {
        let Some(initial) = &self.initial else {
            return true;
        };
        match self.crdt {
            CrdtKind::Register => self.accepts(initial),
            CrdtKind::Text => initial.is_string(),
            CrdtKind::Array | CrdtKind::Set => initial
                .as_array()
                .is_some_and(|items| items.iter().all(|v| self.accepts(v))),
            CrdtKind::Map => initial.as_array().is_some_and(|entries| {
                entries.iter().all(|entry| match entry.as_array().map(Vec::as_slice) {
                    Some([_, value]) => self.accepts(value),
                    _ => false,
                })
            }),
            CrdtKind::Record => initial
                .as_object()
                .is_some_and(|props| props.values().all(|v| self.accepts(v))),
        }
    }

    fn id_input(&self) -> Value {
        let mut input = Map::new();
        input.insert("crdt".to_string(), Value::from(self.crdt.as_str()));
        input.insert("jsType".to_string(), Value::from(self.value_type.as_str()));
        // The pattern exactly as written; regexes only constrain registers
        if let (CrdtKind::Register, Some(regex)) = (self.crdt, &self.regex) {
            input.insert("regex".to_string(), Value::from(regex.as_str()));
        }
        Value::Object(input)
    }
}

/// A document schema: named fields in name order.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, FieldSchema>,
}

impl Schema {
    /// Create an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Look up a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldSchema)> {
        self.fields.iter()
    }

    /// Check field names and initial values.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Reserved`] or [`SchemaError::InvalidInitial`].
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, field) in &self.fields {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(SchemaError::Reserved(name.clone()));
            }
            if !field.initial_is_valid() {
                return Err(SchemaError::InvalidInitial(name.clone()));
            }
        }
        Ok(())
    }

    /// Content id: base64url SHA-256 of the canonical structural description.
    #[must_use]
    pub fn id(&self) -> String {
        let input: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, field)| (name.clone(), field.id_input()))
            .collect();
        let digest = Sha256::digest(canonical_json(&Value::Object(input)).as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}
