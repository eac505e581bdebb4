//! # Quill Core
//!
//! Core CRDT model, HLC timestamps, and access-control log for Quill.
//!
//! This crate provides:
//! - Hybrid Logical Clock (HLC) for globally ordered timestamps
//! - A causal node store backing replicated arrays and text
//! - Add-wins collections (set, map, record) and an LWW register
//! - An append-only access-control log queryable at any logical time
//! - Document schemas and the op-kind table tying fields to CRDTs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acl;
pub mod canonical;
pub mod crdt;
pub mod hlc;
pub mod ids;
pub mod merge;
pub mod schema;
pub mod sequence;

pub use acl::{AclAssignment, AclLog, Role};
pub use canonical::canonical_json;
pub use crdt::{CrMap, CrRecord, CrSet, MapNode, RecordNode, Register, RegisterEntry, SetNode};
pub use hlc::{Hlc, Timestamp};
pub use ids::{nonce, IdGenerator, TimeOrderedIds};
pub use merge::{CrdtKind, OpKind};
pub use schema::{FieldSchema, Schema, SchemaError, ValueType};
pub use sequence::{CausalNode, Sequence, SequenceError};
