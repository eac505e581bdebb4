//! Per-field merge semantics and op kinds.
//!
//! # Merge Rules
//!
//! | Field CRDT | Merge rule | Op kind |
//! |------------|----------|---------|
//! | register | LWW on op stamp (HLC + clock tiebreaker) | `register.set` |
//! | text | Causal sequence of characters | `text.patch` |
//! | array | Causal sequence of values | `array.patch` |
//! | set | Add-wins observed-remove | `set.patch` |
//! | map | Add-wins observed-remove by key | `map.patch` |
//! | record | Add-wins observed-remove by property | `record.patch` |

use serde::{Deserialize, Serialize};
use std::fmt;

/// The CRDT backing a document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrdtKind {
    /// Last-writer-wins register
    Register,
    /// Replicated text
    Text,
    /// Replicated array
    Array,
    /// Add-wins set
    Set,
    /// Add-wins map
    Map,
    /// Add-wins record
    Record,
}

impl CrdtKind {
    /// The op kind carrying mutations of this field kind.
    #[must_use]
    pub fn op_kind(&self) -> OpKind {
        match self {
            CrdtKind::Register => OpKind::RegisterSet,
            CrdtKind::Text => OpKind::TextPatch,
            CrdtKind::Array => OpKind::ArrayPatch,
            CrdtKind::Set => OpKind::SetPatch,
            CrdtKind::Map => OpKind::MapPatch,
            CrdtKind::Record => OpKind::RecordPatch,
        }
    }

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CrdtKind::Register => "register",
            CrdtKind::Text => "text",
            CrdtKind::Array => "array",
            CrdtKind::Set => "set",
            CrdtKind::Map => "map",
            CrdtKind::Record => "record",
        }
    }
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a signed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Role assignment
    #[serde(rename = "acl.set")]
    AclSet,
    /// Register write
    #[serde(rename = "register.set")]
    RegisterSet,
    /// Text node patch
    #[serde(rename = "text.patch")]
    TextPatch,
    /// Array node patch
    #[serde(rename = "array.patch")]
    ArrayPatch,
    /// Set node patch
    #[serde(rename = "set.patch")]
    SetPatch,
    /// Map node patch
    #[serde(rename = "map.patch")]
    MapPatch,
    /// Record node patch
    #[serde(rename = "record.patch")]
    RecordPatch,
    /// Clock acknowledgement
    #[serde(rename = "ack")]
    Ack,
}

impl OpKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::AclSet => "acl.set",
            OpKind::RegisterSet => "register.set",
            OpKind::TextPatch => "text.patch",
            OpKind::ArrayPatch => "array.patch",
            OpKind::SetPatch => "set.patch",
            OpKind::MapPatch => "map.patch",
            OpKind::RecordPatch => "record.patch",
            OpKind::Ack => "ack",
        }
    }

    /// The field kind this op mutates, if it targets a field.
    #[must_use]
    pub fn field_kind(&self) -> Option<CrdtKind> {
        match self {
            OpKind::RegisterSet => Some(CrdtKind::Register),
            OpKind::TextPatch => Some(CrdtKind::Text),
            OpKind::ArrayPatch => Some(CrdtKind::Array),
            OpKind::SetPatch => Some(CrdtKind::Set),
            OpKind::MapPatch => Some(CrdtKind::Map),
            OpKind::RecordPatch => Some(CrdtKind::Record),
            OpKind::AclSet | OpKind::Ack => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_kinds_round_trip_through_field_kinds() {
        for kind in [
            CrdtKind::Register,
            CrdtKind::Text,
            CrdtKind::Array,
            CrdtKind::Set,
            CrdtKind::Map,
            CrdtKind::Record,
        ] {
            assert_eq!(kind.op_kind().field_kind(), Some(kind));
        }
        assert_eq!(OpKind::AclSet.field_kind(), None);
    }

    #[test]
    fn wire_names_match_serde() {
        for kind in [OpKind::AclSet, OpKind::TextPatch, OpKind::Ack] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
        let parsed: OpKind = serde_json::from_str("\"record.patch\"").unwrap();
        assert_eq!(parsed, OpKind::RecordPatch);
        assert!(serde_json::from_str::<OpKind>("\"bogus\"").is_err());
    }
}
