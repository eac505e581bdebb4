//! Protocol messages: token header and payload, patches, and snapshots.

use crate::signing::RolePublicKeys;
use quill_core::{OpKind, Role, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Signature algorithm
    pub alg: String,
    /// Token type, always [`crate::token::TOKEN_TYP`] for ops
    pub typ: String,
    /// `<issuer>:<role>` of the signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Token payload describing one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpPayload {
    /// Issuing actor
    pub iss: String,
    /// Document id
    pub sub: String,
    /// Issue time, seconds since UNIX epoch
    pub iat: i64,
    /// HLC stamp fixing the op's logical time
    pub stamp: Timestamp,
    /// Operation kind
    pub kind: OpKind,
    /// Schema id the op was produced against
    pub schema: String,
    /// Target field, for field ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Kind-specific patch
    pub patch: Value,
}

impl OpPayload {
    /// Decode the patch as a typed structure.
    ///
    /// # Errors
    ///
    /// Returns error if the patch does not have the expected shape.
    pub fn patch_as<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(self.patch.clone()).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Patch of an `acl.set` op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPatch {
    /// Grant id
    pub id: String,
    /// Actor receiving the role
    pub target: String,
    /// Granted role
    pub role: Role,
}

/// Patch of a `register.set` op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPatch {
    /// New register value
    pub value: Value,
}

/// Patch of a `*.patch` op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesPatch<N> {
    /// CRDT nodes produced by the mutation
    pub nodes: Vec<N>,
}

/// Patch of an `ack` op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPatch {
    /// Clock of the issuer when acknowledging
    pub seen: Timestamp,
}

/// A signed operation as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedOp {
    /// Compact token `header.payload.signature`
    pub token: String,
}

impl From<String> for SignedOp {
    fn from(token: String) -> Self {
        Self { token }
    }
}

/// Replayable document state: verification keys and the op log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Document id
    pub doc_id: String,
    /// Role verification keys
    pub role_keys: RolePublicKeys,
    /// Accepted ops in acceptance order
    pub ops: Vec<SignedOp>,
}

impl DocumentSnapshot {
    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
