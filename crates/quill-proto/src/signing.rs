//! Signing seam and role key material.
//!
//! Documents sign and verify through the [`Signer`] trait, keyed by JSON
//! web keys. [`Ed25519Signer`] is the shipped backend.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use quill_core::Role;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by signing backends.
#[derive(Debug, Clone, Error)]
pub enum SignError {
    /// Key material is malformed or of the wrong type
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A private key was required but the JWK only holds the public part
    #[error("key has no private component")]
    MissingPrivateKey,

    /// No key is available for the requested role
    #[error("no signing key for role '{0}'")]
    NoKeyForRole(Role),
}

/// An OKP JSON web key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type
    pub kty: String,
    /// Curve name
    pub crv: String,
    /// Public key, base64url
    pub x: String,
    /// Private key, base64url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    /// Copy of this key without the private component.
    #[must_use]
    pub fn public(&self) -> Self {
        Self {
            d: None,
            ..self.clone()
        }
    }

    /// Whether the key carries a private component.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }
}

/// A private/public key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleKeyPair {
    /// Signing key
    pub private_key: Jwk,
    /// Verification key
    pub public_key: Jwk,
}

/// Key pairs for every signing role of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    /// Owner keys
    pub owner: RoleKeyPair,
    /// Manager keys
    pub manager: RoleKeyPair,
    /// Editor keys
    pub editor: RoleKeyPair,
}

impl RoleKeys {
    /// Generate fresh key pairs for owner, manager and editor.
    ///
    /// # Errors
    ///
    /// Propagates backend key generation failures.
    pub fn generate(signer: &dyn Signer) -> Result<Self, SignError> {
        Ok(Self {
            owner: signer.generate_key_pair()?,
            manager: signer.generate_key_pair()?,
            editor: signer.generate_key_pair()?,
        })
    }

    /// Public halves, as distributed in snapshots.
    #[must_use]
    pub fn public(&self) -> RolePublicKeys {
        RolePublicKeys {
            owner: self.owner.public_key.clone(),
            manager: self.manager.public_key.clone(),
            editor: self.editor.public_key.clone(),
        }
    }

    /// Signing key for `role`, if the role signs.
    #[must_use]
    pub fn private_for(&self, role: Role) -> Option<&Jwk> {
        match role {
            Role::Owner => Some(&self.owner.private_key),
            Role::Manager => Some(&self.manager.private_key),
            Role::Editor => Some(&self.editor.private_key),
            Role::Viewer | Role::Revoked => None,
        }
    }
}

/// Verification keys for every signing role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePublicKeys {
    /// Owner verification key
    pub owner: Jwk,
    /// Manager verification key
    pub manager: Jwk,
    /// Editor verification key
    pub editor: Jwk,
}

impl RolePublicKeys {
    /// Verification key for `role`, if the role signs.
    #[must_use]
    pub fn for_role(&self, role: Role) -> Option<&Jwk> {
        match role {
            Role::Owner => Some(&self.owner),
            Role::Manager => Some(&self.manager),
            Role::Editor => Some(&self.editor),
            Role::Viewer | Role::Revoked => None,
        }
    }
}

/// A signature algorithm backend.
#[async_trait]
pub trait Signer: std::fmt::Debug + Send + Sync {
    /// Value placed in the token header `alg` field.
    fn algorithm(&self) -> &'static str;

    /// Sign `input` with the private component of `key`.
    async fn sign(&self, key: &Jwk, input: &[u8]) -> Result<Vec<u8>, SignError>;

    /// Check `signature` over `input` with the public component of `key`.
    async fn verify(&self, key: &Jwk, input: &[u8], signature: &[u8]) -> bool;

    /// Generate a fresh key pair.
    fn generate_key_pair(&self) -> Result<RoleKeyPair, SignError>;
}

/// Ed25519 signatures over OKP keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Signer;

const KTY: &str = "OKP";
const CRV: &str = "Ed25519";

impl Ed25519Signer {
    fn check_type(key: &Jwk) -> Result<(), SignError> {
        if key.kty == KTY && key.crv == CRV {
            Ok(())
        } else {
            Err(SignError::InvalidKey(format!("expected {KTY}/{CRV}, got {}/{}", key.kty, key.crv)))
        }
    }

    fn decode_32(field: &str) -> Result<[u8; 32], SignError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(field)
            .map_err(|e| SignError::InvalidKey(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| SignError::InvalidKey("expected 32 bytes".to_string()))
    }

    fn signing_key(key: &Jwk) -> Result<DalekSigningKey, SignError> {
        Self::check_type(key)?;
        let d = key.d.as_deref().ok_or(SignError::MissingPrivateKey)?;
        Ok(DalekSigningKey::from_bytes(&Self::decode_32(d)?))
    }

    fn verifying_key(key: &Jwk) -> Result<DalekVerifyingKey, SignError> {
        Self::check_type(key)?;
        DalekVerifyingKey::from_bytes(&Self::decode_32(&key.x)?)
            .map_err(|e| SignError::InvalidKey(e.to_string()))
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    fn algorithm(&self) -> &'static str {
        "EdDSA"
    }

    async fn sign(&self, key: &Jwk, input: &[u8]) -> Result<Vec<u8>, SignError> {
        let signing = Self::signing_key(key)?;
        Ok(signing.sign(input).to_bytes().to_vec())
    }

    async fn verify(&self, key: &Jwk, input: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying) = Self::verifying_key(key) else {
            return false;
        };
        let Ok(signature) = DalekSignature::from_slice(signature) else {
            return false;
        };
        verifying.verify(input, &signature).is_ok()
    }

    fn generate_key_pair(&self) -> Result<RoleKeyPair, SignError> {
        let signing = DalekSigningKey::generate(&mut OsRng);
        let public_key = Jwk {
            kty: KTY.to_string(),
            crv: CRV.to_string(),
            x: URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes()),
            d: None,
        };
        let private_key = Jwk {
            d: Some(URL_SAFE_NO_PAD.encode(signing.to_bytes())),
            ..public_key.clone()
        };
        Ok(RoleKeyPair {
            private_key,
            public_key,
        })
    }
}
