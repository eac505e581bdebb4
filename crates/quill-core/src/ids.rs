//! Identifier generation for nodes, grants, actors and documents.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use uuid::Uuid;

/// Source of unique op ids.
///
/// Ids are compared as strings when ordering siblings and choosing
/// add-wins winners, so implementations should produce ids whose string
/// order roughly follows creation time.
pub trait IdGenerator: std::fmt::Debug + Send + Sync {
    /// Produce a fresh, globally unique id.
    fn next_id(&self) -> String;
}

/// Default generator producing UUIDv7 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeOrderedIds;

impl IdGenerator for TimeOrderedIds {
    fn next_id(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Generate a 256-bit random nonce encoded as base64url without padding.
///
/// Used for actor and document ids.
#[must_use]
pub fn nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
