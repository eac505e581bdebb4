//! Compact op tokens.
//!
//! A token is `b64url(header).b64url(payload).b64url(signature)` where the
//! header and payload are canonical JSON and the signature covers the
//! first two segments joined by `.`.

use crate::messages::{OpPayload, TokenHeader};
use crate::signing::{Jwk, SignError, Signer};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use quill_core::canonical::to_canonical_string;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Token type carried by every op header.
pub const TOKEN_TYP: &str = "QOP";

/// Errors raised while encoding, decoding or verifying tokens.
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    /// Not three dot-separated segments
    #[error("malformed token: expected 3 segments, got {0}")]
    Segments(usize),

    /// A segment is not valid base64url or JSON of the expected shape
    #[error("malformed token {segment}: {reason}")]
    Segment {
        /// Which segment failed
        segment: &'static str,
        /// Decoder message
        reason: String,
    },

    /// Header `alg` or `typ` differs from what the verifier expects
    #[error("unexpected header alg={alg} typ={typ}")]
    Header {
        /// Header algorithm
        alg: String,
        /// Header type
        typ: String,
    },

    /// Signature does not verify
    #[error("signature verification failed")]
    BadSignature,

    /// Header or payload could not be encoded
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Signing backend failed
    #[error(transparent)]
    Sign(#[from] SignError),
}

/// A token split into its decoded parts.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// Decoded header
    pub header: TokenHeader,
    /// Decoded payload
    pub payload: OpPayload,
    /// Raw signature bytes
    pub signature: Vec<u8>,
    /// `header.payload` exactly as transmitted
    pub signing_input: String,
}

fn encode_part<T: serde::Serialize>(value: &T) -> Result<String, TokenError> {
    let json = to_canonical_string(value).map_err(|e| TokenError::Encode(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
}

fn decode_part<T: DeserializeOwned>(segment: &'static str, part: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD.decode(part).map_err(|e| TokenError::Segment {
        segment,
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Segment {
        segment,
        reason: e.to_string(),
    })
}

/// Sign `payload` under `header`, producing a compact token.
///
/// # Errors
///
/// Returns error if encoding or the signing backend fails.
pub async fn sign_token(
    signer: &dyn Signer,
    key: &Jwk,
    header: &TokenHeader,
    payload: &OpPayload,
) -> Result<String, TokenError> {
    let signing_input = format!("{}.{}", encode_part(header)?, encode_part(payload)?);
    let signature = signer.sign(key, signing_input.as_bytes()).await?;
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Split and decode a token without checking its signature.
///
/// # Errors
///
/// Returns error if the token is not three well-formed segments.
pub fn decode_token(token: &str) -> Result<DecodedToken, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
        return Err(TokenError::Segments(parts.len()));
    };

    let header = decode_part("header", header_b64)?;
    let payload = decode_part("payload", payload_b64)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| TokenError::Segment {
            segment: "signature",
            reason: e.to_string(),
        })?;

    Ok(DecodedToken {
        header,
        payload,
        signature,
        signing_input: format!("{header_b64}.{payload_b64}"),
    })
}

/// Decode a token and verify its header and signature against `key`.
///
/// # Errors
///
/// Returns error if decoding fails, the header does not carry the
/// signer's algorithm and [`TOKEN_TYP`], or the signature is invalid.
pub async fn verify_token(signer: &dyn Signer, key: &Jwk, token: &str) -> Result<DecodedToken, TokenError> {
    let decoded = decode_token(token)?;
    if decoded.header.alg != signer.algorithm() || decoded.header.typ != TOKEN_TYP {
        return Err(TokenError::Header {
            alg: decoded.header.alg,
            typ: decoded.header.typ,
        });
    }
    if !signer
        .verify(key, decoded.signing_input.as_bytes(), &decoded.signature)
        .await
    {
        tracing::debug!(kid = ?decoded.header.kid, iss = %decoded.payload.iss, "Signature check failed");
        return Err(TokenError::BadSignature);
    }
    Ok(decoded)
}
