//! # Quill Protocol
//!
//! Wire format for signed document operations.
//!
//! ## Tokens
//!
//! Every operation travels as a compact token
//! `b64url(header).b64url(payload).b64url(signature)`:
//!
//! - header: `{ alg, typ: "QOP", kid: "<issuer>:<role>" }`
//! - payload: `{ iss, sub, iat, stamp, kind, schema, field?, patch }`
//!
//! ## Snapshots
//!
//! A [`DocumentSnapshot`] carries the document id, the role verification
//! keys, and the accepted op log. It is exchanged as JSON or CBOR.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod signing;
pub mod token;

pub use messages::{
    AckPatch, AclPatch, DocumentSnapshot, MessageError, NodesPatch, OpPayload, RegisterPatch,
    SignedOp, TokenHeader,
};
pub use signing::{Ed25519Signer, Jwk, RoleKeyPair, RoleKeys, RolePublicKeys, SignError, Signer};
pub use token::{decode_token, sign_token, verify_token, DecodedToken, TokenError, TOKEN_TYP};
