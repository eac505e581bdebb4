//! # Quill Documents
//!
//! Replicated documents whose every change is a signed, role-checked op.
//!
//! ## Lifecycle
//!
//! 1. [`Document::create`] generates role keys and signs the owner grant
//!    and initial values into a [`DocumentSnapshot`](quill_proto::DocumentSnapshot).
//! 2. Each replica opens it with [`Document::load`], passing the private key
//!    of the role it writes with.
//! 3. Local writes through field handles emit [`DocumentEvent::Change`]
//!    carrying signed tokens; replicas exchange tokens and call
//!    [`Document::merge`].
//!
//! ## Authority
//!
//! An op is accepted only if its issuer held a signing role at the op's
//! stamp and the signature verifies against that role's key. Grants follow
//! the policy in [`Role`](quill_core::Role). A replica whose actor is
//! revoked keeps merging but reads the schema initial values and can no
//! longer take snapshots.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod document;
pub mod error;
pub mod events;
mod fields;
mod handles;

pub use config::DocumentConfig;
pub use document::{CreateResult, Document, MergeOutcome};
pub use error::DocError;
pub use events::{DocumentEvent, MergeEvent, RevokedEvent};
pub use fields::FieldValue;
pub use handles::{
    AclHandle, ArrayHandle, FieldHandle, MapHandle, RecordHandle, RegisterHandle, SetHandle,
    TextHandle,
};
