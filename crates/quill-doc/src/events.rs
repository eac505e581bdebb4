//! Document events.

use quill_core::{Role, Timestamp};
use quill_proto::SignedOp;
use serde_json::Value;
use tokio::sync::broadcast;

/// Events published by a document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    /// A local op finished signing
    Change {
        /// The signed ops, ready to ship to other replicas
        ops: Vec<SignedOp>,
    },

    /// A remote op changed visible state
    Merge(MergeEvent),

    /// The local actor lost access
    Revoked(RevokedEvent),

    /// Signing a local op failed
    Error {
        /// Failure description
        message: String,
    },
}

/// A visible change caused by a merged op.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeEvent {
    /// Issuer of the op
    pub actor: String,
    /// Field that changed
    pub target: String,
    /// Method the change corresponds to, e.g. `push` or `set`
    pub method: &'static str,
    /// Method arguments (`{ value }`, `{ index }`, `{ key, value }`, ...)
    pub data: Value,
}

/// Details of a revocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RevokedEvent {
    /// The local actor
    pub actor_id: String,
    /// Role held before the revocation
    pub previous: Role,
    /// Issuer of the revoking grant
    pub by: String,
    /// Stamp of the revoking grant
    pub stamp: Timestamp,
}

/// Fan-out of document events.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<DocumentEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is fine.
    pub(crate) fn emit(&self, event: DocumentEvent) {
        let _ = self.tx.send(event);
    }
}
