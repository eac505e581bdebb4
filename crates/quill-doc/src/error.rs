//! Document error type.

use quill_core::{Role, SchemaError, SequenceError};
use quill_proto::{MessageError, TokenError};
use thiserror::Error;

/// Errors surfaced by document operations.
///
/// Remote ops that fail validation are never errors; `merge` counts them
/// as rejected instead.
#[derive(Debug, Error)]
pub enum DocError {
    /// Bad argument: unknown field, wrong field kind, value of the wrong
    /// type, failed regex, or index out of range
    #[error("validation failed: {0}")]
    Validation(String),

    /// The local role at the op's stamp does not permit the operation
    #[error("role '{role}' cannot {action}")]
    Unauthorized {
        /// Local role at the time of the call
        role: Role,
        /// What was attempted
        action: String,
    },

    /// A snapshot replay rejected some of its ops
    #[error("snapshot contains {rejected} invalid ops")]
    InvalidSnapshot {
        /// Number of rejected ops
        rejected: usize,
    },

    /// Token signing failed
    #[error("signing failed: {0}")]
    Signing(#[from] TokenError),

    /// No tokio runtime to run signing tasks on
    #[error("no tokio runtime available for signing")]
    NoRuntime,

    /// Encoding or decoding a message failed
    #[error(transparent)]
    Serialization(#[from] MessageError),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<SequenceError> for DocError {
    fn from(err: SequenceError) -> Self {
        DocError::Validation(err.to_string())
    }
}

impl From<SchemaError> for DocError {
    fn from(err: SchemaError) -> Self {
        DocError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for DocError {
    fn from(err: serde_json::Error) -> Self {
        DocError::Serialization(MessageError::Serialize(err.to_string()))
    }
}
