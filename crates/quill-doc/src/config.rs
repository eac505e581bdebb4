//! Document configuration.

use crate::error::DocError;
use quill_core::{IdGenerator, TimeOrderedIds};
use quill_proto::{Ed25519Signer, Signer};
use std::sync::Arc;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Document configuration.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Capacity of the event channel; slow subscribers lose older events
    pub event_capacity: usize,

    /// Signature backend
    pub signer: Arc<dyn Signer>,

    /// Source of node and grant ids
    pub ids: Arc<dyn IdGenerator>,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            signer: Arc::new(Ed25519Signer),
            ids: Arc::new(TimeOrderedIds),
        }
    }
}

impl DocumentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUILL_EVENT_CAPACITY`: event channel capacity (positive integer)
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, DocError> {
        let mut config = Self::default();

        if let Ok(capacity) = std::env::var("QUILL_EVENT_CAPACITY") {
            config.event_capacity = parse_capacity(&capacity)?;
        }

        Ok(config)
    }

    /// Use a different signature backend.
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    /// Use a different id generator.
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }
}

fn parse_capacity(raw: &str) -> Result<usize, DocError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DocError::Config(format!(
            "QUILL_EVENT_CAPACITY must be a positive integer, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DocumentConfig::default();
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.signer.algorithm(), "EdDSA");
    }

    #[test]
    fn capacity_parsing() {
        assert_eq!(parse_capacity("64").unwrap(), 64);
        assert_eq!(parse_capacity(" 8 ").unwrap(), 8);
        assert!(matches!(parse_capacity("0"), Err(DocError::Config(_))));
        assert!(parse_capacity("lots").is_err());
    }
}
