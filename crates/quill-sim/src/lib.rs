//! # Quill Simulator
//!
//! Runs an owner and several editors against one document, each on its own
//! task, with tokens relayed between them after random delays.
//!
//! ## Phases
//!
//! 1. **Setup**: the owner creates the document, grants every peer the
//!    editor role, and hands out a snapshot.
//! 2. **Churn**: every actor mutates the shared fields on a ticker while
//!    merging whatever arrives from the relay.
//! 3. **Barrier**: honest replicas flush and merge the union of their logs.
//!
//! With `adversarial` set, one extra editor corrupts a share of its tokens
//! and tries to grant itself the manager role. Honest replicas must reject
//! the corrupted tokens and still converge.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod relay;
pub mod runtime;

pub use config::SimConfig;
pub use relay::Relay;
pub use runtime::{schema, SimReport, Simulation, CHECKED_FIELDS};
