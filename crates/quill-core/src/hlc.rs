//! Hybrid logical clock stamps.
//!
//! Every op carries a [`Timestamp`] of wall time, a logical counter that
//! breaks ties within one millisecond, and the issuing actor's id as the
//! final tiebreak. Stamps from one [`Hlc`] strictly increase, and
//! [`Hlc::observe`] keeps a replica's clock ahead of every stamp it merges.
//!
//! Kulkarni et al., "Logical Physical Clocks and Consistent Snapshots in
//! Globally Distributed Databases" (2014).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// A globally unique timestamp combining physical time, logical counter, and clock ID.
///
/// Serialized as `{ "wallTimeMs", "logical", "clockId" }` inside op payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Physical wall-clock time in milliseconds since UNIX epoch
    pub wall_time_ms: u64,
    /// Logical counter for events at the same physical time
    pub logical: u32,
    /// Actor ID of the clock that produced the stamp
    pub clock_id: String,
}

impl Timestamp {
    /// Create a timestamp from its parts.
    #[must_use]
    pub fn new(wall_time_ms: u64, logical: u32, clock_id: impl Into<String>) -> Self {
        Self {
            wall_time_ms,
            logical,
            clock_id: clock_id.into(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        // First compare physical time
        match self.wall_time_ms.cmp(&other.wall_time_ms) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Then logical counter
        match self.logical.cmp(&other.logical) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Finally clock ID for deterministic tiebreaking
        self.clock_id.cmp(&other.clock_id)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Next `(wall, logical)` pair; an exhausted counter carries into wall time.
fn step(wall_time_ms: u64, logical: u32) -> (u64, u32) {
    match logical.checked_add(1) {
        Some(logical) => (wall_time_ms, logical),
        None => (wall_time_ms.saturating_add(1), 0),
    }
}

/// Hybrid Logical Clock state machine.
#[derive(Debug, Clone)]
pub struct Hlc {
    /// Last emitted or observed timestamp
    last: Timestamp,
}

impl Hlc {
    /// Create a new HLC for the given actor.
    ///
    /// The clock starts at wall time zero, so the first `next` adopts the
    /// caller's wall time.
    #[must_use]
    pub fn new(clock_id: impl Into<String>) -> Self {
        Self {
            last: Timestamp::new(0, 0, clock_id),
        }
    }

    /// Get the actor ID for this clock.
    #[must_use]
    pub fn clock_id(&self) -> &str {
        &self.last.clock_id
    }

    /// Generate a new timestamp for a local event at wall time `now_ms`.
    ///
    /// Guarantees the returned timestamp is greater than any previously
    /// generated or observed timestamp.
    pub fn next(&mut self, now_ms: u64) -> Timestamp {
        if now_ms > self.last.wall_time_ms {
            // Wall clock advanced, reset logical counter
            self.last.wall_time_ms = now_ms;
            self.last.logical = 0;
        } else {
            // Wall clock hasn't advanced, increment logical counter
            (self.last.wall_time_ms, self.last.logical) =
                step(self.last.wall_time_ms, self.last.logical);
        }

        self.last.clone()
    }

    /// Generate a new timestamp using the system wall clock.
    pub fn tick(&mut self) -> Timestamp {
        self.next(current_time_ms())
    }

    /// Merge a foreign timestamp into the clock.
    pub fn observe(&mut self, seen: &Timestamp) {
        self.observe_at(seen, current_time_ms());
    }

    /// Merge a foreign timestamp into the clock, with `now_ms` as real time.
    ///
    /// Ensures the next local stamp sorts after `seen`.
    pub fn observe_at(&mut self, seen: &Timestamp, now_ms: u64) {
        let merged_wall = self.last.wall_time_ms.max(seen.wall_time_ms).max(now_ms);

        (self.last.wall_time_ms, self.last.logical) = if merged_wall == self.last.wall_time_ms {
            // Local wall is (one of) the maximum, step past both counters
            step(merged_wall, self.last.logical.max(seen.logical))
        } else if merged_wall == seen.wall_time_ms {
            // Foreign wall is ahead, adopt its counter
            (merged_wall, seen.logical)
        } else {
            // Real time is ahead of both
            (merged_wall, 0)
        };
    }

    /// Get the current timestamp without advancing the clock.
    #[must_use]
    pub fn current(&self) -> &Timestamp {
        &self.last
    }
}

/// Get current wall clock time in milliseconds since UNIX epoch.
#[must_use]
pub fn current_time_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    u64::try_from(millis).unwrap_or(u64::MAX)
}
