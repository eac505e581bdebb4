//! Append-only access-control log.
//!
//! Role assignments are never overwritten. Each actor's assignments are
//! kept sorted by `(stamp, id)`, so the role an actor held at any logical
//! time can be answered after the fact.

use crate::hlc::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Document roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control, including granting owner and manager
    Owner,
    /// Writes fields, grants editor/viewer/revoked
    Manager,
    /// Writes fields
    Editor,
    /// Reads only
    Viewer,
    /// No access
    Revoked,
}

impl Role {
    /// Every role, most privileged first.
    pub const ALL: [Role; 5] = [
        Role::Owner,
        Role::Manager,
        Role::Editor,
        Role::Viewer,
        Role::Revoked,
    ];

    /// Wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Manager => "manager",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
            Role::Revoked => "revoked",
        }
    }

    /// Whether this role may write document fields.
    #[must_use]
    pub fn can_write_fields(&self) -> bool {
        matches!(self, Role::Owner | Role::Manager | Role::Editor)
    }

    /// Whether this role may assign `target` to an actor.
    #[must_use]
    pub fn can_grant(&self, target: Role) -> bool {
        match self {
            Role::Owner => true,
            Role::Manager => matches!(target, Role::Editor | Role::Viewer | Role::Revoked),
            Role::Editor | Role::Viewer | Role::Revoked => false,
        }
    }

    /// Whether ops issued under this role are signed (and carry a key).
    #[must_use]
    pub fn signs(&self) -> bool {
        self.can_write_fields()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role: {s}"))
    }
}

/// A single role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclAssignment {
    /// Unique grant id
    pub id: String,
    /// Actor receiving the role
    pub actor_id: String,
    /// Assigned role
    pub role: Role,
    /// Stamp of the `acl.set` op carrying the grant
    pub stamp: Timestamp,
    /// Issuer of the grant
    pub by: String,
}

impl AclAssignment {
    fn order(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// The access-control log.
#[derive(Debug, Clone, Default)]
pub struct AclLog {
    /// Grant ids already merged
    ids: HashSet<String>,
    /// Actor -> assignments sorted by (stamp, id)
    by_actor: BTreeMap<String, Vec<AclAssignment>>,
}

impl AclLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any assignment has been merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether a grant with `id` is already in the log.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// The assignment with grant id `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&AclAssignment> {
        if !self.ids.contains(id) {
            return None;
        }
        self.by_actor.values().flatten().find(|a| a.id == id)
    }

    /// Merge assignments, returning the ones not seen before.
    pub fn merge(&mut self, assignments: impl IntoIterator<Item = AclAssignment>) -> Vec<AclAssignment> {
        let mut accepted = Vec::new();
        for assignment in assignments {
            if !self.ids.insert(assignment.id.clone()) {
                continue;
            }
            let list = self.by_actor.entry(assignment.actor_id.clone()).or_default();
            let pos = list.partition_point(|existing| existing.order(&assignment) != Ordering::Greater);
            list.insert(pos, assignment.clone());
            tracing::debug!(
                id = %assignment.id,
                actor = %assignment.actor_id,
                role = %assignment.role,
                "Merged ACL assignment"
            );
            accepted.push(assignment);
        }
        accepted
    }

    /// The assignment in force for `actor_id` at `stamp`.
    #[must_use]
    pub fn entry_at(&self, actor_id: &str, stamp: &Timestamp) -> Option<&AclAssignment> {
        self.by_actor
            .get(actor_id)?
            .iter()
            .rev()
            .find(|entry| entry.stamp <= *stamp)
    }

    /// Role of `actor_id` at `stamp`; revoked when nothing applies.
    #[must_use]
    pub fn role_at(&self, actor_id: &str, stamp: &Timestamp) -> Role {
        self.entry_at(actor_id, stamp)
            .map_or(Role::Revoked, |entry| entry.role)
    }

    /// Role from the greatest assignment targeting `actor_id`.
    #[must_use]
    pub fn current_role(&self, actor_id: &str) -> Role {
        self.by_actor
            .get(actor_id)
            .and_then(|list| list.last())
            .map_or(Role::Revoked, |entry| entry.role)
    }

    /// Actors that have ever received an assignment, sorted.
    #[must_use]
    pub fn known_actors(&self) -> Vec<String> {
        self.by_actor.keys().cloned().collect()
    }

    /// Every assignment sorted by (stamp, id).
    #[must_use]
    pub fn snapshot(&self) -> Vec<AclAssignment> {
        let mut all: Vec<AclAssignment> = self.by_actor.values().flatten().cloned().collect();
        all.sort_by(AclAssignment::order);
        all
    }
}
