//! Replica and item identities.
//!
//! Every item ever created is named by `(replica, clock)`. Clocks are
//! per-replica, start at 1 and are never reused, so an `ItemId` stays valid
//! for the lifetime of the document, tombstoned or not.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one editing replica (one open editor session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Fresh random replica id, folded from a v4 UUID.
    pub fn random() -> Self {
        let bits = uuid::Uuid::new_v4().as_u128();
        Self(((bits >> 64) as u64) ^ (bits as u64))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Stable identity of a single item.
///
/// Ordering is `(replica, clock)`, which keeps per-replica runs adjacent in
/// sorted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl ItemId {
    pub const fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.replica, self.clock)
    }
}
