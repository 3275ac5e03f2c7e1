//! State vectors: replica → highest incorporated clock.
//!
//! Two replicas exchange state vectors to work out the minimal set of items
//! each one is missing (see [`Doc::encode_diff`](crate::Doc::encode_diff)).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DocError;
use crate::id::{ItemId, ReplicaId};
use crate::update::{decode_framed, encode_framed};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen from `replica`, 0 when nothing is known.
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    /// Raise the entry for `replica` to `clock` if it is higher.
    pub fn set_max(&mut self, replica: ReplicaId, clock: u64) {
        let entry = self.0.entry(replica).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether the item is covered by this vector.
    pub fn contains(&self, id: &ItemId) -> bool {
        id.clock <= self.get(id.replica)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }

    /// Serialize for a `SyncStep1` frame.
    pub fn encode(&self) -> Result<Vec<u8>, DocError> {
        encode_framed(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        decode_framed(bytes)
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, clock) in iter {
            sv.set_max(replica, clock);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_max_only_raises() {
        let mut sv = StateVector::new();
        sv.set_max(ReplicaId(1), 5);
        sv.set_max(ReplicaId(1), 3);
        assert_eq!(sv.get(ReplicaId(1)), 5);
        assert_eq!(sv.get(ReplicaId(2)), 0);
    }

    #[test]
    fn test_contains() {
        let sv: StateVector = [(ReplicaId(7), 4)].into_iter().collect();
        assert!(sv.contains(&ItemId::new(ReplicaId(7), 4)));
        assert!(!sv.contains(&ItemId::new(ReplicaId(7), 5)));
        assert!(!sv.contains(&ItemId::new(ReplicaId(8), 1)));
    }

    #[test]
    fn test_wire_encoding() {
        let sv: StateVector = [(ReplicaId(1), 10), (ReplicaId(u64::MAX), 1)]
            .into_iter()
            .collect();
        let bytes = sv.encode().unwrap();
        assert_eq!(StateVector::decode(&bytes).unwrap(), sv);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            StateVector::decode(&[0xde, 0xad]),
            Err(DocError::Decode(_))
        ));
    }
}
