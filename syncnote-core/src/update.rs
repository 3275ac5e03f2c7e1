//! Updates: the unit of wire transfer and persistence.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ version │ bincode(Update { runs, deletes })            │
//! │ 1 byte  │ variable                                     │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! An [`ItemRun`] packs consecutive characters typed by one replica: the
//! first character carries the run's `origin_left`, every following one is
//! anchored on its predecessor, and all share the run's `origin_right`.
//! Deletions travel as a [`DeleteSet`] of coalesced clock ranges.
//!
//! Applying an update twice is a no-op, so updates can be replayed, merged
//! and re-sent freely.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DocError;
use crate::id::{ItemId, ReplicaId};

/// Current wire format version.
const FORMAT_VERSION: u8 = 1;

/// Upper bound on what a single decode may allocate.
const MAX_DECODE_BYTES: usize = 64 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_DECODE_BYTES>()
}

pub(crate) fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>, DocError> {
    let body = bincode::serde::encode_to_vec(value, wire_config())
        .map_err(|e| DocError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

pub(crate) fn decode_framed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DocError> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| DocError::Decode("empty buffer".into()))?;
    if *version != FORMAT_VERSION {
        return Err(DocError::Decode(format!("unsupported format version {version}")));
    }
    let (value, read) = bincode::serde::decode_from_slice(body, wire_config())
        .map_err(|e| DocError::Decode(e.to_string()))?;
    if read != body.len() {
        return Err(DocError::Decode(format!("{} trailing bytes", body.len() - read)));
    }
    Ok(value)
}

/// Inclusive range of clocks from one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockRange {
    pub start: u64,
    pub end: u64,
}

impl ClockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Saturates at `u64::MAX` for the full clock range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

/// Tombstoned item ids, grouped per replica as sorted, coalesced ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSet(BTreeMap<ReplicaId, Vec<ClockRange>>);

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I: IntoIterator<Item = ItemId>>(ids: I) -> Self {
        let mut set = DeleteSet::new();
        for id in ids {
            set.0
                .entry(id.replica)
                .or_default()
                .push(ClockRange::new(id.clock, id.clock));
        }
        for ranges in set.0.values_mut() {
            normalize(ranges);
        }
        set
    }

    pub fn insert_range(&mut self, replica: ReplicaId, range: ClockRange) {
        let ranges = self.0.entry(replica).or_default();
        ranges.push(range);
        normalize(ranges);
    }

    pub fn merge(&mut self, other: &DeleteSet) {
        for (replica, ranges) in &other.0 {
            let mine = self.0.entry(*replica).or_default();
            mine.extend_from_slice(ranges);
            normalize(mine);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Number of item ids covered, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        self.0
            .values()
            .flatten()
            .map(ClockRange::len)
            .fold(0, u64::saturating_add)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.0.get(&id.replica).is_some_and(|ranges| {
            ranges
                .binary_search_by(|r| {
                    if r.end < id.clock {
                        std::cmp::Ordering::Less
                    } else if r.start > id.clock {
                        std::cmp::Ordering::Greater
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
                .is_ok()
        })
    }

    pub fn ranges(&self) -> impl Iterator<Item = (ReplicaId, ClockRange)> + '_ {
        self.0
            .iter()
            .flat_map(|(replica, ranges)| ranges.iter().map(move |r| (*replica, *r)))
    }

    pub(crate) fn replace(&mut self, replica: ReplicaId, ranges: Vec<ClockRange>) {
        if ranges.is_empty() {
            self.0.remove(&replica);
        } else {
            self.0.insert(replica, ranges);
        }
    }

    pub(crate) fn take(&mut self) -> BTreeMap<ReplicaId, Vec<ClockRange>> {
        std::mem::take(&mut self.0)
    }

    fn validate(&self) -> Result<(), DocError> {
        for (replica, range) in self.ranges() {
            if range.start == 0 || range.start > range.end {
                return Err(DocError::Decode(format!(
                    "invalid delete range {}..={} for replica {replica}",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }
}

/// Sort and coalesce overlapping or touching ranges in place.
fn normalize(ranges: &mut Vec<ClockRange>) {
    ranges.sort_by_key(|r| r.start);
    let mut out: Vec<ClockRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match out.last_mut() {
            Some(last) if r.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(r.end);
            }
            _ => out.push(r),
        }
    }
    *ranges = out;
}

/// A block of consecutive characters inserted by one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRun {
    pub id: ItemId,
    pub origin_left: Option<ItemId>,
    pub origin_right: Option<ItemId>,
    pub content: String,
}

impl ItemRun {
    /// Number of items (characters) in the run.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Expand into one record per character.
    pub(crate) fn records(&self) -> impl Iterator<Item = ItemRecord> + '_ {
        let replica = self.id.replica;
        let base = self.id.clock;
        self.content.chars().enumerate().map(move |(i, content)| {
            let clock = base + i as u64;
            ItemRecord {
                id: ItemId::new(replica, clock),
                origin_left: if i == 0 {
                    self.origin_left
                } else {
                    Some(ItemId::new(replica, clock - 1))
                },
                origin_right: self.origin_right,
                content,
            }
        })
    }
}

/// One character with its origins, as integrated by the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItemRecord {
    pub id: ItemId,
    pub origin_left: Option<ItemId>,
    pub origin_right: Option<ItemId>,
    pub content: char,
}

/// Pack causally ordered records back into runs.
pub(crate) fn runs_from_records<I: IntoIterator<Item = ItemRecord>>(records: I) -> Vec<ItemRun> {
    let mut runs: Vec<ItemRun> = Vec::new();
    let mut last: Option<ItemId> = None;
    for rec in records {
        if let (Some(run), Some(prev)) = (runs.last_mut(), last) {
            if rec.id.replica == prev.replica
                && rec.id.clock == prev.clock + 1
                && rec.origin_left == Some(prev)
                && rec.origin_right == run.origin_right
            {
                run.content.push(rec.content);
                last = Some(rec.id);
                continue;
            }
        }
        runs.push(ItemRun {
            id: rec.id,
            origin_left: rec.origin_left,
            origin_right: rec.origin_right,
            content: rec.content.to_string(),
        });
        last = Some(rec.id);
    }
    runs
}

/// Causally tagged set of insertions and tombstones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub runs: Vec<ItemRun>,
    pub deletes: DeleteSet,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.deletes.is_empty()
    }

    /// Total inserted items across all runs.
    pub fn item_count(&self) -> usize {
        self.runs.iter().map(ItemRun::len).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocError> {
        encode_framed(self)
    }

    /// Decode and validate an update received from outside.
    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        let update: Update = decode_framed(bytes)?;
        update.validate()?;
        Ok(update)
    }

    /// Combine updates into one, preserving their order.
    pub fn merge<I: IntoIterator<Item = Update>>(updates: I) -> Update {
        let mut merged = Update::default();
        for update in updates {
            merged.runs.extend(update.runs);
            merged.deletes.merge(&update.deletes);
        }
        merged
    }

    /// Merge already-encoded updates, e.g. an offline queue.
    pub fn merge_encoded<B: AsRef<[u8]>>(updates: &[B]) -> Result<Vec<u8>, DocError> {
        let decoded = updates
            .iter()
            .map(|b| Update::decode(b.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Update::merge(decoded).encode()
    }

    fn validate(&self) -> Result<(), DocError> {
        for run in &self.runs {
            if run.content.is_empty() {
                return Err(DocError::Decode(format!("empty run at {}", run.id)));
            }
            if run.id.clock == 0 {
                return Err(DocError::Decode("item clock 0 is reserved".into()));
            }
            if run.id.clock.checked_add(run.len() as u64 - 1).is_none() {
                return Err(DocError::Decode(format!("clock overflow in run {}", run.id)));
            }
            let bad_origin = [run.origin_left, run.origin_right]
                .into_iter()
                .flatten()
                .any(|o| o.clock == 0);
            if bad_origin {
                return Err(DocError::Decode(format!("origin with clock 0 in run {}", run.id)));
            }
        }
        self.deletes.validate()
    }
}
