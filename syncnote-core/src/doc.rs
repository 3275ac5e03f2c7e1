//! The replicated document.
//!
//! ```text
//!   arena (integration order, append-only)      document order (linked)
//!  ┌────┬────┬────┬────┬────┐
//!  │ h  │ e  │ w  │ y  │ !  │          head → h → e → y → w → !
//!  └────┴────┴────┴────┴────┘                         (y inserted between e and w)
//!        ▲
//!        └── index: ItemId → arena slot
//! ```
//!
//! Items live in a contiguous arena and point at their neighbours by slot
//! index, so tombstones and origin links never form reference cycles.
//! Concurrent inserts are ordered with YATA: the scan between an item's
//! origins skips over conflicting items whose origin lies further left, and
//! items sharing the same left origin are ordered by ascending replica id.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared Editing
//! on Extensible Data Types" (GROUP 2016)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::anchor::Anchor;
use crate::error::DocError;
use crate::id::{ItemId, ReplicaId};
use crate::item::{Item, Slot};
use crate::observer::{Observers, SubscriptionId};
use crate::state_vector::StateVector;
use crate::update::{runs_from_records, ClockRange, DeleteSet, ItemRecord, ItemRun, Update};

/// Where a transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Produced by this replica's own insert/delete.
    Local,
    /// Merged from another replica.
    Remote,
    /// Loaded from a persisted snapshot while opening the document.
    Bootstrap,
}

/// Fired after every transaction that changed the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEvent {
    pub origin: Origin,
    /// Encoded update containing exactly what the transaction applied.
    pub update: Vec<u8>,
}

#[derive(Debug)]
pub struct Doc {
    replica: ReplicaId,
    slots: Vec<Slot>,
    index: HashMap<ItemId, usize>,
    head: Option<usize>,
    state: StateVector,
    visible_len: usize,
    /// Items whose origins or predecessors have not arrived yet.
    pending_items: BTreeMap<ItemId, ItemRecord>,
    /// Deletions targeting items not integrated yet.
    pending_deletes: DeleteSet,
    observers: Observers<DocEvent>,
}

impl Doc {
    /// Empty document with a fresh random replica id.
    pub fn new() -> Self {
        Self::with_replica(ReplicaId::random())
    }

    pub fn with_replica(replica: ReplicaId) -> Self {
        Self {
            replica,
            slots: Vec::new(),
            index: HashMap::new(),
            head: None,
            state: StateVector::new(),
            visible_len: 0,
            pending_items: BTreeMap::new(),
            pending_deletes: DeleteSet::new(),
            observers: Observers::new(),
        }
    }

    /// Open a document from a persisted full-state snapshot.
    pub fn from_snapshot(replica: ReplicaId, snapshot: &[u8]) -> Result<Self, DocError> {
        let mut doc = Self::with_replica(replica);
        doc.apply_update_with_origin(snapshot, Origin::Bootstrap)?;
        Ok(doc)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// Highest clock this replica has issued.
    pub fn clock(&self) -> u64 {
        self.state.get(self.replica)
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn text(&self) -> String {
        self.order()
            .map(|i| &self.slots[i].item)
            .filter(|item| !item.deleted)
            .map(|item| item.content)
            .collect()
    }

    /// All items in document order, tombstones included.
    pub fn items(&self) -> impl Iterator<Item = &Item> + '_ {
        self.order().map(move |i| &self.slots[i].item)
    }

    /// Items and deletions buffered behind missing dependencies.
    pub fn pending_len(&self) -> usize {
        let deletes = usize::try_from(self.pending_deletes.len()).unwrap_or(usize::MAX);
        self.pending_items.len().saturating_add(deletes)
    }

    // ─── Local edits ─────────────────────────────────────────────────

    /// Insert `text` before the character currently at `index`.
    pub fn insert(&mut self, index: usize, text: &str) -> Result<Vec<u8>, DocError> {
        if index > self.visible_len {
            return Err(DocError::IndexOutOfBounds {
                index,
                len: self.visible_len,
            });
        }
        if text.is_empty() {
            return Update::default().encode();
        }

        let left = if index == 0 {
            None
        } else {
            self.visible_slot(index - 1)
        };
        let right = match left {
            Some(l) => self.slots[l].right,
            None => self.head,
        };
        let run = ItemRun {
            id: ItemId::new(self.replica, self.clock() + 1),
            origin_left: left.map(|i| self.slots[i].item.id),
            origin_right: right.map(|i| self.slots[i].item.id),
            content: text.to_owned(),
        };
        let update = Update {
            runs: vec![run],
            deletes: DeleteSet::new(),
        };
        let bytes = update.encode()?;
        for record in update.runs[0].records() {
            self.integrate(record);
        }

        log::trace!("Replica {} inserted {} chars at {index}", self.replica, update.item_count());
        self.emit(Origin::Local, &bytes);
        Ok(bytes)
    }

    /// Tombstone `len` visible characters starting at `index`.
    pub fn delete(&mut self, index: usize, len: usize) -> Result<Vec<u8>, DocError> {
        if index.checked_add(len).map_or(true, |end| end > self.visible_len) {
            return Err(DocError::IndexOutOfBounds {
                index: index.saturating_add(len),
                len: self.visible_len,
            });
        }
        if len == 0 {
            return Update::default().encode();
        }

        let targets: Vec<usize> = self
            .order()
            .filter(|&i| !self.slots[i].item.deleted)
            .skip(index)
            .take(len)
            .collect();
        let update = Update {
            runs: Vec::new(),
            deletes: DeleteSet::from_ids(targets.iter().map(|&i| self.slots[i].item.id)),
        };
        let bytes = update.encode()?;
        for slot in targets {
            self.tombstone(slot);
        }

        log::trace!("Replica {} deleted {len} chars at {index}", self.replica);
        self.emit(Origin::Local, &bytes);
        Ok(bytes)
    }

    // ─── Merging ─────────────────────────────────────────────────────

    /// Merge an update received from another replica.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<(), DocError> {
        self.apply_update_with_origin(bytes, Origin::Remote)
    }

    /// Merge an update, tagging the resulting event with `origin`.
    ///
    /// Malformed bytes are dropped and leave the replica untouched. Parts
    /// whose dependencies are missing are buffered and `CausalGap` is
    /// returned; they integrate automatically once the gap closes.
    pub fn apply_update_with_origin(&mut self, bytes: &[u8], origin: Origin) -> Result<(), DocError> {
        let update = match Update::decode(bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping malformed update ({} bytes): {e}", bytes.len());
                return Err(e);
            }
        };

        let mut integrated = Vec::new();
        for run in &update.runs {
            for record in run.records() {
                if self.state.contains(&record.id) || self.pending_items.contains_key(&record.id) {
                    continue;
                }
                if self.is_ready(&record) {
                    self.integrate(record);
                    integrated.push(record);
                } else {
                    self.pending_items.insert(record.id, record);
                }
            }
        }
        if !integrated.is_empty() && !self.pending_items.is_empty() {
            let unblocked = self.integrate_pending();
            integrated.extend(unblocked);
        }

        self.pending_deletes.merge(&update.deletes);
        let deleted = self.apply_pending_deletes();

        if !integrated.is_empty() || !deleted.is_empty() {
            let applied = Update {
                runs: runs_from_records(integrated),
                deletes: DeleteSet::from_ids(deleted),
            };
            let encoded = applied.encode()?;
            self.emit(origin, &encoded);
        }

        let items = update
            .runs
            .iter()
            .flat_map(|run| run.records())
            .filter(|r| self.pending_items.contains_key(&r.id))
            .count();
        let deletes: u64 = update
            .deletes
            .ranges()
            .map(|(replica, range)| {
                let known = self.state.get(replica);
                if range.end <= known {
                    0
                } else {
                    ClockRange::new(range.start.max(known + 1), range.end).len()
                }
            })
            .fold(0, u64::saturating_add);
        if items > 0 || deletes > 0 {
            log::debug!(
                "Replica {} buffered {items} items and {deletes} deletions behind a causal gap",
                self.replica
            );
            return Err(DocError::CausalGap { items, deletes });
        }
        Ok(())
    }

    // ─── Encoding ────────────────────────────────────────────────────

    /// Full state as a single update, for bootstrap and persistence.
    pub fn encode_state_as_update(&self) -> Result<Vec<u8>, DocError> {
        self.encode_diff(&StateVector::new())
    }

    pub fn encode_state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Everything a replica at `remote` is missing.
    ///
    /// Items are emitted in integration order, which is causal, so the
    /// receiver never has to buffer. The whole delete set is always included.
    pub fn encode_diff(&self, remote: &StateVector) -> Result<Vec<u8>, DocError> {
        let records = self
            .slots
            .iter()
            .map(|slot| &slot.item)
            .filter(|item| !remote.contains(&item.id))
            .map(|item| ItemRecord {
                id: item.id,
                origin_left: item.origin_left,
                origin_right: item.origin_right,
                content: item.content,
            });
        let update = Update {
            runs: runs_from_records(records),
            deletes: DeleteSet::from_ids(
                self.slots
                    .iter()
                    .filter(|slot| slot.item.deleted)
                    .map(|slot| slot.item.id),
            ),
        };
        update.encode()
    }

    // ─── Anchors ─────────────────────────────────────────────────────

    /// Stable anchor for the gap before the character at `index`.
    pub fn anchor_at(&self, index: usize) -> Result<Anchor, DocError> {
        if index > self.visible_len {
            return Err(DocError::IndexOutOfBounds {
                index,
                len: self.visible_len,
            });
        }
        if index == 0 {
            return Ok(Anchor::Start);
        }
        let slot = self
            .visible_slot(index - 1)
            .ok_or(DocError::IndexOutOfBounds {
                index,
                len: self.visible_len,
            })?;
        Ok(Anchor::After(self.slots[slot].item.id))
    }

    /// Current visible offset of an anchor, `None` if its item is unknown.
    pub fn resolve_anchor(&self, anchor: &Anchor) -> Option<usize> {
        let id = match anchor {
            Anchor::Start => return Some(0),
            Anchor::After(id) => id,
        };
        let target = *self.index.get(id)?;
        let mut offset = 0;
        for i in self.order() {
            if !self.slots[i].item.deleted {
                offset += 1;
            }
            if i == target {
                return Some(offset);
            }
        }
        None
    }

    // ─── Notifications ───────────────────────────────────────────────

    pub fn observe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&DocEvent) + Send + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // ─── Internals ───────────────────────────────────────────────────

    fn emit(&mut self, origin: Origin, update: &[u8]) {
        if self.observers.is_empty() {
            return;
        }
        self.observers.emit(&DocEvent {
            origin,
            update: update.to_vec(),
        });
    }

    fn order(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |&i| self.slots[i].right)
    }

    fn visible_slot(&self, index: usize) -> Option<usize> {
        self.order()
            .filter(|&i| !self.slots[i].item.deleted)
            .nth(index)
    }

    fn slot_of(&self, id: Option<ItemId>) -> Option<usize> {
        id.and_then(|id| self.index.get(&id).copied())
    }

    fn is_ready(&self, record: &ItemRecord) -> bool {
        let known = |origin: Option<ItemId>| origin.map_or(true, |id| self.index.contains_key(&id));
        record.id.clock == self.state.get(record.id.replica) + 1
            && known(record.origin_left)
            && known(record.origin_right)
    }

    /// Retry buffered items until no more become ready.
    fn integrate_pending(&mut self) -> Vec<ItemRecord> {
        let mut integrated = Vec::new();
        loop {
            let mut progressed = false;
            let ids: Vec<ItemId> = self.pending_items.keys().copied().collect();
            for id in ids {
                let ready = self
                    .pending_items
                    .get(&id)
                    .is_some_and(|record| self.is_ready(record));
                if !ready {
                    continue;
                }
                if let Some(record) = self.pending_items.remove(&id) {
                    self.integrate(record);
                    integrated.push(record);
                    progressed = true;
                }
            }
            if !progressed {
                return integrated;
            }
        }
    }

    /// Apply every buffered deletion whose target is now known.
    fn apply_pending_deletes(&mut self) -> Vec<ItemId> {
        let mut deleted = Vec::new();
        for (replica, ranges) in self.pending_deletes.take() {
            let known = self.state.get(replica);
            let mut remaining = Vec::new();
            for range in ranges {
                if range.start <= known {
                    for clock in range.start..=range.end.min(known) {
                        let id = ItemId::new(replica, clock);
                        if let Some(&slot) = self.index.get(&id) {
                            if self.tombstone(slot) {
                                deleted.push(id);
                            }
                        }
                    }
                }
                if range.end > known {
                    remaining.push(ClockRange::new(range.start.max(known + 1), range.end));
                }
            }
            self.pending_deletes.replace(replica, remaining);
        }
        deleted
    }

    fn tombstone(&mut self, slot: usize) -> bool {
        let item = &mut self.slots[slot].item;
        if item.deleted {
            return false;
        }
        item.deleted = true;
        self.visible_len -= 1;
        true
    }

    /// Place a ready record into the document order and the arena.
    fn integrate(&mut self, record: ItemRecord) {
        let mut left = self.slot_of(record.origin_left);
        let right = self.slot_of(record.origin_right);

        let mut cursor = match left {
            Some(l) => self.slots[l].right,
            None => self.head,
        };
        let mut before_origin: HashSet<usize> = HashSet::new();
        let mut conflicting: HashSet<usize> = HashSet::new();

        while let Some(o) = cursor {
            if Some(o) == right {
                break;
            }
            before_origin.insert(o);
            conflicting.insert(o);

            let other = &self.slots[o].item;
            if other.origin_left == record.origin_left {
                if other.id.replica < record.id.replica {
                    left = Some(o);
                    conflicting.clear();
                } else if other.origin_right == record.origin_right {
                    break;
                }
            } else if let Some(other_origin) = self.slot_of(other.origin_left) {
                if !before_origin.contains(&other_origin) {
                    break;
                }
                if !conflicting.contains(&other_origin) {
                    left = Some(o);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor = self.slots[o].right;
        }

        let slot = self.slots.len();
        let next = match left {
            Some(l) => self.slots[l].right,
            None => self.head,
        };
        self.slots.push(Slot {
            item: Item {
                id: record.id,
                origin_left: record.origin_left,
                origin_right: record.origin_right,
                content: record.content,
                deleted: false,
            },
            left,
            right: next,
        });
        match left {
            Some(l) => self.slots[l].right = Some(slot),
            None => self.head = Some(slot),
        }
        if let Some(n) = next {
            self.slots[n].left = Some(slot);
        }
        self.index.insert(record.id, slot);
        self.state.set_max(record.id.replica, record.id.clock);
        self.visible_len += 1;
    }
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}
