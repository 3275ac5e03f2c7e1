//! Items and their arena slots.

use crate::id::ItemId;

/// Atomic content unit: one character with its identity and origins.
///
/// Items are never removed or renumbered. Deleting one only sets
/// `deleted`, so later inserts anchored to it stay well defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    /// Neighbour to the left when the item was created.
    pub origin_left: Option<ItemId>,
    /// Neighbour to the right when the item was created.
    pub origin_right: Option<ItemId>,
    pub content: char,
    pub deleted: bool,
}

/// Arena entry. `left`/`right` are arena indices giving document order.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub item: Item,
    pub left: Option<usize>,
    pub right: Option<usize>,
}
