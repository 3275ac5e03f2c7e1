use serde::{Deserialize, Serialize};

use crate::id::ItemId;

/// A document position expressed through item identity.
///
/// Unlike a raw offset, an anchor keeps pointing at the same gap between
/// characters while remote edits shift text around it. `After(id)` means
/// "immediately after item `id`"; if that item is later deleted the anchor
/// collapses onto the tombstone's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    Start,
    After(ItemId),
}
