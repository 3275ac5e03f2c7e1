use thiserror::Error;

/// Errors raised by the document model.
///
/// None of these are fatal: a `Decode` error drops the offending bytes and
/// leaves the replica untouched, a `CausalGap` means the update was buffered
/// and will be integrated once its dependencies arrive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocError {
    #[error("malformed update: {0}")]
    Decode(String),

    #[error("failed to encode: {0}")]
    Encode(String),

    #[error("update buffered: {items} items and {deletes} deletions wait on missing dependencies")]
    CausalGap { items: usize, deletes: u64 },

    #[error("index {index} out of bounds for document of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

impl DocError {
    /// Whether the error left data buffered for a later retry.
    pub fn is_causal_gap(&self) -> bool {
        matches!(self, DocError::CausalGap { .. })
    }
}
