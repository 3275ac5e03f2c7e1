//! Debounced full-state persistence for an open document.
//!
//! ```text
//! Doc ──DocEvent{origin}──► AutoSave ──(Local only, debounced)──► StateBackend
//!                              ▲                                    │
//!                 pause/resume │                                    ├── HttpStateBackend
//!                  manual_save │                                    ├── RocksStateBackend
//!                              │                                    └── MemoryStateBackend
//! ```
//!
//! Snapshots travel as base64 strings, matching the REST state endpoint.

pub mod autosave;
pub mod backend;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

pub use autosave::{AutoSave, AutoSaveConfig, SnapshotSource};
pub use backend::{HttpStateBackend, MemoryStateBackend, RocksStateBackend, StateBackend};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("failed to write document state: {0}")]
    Write(String),

    #[error("failed to load document state: {0}")]
    Load(String),

    #[error("stored document state is not valid: {0}")]
    Decode(String),
}

/// Base64 text of a full-state snapshot.
pub fn encode_state(snapshot: &[u8]) -> String {
    STANDARD.encode(snapshot)
}

pub fn decode_state(state: &str) -> Result<Vec<u8>, PersistenceError> {
    STANDARD
        .decode(state.trim())
        .map_err(|e| PersistenceError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_text_roundtrip() {
        let bytes = vec![0u8, 1, 2, 250, 255];
        let text = encode_state(&bytes);
        assert_eq!(decode_state(&text).unwrap(), bytes);
        assert_eq!(decode_state(&format!(" {text}\n")).unwrap(), bytes);
    }

    #[test]
    fn test_decode_state_rejects_garbage() {
        assert!(matches!(decode_state("not base64!!"), Err(PersistenceError::Decode(_))));
    }
}
