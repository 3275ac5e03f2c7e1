//! Binary protocol for document replication.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: each side sends `SyncStep1` carrying its state vector and
//! answers the other side's `SyncStep1` with a `SyncStep2` carrying exactly
//! the items the peer lacks. Afterwards every local edit travels as an
//! `Update` frame.

use serde::{Deserialize, Serialize};
use syncnote_core::{Anchor, StateVector};
use thiserror::Error;
use uuid::Uuid;

/// Largest frame a peer may send us.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn frame_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector, asks the other side for what we lack
    SyncStep1 = 1,
    /// Diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Cursor/selection presence
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id. The color is derived from the id, so a
    /// peer keeps its color across reconnects.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: color_for(peer_id),
        }
    }
}

fn color_for(peer_id: Uuid) -> [f32; 4] {
    let hash = peer_id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Ephemeral presence of one peer.
///
/// Positions are anchors, so a remote cursor stays on the same character
/// while other edits shift offsets around it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwarenessState {
    pub name: String,
    pub color: [f32; 4],
    pub cursor: Option<Anchor>,
    /// Selection as (start, end) anchors
    pub selection: Option<(Anchor, Anchor)>,
}

impl AwarenessState {
    pub fn for_peer(info: &PeerInfo) -> Self {
        Self {
            name: info.name.clone(),
            color: info.color,
            cursor: None,
            selection: None,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local sequence number. For awareness frames this is the
    /// last-state-wins clock.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    /// Incremental update frame carrying an encoded `Update`.
    pub fn update(peer_id: Uuid, doc_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, doc_id, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: &StateVector) -> Result<Self, ProtocolError> {
        let payload = state_vector
            .encode()
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, payload))
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, diff)
    }

    pub fn awareness(
        peer_id: Uuid,
        doc_id: Uuid,
        clock: u64,
        state: &AwarenessState,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, frame_config())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, doc_id, clock, payload))
    }

    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, frame_config())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, doc_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, frame_config()).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, frame_config())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Decode(format!(
                "{} trailing bytes after frame",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }

    /// Parse the state vector of a `SyncStep1` frame.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.expect(MessageType::SyncStep1)?;
        StateVector::decode(&self.payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        let (state, _) = bincode::serde::decode_from_slice(&self.payload, frame_config())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(state)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, frame_config())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(info)
    }

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("expected {expected:?} frame, got {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
}
