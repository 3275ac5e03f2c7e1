//! # syncnote-collab: replication, relay and editing session for SyncNote
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌─────────────┐
//! │ DocumentSession  │ ◄─────────────────► │ SyncServer  │
//! │  SyncClient      │     Binary Proto    │  (relay)    │
//! └───────┬──────────┘                     └──────┬──────┘
//!         │                                       │
//!         ▼                                       ▼
//! ┌──────────────────┐                     ┌─────────────┐
//! │ DocHandle        │                     │ DocumentRoom│
//! │  Doc + Overlay   │                     │  Doc + fan- │
//! └───────┬──────────┘                     │  out group  │
//!         │ local edits                    └──────┬──────┘
//!         ▼                                       ▼
//! ┌──────────────────┐                     ┌─────────────┐
//! │ AutoSave         │                     │ RocksDB     │
//! │  → StateBackend  │                     │ snapshots   │
//! └──────────────────┘                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`awareness`]: ephemeral cursors and presence
//! - [`broadcast`]: room-based fan-out with backpressure
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`storage`]: compressed snapshot store
//! - [`persistence`]: debounced autosave and state backends
//! - [`overlay`]: provisional AI edits
//! - [`session`]: one open document tying the above together
//! - [`config`]: TOML configuration

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod overlay;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessEvent};
pub use broadcast::{BroadcastGroup, BroadcastStats, DocumentRoom, RoomManager};
pub use client::{
    Backoff, ClientConfig, ConnectionState, LocalReplica, OfflineQueue, SyncClient, SyncEvent, TransportError,
};
pub use config::{CollabConfig, ConfigError};
pub use overlay::{
    DiscardReason, Overlay, OverlayError, OverlayEvent, OverlayHooks, OverlayPhase, OverlayTarget, OverlayView,
    ProvisionalEdit,
};
pub use persistence::{
    AutoSave, AutoSaveConfig, HttpStateBackend, MemoryStateBackend, PersistenceError, RocksStateBackend,
    SnapshotSource, StateBackend,
};
pub use protocol::{AwarenessState, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{AiStreamEvent, DocHandle, DocumentSession, SessionConfig, SessionError};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
