//! Server-side snapshot storage.
//!
//! ```text
//! ┌─────────────┐  last peer leaves  ┌──────────────────────────────────┐
//! │ SyncServer  │ ─────────────────► │ DocumentStore (RocksDB)          │
//! │ room replica│ ◄───────────────── │ CF "documents": LZ4 snapshots    │
//! └─────────────┘  first peer joins  │ CF "metadata" : version, sizes   │
//!                                    └──────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
