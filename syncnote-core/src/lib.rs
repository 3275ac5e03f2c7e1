//! Replicated plain-text document model for SyncNote.
//!
//! Every character is an [`Item`] with a globally unique [`ItemId`] and the
//! ids of its neighbours at creation time. Replicas exchange [`Update`]s,
//! which merge commutatively and idempotently: any two replicas that have
//! seen the same set of updates show the same text, whatever the delivery
//! order.
//!
//! ```
//! use syncnote_core::{Doc, ReplicaId};
//!
//! let mut alice = Doc::with_replica(ReplicaId(1));
//! let mut bob = Doc::with_replica(ReplicaId(2));
//!
//! let a = alice.insert(0, "hello").unwrap();
//! let b = bob.insert(0, "world").unwrap();
//! alice.apply_update(&b).unwrap();
//! bob.apply_update(&a).unwrap();
//!
//! assert_eq!(alice.text(), bob.text());
//! ```

pub mod anchor;
pub mod doc;
pub mod error;
pub mod id;
pub mod item;
pub mod observer;
pub mod state_vector;
pub mod update;

pub use anchor::Anchor;
pub use doc::{Doc, DocEvent, Origin};
pub use error::DocError;
pub use id::{ItemId, ReplicaId};
pub use item::Item;
pub use observer::{Observers, SubscriptionId};
pub use state_vector::StateVector;
pub use update::{ClockRange, DeleteSet, ItemRun, Update};
