//! Ephemeral peer presence: who is in the document and where their cursor is.
//!
//! ```text
//! local cursor move ── set_local() ── clock+1 ──► Awareness frame ──► relay
//!                                                                       │
//! remote Awareness ◄────────────────────────────────────────────────────┘
//!       │
//!       ▼
//! apply_remote(peer, clock, state)   ignored unless clock > last seen
//! ```
//!
//! Nothing here is persisted. Remote entries are dropped on disconnect and
//! when a peer stays silent longer than the idle timeout. Each peer keeps its
//! entry alive by re-sending its local state every heartbeat through
//! [`Awareness::refresh_local`].

use std::collections::HashMap;
use std::time::Duration;
use syncnote_core::{Observers, SubscriptionId};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::AwarenessState;

/// Change notification fired after the awareness map changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessEvent {
    Updated(Uuid),
    Removed(Uuid),
}

struct RemotePeer {
    clock: u64,
    state: AwarenessState,
    last_seen: Instant,
}

/// Presence map for one document.
pub struct Awareness {
    local_peer: Uuid,
    local_clock: u64,
    local: Option<AwarenessState>,
    peers: HashMap<Uuid, RemotePeer>,
    observers: Observers<AwarenessEvent>,
}

impl Awareness {
    pub fn new(local_peer: Uuid) -> Self {
        Self {
            local_peer,
            local_clock: 0,
            local: None,
            peers: HashMap::new(),
            observers: Observers::new(),
        }
    }

    pub fn local_peer(&self) -> Uuid {
        self.local_peer
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local.as_ref()
    }

    /// Clock of the last local state, sent along with it.
    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    /// Replace the local state. Returns the clock to broadcast it with.
    pub fn set_local(&mut self, state: AwarenessState) -> u64 {
        self.local_clock += 1;
        self.local = Some(state);
        self.observers.emit(&AwarenessEvent::Updated(self.local_peer));
        self.local_clock
    }

    /// Re-stamp the unchanged local state with a new clock, for heartbeats
    /// and for announcing it to newly joined peers. `None` until a local
    /// state is set.
    pub fn refresh_local(&mut self) -> Option<(u64, AwarenessState)> {
        let state = self.local.clone()?;
        self.local_clock += 1;
        Some((self.local_clock, state))
    }

    /// Merge a remote state. Stale or duplicate clocks are ignored.
    pub fn apply_remote(&mut self, peer: Uuid, clock: u64, state: AwarenessState) -> bool {
        if peer == self.local_peer {
            return false;
        }
        let now = Instant::now();
        match self.peers.get_mut(&peer) {
            Some(existing) if clock <= existing.clock => {
                log::trace!("Ignoring stale awareness from {peer} (clock {clock} <= {})", existing.clock);
                return false;
            }
            Some(existing) => {
                existing.clock = clock;
                existing.state = state;
                existing.last_seen = now;
            }
            None => {
                self.peers.insert(
                    peer,
                    RemotePeer {
                        clock,
                        state,
                        last_seen: now,
                    },
                );
            }
        }
        self.observers.emit(&AwarenessEvent::Updated(peer));
        true
    }

    pub fn remove_peer(&mut self, peer: Uuid) -> bool {
        if self.peers.remove(&peer).is_none() {
            return false;
        }
        self.observers.emit(&AwarenessEvent::Removed(peer));
        true
    }

    /// Forget every remote peer, e.g. after the connection dropped.
    pub fn clear_remote(&mut self) -> usize {
        let gone: Vec<Uuid> = self.peers.keys().copied().collect();
        for peer in &gone {
            self.remove_peer(*peer);
        }
        gone.len()
    }

    /// Drop peers not heard from within `timeout`.
    pub fn expire_idle(&mut self, timeout: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for peer in &stale {
            self.remove_peer(*peer);
        }
        if !stale.is_empty() {
            log::debug!("Expired {} idle awareness entries", stale.len());
        }
        stale
    }

    pub fn get(&self, peer: &Uuid) -> Option<&AwarenessState> {
        if *peer == self.local_peer {
            return self.local.as_ref();
        }
        self.peers.get(peer).map(|p| &p.state)
    }

    /// Every known state, local included.
    pub fn states(&self) -> impl Iterator<Item = (Uuid, &AwarenessState)> + '_ {
        self.local
            .iter()
            .map(move |s| (self.local_peer, s))
            .chain(self.peers.iter().map(|(id, p)| (*id, &p.state)))
    }

    pub fn remote_count(&self) -> usize {
        self.peers.len()
    }

    pub fn observe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&AwarenessEvent) + Send + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("local_peer", &self.local_peer)
            .field("local_clock", &self.local_clock)
            .field("remote_peers", &self.peers.len())
            .finish()
    }
}
