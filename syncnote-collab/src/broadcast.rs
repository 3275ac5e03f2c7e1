//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind loses the oldest frames and
//! recovers them through the next state-vector exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syncnote_core::Doc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// A pre-encoded frame tagged with the peer that produced it, so the
/// connection task can skip its own frames without decoding them.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters, read through [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out channel plus peer registry for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each peer may lag behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every subscriber. The sender's own connection
    /// filters the frame out.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(msg.peer_id, Arc::new(encoded)))
    }

    /// Send already-encoded bytes. Returns the number of receivers.
    pub fn broadcast_raw(&self, sender: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { sender, bytes }).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Authoritative replica of one document plus its fan-out group.
///
/// The replica sits behind a std mutex: every access is a short synchronous
/// CRDT call and the guard is never held across an await.
pub struct DocumentRoom {
    doc: Mutex<Doc>,
    pub group: BroadcastGroup,
    /// Serializes snapshot writes so a later write never lands first.
    persist: tokio::sync::Mutex<()>,
}

impl DocumentRoom {
    pub fn new(doc: Doc, capacity: usize) -> Self {
        Self {
            doc: Mutex::new(doc),
            group: BroadcastGroup::new(capacity),
            persist: tokio::sync::Mutex::new(()),
        }
    }

    pub fn doc(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold while encoding and writing a snapshot of this room.
    pub async fn persist_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.persist.lock().await
    }
}

/// Maps document ids to rooms. Rooms are created on first join. A room whose
/// last peer left stays mapped until [`RoomManager::remove_if_empty`], so a
/// peer joining meanwhile reuses the live replica instead of reloading one
/// from storage.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<DocumentRoom>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Add `info` to the room for `doc_id`, creating it with `init` if needed.
    ///
    /// Returns `Ok(None)` when the room is full. An `init` error is passed
    /// through and no room is created.
    pub async fn join<F, E>(
        &self,
        doc_id: Uuid,
        info: PeerInfo,
        init: F,
    ) -> Result<Option<(Arc<DocumentRoom>, broadcast::Receiver<Envelope>)>, E>
    where
        F: FnOnce() -> Result<Doc, E>,
    {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(&doc_id).cloned() {
            Some(room) => room,
            None => {
                let room = Arc::new(DocumentRoom::new(init()?, self.capacity));
                rooms.insert(doc_id, room.clone());
                room
            }
        };
        if room.group.peer_count().await >= self.max_peers {
            return Ok(None);
        }
        let rx = room.group.add_peer(info).await;
        Ok(Some((room, rx)))
    }

    /// Remove a peer. Returns the room when it has no peers left; it stays
    /// mapped until [`RoomManager::remove_if_empty`].
    pub async fn leave(&self, doc_id: &Uuid, peer_id: &Uuid) -> Option<Arc<DocumentRoom>> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(doc_id)?.clone();
        room.group.remove_peer(peer_id).await;
        if room.group.peer_count().await > 0 {
            return None;
        }
        Some(room)
    }

    /// Drop the room for `doc_id` unless a peer joined it again.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id) else {
            return false;
        };
        if room.group.peer_count().await > 0 {
            return false;
        }
        rooms.remove(doc_id);
        true
    }

    /// Install a peerless room, e.g. one recovered from storage.
    pub async fn insert(&self, doc_id: Uuid, doc: Doc) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&doc_id) {
            return false;
        }
        rooms.insert(doc_id, Arc::new(DocumentRoom::new(doc, self.capacity)));
        true
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncnote_core::ReplicaId;

    fn empty_doc() -> Result<Doc, std::convert::Infallible> {
        Ok(Doc::with_replica(ReplicaId(0)))
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        group.remove_peer(&peer_id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&peer_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_tags_sender() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let mut rx_alice = group.add_peer(alice.clone()).await;
        let mut rx_bob = group.add_peer(bob).await;

        let msg = SyncMessage::update(alice.peer_id, Uuid::new_v4(), 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        for rx in [&mut rx_alice, &mut rx_bob] {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.sender, alice.peer_id);
            assert_eq!(SyncMessage::decode(&env.bytes).unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver_and_stats() {
        let group = BroadcastGroup::new(2);
        let peer = PeerInfo::new("Slow");
        let mut rx = group.add_peer(peer.clone()).await;

        for i in 0..4u8 {
            group.broadcast_raw(peer.peer_id, Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 4);
        assert_eq!(stats.messages_dropped, 2);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_manager_join_reuses_room() {
        let manager = RoomManager::new(16, 10);
        let doc_id = Uuid::new_v4();

        let (first, _rx1) = manager.join(doc_id, PeerInfo::new("a"), empty_doc).await.unwrap().unwrap();
        let (second, _rx2) = manager
            .join(doc_id, PeerInfo::new("b"), || -> Result<Doc, std::convert::Infallible> {
                panic!("room must be reused")
            })
            .await
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(first.group.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_room_manager_enforces_capacity() {
        let manager = RoomManager::new(16, 1);
        let doc_id = Uuid::new_v4();
        assert!(manager.join(doc_id, PeerInfo::new("a"), empty_doc).await.unwrap().is_some());
        assert!(manager.join(doc_id, PeerInfo::new("b"), empty_doc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_room_manager_leave_keeps_room_until_removed() {
        let manager = RoomManager::new(16, 10);
        let doc_id = Uuid::new_v4();
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let (room, _rx1) = manager.join(doc_id, alice.clone(), empty_doc).await.unwrap().unwrap();
        let _rx2 = manager.join(doc_id, bob.clone(), empty_doc).await.unwrap();
        room.doc().insert(0, "kept").unwrap();

        assert!(manager.leave(&doc_id, &alice.peer_id).await.is_none());
        let emptied = manager.leave(&doc_id, &bob.peer_id).await.unwrap();
        assert_eq!(emptied.doc().text(), "kept");
        assert_eq!(manager.room_count().await, 1);

        assert!(manager.remove_if_empty(&doc_id).await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.leave(&doc_id, &bob.peer_id).await.is_none());
        assert!(!manager.remove_if_empty(&doc_id).await);
    }

    #[tokio::test]
    async fn test_rejoin_before_removal_reuses_live_replica() {
        let manager = RoomManager::new(16, 10);
        let doc_id = Uuid::new_v4();
        let alice = PeerInfo::new("Alice");
        let (room, _rx) = manager.join(doc_id, alice.clone(), empty_doc).await.unwrap().unwrap();
        room.doc().insert(0, "live").unwrap();
        assert!(manager.leave(&doc_id, &alice.peer_id).await.is_some());

        let (again, _rx) = manager
            .join(doc_id, PeerInfo::new("Bob"), || -> Result<Doc, std::convert::Infallible> {
                panic!("room must be reused")
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.doc().text(), "live");
        assert!(!manager.remove_if_empty(&doc_id).await);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_init_creates_no_room() {
        let manager = RoomManager::new(16, 10);
        let doc_id = Uuid::new_v4();
        let joined = manager
            .join(doc_id, PeerInfo::new("a"), || Err::<Doc, _>("unreadable"))
            .await;
        assert_eq!(joined.err(), Some("unreadable"));
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_manager_insert_and_list() {
        let manager = RoomManager::new(16, 10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(manager.insert(a, empty_doc().unwrap()).await);
        assert!(!manager.insert(a, empty_doc().unwrap()).await);
        assert!(manager.insert(b, empty_doc().unwrap()).await);

        let docs = manager.active_documents().await;
        assert!(docs.contains(&a) && docs.contains(&b));
        assert!(manager.get(&a).await.is_some());
    }
}
