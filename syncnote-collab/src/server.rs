//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── Doc replica ── BroadcastGroup
//! Client B ──┘                        │
//!                                     ├── DocumentStore (RocksDB, optional)
//!                                     │       └── Snapshots (LZ4)
//!                                     │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! Handshake for a new connection:
//! ```text
//! client                         server
//!   │ PeerJoined(info) ───────────► │  join room (load snapshot if first)
//!   │ ◄─────────── SyncStep1(sv_s)  │
//!   │ ◄──── PeerJoined(existing..)  │
//!   │ SyncStep1(sv_c) ────────────► │
//!   │ ◄─── SyncStep2(diff for sv_c) │
//!   │ SyncStep2(diff for sv_s) ───► │  merge, relay as Update
//!   │ Update ... ─────────────────► │  merge, relay as Update
//! ```
//!
//! Reference: Kleppmann: Designing Data-Intensive Applications, Chapters 3 & 8

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncnote_core::{Doc, DocError, ReplicaId, Update};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{DocumentRoom, Envelope, RoomManager};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds. A connection silent for three
    /// intervals is closed.
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * 3)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
    pub malformed_frames: u64,
    /// Joins closed because the stored document could not be read
    pub refused_joins: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("document error: {0}")]
    Doc(#[from] DocError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent document store (optional)
    store: Option<Arc<DocumentStore>>,
}

impl SyncServer {
    /// Create a new sync server, opening the snapshot store if configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig::at(path.clone()))?)),
            None => None,
        };
        Ok(Self {
            rooms: Arc::new(RoomManager::new(config.broadcast_capacity, config.max_peers_per_room)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
            config,
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(256, 100)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store: None,
            config: ServerConfig::default(),
        }
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Load every persisted document into a room so it is available before
    /// the first peer reconnects.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let doc_ids = store.list_documents()?;
        let mut recovered = 0;
        for doc_id in &doc_ids {
            let snapshot = match store.load_snapshot(*doc_id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Skipping document {doc_id} during recovery: {e}");
                    continue;
                }
            };
            match Doc::from_snapshot(ReplicaId::random(), &snapshot) {
                Ok(doc) => {
                    if self.rooms.insert(*doc_id, doc).await {
                        recovered += 1;
                        log::info!("Recovered document {doc_id} from storage");
                    }
                }
                Err(e) => log::warn!("Discarding unreadable snapshot for {doc_id}: {e}"),
            }
        }

        self.stats.write().await.active_rooms = self.rooms.room_count().await;
        log::info!("Recovery complete: {recovered}/{} documents restored", doc_ids.len());
        Ok(recovered)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn = Connection {
                addr,
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
                store: self.store.clone(),
                idle_timeout: self.config.idle_timeout(),
                peer: None,
                doc_id: None,
                room: None,
            };
            tokio::spawn(async move {
                if let Err(e) = conn.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    /// Current text of a live room.
    pub async fn document_text(&self, doc_id: &Uuid) -> Option<String> {
        let room = self.rooms.get(doc_id).await?;
        let text = room.doc().text();
        Some(text)
    }
}

/// Room replica for a first joiner: the stored snapshot, or empty when none
/// exists. A snapshot that cannot be read is an error so the room is never
/// started empty and later saved over the stored copy.
fn load_room_doc(store: Option<&DocumentStore>, doc_id: Uuid) -> Result<Doc, ServerError> {
    let Some(store) = store else {
        return Ok(Doc::new());
    };
    match store.load_snapshot(doc_id) {
        Ok(snapshot) => {
            let doc = Doc::from_snapshot(ReplicaId::random(), &snapshot)?;
            log::info!("Loaded persisted snapshot for doc {doc_id}");
            Ok(doc)
        }
        Err(e) if e.is_not_found() => Ok(Doc::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write the room's full state off the runtime threads. Returns whether a
/// snapshot was stored.
async fn persist_room(store: Arc<DocumentStore>, doc_id: Uuid, room: &DocumentRoom) -> bool {
    let _guard = room.persist_guard().await;
    let snapshot = match room.doc().encode_state_as_update() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::error!("Failed to encode snapshot for doc {doc_id}: {e}");
            return false;
        }
    };
    let written = tokio::task::spawn_blocking(move || store.save_snapshot(doc_id, &snapshot)).await;
    match written {
        Ok(Ok(meta)) => {
            log::info!("Persisted snapshot v{} for doc {doc_id} (room closing)", meta.version);
            true
        }
        Ok(Err(e)) => {
            log::error!("Failed to persist snapshot for doc {doc_id}: {e}");
            false
        }
        Err(e) => {
            log::error!("Snapshot write for doc {doc_id} did not complete: {e}");
            false
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

enum Flow {
    Continue,
    Close,
}

/// State of one accepted WebSocket connection.
struct Connection {
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<DocumentStore>>,
    idle_timeout: Duration,
    peer: Option<PeerInfo>,
    doc_id: Option<Uuid>,
    room: Option<Arc<DocumentRoom>>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws_stream.split();
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.event_loop(&mut sink, &mut source).await;
        self.cleanup().await;
        result
    }

    async fn event_loop(
        &mut self,
        sink: &mut WsSink,
        source: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<(), ServerError> {
        let mut broadcast_rx: Option<broadcast::Receiver<Envelope>> = None;
        let mut last_seen = Instant::now();
        let mut idle_check = tokio::time::interval(self.idle_timeout / 3);

        loop {
            tokio::select! {
                incoming = source.next() => {
                    last_seen = Instant::now();
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let msg = match SyncMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    self.malformed(&e.to_string()).await;
                                    break;
                                }
                            };
                            match self.handle_frame(sink, msg, &data, &mut broadcast_rx).await? {
                                Flow::Continue => {}
                                Flow::Close => break,
                            }
                        }
                        Some(Ok(Message::Text(_))) => {
                            self.malformed("text frame on a binary protocol").await;
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                outgoing = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match outgoing {
                        Ok(env) => {
                            if Some(env.sender) == self.peer_id() {
                                continue;
                            }
                            sink.send(Message::Binary(env.bytes.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {:?} lagged by {n} messages, resending full state", self.peer_id());
                            if let Some(room) = &self.room {
                                room.group.record_dropped(n);
                            }
                            self.resend_full_state(sink).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = idle_check.tick() => {
                    if last_seen.elapsed() > self.idle_timeout {
                        log::info!("Closing idle connection from {}", self.addr);
                        break;
                    }
                }
            }
        }

        let _ = sink.close().await;
        Ok(())
    }

    fn peer_id(&self) -> Option<Uuid> {
        self.peer.as_ref().map(|p| p.peer_id)
    }

    async fn malformed(&self, reason: &str) {
        log::warn!("Malformed frame from {}: {reason}; closing", self.addr);
        self.stats.write().await.malformed_frames += 1;
    }

    async fn send(&self, sink: &mut WsSink, msg: &SyncMessage) -> Result<(), ServerError> {
        sink.send(Message::Binary(msg.encode()?.into())).await?;
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        sink: &mut WsSink,
        msg: SyncMessage,
        raw: &[u8],
        broadcast_rx: &mut Option<broadcast::Receiver<Envelope>>,
    ) -> Result<Flow, ServerError> {
        match msg.msg_type {
            MessageType::Ping => {
                self.send(sink, &SyncMessage::pong(Uuid::nil())).await?;
                return Ok(Flow::Continue);
            }
            MessageType::Pong => return Ok(Flow::Continue),
            MessageType::PeerJoined => return self.join(sink, msg, broadcast_rx).await,
            _ => {}
        }

        let (Some(peer_id), Some(doc_id), Some(room)) = (self.peer_id(), self.doc_id, self.room.clone()) else {
            log::debug!("Ignoring {:?} from {} before PeerJoined", msg.msg_type, self.addr);
            return Ok(Flow::Continue);
        };
        if msg.peer_id != peer_id || msg.doc_id != doc_id {
            log::warn!("Frame from {} names peer {} / doc {}; ignoring", self.addr, msg.peer_id, msg.doc_id);
            return Ok(Flow::Continue);
        }

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let sv = match msg.state_vector() {
                    Ok(sv) => sv,
                    Err(e) => {
                        self.malformed(&e.to_string()).await;
                        return Ok(Flow::Close);
                    }
                };
                let diff = room.doc().encode_diff(&sv)?;
                log::debug!("Answering SyncStep1 from {peer_id} with {} byte diff", diff.len());
                self.send(sink, &SyncMessage::sync_step2(Uuid::nil(), doc_id, diff)).await?;
            }

            MessageType::SyncStep2 | MessageType::Update => {
                let update = match Update::decode(&msg.payload) {
                    Ok(update) => update,
                    Err(e) => {
                        self.malformed(&e.to_string()).await;
                        return Ok(Flow::Close);
                    }
                };
                if update.is_empty() {
                    return Ok(Flow::Continue);
                }
                let applied = room.doc().apply_update(&msg.payload);
                match applied {
                    Ok(()) => {}
                    Err(e) if e.is_causal_gap() => log::debug!("Room {doc_id}: {e}"),
                    Err(e) => {
                        self.malformed(&e.to_string()).await;
                        return Ok(Flow::Close);
                    }
                }
                room.group
                    .broadcast(&SyncMessage::update(peer_id, doc_id, msg.clock, msg.payload))?;
            }

            MessageType::Awareness => {
                if let Err(e) = msg.awareness_state() {
                    self.malformed(&e.to_string()).await;
                    return Ok(Flow::Close);
                }
                log::trace!("Presence update from {peer_id} in room {doc_id}");
                room.group.broadcast_raw(peer_id, Arc::new(raw.to_vec()));
            }

            MessageType::PeerLeft => {
                log::info!("Peer {peer_id} left doc {doc_id}");
                return Ok(Flow::Close);
            }

            MessageType::Ping | MessageType::Pong | MessageType::PeerJoined => {}
        }
        Ok(Flow::Continue)
    }

    async fn join(
        &mut self,
        sink: &mut WsSink,
        msg: SyncMessage,
        broadcast_rx: &mut Option<broadcast::Receiver<Envelope>>,
    ) -> Result<Flow, ServerError> {
        if self.room.is_some() {
            log::warn!("Duplicate PeerJoined from {}; ignoring", self.addr);
            return Ok(Flow::Continue);
        }
        let info = match msg.peer_info() {
            Ok(info) => info,
            Err(e) => {
                self.malformed(&e.to_string()).await;
                return Ok(Flow::Close);
            }
        };
        let doc_id = msg.doc_id;

        let store = self.store.clone();
        let joined = self
            .rooms
            .join(doc_id, info.clone(), || load_room_doc(store.as_deref(), doc_id))
            .await;
        let joined = match joined {
            Ok(joined) => joined,
            Err(e) => {
                log::error!("Refusing {} on doc {doc_id}: stored state unreadable: {e}", info.peer_id);
                self.stats.write().await.refused_joins += 1;
                return Ok(Flow::Close);
            }
        };
        let Some((room, rx)) = joined else {
            log::warn!("Room {doc_id} is full; rejecting {}", info.peer_id);
            return Ok(Flow::Close);
        };
        *broadcast_rx = Some(rx);
        self.peer = Some(info.clone());
        self.doc_id = Some(doc_id);
        self.room = Some(room.clone());

        let step1 = {
            let doc = room.doc();
            SyncMessage::sync_step1(Uuid::nil(), doc_id, &doc.encode_state_vector())?
        };
        self.send(sink, &step1).await?;

        for existing in room.group.peers().await {
            if existing.peer_id != info.peer_id {
                self.send(sink, &SyncMessage::peer_joined(doc_id, &existing)?).await?;
            }
        }
        room.group.broadcast(&SyncMessage::peer_joined(doc_id, &info)?)?;

        self.stats.write().await.active_rooms = self.rooms.room_count().await;
        log::info!("Peer {} ({}) joined doc {doc_id}", info.name, info.peer_id);
        Ok(Flow::Continue)
    }

    async fn resend_full_state(&self, sink: &mut WsSink) -> Result<(), ServerError> {
        let (Some(doc_id), Some(room)) = (self.doc_id, &self.room) else {
            return Ok(());
        };
        let state = room.doc().encode_state_as_update()?;
        self.send(sink, &SyncMessage::update(Uuid::nil(), doc_id, 0, state)).await
    }

    async fn cleanup(&mut self) {
        if let (Some(peer_id), Some(doc_id), Some(room)) = (self.peer_id(), self.doc_id, self.room.take()) {
            if let Err(e) = room.group.broadcast(&SyncMessage::peer_left(peer_id, doc_id)) {
                log::warn!("Failed to announce departure of {peer_id}: {e}");
            }
            drop(room);

            let mut saved = false;
            let mut removed = false;
            if let Some(room) = self.rooms.leave(&doc_id, &peer_id).await {
                if let Some(store) = self.store.clone() {
                    saved = persist_room(store, doc_id, &room).await;
                }
                removed = self.rooms.remove_if_empty(&doc_id).await;
            }
            if removed {
                log::info!("Room {doc_id} removed (empty)");
            }

            let mut s = self.stats.write().await;
            if saved {
                s.persisted_snapshots += 1;
            }
            s.active_rooms = self.rooms.room_count().await;
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
        assert_eq!(config.idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_room: 50,
            broadcast_capacity: 512,
            heartbeat_interval_secs: 15,
            storage_path: None,
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert!(server.store().is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_recovery_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let doc_id = Uuid::new_v4();

        {
            let store = DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap();
            let mut doc = Doc::with_replica(ReplicaId(1));
            doc.insert(0, "Hello, persistence!").unwrap();
            store.save_snapshot(doc_id, &doc.encode_state_as_update().unwrap()).unwrap();
        }

        let server = SyncServer::with_storage("127.0.0.1:0", &db_path).unwrap();
        assert_eq!(server.recover().await.unwrap(), 1);
        assert_eq!(server.document_text(&doc_id).await.as_deref(), Some("Hello, persistence!"));
        assert_eq!(server.stats().await.active_rooms, 1);
    }

    #[test]
    fn test_load_room_doc_rejects_unreadable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let doc_id = Uuid::new_v4();

        assert!(load_room_doc(Some(&store), doc_id).unwrap().is_empty());
        assert!(load_room_doc(None, doc_id).unwrap().is_empty());

        store.save_snapshot(doc_id, b"not an update").unwrap();
        assert!(matches!(load_room_doc(Some(&store), doc_id), Err(ServerError::Doc(_))));
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_refuses_join_and_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let doc_id = Uuid::new_v4();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_snapshot(doc_id, b"not an update").unwrap();
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = Arc::new(SyncServer::with_storage("127.0.0.1:0", &path).unwrap());
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let join = SyncMessage::peer_joined(doc_id, &PeerInfo::new("Alice")).unwrap();
        ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "join on an unreadable document was accepted");

        let stats = server.stats().await;
        assert_eq!(stats.refused_joins, 1);
        assert_eq!(stats.persisted_snapshots, 0);
        assert_eq!(server.rooms().room_count().await, 0);
        let stored = server.store().unwrap().load_snapshot(doc_id).unwrap();
        assert_eq!(stored, b"not an update");
    }

    #[tokio::test]
    async fn test_persist_room_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let doc_id = Uuid::new_v4();
        let room = DocumentRoom::new(Doc::with_replica(ReplicaId(4)), 8);
        room.doc().insert(0, "saved on close").unwrap();

        assert!(persist_room(store.clone(), doc_id, &room).await);
        let restored = Doc::from_snapshot(ReplicaId(5), &store.load_snapshot(doc_id).unwrap()).unwrap();
        assert_eq!(restored.text(), "saved on close");
    }
}
