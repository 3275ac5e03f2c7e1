//! WebSocket sync client for one document.
//!
//! Provides:
//! - Connection lifecycle with a reconnect loop and capped exponential backoff
//! - State-vector handshake on every (re)connect
//! - Update and awareness send/receive
//! - Offline queue for edits made while disconnected
//!
//! ```text
//!  Disconnected ─connect()─► Connecting ─ws open─► Connected ─SyncStep2─► (synced)
//!        ▲                        │                    │
//!        │                        └──── failure ───────┤
//!        │                                             ▼
//!   disconnect() ◄──────────────────────────────── Reconnecting (backoff)
//! ```
//!
//! Reference: Kleppmann, Chapter 5: Replication

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use syncnote_core::{Doc, DocError, StateVector, Update};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{AwarenessState, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base WebSocket URL; the document id is appended as a path segment
    pub server_url: String,
    /// Maximum number of updates held while offline
    pub offline_queue_capacity: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long to wait for `SyncStep2` before asking for the full state
    pub sync_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Buffered events before the connection task waits on the consumer
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            offline_queue_capacity: 10_000,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            sync_timeout_ms: 5_000,
            heartbeat_interval_secs: 15,
            event_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// WebSocket established, handshake started
    Connected,
    /// Connection lost
    Disconnected,
    /// First `SyncStep2` of this connection arrived and was forwarded
    Synced,
    /// Update to merge into the local replica
    RemoteUpdate { peer_id: Uuid, update: Vec<u8> },
    RemoteAwareness {
        peer_id: Uuid,
        clock: u64,
        state: AwarenessState,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("offline queue is full")]
    QueueFull,

    #[error("local replica error: {0}")]
    Replica(#[from] DocError),
}

/// Read access to the local replica, needed to answer the handshake.
#[async_trait]
pub trait LocalReplica: Send + Sync {
    async fn state_vector(&self) -> StateVector;

    async fn encode_diff(&self, remote: &StateVector) -> Result<Vec<u8>, DocError>;
}

#[async_trait]
impl LocalReplica for std::sync::Mutex<Doc> {
    async fn state_vector(&self) -> StateVector {
        self.lock().unwrap_or_else(PoisonError::into_inner).encode_state_vector()
    }

    async fn encode_diff(&self, remote: &StateVector) -> Result<Vec<u8>, DocError> {
        self.lock().unwrap_or_else(PoisonError::into_inner).encode_diff(remote)
    }
}

/// Offline queue for edits made while disconnected.
///
/// Queued updates are replayed after the next handshake.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    /// Drain all queued updates in send order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    /// Drain everything as one merged update, or `None` if empty.
    pub fn drain_merged(&mut self) -> Result<Option<Vec<u8>>, DocError> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let payloads: Vec<Vec<u8>> = self.queue.drain(..).map(|u| u.payload).collect();
        Update::merge_encoded(&payloads).map(Some)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// Exponential reconnect delay: doubles per attempt, capped, reset after a
/// successful handshake.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Shared {
    config: ClientConfig,
    peer: PeerInfo,
    doc_id: Uuid,
    state: RwLock<ConnectionState>,
    clock: AtomicU64,
    offline_queue: Mutex<OfflineQueue>,
    /// Writer side of the live connection, if any
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    events: mpsc::Sender<SyncEvent>,
}

impl Shared {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn emit(&self, event: SyncEvent) {
        if self.events.send(event).await.is_err() {
            log::trace!("Sync event dropped: receiver gone");
        }
    }
}

enum Ended {
    Shutdown,
    Dropped,
}

/// The sync client.
pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, peer_info: PeerInfo, doc_id: Uuid) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                offline_queue: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
                config,
                peer: peer_info,
                doc_id,
                state: RwLock::new(ConnectionState::Disconnected),
                clock: AtomicU64::new(0),
                outgoing: Mutex::new(None),
                events,
            }),
            event_rx: Some(event_rx),
            shutdown,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start the reconnect loop in a background task.
    pub fn connect<R>(&self, replica: Arc<R>)
    where
        R: LocalReplica + ?Sized + 'static,
    {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            log::debug!("Sync client for {} already running", self.shared.doc_id);
            return;
        }
        self.shutdown.send_replace(false);
        let shared = self.shared.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(run_loop(shared, replica, shutdown)));
    }

    /// Run the reconnect loop on the current task until `disconnect`.
    pub async fn run<R>(&self, replica: Arc<R>)
    where
        R: LocalReplica + ?Sized + 'static,
    {
        run_loop(self.shared.clone(), replica, self.shutdown.subscribe()).await;
    }

    /// Stop the reconnect loop, announcing departure if connected.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Sync task ended abnormally: {e}");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Send an update, or queue it while offline.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError> {
        let clock = self.shared.clock.fetch_add(1, Ordering::Relaxed) + 1;

        let sender = if *self.shared.state.read().await == ConnectionState::Connected {
            self.shared.outgoing.lock().await.clone()
        } else {
            None
        };
        let update = match sender {
            Some(tx) => {
                let msg = SyncMessage::update(self.shared.peer.peer_id, self.shared.doc_id, clock, update);
                let encoded = msg.encode()?;
                match tx.send(encoded).await {
                    Ok(()) => return Ok(()),
                    Err(_) => msg.payload,
                }
            }
            None => update,
        };

        let mut queue = self.shared.offline_queue.lock().await;
        if !queue.enqueue(clock, update) {
            return Err(TransportError::QueueFull);
        }
        log::trace!("Queued offline update #{clock} ({} pending)", queue.len());
        Ok(())
    }

    /// Send an awareness update. Dropped silently while offline.
    pub async fn send_awareness(&self, clock: u64, state: &AwarenessState) -> Result<(), TransportError> {
        if *self.shared.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let Some(tx) = self.shared.outgoing.lock().await.clone() else {
            return Ok(());
        };
        let msg = SyncMessage::awareness(self.shared.peer.peer_id, self.shared.doc_id, clock, state)?;
        if tx.send(msg.encode()?).await.is_err() {
            log::trace!("Awareness dropped: connection closing");
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.shared.peer
    }

    pub fn doc_id(&self) -> Uuid {
        self.shared.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.shared.config.server_url
    }

    /// Number of updates sent so far, queued ones included.
    pub fn clock(&self) -> u64 {
        self.shared.clock.load(Ordering::Relaxed)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.offline_queue.lock().await.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_loop<R>(shared: Arc<Shared>, replica: Arc<R>, mut shutdown: watch::Receiver<bool>)
where
    R: LocalReplica + ?Sized,
{
    let config = &shared.config;
    let mut backoff = Backoff::new(
        Duration::from_millis(config.initial_backoff_ms),
        Duration::from_millis(config.max_backoff_ms),
    );
    let mut first_attempt = true;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared
            .set_state(if first_attempt {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            })
            .await;
        first_attempt = false;

        let result = connect_once(&shared, replica.as_ref(), &mut shutdown, &mut backoff).await;
        let was_connected = shared.outgoing.lock().await.take().is_some();
        if was_connected {
            shared.emit(SyncEvent::Disconnected).await;
        }
        match result {
            Ok(Ended::Shutdown) => break,
            Ok(Ended::Dropped) => log::info!("Connection for doc {} dropped", shared.doc_id),
            Err(e) => log::warn!("Sync session for doc {} failed: {e}", shared.doc_id),
        }

        shared.set_state(ConnectionState::Reconnecting).await;
        let delay = backoff.next();
        log::debug!("Reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected).await;
}

async fn connect_once<R>(
    shared: &Shared,
    replica: &R,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<Ended, TransportError>
where
    R: LocalReplica + ?Sized,
{
    let url = format!("{}/{}", shared.config.server_url.trim_end_matches('/'), shared.doc_id);
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();
    log::info!("Connected to {url}");

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
    *shared.outgoing.lock().await = Some(out_tx);
    shared.set_state(ConnectionState::Connected).await;
    shared.emit(SyncEvent::Connected).await;

    let peer_id = shared.peer.peer_id;
    let doc_id = shared.doc_id;
    let send = |msg: &SyncMessage| -> Result<Message, TransportError> { Ok(Message::Binary(msg.encode()?.into())) };

    sink.send(send(&SyncMessage::peer_joined(doc_id, &shared.peer)?)?)
        .await
        .map_err(closed)?;
    let sv = replica.state_vector().await;
    sink.send(send(&SyncMessage::sync_step1(peer_id, doc_id, &sv)?)?)
        .await
        .map_err(closed)?;

    let sync_timeout = Duration::from_millis(shared.config.sync_timeout_ms);
    let sync_deadline = tokio::time::sleep(sync_timeout);
    tokio::pin!(sync_deadline);
    let mut synced = false;

    let heartbeat_period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                sink.send(send(&SyncMessage::peer_left(peer_id, doc_id))?).await.map_err(closed)?;
                let _ = sink.close().await;
                return Ok(Ended::Shutdown);
            }

            Some(bytes) = out_rx.recv() => {
                sink.send(Message::Binary(bytes.into())).await.map_err(closed)?;
            }

            _ = &mut sync_deadline, if !synced => {
                log::warn!("No SyncStep2 within {sync_timeout:?}; requesting full state");
                sink.send(send(&SyncMessage::sync_step1(peer_id, doc_id, &StateVector::new())?)?)
                    .await
                    .map_err(closed)?;
                sync_deadline.as_mut().reset(tokio::time::Instant::now() + sync_timeout);
            }

            _ = heartbeat.tick() => {
                sink.send(send(&SyncMessage::ping(peer_id))?).await.map_err(closed)?;
            }

            frame = stream.next() => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(_))) => {
                        return Err(TransportError::MalformedFrame("text frame on a binary protocol".into()));
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Ended::Dropped),
                    Some(Err(e)) => return Err(closed(e)),
                    Some(Ok(_)) => continue,
                };
                let msg = SyncMessage::decode(&data).map_err(|e| TransportError::MalformedFrame(e.to_string()))?;

                match msg.msg_type {
                    MessageType::SyncStep1 => {
                        let remote_sv = msg.state_vector().map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
                        let diff = replica.encode_diff(&remote_sv).await?;
                        sink.send(send(&SyncMessage::sync_step2(peer_id, doc_id, diff))?).await.map_err(closed)?;
                    }
                    MessageType::SyncStep2 => {
                        shared.emit(SyncEvent::RemoteUpdate { peer_id: msg.peer_id, update: msg.payload }).await;
                        if !synced {
                            synced = true;
                            backoff.reset();
                            shared.emit(SyncEvent::Synced).await;
                            let queued = shared.offline_queue.lock().await.drain_merged()?;
                            if let Some(update) = queued {
                                log::info!("Replaying {} bytes of offline edits", update.len());
                                let clock = shared.clock.load(Ordering::Relaxed);
                                sink.send(send(&SyncMessage::update(peer_id, doc_id, clock, update))?)
                                    .await
                                    .map_err(closed)?;
                            }
                        }
                    }
                    MessageType::Update => {
                        if msg.peer_id != peer_id {
                            shared.emit(SyncEvent::RemoteUpdate { peer_id: msg.peer_id, update: msg.payload }).await;
                        }
                    }
                    MessageType::Awareness => {
                        let state = msg.awareness_state().map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
                        if msg.peer_id != peer_id {
                            shared.emit(SyncEvent::RemoteAwareness { peer_id: msg.peer_id, clock: msg.clock, state }).await;
                        }
                    }
                    MessageType::PeerJoined => {
                        let info = msg.peer_info().map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
                        if info.peer_id != peer_id {
                            shared.emit(SyncEvent::PeerJoined(info)).await;
                        }
                    }
                    MessageType::PeerLeft => shared.emit(SyncEvent::PeerLeft(msg.peer_id)).await,
                    MessageType::Ping => {
                        sink.send(send(&SyncMessage::pong(peer_id))?).await.map_err(closed)?;
                    }
                    MessageType::Pong => log::trace!("Pong from server"),
                }
            }
        }
    }
}

fn closed(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Closed(e.to_string())
}
