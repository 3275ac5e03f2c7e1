//! One open document on a client.
//!
//! ```text
//!   UI edits ─┐                        ┌──► AutoSave ──► StateBackend
//!   AI pump ──┼──► DocHandle queue ──► Doc + Overlay
//!   remote ───┘        (one task)      └──► SyncClient ──► relay
//! ```
//!
//! The document and its overlay live inside a single task. Everything that
//! touches them is a command on that task's queue, so a local edit, a remote
//! merge and an overlay commit are never interleaved.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use syncnote_core::{Anchor, Doc, DocError, DocEvent, Origin, ReplicaId, StateVector, SubscriptionId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::awareness::Awareness;
use crate::client::{ClientConfig, LocalReplica, SyncClient, SyncEvent, TransportError};
use crate::overlay::{
    Overlay, OverlayError, OverlayEvent, OverlayHooks, OverlayPhase, OverlayTarget, OverlayView, ProvisionalEdit,
};
use crate::persistence::{decode_state, AutoSave, AutoSaveConfig, PersistenceError, SnapshotSource, StateBackend};
use crate::protocol::{AwarenessState, PeerInfo};

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("input is locked while a provisional edit is active")]
    InputLocked,

    #[error("document session is closed")]
    Closed,

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What an AI text stream yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiStreamEvent {
    Chunk(String),
    Done,
    Error(String),
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;
type DocObserver = Box<dyn FnMut(&DocEvent) + Send>;
type OverlayObserver = Box<dyn FnMut(&OverlayEvent) + Send>;

enum DocCommand {
    Insert { index: usize, text: String, reply: Reply<Vec<u8>> },
    Delete { index: usize, len: usize, reply: Reply<Vec<u8>> },
    ApplyRemote { update: Vec<u8>, reply: Reply<()> },
    Text(oneshot::Sender<String>),
    StateVector(oneshot::Sender<StateVector>),
    Diff { remote: StateVector, reply: Reply<Vec<u8>> },
    Snapshot(Reply<Vec<u8>>),
    AnchorAt { index: usize, reply: Reply<Anchor> },
    Resolve { anchor: Anchor, reply: oneshot::Sender<Option<usize>> },
    Observe { callback: DocObserver, reply: oneshot::Sender<SubscriptionId> },

    BeginOverlay { target: OverlayTarget, hooks: Arc<dyn OverlayHooks>, reply: Reply<()> },
    DeferOverlayCleanup(Box<dyn FnOnce() + Send>),
    OverlayChunk(String),
    OverlayDone,
    OverlayFailed(String),
    AcceptOverlay(Reply<Vec<u8>>),
    RejectOverlay(Reply<ProvisionalEdit>),
    CancelOverlay(oneshot::Sender<Option<ProvisionalEdit>>),
    OverlayPhase(oneshot::Sender<OverlayPhase>),
    OverlayView(oneshot::Sender<Option<OverlayView>>),
    ObserveOverlay { callback: OverlayObserver, reply: oneshot::Sender<SubscriptionId> },
}

/// Cloneable handle to the task that owns a document.
#[derive(Clone)]
pub struct DocHandle {
    doc_id: Uuid,
    tx: mpsc::Sender<DocCommand>,
    input_locked: Arc<AtomicBool>,
}

impl DocHandle {
    /// Move `doc` into a new owner task.
    pub fn spawn(doc_id: Uuid, doc: Doc) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let input_locked = Arc::new(AtomicBool::new(false));
        let owner = DocOwner {
            doc_id,
            doc,
            overlay: Overlay::new(doc_id),
            input_locked: input_locked.clone(),
        };
        let task = tokio::spawn(owner.run(rx));
        (
            Self {
                doc_id,
                tx,
                input_locked,
            },
            task,
        )
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn is_input_locked(&self) -> bool {
        self.input_locked.load(Ordering::SeqCst)
    }

    pub async fn insert(&self, index: usize, text: impl Into<String>) -> Result<Vec<u8>, SessionError> {
        let text = text.into();
        self.call(|reply| DocCommand::Insert { index, text, reply }).await
    }

    pub async fn delete(&self, index: usize, len: usize) -> Result<Vec<u8>, SessionError> {
        self.call(|reply| DocCommand::Delete { index, len, reply }).await
    }

    /// Merge an update received from the network.
    pub async fn apply_remote(&self, update: Vec<u8>) -> Result<(), SessionError> {
        self.call(|reply| DocCommand::ApplyRemote { update, reply }).await
    }

    pub async fn text(&self) -> Result<String, SessionError> {
        self.ask(DocCommand::Text).await
    }

    pub async fn state_vector(&self) -> Result<StateVector, SessionError> {
        self.ask(DocCommand::StateVector).await
    }

    pub async fn encode_diff(&self, remote: StateVector) -> Result<Vec<u8>, SessionError> {
        self.call(|reply| DocCommand::Diff { remote, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>, SessionError> {
        self.call(DocCommand::Snapshot).await
    }

    pub async fn anchor_at(&self, index: usize) -> Result<Anchor, SessionError> {
        self.call(|reply| DocCommand::AnchorAt { index, reply }).await
    }

    pub async fn resolve_anchor(&self, anchor: Anchor) -> Result<Option<usize>, SessionError> {
        self.ask(|reply| DocCommand::Resolve { anchor, reply }).await
    }

    /// Register a document observer. It runs on the owner task.
    pub async fn observe<F>(&self, callback: F) -> Result<SubscriptionId, SessionError>
    where
        F: FnMut(&DocEvent) + Send + 'static,
    {
        let callback: DocObserver = Box::new(callback);
        self.ask(|reply| DocCommand::Observe { callback, reply }).await
    }

    pub async fn begin_overlay(&self, target: OverlayTarget, hooks: Arc<dyn OverlayHooks>) -> Result<(), SessionError> {
        self.call(|reply| DocCommand::BeginOverlay { target, hooks, reply }).await
    }

    /// Tie `cleanup` to the active overlay; runs now when none is active.
    pub async fn defer_overlay_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) -> Result<(), SessionError> {
        self.post(DocCommand::DeferOverlayCleanup(Box::new(cleanup))).await
    }

    pub async fn push_overlay_chunk(&self, delta: impl Into<String>) -> Result<(), SessionError> {
        self.post(DocCommand::OverlayChunk(delta.into())).await
    }

    pub async fn finish_overlay_stream(&self) -> Result<(), SessionError> {
        self.post(DocCommand::OverlayDone).await
    }

    pub async fn fail_overlay(&self, error: impl Into<String>) -> Result<(), SessionError> {
        self.post(DocCommand::OverlayFailed(error.into())).await
    }

    pub async fn accept_overlay(&self) -> Result<Vec<u8>, SessionError> {
        self.call(DocCommand::AcceptOverlay).await
    }

    pub async fn reject_overlay(&self) -> Result<ProvisionalEdit, SessionError> {
        self.call(DocCommand::RejectOverlay).await
    }

    pub async fn cancel_overlay(&self) -> Result<Option<ProvisionalEdit>, SessionError> {
        self.ask(DocCommand::CancelOverlay).await
    }

    pub async fn overlay_phase(&self) -> Result<OverlayPhase, SessionError> {
        self.ask(DocCommand::OverlayPhase).await
    }

    pub async fn overlay_view(&self) -> Result<Option<OverlayView>, SessionError> {
        self.ask(DocCommand::OverlayView).await
    }

    pub async fn observe_overlay<F>(&self, callback: F) -> Result<SubscriptionId, SessionError>
    where
        F: FnMut(&OverlayEvent) + Send + 'static,
    {
        let callback: OverlayObserver = Box::new(callback);
        self.ask(|reply| DocCommand::ObserveOverlay { callback, reply }).await
    }

    async fn post(&self, command: DocCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> DocCommand) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(command(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> DocCommand) -> Result<T, SessionError> {
        self.ask(command).await?
    }
}

#[async_trait]
impl LocalReplica for DocHandle {
    async fn state_vector(&self) -> StateVector {
        match DocHandle::state_vector(self).await {
            Ok(sv) => sv,
            Err(e) => {
                log::warn!("No state vector for {}: {e}", self.doc_id);
                StateVector::new()
            }
        }
    }

    async fn encode_diff(&self, remote: &StateVector) -> Result<Vec<u8>, DocError> {
        DocHandle::encode_diff(self, remote.clone()).await.map_err(into_doc_error)
    }
}

#[async_trait]
impl SnapshotSource for DocHandle {
    async fn snapshot(&self) -> Result<Vec<u8>, DocError> {
        DocHandle::snapshot(self).await.map_err(into_doc_error)
    }
}

fn into_doc_error(e: SessionError) -> DocError {
    match e {
        SessionError::Doc(e) => e,
        e => DocError::Encode(e.to_string()),
    }
}

struct DocOwner {
    doc_id: Uuid,
    doc: Doc,
    overlay: Overlay,
    input_locked: Arc<AtomicBool>,
}

impl DocOwner {
    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        // Last handle gone: release whatever the overlay still holds.
        self.overlay.cancel();
        log::debug!("Document task for {} stopped", self.doc_id);
    }

    fn check_input(&self) -> Result<(), SessionError> {
        if self.input_locked.load(Ordering::SeqCst) {
            return Err(SessionError::InputLocked);
        }
        Ok(())
    }

    fn handle(&mut self, command: DocCommand) {
        match command {
            DocCommand::Insert { index, text, reply } => {
                let result = self
                    .check_input()
                    .and_then(|()| self.doc.insert(index, &text).map_err(Into::into));
                let _ = reply.send(result);
            }
            DocCommand::Delete { index, len, reply } => {
                let result = self
                    .check_input()
                    .and_then(|()| self.doc.delete(index, len).map_err(Into::into));
                let _ = reply.send(result);
            }
            DocCommand::ApplyRemote { update, reply } => {
                let result = self.doc.apply_update_with_origin(&update, Origin::Remote);
                let _ = reply.send(result.map_err(Into::into));
            }
            DocCommand::Text(reply) => {
                let _ = reply.send(self.doc.text());
            }
            DocCommand::StateVector(reply) => {
                let _ = reply.send(self.doc.encode_state_vector());
            }
            DocCommand::Diff { remote, reply } => {
                let _ = reply.send(self.doc.encode_diff(&remote).map_err(Into::into));
            }
            DocCommand::Snapshot(reply) => {
                let _ = reply.send(self.doc.encode_state_as_update().map_err(Into::into));
            }
            DocCommand::AnchorAt { index, reply } => {
                let _ = reply.send(self.doc.anchor_at(index).map_err(Into::into));
            }
            DocCommand::Resolve { anchor, reply } => {
                let _ = reply.send(self.doc.resolve_anchor(&anchor));
            }
            DocCommand::Observe { callback, reply } => {
                let _ = reply.send(self.doc.observe(callback));
            }
            DocCommand::BeginOverlay { target, hooks, reply } => {
                let result = self.overlay.begin(&self.doc, target, hooks);
                let _ = reply.send(result.map_err(Into::into));
            }
            DocCommand::DeferOverlayCleanup(cleanup) => self.overlay.defer(cleanup),
            DocCommand::OverlayChunk(delta) => {
                if let Err(e) = self.overlay.push_chunk(&delta) {
                    log::debug!("AI chunk ignored: {e}");
                }
            }
            DocCommand::OverlayDone => {
                if let Err(e) = self.overlay.finish_stream() {
                    log::debug!("AI stream end ignored: {e}");
                }
            }
            DocCommand::OverlayFailed(error) => {
                if self.overlay.phase() == OverlayPhase::Streaming {
                    let _ = self.overlay.fail(error);
                }
            }
            DocCommand::AcceptOverlay(reply) => {
                let _ = reply.send(self.overlay.accept(&mut self.doc).map_err(Into::into));
            }
            DocCommand::RejectOverlay(reply) => {
                let _ = reply.send(self.overlay.reject().map_err(Into::into));
            }
            DocCommand::CancelOverlay(reply) => {
                let _ = reply.send(self.overlay.cancel());
            }
            DocCommand::OverlayPhase(reply) => {
                let _ = reply.send(self.overlay.phase());
            }
            DocCommand::OverlayView(reply) => {
                let _ = reply.send(self.overlay.view(&self.doc));
            }
            DocCommand::ObserveOverlay { callback, reply } => {
                let _ = reply.send(self.overlay.observe(callback));
            }
        }
    }
}

/// Overlay side effects for a session: input lock flag and autosave pause.
struct SessionHooks {
    input_locked: Arc<AtomicBool>,
    autosave: Arc<AutoSave>,
}

impl OverlayHooks for SessionHooks {
    fn lock_input(&self) {
        self.input_locked.store(true, Ordering::SeqCst);
    }

    fn unlock_input(&self) {
        self.input_locked.store(false, Ordering::SeqCst);
    }

    fn pause_persistence(&self) {
        self.autosave.pause();
    }

    fn resume_persistence(&self) {
        self.autosave.resume();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name announced to other peers
    pub peer_name: String,
    pub autosave: AutoSaveConfig,
    /// Relay connection; `None` keeps the session offline
    pub client: Option<ClientConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_name: "anonymous".to_string(),
            autosave: AutoSaveConfig::default(),
            client: None,
        }
    }
}

struct Transport {
    client: Arc<SyncClient>,
    pumps: Vec<JoinHandle<()>>,
}

/// An open document: replica task, autosave, optional relay connection and
/// the AI overlay.
pub struct DocumentSession {
    doc_id: Uuid,
    handle: DocHandle,
    doc_task: Option<JoinHandle<()>>,
    autosave: Arc<AutoSave>,
    hooks: Arc<SessionHooks>,
    awareness: Arc<Mutex<Awareness>>,
    peer: PeerInfo,
    transport: Option<Transport>,
    ai_pump: Option<AbortHandle>,
}

impl DocumentSession {
    /// Load the document from `backend` and start its tasks.
    pub async fn open<B>(config: SessionConfig, doc_id: Uuid, backend: Arc<B>) -> Result<Self, SessionError>
    where
        B: StateBackend + ?Sized + 'static,
    {
        let baseline = backend.load(doc_id).await?;
        let mut doc = Doc::with_replica(ReplicaId::random());
        if let Some(state) = &baseline {
            let snapshot = decode_state(state)?;
            doc.apply_update_with_origin(&snapshot, Origin::Bootstrap)?;
            log::info!("Opened {doc_id} from {} bytes of stored state", snapshot.len());
        } else {
            log::info!("Opened {doc_id} as a new document");
        }

        let (handle, doc_task) = DocHandle::spawn(doc_id, doc);
        let autosave = Arc::new(AutoSave::spawn(
            doc_id,
            Arc::new(handle.clone()),
            backend,
            config.autosave.clone(),
            baseline,
        ));
        handle.observe(autosave.observer()).await?;

        let hooks = Arc::new(SessionHooks {
            input_locked: handle.input_locked.clone(),
            autosave: autosave.clone(),
        });
        let peer = PeerInfo::new(config.peer_name.clone());
        let mut presence = Awareness::new(peer.peer_id);
        presence.set_local(AwarenessState::for_peer(&peer));
        let awareness = Arc::new(Mutex::new(presence));

        let transport = match config.client {
            Some(client_config) => Some(start_transport(client_config, &peer, &handle, &awareness).await?),
            None => None,
        };

        Ok(Self {
            doc_id,
            handle,
            doc_task: Some(doc_task),
            autosave,
            hooks,
            awareness,
            peer,
            transport,
            ai_pump: None,
        })
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn autosave(&self) -> &AutoSave {
        &self.autosave
    }

    pub fn client(&self) -> Option<&SyncClient> {
        self.transport.as_ref().map(|t| t.client.as_ref())
    }

    pub fn awareness(&self) -> MutexGuard<'_, Awareness> {
        lock(&self.awareness)
    }

    pub async fn insert(&self, index: usize, text: impl Into<String>) -> Result<Vec<u8>, SessionError> {
        self.handle.insert(index, text).await
    }

    pub async fn delete(&self, index: usize, len: usize) -> Result<Vec<u8>, SessionError> {
        self.handle.delete(index, len).await
    }

    pub async fn text(&self) -> Result<String, SessionError> {
        self.handle.text().await
    }

    pub fn is_input_locked(&self) -> bool {
        self.handle.is_input_locked()
    }

    /// Move the local cursor and tell the other peers.
    pub async fn set_cursor(&self, index: usize) -> Result<(), SessionError> {
        let anchor = self.handle.anchor_at(index).await?;
        let mut state = AwarenessState::for_peer(&self.peer);
        state.cursor = Some(anchor);
        let clock = self.awareness().set_local(state.clone());
        if let Some(transport) = &self.transport {
            transport.client.send_awareness(clock, &state).await?;
        }
        Ok(())
    }

    /// Current cursor offsets of the other peers.
    pub async fn remote_cursors(&self) -> Result<Vec<(Uuid, usize)>, SessionError> {
        let anchors: Vec<(Uuid, Anchor)> = {
            let awareness = self.awareness();
            awareness
                .states()
                .filter(|(peer, _)| *peer != self.peer.peer_id)
                .filter_map(|(peer, state)| state.cursor.map(|c| (peer, c)))
                .collect()
        };
        let mut cursors = Vec::with_capacity(anchors.len());
        for (peer, anchor) in anchors {
            if let Some(offset) = self.handle.resolve_anchor(anchor).await? {
                cursors.push((peer, offset));
            }
        }
        Ok(cursors)
    }

    /// Stage AI output for `target`, read from `stream` by a pump task.
    ///
    /// Input stays locked and autosave paused until the edit is accepted,
    /// rejected or cancelled.
    pub async fn request_ai_edit(
        &mut self,
        target: OverlayTarget,
        stream: mpsc::Receiver<AiStreamEvent>,
    ) -> Result<(), SessionError> {
        let hooks: Arc<dyn OverlayHooks> = self.hooks.clone();
        self.handle.begin_overlay(target, hooks).await?;

        let pump = tokio::spawn(pump_ai_stream(self.handle.clone(), stream));
        let abort = pump.abort_handle();
        self.ai_pump = Some(abort.clone());
        self.handle.defer_overlay_cleanup(move || abort.abort()).await
    }

    pub async fn overlay_phase(&self) -> Result<OverlayPhase, SessionError> {
        self.handle.overlay_phase().await
    }

    pub async fn overlay_view(&self) -> Result<Option<OverlayView>, SessionError> {
        self.handle.overlay_view().await
    }

    /// Commit the staged text as one local edit.
    pub async fn accept_ai_edit(&mut self) -> Result<Vec<u8>, SessionError> {
        let update = self.handle.accept_overlay().await?;
        self.ai_pump = None;
        Ok(update)
    }

    pub async fn reject_ai_edit(&mut self) -> Result<ProvisionalEdit, SessionError> {
        let edit = self.handle.reject_overlay().await?;
        self.ai_pump = None;
        Ok(edit)
    }

    /// Stop the stream and drop the staged text. No-op when idle.
    pub async fn cancel_ai_edit(&mut self) -> Result<Option<ProvisionalEdit>, SessionError> {
        if let Some(pump) = self.ai_pump.take() {
            pump.abort();
        }
        self.handle.cancel_overlay().await
    }

    /// Cancel any overlay, write pending changes and disconnect.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.cancel_ai_edit().await?;
        let flushed = self.autosave.shutdown().await;

        if let Some(transport) = self.transport.take() {
            transport.client.disconnect().await;
            for pump in transport.pumps {
                pump.abort();
            }
        }

        let Self { handle, doc_task, .. } = self;
        drop(handle);
        if let Some(task) = doc_task {
            if let Err(e) = task.await {
                log::warn!("Document task ended abnormally: {e}");
            }
        }
        flushed?;
        Ok(())
    }
}

async fn start_transport(
    config: ClientConfig,
    peer: &PeerInfo,
    handle: &DocHandle,
    awareness: &Arc<Mutex<Awareness>>,
) -> Result<Transport, SessionError> {
    let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let mut client = SyncClient::new(config, peer.clone(), handle.doc_id());
    let events = client.take_event_rx();
    let client = Arc::new(client);

    let (local_tx, local_rx) = mpsc::unbounded_channel();
    handle
        .observe(move |event: &DocEvent| {
            if event.origin == Origin::Local && local_tx.send(event.update.clone()).is_err() {
                log::trace!("Outbound pump stopped; local update not sent");
            }
        })
        .await?;

    let announce = Arc::new(Notify::new());
    let mut pumps = vec![
        tokio::spawn(pump_local_updates(client.clone(), local_rx)),
        tokio::spawn(pump_presence(client.clone(), awareness.clone(), announce.clone(), heartbeat)),
    ];
    if let Some(events) = events {
        pumps.push(tokio::spawn(pump_remote_events(
            handle.clone(),
            awareness.clone(),
            announce,
            events,
            heartbeat * 3,
        )));
    }
    client.connect(Arc::new(handle.clone()));

    Ok(Transport { client, pumps })
}

async fn pump_local_updates(client: Arc<SyncClient>, mut updates: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(update) = updates.recv().await {
        if let Err(e) = client.send_update(update).await {
            log::warn!("Local update not sent for {}: {e}", client.doc_id());
        }
    }
}

/// Re-send the local presence every heartbeat, and right away when a peer
/// joins or the connection has synced, so idle peers are not expired.
async fn pump_presence(
    client: Arc<SyncClient>,
    awareness: Arc<Mutex<Awareness>>,
    announce: Arc<Notify>,
    period: Duration,
) {
    let mut heartbeat = tokio::time::interval(period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {}
            _ = announce.notified() => {}
        }
        let refreshed = lock(&awareness).refresh_local();
        if let Some((clock, state)) = refreshed {
            if let Err(e) = client.send_awareness(clock, &state).await {
                log::debug!("Presence heartbeat for {} not sent: {e}", client.doc_id());
            }
        }
    }
}

async fn pump_remote_events(
    handle: DocHandle,
    awareness: Arc<Mutex<Awareness>>,
    announce: Arc<Notify>,
    mut events: mpsc::Receiver<SyncEvent>,
    idle_timeout: Duration,
) {
    let mut sweep = tokio::time::interval(idle_timeout);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SyncEvent::RemoteUpdate { peer_id, update } => match handle.apply_remote(update).await {
                        Ok(()) => {}
                        Err(SessionError::Doc(e)) if e.is_causal_gap() => {
                            log::debug!("Update from {peer_id} waits for missing history: {e}");
                        }
                        Err(SessionError::Closed) => break,
                        Err(e) => log::warn!("Dropped update from {peer_id}: {e}"),
                    },
                    SyncEvent::RemoteAwareness { peer_id, clock, state } => {
                        lock(&awareness).apply_remote(peer_id, clock, state);
                    }
                    SyncEvent::PeerLeft(peer_id) => {
                        lock(&awareness).remove_peer(peer_id);
                    }
                    SyncEvent::Disconnected => {
                        lock(&awareness).clear_remote();
                    }
                    SyncEvent::PeerJoined(info) => {
                        log::debug!("{} joined {}", info.name, handle.doc_id());
                        announce.notify_one();
                    }
                    SyncEvent::Synced => announce.notify_one(),
                    SyncEvent::Connected => {}
                }
            }
            _ = sweep.tick() => {
                let expired = lock(&awareness).expire_idle(idle_timeout);
                if !expired.is_empty() {
                    log::debug!("Expired {} idle peers on {}", expired.len(), handle.doc_id());
                }
            }
        }
    }
}

fn lock(awareness: &Mutex<Awareness>) -> MutexGuard<'_, Awareness> {
    awareness.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sole consumer of an AI stream.
async fn pump_ai_stream(handle: DocHandle, mut stream: mpsc::Receiver<AiStreamEvent>) {
    let result = loop {
        match stream.recv().await {
            Some(AiStreamEvent::Chunk(delta)) => {
                if let Err(e) = handle.push_overlay_chunk(delta).await {
                    break Err(e);
                }
            }
            Some(AiStreamEvent::Done) => break handle.finish_overlay_stream().await,
            Some(AiStreamEvent::Error(error)) => break handle.fail_overlay(error).await,
            None => break handle.fail_overlay("stream closed before completion").await,
        }
    };
    if let Err(e) = result {
        log::debug!("AI stream pump for {} stopped: {e}", handle.doc_id());
    }
}
