//! Debounced autosave.
//!
//! A single task owns the save state. Document events, pause/resume and
//! explicit saves reach it as commands, so a save never races another save.
//!
//! Rules:
//! - only `Origin::Local` events schedule a save; bootstrap and remote
//!   merges never do
//! - every save writes the full state and is skipped when the encoded bytes
//!   equal the last successful write
//! - while paused the debounce timer is off, but local changes are
//!   remembered and scheduled again on resume
//! - `manual_save` ignores pause, cancels the pending timer, always writes
//!   and reports failure to the caller
//! - a failed write keeps the document dirty, so the next trigger retries

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use syncnote_core::{Doc, DocError, DocEvent, Origin};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{encode_state, PersistenceError, StateBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    /// Quiet period after the last local edit before saving
    pub debounce_ms: u64,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

/// Anything that can produce a full-state snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<u8>, DocError>;
}

#[async_trait]
impl SnapshotSource for std::sync::Mutex<Doc> {
    async fn snapshot(&self) -> Result<Vec<u8>, DocError> {
        self.lock().unwrap_or_else(PoisonError::into_inner).encode_state_as_update()
    }
}

type Reply<T> = oneshot::Sender<Result<T, PersistenceError>>;

enum Command {
    Changed,
    Pause,
    Resume,
    Flush(Reply<bool>),
    ManualSave(Reply<()>),
    Shutdown(Reply<bool>),
}

/// Handle to the autosave task of one document.
pub struct AutoSave {
    tx: mpsc::UnboundedSender<Command>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AutoSave {
    /// Start the task. `baseline` is the state the document was loaded
    /// from; saving identical bytes is skipped.
    pub fn spawn<S, B>(
        doc_id: Uuid,
        source: Arc<S>,
        backend: Arc<B>,
        config: AutoSaveConfig,
        baseline: Option<String>,
    ) -> Self
    where
        S: SnapshotSource + ?Sized + 'static,
        B: StateBackend + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            doc_id,
            source,
            backend,
            debounce: Duration::from_millis(config.debounce_ms),
            last_saved: baseline,
            dirty: false,
            paused: false,
            deadline: None,
        };
        Self {
            tx,
            task: std::sync::Mutex::new(Some(tokio::spawn(worker.run(rx)))),
        }
    }

    /// Feed a transaction origin. Only local edits count.
    pub fn notify(&self, origin: Origin) {
        if origin == Origin::Local {
            self.send(Command::Changed);
        }
    }

    /// Callback for `Doc::observe`.
    pub fn observer(&self) -> impl FnMut(&DocEvent) + Send + 'static {
        let tx = self.tx.clone();
        move |event: &DocEvent| {
            if event.origin == Origin::Local && tx.send(Command::Changed).is_err() {
                log::trace!("Autosave stopped; change not scheduled");
            }
        }
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Save pending changes now unless paused. Returns whether a write
    /// happened.
    pub async fn flush(&self) -> Result<bool, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush(reply));
        rx.await.map_err(|_| stopped())?
    }

    /// Write the current state immediately, paused or not.
    pub async fn manual_save(&self) -> Result<(), PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ManualSave(reply));
        rx.await.map_err(|_| stopped())?
    }

    /// Flush pending changes and stop the task.
    pub async fn shutdown(&self) -> Result<bool, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply));
        let result = rx.await.map_err(|_| stopped())?;
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Autosave task ended abnormally: {e}");
            }
        }
        result
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            log::warn!("Autosave task is not running");
        }
    }
}

fn stopped() -> PersistenceError {
    PersistenceError::Write("autosave task stopped".into())
}

struct Worker<S: ?Sized, B: ?Sized> {
    doc_id: Uuid,
    source: Arc<S>,
    backend: Arc<B>,
    debounce: Duration,
    last_saved: Option<String>,
    dirty: bool,
    paused: bool,
    deadline: Option<Instant>,
}

impl<S, B> Worker<S, B>
where
    S: SnapshotSource + ?Sized,
    B: StateBackend + ?Sized,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Changed) => {
                        self.dirty = true;
                        if !self.paused {
                            self.deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(Command::Pause) => {
                        self.paused = true;
                        self.deadline = None;
                        log::info!("Autosave paused for {}", self.doc_id);
                    }
                    Some(Command::Resume) => {
                        self.paused = false;
                        if self.dirty {
                            self.deadline = Some(Instant::now() + self.debounce);
                        }
                        log::info!("Autosave resumed for {}", self.doc_id);
                    }
                    Some(Command::Flush(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::ManualSave(reply)) => {
                        self.deadline = None;
                        let result = self.save(true).await.map(|_| ());
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                        break;
                    }
                    None => {
                        if let Err(e) = self.flush().await {
                            log::error!("Final save for {} failed: {e}", self.doc_id);
                        }
                        break;
                    }
                },

                _ = timer => {
                    self.deadline = None;
                    if let Err(e) = self.save(false).await {
                        log::error!("Autosave for {} failed: {e}", self.doc_id);
                    }
                }
            }
        }
        log::debug!("Autosave task for {} stopped", self.doc_id);
    }

    async fn flush(&mut self) -> Result<bool, PersistenceError> {
        if self.paused || !self.dirty {
            return Ok(false);
        }
        self.deadline = None;
        self.save(false).await
    }

    /// Write the full state. Without `force`, identical bytes are skipped.
    async fn save(&mut self, force: bool) -> Result<bool, PersistenceError> {
        let snapshot = self
            .source
            .snapshot()
            .await
            .map_err(|e| PersistenceError::Write(e.to_string()))?;
        let state = encode_state(&snapshot);

        if !force && self.last_saved.as_deref() == Some(state.as_str()) {
            log::trace!("State of {} unchanged since last save", self.doc_id);
            self.dirty = false;
            return Ok(false);
        }

        self.backend.save(self.doc_id, state.clone()).await?;
        log::info!("Saved {} ({} bytes)", self.doc_id, snapshot.len());
        self.last_saved = Some(state);
        self.dirty = false;
        Ok(true)
    }
}
