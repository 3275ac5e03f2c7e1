//! Provisional AI edits staged outside the document.
//!
//! ```text
//!          begin()            finish_stream()           accept()
//!   Idle ──────────► Streaming ──────────────► AwaitingDecision ──────► Committed ─┐
//!    ▲                   │                           │                            │
//!    │                   │ fail() / cancel()         │ reject() / cancel()        │
//!    │                   ▼                           ▼                            │
//!    └──────────────── Discarded ◄───────────────────┘                            │
//!    └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Streamed text is buffered here and only ever rendered. The replica is
//! touched once, on accept, by an ordinary local edit at the anchor's
//! current position. Positions are kept as anchors so remote edits merged
//! during streaming shift the insertion point with the text around it.

use std::sync::Arc;
use syncnote_core::{Anchor, Doc, DocError, Observers, SubscriptionId, Update};
use thiserror::Error;
use uuid::Uuid;

/// Where the AI text goes, in offsets at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayTarget {
    Insert { at: usize },
    /// Replace the selection `start..end`
    Replace { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPhase {
    Idle,
    Streaming,
    AwaitingDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayOutcome {
    Committed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    Rejected,
    Cancelled,
    StreamError(String),
    AnchorLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    Started(OverlayTarget),
    /// A streamed delta; `total` is the buffered length in chars
    Chunk { delta: String, total: usize },
    AwaitingDecision,
    Committed { update: Vec<u8> },
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error("a provisional edit is already active for document {0}")]
    Conflict(Uuid),

    #[error("no provisional edit is active")]
    NotActive,

    #[error("the provisional edit is still streaming")]
    StillStreaming,

    #[error("the provisional edit has stopped streaming")]
    NotStreaming,

    #[error("AI stream failed: {0}")]
    Stream(String),

    #[error("anchor of the provisional edit no longer resolves")]
    AnchorLost,

    #[error(transparent)]
    Doc(#[from] DocError),
}

/// Side effects of an active overlay on its surroundings.
pub trait OverlayHooks: Send + Sync {
    fn lock_input(&self);
    fn unlock_input(&self);
    fn pause_persistence(&self);
    fn resume_persistence(&self);
}

/// Acquires the overlay's side effects and releases them exactly once:
/// on commit, discard, or when dropped.
pub struct Disposer {
    hooks: Option<Arc<dyn OverlayHooks>>,
    cleanups: Vec<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    /// Lock input and pause persistence.
    pub fn acquire(hooks: Arc<dyn OverlayHooks>) -> Self {
        hooks.lock_input();
        hooks.pause_persistence();
        Self {
            hooks: Some(hooks),
            cleanups: Vec::new(),
        }
    }

    /// Run `cleanup` on release, before input is unlocked.
    pub fn defer(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        if self.hooks.is_some() {
            self.cleanups.push(Box::new(cleanup));
        } else {
            cleanup();
        }
    }

    pub fn release(&mut self) {
        let Some(hooks) = self.hooks.take() else {
            return;
        };
        for cleanup in self.cleanups.drain(..) {
            cleanup();
        }
        hooks.unlock_input();
        hooks.resume_persistence();
    }

    pub fn is_released(&self) -> bool {
        self.hooks.is_none()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.release();
    }
}

/// The staged edit itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalEdit {
    pub doc_id: Uuid,
    pub target: OverlayTarget,
    /// Insertion point, or start of the replaced selection
    pub start: Anchor,
    /// End of the replaced selection
    pub end: Option<Anchor>,
    pub content: String,
    pub streaming: bool,
    pub outcome: Option<OverlayOutcome>,
    /// Selection text at request time, for replacements
    pub original: Option<String>,
}

/// What a UI renders for the active overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayView {
    pub phase: OverlayPhase,
    /// Current offset where the provisional text is shown
    pub at: usize,
    /// Currently selected range that would be replaced
    pub replaces: Option<(usize, usize)>,
    pub text: String,
}

struct Active {
    edit: ProvisionalEdit,
    disposer: Disposer,
}

/// Per-document overlay state machine.
pub struct Overlay {
    doc_id: Uuid,
    active: Option<Active>,
    observers: Observers<OverlayEvent>,
}

impl Overlay {
    pub fn new(doc_id: Uuid) -> Self {
        Self {
            doc_id,
            active: None,
            observers: Observers::new(),
        }
    }

    pub fn phase(&self) -> OverlayPhase {
        match &self.active {
            None => OverlayPhase::Idle,
            Some(active) if active.edit.streaming => OverlayPhase::Streaming,
            Some(_) => OverlayPhase::AwaitingDecision,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn edit(&self) -> Option<&ProvisionalEdit> {
        self.active.as_ref().map(|a| &a.edit)
    }

    /// Start streaming into a new provisional edit.
    pub fn begin(&mut self, doc: &Doc, target: OverlayTarget, hooks: Arc<dyn OverlayHooks>) -> Result<(), OverlayError> {
        if self.active.is_some() {
            return Err(OverlayError::Conflict(self.doc_id));
        }

        let (start, end, original) = match target {
            OverlayTarget::Insert { at } => (doc.anchor_at(at)?, None, None),
            OverlayTarget::Replace { start, end } => {
                let (start, end) = (start.min(end), start.max(end));
                let start_anchor = doc.anchor_at(start)?;
                let end_anchor = doc.anchor_at(end)?;
                let original: String = doc.text().chars().skip(start).take(end - start).collect();
                (start_anchor, Some(end_anchor), Some(original))
            }
        };

        self.active = Some(Active {
            edit: ProvisionalEdit {
                doc_id: self.doc_id,
                target,
                start,
                end,
                content: String::new(),
                streaming: true,
                outcome: None,
                original,
            },
            disposer: Disposer::acquire(hooks),
        });
        log::info!("Provisional edit started on {} at {target:?}", self.doc_id);
        self.observers.emit(&OverlayEvent::Started(target));
        Ok(())
    }

    /// Register cleanup for resources tied to this edit (stream readers,
    /// timers). Runs immediately if nothing is active.
    pub fn defer(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        match &mut self.active {
            Some(active) => active.disposer.defer(cleanup),
            None => cleanup(),
        }
    }

    pub fn push_chunk(&mut self, delta: &str) -> Result<(), OverlayError> {
        let active = self.active.as_mut().ok_or(OverlayError::NotActive)?;
        if !active.edit.streaming {
            return Err(OverlayError::NotStreaming);
        }
        active.edit.content.push_str(delta);
        let total = active.edit.content.chars().count();
        self.observers.emit(&OverlayEvent::Chunk {
            delta: delta.to_string(),
            total,
        });
        Ok(())
    }

    pub fn finish_stream(&mut self) -> Result<(), OverlayError> {
        let active = self.active.as_mut().ok_or(OverlayError::NotActive)?;
        if !active.edit.streaming {
            return Err(OverlayError::NotStreaming);
        }
        active.edit.streaming = false;
        log::debug!("Provisional edit on {} awaits decision", self.doc_id);
        self.observers.emit(&OverlayEvent::AwaitingDecision);
        Ok(())
    }

    /// Stream error: discard whatever was buffered.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<ProvisionalEdit, OverlayError> {
        let error = error.into();
        log::warn!("AI stream for {} failed: {error}", self.doc_id);
        self.discard(DiscardReason::StreamError(error))
    }

    /// Apply the buffered text to `doc` as one local edit.
    ///
    /// Returns the encoded update of the edit.
    pub fn accept(&mut self, doc: &mut Doc) -> Result<Vec<u8>, OverlayError> {
        let active = self.active.as_ref().ok_or(OverlayError::NotActive)?;
        if active.edit.streaming {
            return Err(OverlayError::StillStreaming);
        }

        let Some((at, replaced)) = resolve(doc, &active.edit) else {
            self.discard(DiscardReason::AnchorLost)?;
            return Err(OverlayError::AnchorLost);
        };

        let mut updates = Vec::with_capacity(2);
        if replaced > 0 {
            updates.push(doc.delete(at, replaced)?);
        }
        if !active.edit.content.is_empty() {
            updates.push(doc.insert(at, &active.edit.content)?);
        }
        let update = match updates.len() {
            1 => updates.remove(0),
            _ => Update::merge_encoded(&updates)?,
        };

        let Some(mut active) = self.active.take() else {
            return Err(OverlayError::NotActive);
        };
        active.edit.outcome = Some(OverlayOutcome::Committed);
        active.disposer.release();
        log::info!(
            "Provisional edit committed on {}: {} chars at {at}",
            self.doc_id,
            active.edit.content.chars().count()
        );
        self.observers.emit(&OverlayEvent::Committed { update: update.clone() });
        Ok(update)
    }

    /// User declined the edit. The document is left untouched.
    pub fn reject(&mut self) -> Result<ProvisionalEdit, OverlayError> {
        self.discard(DiscardReason::Rejected)
    }

    /// Abort from any phase (navigation away, shutdown). No-op when idle.
    pub fn cancel(&mut self) -> Option<ProvisionalEdit> {
        self.discard(DiscardReason::Cancelled).ok()
    }

    /// Rendering data for the active edit against the current document.
    pub fn view(&self, doc: &Doc) -> Option<OverlayView> {
        let edit = &self.active.as_ref()?.edit;
        let (at, replaced) = resolve(doc, edit)?;
        Some(OverlayView {
            phase: self.phase(),
            at,
            replaces: edit.end.map(|_| (at, at + replaced)),
            text: edit.content.clone(),
        })
    }

    pub fn observe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&OverlayEvent) + Send + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn discard(&mut self, reason: DiscardReason) -> Result<ProvisionalEdit, OverlayError> {
        let mut active = self.active.take().ok_or(OverlayError::NotActive)?;
        active.edit.streaming = false;
        active.edit.outcome = Some(OverlayOutcome::Discarded);
        active.disposer.release();
        log::info!("Provisional edit on {} discarded: {reason:?}", self.doc_id);
        self.observers.emit(&OverlayEvent::Discarded(reason));
        Ok(active.edit)
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("doc_id", &self.doc_id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Current insertion offset and the number of selected chars to replace.
fn resolve(doc: &Doc, edit: &ProvisionalEdit) -> Option<(usize, usize)> {
    let at = doc.resolve_anchor(&edit.start)?;
    let replaced = match &edit.end {
        Some(end) => doc.resolve_anchor(end)?.saturating_sub(at),
        None => 0,
    };
    Some((at, replaced))
}
