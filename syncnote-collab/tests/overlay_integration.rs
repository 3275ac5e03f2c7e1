//! Provisional AI edits through a full document session.
//!
//! Verifies:
//! - streamed text never reaches the replica or storage before accept
//! - accept lands as one local edit at the anchored position
//! - reject leaves the replica byte-identical to one that never saw the edit
//! - remote edits merged during streaming move the insertion point

use std::sync::Arc;
use syncnote_collab::overlay::{OverlayError, OverlayPhase, OverlayTarget};
use syncnote_collab::persistence::{decode_state, encode_state, AutoSaveConfig, MemoryStateBackend};
use syncnote_collab::session::{AiStreamEvent, DocumentSession, SessionConfig, SessionError};
use syncnote_core::{Doc, ReplicaId};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const DEBOUNCE_MS: u64 = 500;

fn config() -> SessionConfig {
    SessionConfig {
        autosave: AutoSaveConfig {
            debounce_ms: DEBOUNCE_MS,
        },
        ..SessionConfig::default()
    }
}

/// Seed a backend with `text` and return a replica sharing that history.
fn seeded(doc_id: Uuid, text: &str) -> (Arc<MemoryStateBackend>, Doc) {
    let mut doc = Doc::new();
    doc.insert(0, text).unwrap();
    let snapshot = doc.encode_state_as_update().unwrap();
    let backend = Arc::new(MemoryStateBackend::with_state(doc_id, encode_state(&snapshot)));
    let control = Doc::from_snapshot(ReplicaId::random(), &snapshot).unwrap();
    (backend, control)
}

async fn stream(session: &mut DocumentSession, target: OverlayTarget, chunks: &[&str]) {
    let (tx, rx) = mpsc::channel(16);
    session.request_ai_edit(target, rx).await.unwrap();
    for chunk in chunks {
        tx.send(AiStreamEvent::Chunk(chunk.to_string())).await.unwrap();
    }
    tx.send(AiStreamEvent::Done).await.unwrap();
    while session.overlay_phase().await.unwrap() != OverlayPhase::AwaitingDecision {
        tokio::task::yield_now().await;
    }
}

fn saved_text(backend: &MemoryStateBackend, doc_id: &Uuid) -> String {
    let snapshot = decode_state(&backend.stored(doc_id).unwrap()).unwrap();
    Doc::from_snapshot(ReplicaId::random(), &snapshot).unwrap().text()
}

#[tokio::test(start_paused = true)]
async fn test_accept_commits_once_and_saves_after() {
    let doc_id = Uuid::new_v4();
    let (backend, _) = seeded(doc_id, "Hello world");
    let mut session = DocumentSession::open(config(), doc_id, backend.clone()).await.unwrap();

    stream(&mut session, OverlayTarget::Insert { at: 5 }, &[" brave", " new"]).await;
    let view = session.overlay_view().await.unwrap().unwrap();
    assert_eq!(view.at, 5);
    assert_eq!(view.text, " brave new");
    assert_eq!(session.text().await.unwrap(), "Hello world");
    assert!(session.is_input_locked());

    sleep(Duration::from_millis(DEBOUNCE_MS * 4)).await;
    assert_eq!(backend.writes(), 0, "nothing is saved while the overlay is open");

    session.accept_ai_edit().await.unwrap();
    assert_eq!(session.text().await.unwrap(), "Hello brave new world");
    assert!(!session.is_input_locked());
    assert_eq!(session.overlay_phase().await.unwrap(), OverlayPhase::Idle);

    sleep(Duration::from_millis(DEBOUNCE_MS * 2)).await;
    assert_eq!(backend.writes(), 1);
    assert_eq!(saved_text(&backend, &doc_id), "Hello brave new world");
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_edit_saved_after_overlay_ends() {
    let doc_id = Uuid::new_v4();
    let backend = Arc::new(MemoryStateBackend::new());
    let mut session = DocumentSession::open(config(), doc_id, backend.clone()).await.unwrap();

    // Typed just before the request; its debounce is still running.
    session.insert(0, "draft").await.unwrap();
    stream(&mut session, OverlayTarget::Insert { at: 5 }, &["!"]).await;
    sleep(Duration::from_millis(DEBOUNCE_MS * 4)).await;
    assert_eq!(backend.writes(), 0);

    session.reject_ai_edit().await.unwrap();
    sleep(Duration::from_millis(DEBOUNCE_MS * 2)).await;
    assert_eq!(backend.writes(), 1);
    assert_eq!(saved_text(&backend, &doc_id), "draft");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_reject_leaves_no_trace_under_remote_edits() {
    let doc_id = Uuid::new_v4();
    let (backend, mut control) = seeded(doc_id, "abcdef");
    let mut session = DocumentSession::open(config(), doc_id, backend).await.unwrap();
    let mut remote = Doc::from_snapshot(ReplicaId::random(), &control.encode_state_as_update().unwrap()).unwrap();

    let (tx, rx) = mpsc::channel(16);
    session.request_ai_edit(OverlayTarget::Insert { at: 3 }, rx).await.unwrap();
    tx.send(AiStreamEvent::Chunk("provisional".into())).await.unwrap();

    for (index, text) in [(0, "X"), (7, "Y")] {
        let update = remote.insert(index, text).unwrap();
        control.apply_update(&update).unwrap();
        session.handle().apply_remote(update).await.unwrap();
    }
    let update = remote.delete(1, 2).unwrap();
    control.apply_update(&update).unwrap();
    session.handle().apply_remote(update).await.unwrap();

    tx.send(AiStreamEvent::Chunk(" text".into())).await.unwrap();
    tx.send(AiStreamEvent::Done).await.unwrap();
    while session.overlay_phase().await.unwrap() != OverlayPhase::AwaitingDecision {
        tokio::task::yield_now().await;
    }

    let rejected = session.reject_ai_edit().await.unwrap();
    assert_eq!(rejected.content, "provisional text");
    assert_eq!(session.text().await.unwrap(), control.text());
    assert_eq!(session.handle().state_vector().await.unwrap(), control.encode_state_vector());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_insertion_point_follows_remote_edits() {
    let doc_id = Uuid::new_v4();
    let (backend, control) = seeded(doc_id, "abcdef");
    let mut session = DocumentSession::open(config(), doc_id, backend).await.unwrap();
    let mut remote = Doc::from_snapshot(ReplicaId::random(), &control.encode_state_as_update().unwrap()).unwrap();

    stream(&mut session, OverlayTarget::Insert { at: 3 }, &["<AI>"]).await;
    let update = remote.insert(0, "XY").unwrap();
    session.handle().apply_remote(update).await.unwrap();
    assert_eq!(session.overlay_view().await.unwrap().unwrap().at, 5);

    session.accept_ai_edit().await.unwrap();
    assert_eq!(session.text().await.unwrap(), "XYabc<AI>def");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_replace_selection() {
    let doc_id = Uuid::new_v4();
    let (backend, _) = seeded(doc_id, "The quick fox");
    let mut session = DocumentSession::open(config(), doc_id, backend).await.unwrap();

    stream(&mut session, OverlayTarget::Replace { start: 4, end: 9 }, &["slow"]).await;
    let view = session.overlay_view().await.unwrap().unwrap();
    assert_eq!(view.replaces, Some((4, 9)));

    session.accept_ai_edit().await.unwrap();
    assert_eq!(session.text().await.unwrap(), "The slow fox");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_accept_while_streaming_is_refused() {
    let doc_id = Uuid::new_v4();
    let mut session = DocumentSession::open(config(), doc_id, Arc::new(MemoryStateBackend::new()))
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(16);
    session.request_ai_edit(OverlayTarget::Insert { at: 0 }, rx).await.unwrap();
    tx.send(AiStreamEvent::Chunk("half".into())).await.unwrap();
    assert_eq!(
        session.accept_ai_edit().await,
        Err(SessionError::Overlay(OverlayError::StillStreaming))
    );

    // Cancelling mid-stream discards the edit and unlocks input.
    assert!(session.cancel_ai_edit().await.unwrap().is_some());
    assert!(!session.is_input_locked());
    assert_eq!(session.text().await.unwrap(), "");
    drop(tx);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_cancels_active_overlay() {
    let doc_id = Uuid::new_v4();
    let backend = Arc::new(MemoryStateBackend::new());
    let mut session = DocumentSession::open(config(), doc_id, backend.clone()).await.unwrap();
    session.insert(0, "kept").await.unwrap();

    let (_tx, rx) = mpsc::channel(16);
    session.request_ai_edit(OverlayTarget::Insert { at: 4 }, rx).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(saved_text(&backend, &doc_id), "kept");
}
