//! Connection recovery tests.
//!
//! Verifies:
//! - edits made while the relay is unreachable are replayed once on reconnect
//! - a missing `SyncStep2` triggers a full-state `SyncStep1`
//! - a malformed frame from the server drops the connection and the client
//!   reconnects

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use syncnote_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use syncnote_collab::persistence::MemoryStateBackend;
use syncnote_collab::protocol::{MessageType, PeerInfo, SyncMessage};
use syncnote_collab::server::{ServerConfig, SyncServer};
use syncnote_collab::session::{DocumentSession, SessionConfig};
use syncnote_core::Doc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start_server() -> (Arc<SyncServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(
        SyncServer::new(ServerConfig {
            bind_addr: addr.to_string(),
            ..ServerConfig::default()
        })
        .unwrap(),
    );
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr)
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        server_url: url.to_string(),
        initial_backoff_ms: 50,
        max_backoff_ms: 200,
        ..ClientConfig::default()
    }
}

async fn open(name: &str, url: &str, doc_id: Uuid) -> DocumentSession {
    let config = SessionConfig {
        peer_name: name.to_string(),
        client: Some(client_config(url)),
        ..SessionConfig::default()
    };
    DocumentSession::open(config, doc_id, Arc::new(MemoryStateBackend::new()))
        .await
        .unwrap()
}

async fn wait_for_text(session: &DocumentSession, expected: &str) {
    let reached = timeout(WAIT, async {
        while session.text().await.unwrap() != expected {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "expected {expected:?}, have {:?}",
        session.text().await.unwrap()
    );
}

/// TCP forwarder in front of the relay that can be cut and restored.
/// While cut, every new connection is dropped right after accept.
struct FlakyLink {
    url: String,
    up: Arc<AtomicBool>,
    links: Arc<Mutex<Vec<AbortHandle>>>,
}

impl FlakyLink {
    async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let up = Arc::new(AtomicBool::new(true));
        let links = Arc::new(Mutex::new(Vec::new()));

        let (accept_up, accept_links) = (up.clone(), links.clone());
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                if !accept_up.load(Ordering::SeqCst) {
                    drop(inbound);
                    continue;
                }
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                accept_links.lock().unwrap().push(link.abort_handle());
            }
        });
        Self { url, up, links }
    }

    fn cut(&self) {
        self.up.store(false, Ordering::SeqCst);
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    fn restore(&self) {
        self.up.store(true, Ordering::SeqCst);
    }
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Next protocol frame, or `None` once the peer has gone.
async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Option<SyncMessage> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return Some(SyncMessage::decode(&data).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, msg: SyncMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
}

// ─── Relay outage ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_offline_edits_survive_relay_outage() {
    let (server, addr) = start_server().await;
    let link = FlakyLink::start(addr).await;
    let doc_id = Uuid::new_v4();
    let alice = open("Alice", &link.url, doc_id).await;
    let bob = open("Bob", &format!("ws://{addr}"), doc_id).await;

    alice.insert(0, "shared").await.unwrap();
    wait_for_text(&bob, "shared").await;

    link.cut();
    let alice_client = alice.client().unwrap();
    let dropped = timeout(WAIT, async {
        while alice_client.connection_state().await == ConnectionState::Connected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "client never noticed the outage");

    alice.insert(6, " offline").await.unwrap();
    alice.insert(14, " edits").await.unwrap();
    bob.insert(0, ">").await.unwrap();
    let queued = timeout(WAIT, async {
        while alice_client.offline_queue_len().await < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(queued.is_ok());
    assert_eq!(bob.text().await.unwrap(), ">shared");

    link.restore();
    wait_for_text(&alice, ">shared offline edits").await;
    wait_for_text(&bob, ">shared offline edits").await;
    assert_eq!(
        server.document_text(&doc_id).await.as_deref(),
        Some(">shared offline edits")
    );
    assert_eq!(alice_client.offline_queue_len().await, 0);
    assert_eq!(alice_client.connection_state().await, ConnectionState::Connected);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

// ─── Stub relays ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_sync_step2_requests_full_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    // Ignores the first SyncStep1 and answers only a full-state request.
    tokio::spawn(async move {
        let mut relay_doc = Doc::new();
        relay_doc.insert(0, "relay").unwrap();
        let mut ws = accept_ws(&listener).await;
        while let Some(msg) = next_frame(&mut ws).await {
            if msg.msg_type != MessageType::SyncStep1 {
                continue;
            }
            let full = msg.state_vector().unwrap().is_empty();
            let _ = seen_tx.send((std::time::Instant::now(), full));
            if full {
                let state = relay_doc.encode_state_as_update().unwrap();
                reply(&mut ws, SyncMessage::sync_step2(Uuid::nil(), msg.doc_id, state)).await;
            }
        }
    });

    let doc = Arc::new(Mutex::new(Doc::new()));
    doc.lock().unwrap().insert(0, "local").unwrap();
    let config = ClientConfig {
        sync_timeout_ms: 200,
        ..client_config(&url)
    };
    let mut client = SyncClient::new(config, PeerInfo::new("Alice"), Uuid::new_v4());
    let mut events = client.take_event_rx().unwrap();
    client.connect(doc.clone());

    let synced = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::RemoteUpdate { update, .. } => doc.lock().unwrap().apply_update(&update).unwrap(),
                SyncEvent::Synced => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(synced.is_ok(), "client never synced");

    let (first_at, first_full) = seen_rx.recv().await.unwrap();
    let (second_at, second_full) = seen_rx.recv().await.unwrap();
    assert!(!first_full, "first SyncStep1 carries the local state vector");
    assert!(second_full, "fallback SyncStep1 asks for everything");
    assert!(second_at - first_at >= Duration::from_millis(150));

    let text = doc.lock().unwrap().text();
    assert_eq!(text.len(), "localrelay".len());
    assert!(text.contains("local") && text.contains("relay"));
    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_server_frame_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First connection: answer the join with garbage.
        let mut ws = accept_ws(&listener).await;
        let _join = next_frame(&mut ws).await;
        ws.send(Message::Binary(vec![0xff, 0x00, 0x13].into())).await.unwrap();
        while next_frame(&mut ws).await.is_some() {}
        let _ = closed_tx.send(());

        // Second connection: a normal handshake.
        let mut ws = accept_ws(&listener).await;
        let relay_doc = Doc::new();
        while let Some(msg) = next_frame(&mut ws).await {
            if msg.msg_type == MessageType::SyncStep1 {
                let diff = relay_doc.encode_diff(&msg.state_vector().unwrap()).unwrap();
                reply(&mut ws, SyncMessage::sync_step2(Uuid::nil(), msg.doc_id, diff)).await;
            }
        }
    });

    let mut client = SyncClient::new(client_config(&url), PeerInfo::new("Alice"), Uuid::new_v4());
    let mut events = client.take_event_rx().unwrap();
    client.connect(Arc::new(Mutex::new(Doc::new())));

    let mut lifecycle = Vec::new();
    let synced = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::Connected | SyncEvent::Disconnected => lifecycle.push(event),
                SyncEvent::Synced => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(synced.is_ok(), "client never recovered, saw {lifecycle:?}");
    assert_eq!(
        lifecycle,
        vec![SyncEvent::Connected, SyncEvent::Disconnected, SyncEvent::Connected]
    );
    assert!(
        timeout(WAIT, closed_rx.recv()).await.unwrap().is_some(),
        "client kept the bad connection open"
    );
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    client.disconnect().await;
}
