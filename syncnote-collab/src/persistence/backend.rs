//! Where snapshots go.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{decode_state, encode_state, PersistenceError};
use crate::storage::DocumentStore;

/// Durable home of a document's base64 full-state snapshot.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `None` when the document has never been saved.
    async fn load(&self, doc_id: Uuid) -> Result<Option<String>, PersistenceError>;

    async fn save(&self, doc_id: Uuid, state: String) -> Result<(), PersistenceError>;
}

/// Response envelope of the document service.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateRequest<'a> {
    base64_state: &'a str,
}

/// REST backend: `GET|POST {base}/documents/{id}/state`.
pub struct HttpStateBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStateBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    /// Use a preconfigured client (auth headers, proxies).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn state_url(&self, doc_id: Uuid) -> String {
        format!("{}/documents/{doc_id}/state", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl StateBackend for HttpStateBackend {
    async fn load(&self, doc_id: Uuid) -> Result<Option<String>, PersistenceError> {
        let url = self.state_url(doc_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PersistenceError::Load(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(PersistenceError::Load(format!("HTTP {} for {url}", response.status())));
        }
        let body: ApiResponse<String> = response
            .json()
            .await
            .map_err(|e| PersistenceError::Load(format!("invalid response from {url}: {e}")))?;

        match body.code {
            200 => Ok(body.data.filter(|state| !state.is_empty())),
            404 => Ok(None),
            code => Err(PersistenceError::Load(format!("service returned {code}: {}", body.message))),
        }
    }

    async fn save(&self, doc_id: Uuid, state: String) -> Result<(), PersistenceError> {
        let url = self.state_url(doc_id);
        let response = self
            .client
            .post(&url)
            .json(&StateRequest { base64_state: &state })
            .send()
            .await
            .map_err(|e| PersistenceError::Write(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(PersistenceError::Write(format!("HTTP {} for {url}", response.status())));
        }
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| PersistenceError::Write(format!("invalid response from {url}: {e}")))?;
        if body.code != 200 {
            return Err(PersistenceError::Write(format!(
                "service returned {}: {}",
                body.code, body.message
            )));
        }
        log::debug!("Saved {} bytes of state for {doc_id}", state.len());
        Ok(())
    }
}

/// Local backend on the RocksDB snapshot store.
pub struct RocksStateBackend {
    store: Arc<DocumentStore>,
}

impl RocksStateBackend {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StateBackend for RocksStateBackend {
    async fn load(&self, doc_id: Uuid) -> Result<Option<String>, PersistenceError> {
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load_snapshot(doc_id))
            .await
            .map_err(|e| PersistenceError::Load(e.to_string()))?;
        match loaded {
            Ok(snapshot) => Ok(Some(encode_state(&snapshot))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(PersistenceError::Load(e.to_string())),
        }
    }

    async fn save(&self, doc_id: Uuid, state: String) -> Result<(), PersistenceError> {
        let snapshot = decode_state(&state)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_snapshot(doc_id, &snapshot))
            .await
            .map_err(|e| PersistenceError::Write(e.to_string()))?
            .map_err(|e| PersistenceError::Write(e.to_string()))?;
        Ok(())
    }
}

/// In-process backend with write counting and failure injection.
#[derive(Default)]
pub struct MemoryStateBackend {
    states: Mutex<HashMap<Uuid, String>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(doc_id: Uuid, state: String) -> Self {
        let backend = Self::default();
        backend.states().insert(doc_id, state);
        backend
    }

    /// Successful saves so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every following save fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self, doc_id: &Uuid) -> Option<String> {
        self.states().get(doc_id).cloned()
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, String>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn load(&self, doc_id: Uuid) -> Result<Option<String>, PersistenceError> {
        Ok(self.stored(&doc_id))
    }

    async fn save(&self, doc_id: Uuid, state: String) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write("injected failure".into()));
        }
        self.states().insert(doc_id, state);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
