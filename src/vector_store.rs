//! Persistent nearest-neighbour index
//!
//! Brute-force cosine similarity over an in-memory entry list. Each store
//! persists to `vectorstore_<name>.json` under the data directory. Mutations
//! mark the store dirty; a background flusher coalesces them into one write
//! per quiet period, and shutdown performs a final flush.

use crate::metrics;
use crate::storage::StorageBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorEntry {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Cosine similarity; 0 for mismatched lengths or a zero-norm vector
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        (dot / denominator) as f32
    }
}

pub struct VectorStore {
    name: String,
    snapshot_path: PathBuf,
    storage: Arc<dyn StorageBackend>,
    entries: RwLock<Vec<VectorEntry>>,
    dirty: AtomicBool,
    changed: Notify,
}

impl VectorStore {
    pub fn new(name: &str, data_dir: &Path, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.to_string(),
            snapshot_path: data_dir.join(format!("vectorstore_{name}.json")),
            storage,
            entries: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self, count: usize) {
        self.dirty.store(true, Ordering::SeqCst);
        self.changed.notify_one();
        metrics::update_vector_store_entries(&self.name, count);
    }

    /// Replace contents with the persisted snapshot. A missing or unreadable
    /// snapshot leaves the store empty.
    pub async fn load(&self) {
        let loaded = match self.storage.load(&self.snapshot_path).await {
            Ok(Some(content)) => match serde_json::from_str::<Vec<VectorEntry>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(store = %self.name, error = %e, "Failed to parse vector store snapshot");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(store = %self.name, error = %e, "Failed to load vector store snapshot");
                Vec::new()
            }
        };

        let count = loaded.len();
        *self.entries.write().await = loaded;
        self.dirty.store(false, Ordering::SeqCst);
        metrics::update_vector_store_entries(&self.name, count);
        tracing::debug!(store = %self.name, entries = count, "Loaded vector store");
    }

    /// Write the snapshot. Failures are logged and the store stays dirty.
    pub async fn save(&self) -> bool {
        self.dirty.store(false, Ordering::SeqCst);
        let content = {
            let entries = self.entries.read().await;
            serde_json::to_string(&*entries)
        };

        let result = match content {
            Ok(content) => self.storage.save(&self.snapshot_path, &content).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                tracing::debug!(store = %self.name, path = ?self.snapshot_path, "Saved vector store");
                true
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                tracing::warn!(store = %self.name, error = %e, "Failed to save vector store");
                false
            }
        }
    }

    /// Insert or replace the entry with this id
    pub async fn add(&self, id: &str, text: &str, embedding: Vec<f32>, metadata: Metadata) {
        let count = {
            let mut entries = self.entries.write().await;
            entries.retain(|e| e.id != id);
            entries.push(VectorEntry {
                id: id.to_string(),
                text: text.to_string(),
                embedding,
                metadata,
                created_at: Utc::now(),
            });
            entries.len()
        };
        self.mark_dirty(count);
    }

    /// At most `top_k` entries scoring at least `threshold`, best first
    pub async fn query(&self, embedding: &[f32], top_k: usize, threshold: f32) -> Vec<SearchResult> {
        let entries = self.entries.read().await;
        let mut results: Vec<SearchResult> = entries
            .iter()
            .map(|e| (e, cosine_similarity(embedding, &e.embedding)))
            .filter(|(_, score)| *score >= threshold)
            .map(|(e, score)| SearchResult {
                id: e.id.clone(),
                text: e.text.clone(),
                score,
                metadata: e.metadata.clone(),
                created_at: e.created_at,
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(top_k);
        results
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.remove_where(|e| e.id == id).await > 0
    }

    /// Remove every matching entry; returns how many were removed
    pub async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&VectorEntry) -> bool,
    {
        let (removed, count) = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|e| !predicate(e));
            (before - entries.len(), entries.len())
        };
        if removed > 0 {
            self.mark_dirty(count);
        }
        removed
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.mark_dirty(0);
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn entries(&self) -> Vec<VectorEntry> {
        self.entries.read().await.clone()
    }

    /// Start the debounced background flush
    pub fn spawn_flusher(self: &Arc<Self>, debounce: Duration) -> StoreFlusher {
        let token = CancellationToken::new();
        let store = Arc::clone(self);
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            'outer: loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = store.changed.notified() => {}
                }

                // Restart the quiet period on every further change
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        _ = store.changed.notified() => continue,
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }

                if store.is_dirty() {
                    store.save().await;
                }
            }
        });

        StoreFlusher {
            store: Arc::clone(self),
            token,
            handle,
        }
    }
}

/// Background flush task; call [`StoreFlusher::shutdown`] before exit
pub struct StoreFlusher {
    store: Arc<VectorStore>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl StoreFlusher {
    /// Stop the flusher and write any pending changes
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(store = %self.store.name, error = %e, "Flusher task failed");
        }
        if self.store.is_dirty() {
            self.store.save().await;
        }
    }
}
