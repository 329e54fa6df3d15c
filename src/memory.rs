//! Semantic memory and document retrieval
//!
//! Two vector stores back the service: `memory` holds short interaction
//! summaries, `documents` holds chunks of imported files. Embeddings come from
//! the configured embedding model, which is brought up through the lifecycle
//! manager on every call so an evicted embedder is reloaded transparently.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::lifecycle::ModelLifecycleManager;
use crate::storage::StorageBackend;
use crate::vector_store::{Metadata, SearchResult, StoreFlusher, VectorStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const MEMORY_STORE: &str = "memory";
pub const DOCUMENT_STORE: &str = "documents";

/// Interaction snippets longer than this are truncated in summaries
const SNIPPET_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum characters per document chunk
    pub chunk_size: usize,
    /// Characters carried from the end of one chunk into the next
    pub chunk_overlap: usize,
    pub recall_top_k: usize,
    /// Minimum score for a memory to count as relevant to a message
    pub relevance_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            recall_top_k: 3,
            relevance_threshold: 0.7,
        }
    }
}

/// Split text into bounded, overlapping chunks.
///
/// Paragraphs (separated by blank lines) are packed greedily. When the next
/// paragraph would overflow `max_chars`, the buffer is emitted and the next one
/// starts with the last `overlap` characters of it. Text without paragraph
/// breaks is packed word by word instead.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let chunks = accumulate(paragraphs(text), "\n\n", max_chars, overlap);

    let needs_words = match chunks.as_slice() {
        [] => true,
        [only] => only.chars().count() > max_chars,
        _ => false,
    };

    if needs_words && !text.trim().is_empty() {
        accumulate(text.split_whitespace(), " ", max_chars, overlap)
    } else {
        chunks
    }
}

/// Paragraphs separated by one or more whitespace-only lines
fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                parts.push(&text[s..end]);
            }
        } else {
            start.get_or_insert(offset);
            end = offset + line.len();
        }
        offset += line.len();
    }
    if let Some(s) = start {
        parts.push(&text[s..end]);
    }

    parts.into_iter()
}

fn accumulate<'a>(
    units: impl Iterator<Item = &'a str>,
    separator: &str,
    max_chars: usize,
    overlap: usize,
) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for unit in units {
        let unit = unit.trim();
        if unit.is_empty() {
            continue;
        }
        let unit_len = unit.chars().count();

        if current_len > 0 && current_len + unit_len + 1 > max_chars {
            chunks.push(current.trim().to_string());
            current = format!("{} {unit}", char_tail(&current, overlap));
        } else if current_len > 0 {
            current.push_str(separator);
            current.push_str(unit);
        } else {
            current = unit.to_string();
        }
        current_len = current.chars().count();
    }

    let rest = current.trim();
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// The last `n` characters of `s`
fn char_tail(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if n == 0 {
        return "";
    }
    if n >= count {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

fn snippet(text: &str) -> String {
    if text.chars().count() > SNIPPET_CHARS {
        let head: String = text.chars().take(SNIPPET_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// A document chunk returned from a document query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMatch {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub doc_id: Option<String>,
    pub source_file: String,
    pub chunk_index: u64,
}

impl From<SearchResult> for DocumentMatch {
    fn from(result: SearchResult) -> Self {
        let doc_id = result
            .metadata
            .get("docId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let source_file = result
            .metadata
            .get("sourceFile")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string();
        let chunk_index = result
            .metadata
            .get("chunkIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Self {
            id: result.id,
            text: result.text,
            score: result.score,
            metadata: result.metadata,
            created_at: result.created_at,
            doc_id,
            source_file,
            chunk_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub memory_count: usize,
    /// Number of document chunks
    pub document_count: usize,
    pub document_files: Vec<String>,
}

pub struct MemoryService {
    lifecycle: Arc<ModelLifecycleManager>,
    embedding_slug: String,
    config: MemoryConfig,
    memory: Arc<VectorStore>,
    documents: Arc<VectorStore>,
    loaded: OnceCell<()>,
}

impl MemoryService {
    pub fn new(
        lifecycle: Arc<ModelLifecycleManager>,
        embedding_slug: &str,
        config: MemoryConfig,
        data_dir: &Path,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            lifecycle,
            embedding_slug: embedding_slug.to_string(),
            config,
            memory: Arc::new(VectorStore::new(MEMORY_STORE, data_dir, storage.clone())),
            documents: Arc::new(VectorStore::new(DOCUMENT_STORE, data_dir, storage)),
            loaded: OnceCell::new(),
        }
    }

    pub fn embedding_slug(&self) -> &str {
        &self.embedding_slug
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn memory_store(&self) -> &Arc<VectorStore> {
        &self.memory
    }

    pub fn document_store(&self) -> &Arc<VectorStore> {
        &self.documents
    }

    /// Start debounced persistence for both stores
    pub fn spawn_flushers(&self, debounce: Duration) -> Vec<StoreFlusher> {
        vec![
            self.memory.spawn_flusher(debounce),
            self.documents.spawn_flusher(debounce),
        ]
    }

    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                self.memory.load().await;
                self.documents.load().await;
                let memories = self.memory.count().await;
                let chunks = self.documents.count().await;
                tracing::info!(memories, chunks, "Loaded memory stores");
            })
            .await;
    }

    /// Load both stores and bring up the embedding model. Safe to call
    /// repeatedly and concurrently.
    pub async fn init(&self) -> OrchestratorResult<()> {
        self.ensure_loaded().await;
        self.lifecycle
            .ensure(&self.embedding_slug)
            .await
            .map(|_| ())
            .map_err(|e| self.unavailable(e))
    }

    fn unavailable(&self, err: OrchestratorError) -> OrchestratorError {
        tracing::warn!(slug = %self.embedding_slug, error = %err, "Embedding model unavailable");
        OrchestratorError::MemoryUnavailable {
            message: format!("embedding model '{}': {err}", self.embedding_slug),
        }
    }

    async fn embed(&self, text: &str) -> OrchestratorResult<Vec<f32>> {
        self.ensure_loaded().await;
        let model = self
            .lifecycle
            .ensure(&self.embedding_slug)
            .await
            .map_err(|e| self.unavailable(e))?;

        let handle = model.engine.ok_or_else(|| OrchestratorError::MemoryUnavailable {
            message: format!("embedding model '{}' has no engine", self.embedding_slug),
        })?;
        handle.engine.embed(text).await
    }

    // === Memory ===

    pub async fn remember(&self, text: &str, metadata: Metadata) -> OrchestratorResult<String> {
        let embedding = self.embed(text).await?;
        let id = uuid::Uuid::new_v4().to_string();
        self.memory.add(&id, text, embedding, metadata).await;
        tracing::debug!(id = %id, "Stored memory");
        Ok(id)
    }

    pub async fn recall(&self, query: &str, top_k: usize) -> OrchestratorResult<Vec<SearchResult>> {
        let embedding = self.embed(query).await?;
        Ok(self.memory.query(&embedding, top_k, 0.0).await)
    }

    /// Store a short summary of one exchange
    pub async fn remember_interaction(
        &self,
        user_message: &str,
        assistant_message: &str,
    ) -> OrchestratorResult<String> {
        let summary = format!(
            "User asked about {}. Assistant responded: {}",
            snippet(user_message),
            snippet(assistant_message)
        );
        let metadata = match json!({
            "type": "interaction",
            "userMessage": user_message,
            "assistantMessage": assistant_message,
        }) {
            Value::Object(map) => map,
            _ => Metadata::new(),
        };
        self.remember(&summary, metadata).await
    }

    /// Memories relevant enough to inject as context for a message
    pub async fn recall_relevant(&self, message: &str) -> OrchestratorResult<Vec<SearchResult>> {
        let mut results = self.recall(message, self.config.recall_top_k).await?;
        results.retain(|r| r.score >= self.config.relevance_threshold);
        Ok(results)
    }

    pub async fn forget(&self, id: &str) -> bool {
        self.ensure_loaded().await;
        self.memory.remove(id).await
    }

    pub async fn clear_memory(&self) {
        self.ensure_loaded().await;
        self.memory.clear().await;
        self.memory.save().await;
    }

    // === Documents ===

    /// Import a text file; returns the number of chunks stored
    pub async fn add_document(&self, path: &Path) -> OrchestratorResult<usize> {
        self.ensure_loaded().await;

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OrchestratorError::NotFound {
                    what: format!("file {}", path.display()),
                }
            } else {
                e.into()
            }
        })?;

        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let doc_id = uuid::Uuid::new_v4().to_string();
        let chunks = chunk_text(&content, self.config.chunk_size, self.config.chunk_overlap);
        let total = chunks.len();

        for (i, chunk) in chunks.iter().enumerate() {
            let embedding = self.embed(chunk).await?;
            let mut metadata = Metadata::new();
            metadata.insert("docId".into(), json!(doc_id));
            metadata.insert("sourceFile".into(), json!(source_file));
            metadata.insert("chunkIndex".into(), json!(i));
            metadata.insert("totalChunks".into(), json!(total));
            self.documents
                .add(&format!("{doc_id}_chunk_{i}"), chunk, embedding, metadata)
                .await;
        }

        tracing::info!(
            doc_id = %doc_id,
            source_file = %source_file,
            chunks = total,
            "Imported document"
        );
        Ok(total)
    }

    pub async fn query_documents(
        &self,
        query: &str,
        top_k: usize,
    ) -> OrchestratorResult<Vec<DocumentMatch>> {
        let embedding = self.embed(query).await?;
        Ok(self
            .documents
            .query(&embedding, top_k, 0.0)
            .await
            .into_iter()
            .map(DocumentMatch::from)
            .collect())
    }

    /// Remove every chunk of a document; returns how many were removed
    pub async fn remove_document(&self, doc_id: &str) -> usize {
        self.ensure_loaded().await;
        let removed = self
            .documents
            .remove_where(|e| e.metadata.get("docId").and_then(Value::as_str) == Some(doc_id))
            .await;
        self.documents.save().await;
        removed
    }

    pub async fn clear_documents(&self) {
        self.ensure_loaded().await;
        self.documents.clear().await;
        self.documents.save().await;
    }

    pub async fn has_documents(&self) -> bool {
        self.ensure_loaded().await;
        self.documents.count().await > 0
    }

    pub async fn stats(&self) -> MemoryStats {
        self.ensure_loaded().await;
        let document_files: BTreeSet<String> = self
            .documents
            .entries()
            .await
            .into_iter()
            .filter_map(|e| {
                e.metadata
                    .get("sourceFile")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();

        MemoryStats {
            memory_count: self.memory.count().await,
            document_count: self.documents.count().await,
            document_files: document_files.into_iter().collect(),
        }
    }

    /// Write both stores if they have unsaved changes
    pub async fn shutdown(&self) {
        for store in [&self.memory, &self.documents] {
            if store.is_dirty() {
                store.save().await;
            }
        }
    }
}
