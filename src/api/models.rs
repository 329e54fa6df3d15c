//! API request and response models

use crate::device::DeviceProfile;
use crate::engine::{ChatMessage, CompletionOptions};
use crate::vector_store::Metadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Device profile and current memory usage
#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub profile: Option<DeviceProfile>,
    pub ram_budget_mb: u64,
    pub loaded_ram_mb: u64,
    pub loaded_models: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseAllResponse {
    pub released: Vec<String>,
}

/// Chat completion against one model
#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub options: CompletionOptions,

    /// Reply with server-sent events, one `token` event per generated token
    /// followed by a `done` event carrying the full completion
    #[serde(default)]
    pub stream: bool,
}

/// Message to classify or dispatch
#[derive(Debug, Serialize, Deserialize)]
pub struct RouteRequest {
    pub message: String,

    /// Model currently serving the conversation
    /// Defaults to the router's chat model
    #[serde(default)]
    pub current_model: Option<String>,

    /// Defaults to whether any document has been imported
    #[serde(default)]
    pub has_document_corpus: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RememberRequest {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RememberResponse {
    pub id: String,
}

/// Recall or document query
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddDocumentRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddDocumentResponse {
    pub path: PathBuf,
    pub chunks: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveDocumentResponse {
    pub doc_id: String,
    pub removed: usize,
}
