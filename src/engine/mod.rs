//! Inference engine abstraction
//!
//! Every loaded model is driven through one [`InferenceEngine`] trait object,
//! regardless of which engine variant brought it up. The artifact resolver
//! picks the variant once; nothing downstream branches on it.

pub mod server;

use crate::artifacts::Artifact;
use crate::error::OrchestratorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use server::{EngineCommand, ServerEngine, ServerEngineFactory};

/// Which engine implementation produced a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineVariant {
    Primary,
    Fallback,
}

impl std::fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    /// Tool definitions forwarded verbatim to the engine
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 512,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub time_to_first_token_ms: f64,
    pub total_time_ms: f64,
    pub tokens_per_second: f64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
    pub timings: Timings,
}

/// Streaming token sink; receives each generated token
pub type TokenCallback = Box<dyn FnMut(&str) + Send>;

/// Capability set shared by every engine variant
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        on_token: Option<TokenCallback>,
    ) -> OrchestratorResult<Completion>;

    async fn embed(&self, text: &str) -> OrchestratorResult<Vec<f32>>;

    /// Release native resources; the handle must not be used afterwards
    async fn destroy(&self) -> OrchestratorResult<()>;
}

/// An initialized engine plus the variant that produced it
#[derive(Clone)]
pub struct EngineHandle {
    pub variant: EngineVariant,
    pub engine: Arc<dyn InferenceEngine>,
}

impl EngineHandle {
    pub fn new(variant: EngineVariant, engine: Arc<dyn InferenceEngine>) -> Self {
        Self { variant, engine }
    }

    /// True when both handles point at the same engine instance
    pub fn same_engine(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Brings up an engine of a given variant over resolved artifact files
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn initialize(
        &self,
        variant: EngineVariant,
        artifact: &Artifact,
    ) -> OrchestratorResult<Arc<dyn InferenceEngine>>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::artifacts::ArtifactOrigin;
    use crate::error::OrchestratorError;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Engine that embeds text as a bag-of-characters vector
    pub struct MockEngine {
        pub destroyed: AtomicUsize,
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self {
                destroyed: AtomicUsize::new(0),
            }
        }
    }

    /// Deterministic 26-dim letter histogram
    pub fn letter_embedding(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 26];
        for c in text.to_lowercase().chars() {
            if c.is_ascii_lowercase() {
                v[(c as u8 - b'a') as usize] += 1.0;
            }
        }
        v
    }

    #[async_trait]
    impl InferenceEngine for MockEngine {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _options: &CompletionOptions,
            mut on_token: Option<TokenCallback>,
        ) -> OrchestratorResult<Completion> {
            let text = messages
                .last()
                .map(|m| format!("echo: {}", m.content))
                .unwrap_or_default();
            if let Some(cb) = on_token.as_mut() {
                cb(&text);
            }
            Ok(Completion {
                text,
                ..Default::default()
            })
        }

        async fn embed(&self, text: &str) -> OrchestratorResult<Vec<f32>> {
            Ok(letter_embedding(text))
        }

        async fn destroy(&self) -> OrchestratorResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Factory with per-variant failure injection and an init counter
    pub struct MockEngineFactory {
        pub inits: AtomicUsize,
        pub failing: Mutex<HashSet<EngineVariant>>,
        pub delay: Duration,
        pub initialized: Mutex<Vec<(EngineVariant, std::path::PathBuf)>>,
        /// Artifacts from these stages fail on every variant
        pub rejected_origins: Mutex<HashSet<ArtifactOrigin>>,
    }

    impl MockEngineFactory {
        pub fn new() -> Self {
            Self {
                inits: AtomicUsize::new(0),
                failing: Mutex::new(HashSet::new()),
                delay: Duration::ZERO,
                initialized: Mutex::new(Vec::new()),
                rejected_origins: Mutex::new(HashSet::new()),
            }
        }

        pub fn rejecting(origin: ArtifactOrigin) -> Self {
            let factory = Self::new();
            factory.rejected_origins.lock().unwrap().insert(origin);
            factory
        }

        pub fn failing(variants: &[EngineVariant]) -> Self {
            let factory = Self::new();
            factory
                .failing
                .lock()
                .unwrap()
                .extend(variants.iter().copied());
            factory
        }
    }

    #[async_trait]
    impl EngineFactory for MockEngineFactory {
        async fn initialize(
            &self,
            variant: EngineVariant,
            artifact: &Artifact,
        ) -> OrchestratorResult<Arc<dyn InferenceEngine>> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.lock().unwrap().contains(&variant)
                || self
                    .rejected_origins
                    .lock()
                    .unwrap()
                    .contains(&artifact.origin)
            {
                return Err(OrchestratorError::EngineInitFailure {
                    slug: artifact.slug.clone(),
                    reason: format!("{variant} engine rejected weights"),
                });
            }
            self.initialized
                .lock()
                .unwrap()
                .push((variant, artifact.path.clone()));
            Ok(Arc::new(MockEngine::new()))
        }
    }
}
