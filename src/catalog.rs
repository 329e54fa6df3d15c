//! Model catalog and tier classification
//!
//! The catalog is the static registry of every model the manager knows how to
//! load. Each entry carries its download size, capabilities and optionally a
//! remote repository holding its weights. Tiers decide eviction priority.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Eviction-priority class of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Never evicted automatically
    Hot,
    /// Kept loaded while the budget allows
    Warm,
    /// Loaded on demand, first to go
    Cold,
}

impl ModelTier {
    /// Lower rank is evicted first when two models were last used at the same instant
    pub fn eviction_rank(self) -> u8 {
        match self {
            Self::Cold => 0,
            Self::Warm => 1,
            Self::Hot => 2,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Text,
    Vision,
    Audio,
    Specialized,
    Custom,
    Embedding,
}

/// Capability flags advertised by a model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub completion: bool,
    pub tool_calling: bool,
    pub vision: bool,
    pub audio: bool,
    pub thinking: bool,
}

/// A single catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub slug: String,
    pub category: ModelCategory,
    pub size_mb: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub is_custom: bool,
    /// Remote repository id holding the full weight set (e.g. "org/name")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_repo: Option<String>,
    #[serde(default)]
    pub is_stt: bool,
    /// Tier override; entries without one use the static tier table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,
}

impl CatalogEntry {
    fn builtin(
        name: &str,
        slug: &str,
        category: ModelCategory,
        size_mb: u64,
        description: &str,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            name: name.to_string(),
            slug: slug.to_string(),
            category,
            size_mb,
            description: description.to_string(),
            capabilities,
            is_custom: false,
            remote_repo: None,
            is_stt: false,
            tier: None,
        }
    }

    /// Whether the model can serve chat completions
    pub fn is_chat_capable(&self) -> bool {
        self.capabilities.completion && !self.is_stt
    }
}

const TEXT: Capabilities = Capabilities {
    completion: true,
    tool_calling: false,
    vision: false,
    audio: false,
    thinking: false,
};

/// Static slug -> tier table
const TIER_TABLE: &[(&str, ModelTier)] = &[
    ("lfm25-mobile-actions", ModelTier::Hot),
    ("lfm2-350m", ModelTier::Hot),
    ("whisper-small", ModelTier::Warm),
    ("qwen3-embedding-0.6b", ModelTier::Warm),
    ("lfm2-vl-450m", ModelTier::Warm),
    ("lfm2-1.2b", ModelTier::Warm),
    ("lfm2-1.2b-rag", ModelTier::Warm),
    ("lfm2-700m", ModelTier::Cold),
    ("lfm2-vl-1.6b", ModelTier::Cold),
    ("whisper-medium", ModelTier::Cold),
    ("lfm25-1.2b-thinking", ModelTier::Cold),
];

/// Look up a slug in the static tier table; unknown slugs are cold
pub fn tier_for(slug: &str) -> ModelTier {
    TIER_TABLE
        .iter()
        .find(|(s, _)| *s == slug)
        .map(|(_, tier)| *tier)
        .unwrap_or(ModelTier::Cold)
}

/// The built-in model set
pub fn builtin_models() -> Vec<CatalogEntry> {
    use ModelCategory::*;

    let vision = Capabilities {
        vision: true,
        ..TEXT
    };
    let audio = Capabilities {
        completion: false,
        audio: true,
        ..TEXT
    };

    let mut whisper_small = CatalogEntry::builtin(
        "Whisper Small",
        "whisper-small",
        Audio,
        244,
        "Fast on-device speech-to-text transcription.",
        audio,
    );
    whisper_small.is_stt = true;

    let mut whisper_medium = CatalogEntry::builtin(
        "Whisper Medium",
        "whisper-medium",
        Audio,
        769,
        "Higher accuracy speech-to-text transcription.",
        audio,
    );
    whisper_medium.is_stt = true;

    let mut mobile_actions = CatalogEntry::builtin(
        "LFM2.5 Mobile Actions",
        "lfm25-mobile-actions",
        Custom,
        600,
        "Fine-tuned for mobile action tool calling.",
        Capabilities {
            tool_calling: true,
            ..TEXT
        },
    );
    mobile_actions.is_custom = true;
    mobile_actions.remote_repo = Some("kshitijthakkar/lfm25-mobile-actions-cactus".to_string());

    vec![
        CatalogEntry::builtin(
            "LFM2-350M",
            "lfm2-350m",
            Text,
            200,
            "Lightweight model for fast inference.",
            TEXT,
        ),
        CatalogEntry::builtin(
            "LFM2-700M",
            "lfm2-700m",
            Text,
            400,
            "Medium model balancing speed and quality.",
            TEXT,
        ),
        CatalogEntry::builtin(
            "LFM2-1.2B",
            "lfm2-1.2b",
            Text,
            600,
            "Standard model for everyday use.",
            TEXT,
        ),
        CatalogEntry::builtin(
            "LFM2.5-1.2B-Thinking",
            "lfm25-1.2b-thinking",
            Text,
            730,
            "Reasoning model that thinks before answering.",
            Capabilities {
                thinking: true,
                ..TEXT
            },
        ),
        CatalogEntry::builtin(
            "LFM2-1.2B-RAG",
            "lfm2-1.2b-rag",
            Specialized,
            600,
            "Optimized for retrieval-augmented generation.",
            TEXT,
        ),
        CatalogEntry::builtin(
            "LFM2-VL-450M",
            "lfm2-vl-450m",
            Vision,
            300,
            "Compact vision-language model.",
            vision,
        ),
        CatalogEntry::builtin(
            "LFM2-VL-1.6B",
            "lfm2-vl-1.6b",
            Vision,
            900,
            "Standard vision-language model.",
            vision,
        ),
        whisper_small,
        whisper_medium,
        CatalogEntry::builtin(
            "Qwen3-Embedding-0.6B",
            "qwen3-embedding-0.6b",
            Embedding,
            394,
            "Text embedding model for semantic memory and RAG.",
            Capabilities::default(),
        ),
        mobile_actions,
    ]
}

/// Immutable model registry
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Build a catalog from a list of entries; later duplicates replace earlier ones
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let mut catalog = Self {
            entries: Vec::with_capacity(entries.len()),
            index: HashMap::new(),
        };
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    /// Built-in models plus extra entries from configuration
    pub fn with_extra(extra: Vec<CatalogEntry>) -> Self {
        let mut entries = builtin_models();
        entries.extend(extra);
        Self::new(entries)
    }

    fn insert(&mut self, entry: CatalogEntry) {
        match self.index.get(&entry.slug) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.index.insert(entry.slug.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, slug: &str) -> Option<&CatalogEntry> {
        self.index.get(slug).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.index.contains_key(slug)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn by_category(&self, category: ModelCategory) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    /// Tier of a slug: entry override, then the static table, then cold
    pub fn tier(&self, slug: &str) -> ModelTier {
        self.get(slug)
            .and_then(|e| e.tier)
            .unwrap_or_else(|| tier_for(slug))
    }

    /// First thinking-capable chat model, if any
    pub fn reasoning_model(&self) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.capabilities.thinking && e.is_chat_capable())
    }

    /// Smallest chat-capable model; ties keep catalog order
    pub fn smallest_chat_model(&self) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_chat_capable())
            .min_by_key(|e| e.size_mb)
    }

    pub fn embedding_models(&self) -> Vec<&CatalogEntry> {
        self.by_category(ModelCategory::Embedding)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(builtin_models())
    }
}
