//! Configuration structures and loading logic

use crate::catalog::CatalogEntry;
use crate::device::DeviceProfile;
use crate::engine::EngineCommand;
use crate::memory::MemoryConfig;
use crate::router::RouterConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    /// Vector store snapshots
    pub data_dir: PathBuf,
    /// Locally available model weights, and the repository download target
    pub models_dir: PathBuf,
    /// Registry organisation that publishes ready-to-run weight folders
    pub registry_org: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_cache_dir: Option<PathBuf>,
    /// Overrides the operating system memory query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_ram_bytes: Option<u64>,
    pub embedding_model: String,
    pub persist_debounce_ms: u64,
    pub engine: EngineConfig,
    pub router: RouterConfig,
    pub memory: MemoryConfig,
    /// Replaces the built-in device profiles when non-empty
    pub profiles: Vec<DeviceProfile>,
    /// Extra catalog entries; a built-in slug is replaced
    pub models: Vec<CatalogEntry>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            data_dir: PathBuf::from("./data"),
            models_dir: PathBuf::from("./models"),
            registry_org: default_registry_org(),
            hub_cache_dir: None,
            device_ram_bytes: None,
            embedding_model: default_embedding_model(),
            persist_debounce_ms: default_persist_debounce_ms(),
            engine: EngineConfig::default(),
            router: RouterConfig::default(),
            memory: MemoryConfig::default(),
            profiles: Vec::new(),
            models: Vec::new(),
        }
    }
}

/// Primary and fallback inference server commands
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub primary: EngineCommand,
    pub fallback: EngineCommand,
    pub start_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary: EngineCommand::default(),
            fallback: EngineCommand::cpu_fallback(),
            start_timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("SLM_MANAGER_API_PORT") {
            config.api_port = port.parse().context("Invalid SLM_MANAGER_API_PORT value")?;
        }
        if let Ok(dir) = std::env::var("SLM_MANAGER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SLM_MANAGER_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(bytes) = std::env::var("SLM_MANAGER_DEVICE_RAM_BYTES") {
            config.device_ram_bytes = Some(
                bytes
                    .parse()
                    .context("Invalid SLM_MANAGER_DEVICE_RAM_BYTES value")?,
            );
        }
        if let Ok(binary) = std::env::var("SLM_ENGINE_BINARY") {
            config.engine.primary.binary = binary.clone();
            config.engine.fallback.binary = binary;
        }

        Ok(config)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Port range validation
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }

        let mut slugs = HashSet::new();
        for entry in &self.models {
            if entry.slug.is_empty() {
                anyhow::bail!("Model slug cannot be empty");
            }
            if entry.slug.contains('/') || entry.slug.contains('\\') {
                anyhow::bail!("Model slug '{}' cannot contain path separators", entry.slug);
            }
            if !slugs.insert(&entry.slug) {
                anyhow::bail!("Duplicate model slug: {}", entry.slug);
            }
        }

        if self.embedding_model.is_empty() {
            anyhow::bail!("Embedding model cannot be empty");
        }
        if self.memory.chunk_size == 0 {
            anyhow::bail!("Memory chunk_size must be > 0");
        }
        if self.memory.chunk_overlap >= self.memory.chunk_size {
            anyhow::bail!(
                "Memory chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.memory.chunk_overlap,
                self.memory.chunk_size
            );
        }
        if self.engine.primary.binary.is_empty() || self.engine.fallback.binary.is_empty() {
            anyhow::bail!("Engine binary cannot be empty");
        }

        // Ensure working directories exist or can be created
        for dir in [&self.data_dir, &self.models_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Cannot create directory: {:?}", dir))?;
            }
        }

        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    9100
}
fn default_registry_org() -> String {
    "Cactus-Compute".to_string()
}
fn default_embedding_model() -> String {
    "qwen3-embedding-0.6b".to_string()
}
fn default_persist_debounce_ms() -> u64 {
    2000
}
