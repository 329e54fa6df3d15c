//! SLM Manager - On-device small language model lifecycle manager
//!
//! Keeps a set of local language models loaded within a device RAM budget,
//! routes user messages to the model best suited to them, and provides a
//! semantic memory and document store backed by an embedding model.

pub mod api;
pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod router;
pub mod storage;
pub mod vector_store;

pub use artifacts::{Artifact, ArtifactResolver, ArtifactSource};
pub use catalog::{Catalog, CatalogEntry, ModelTier};
pub use config::ManagerConfig;
pub use device::{DeviceProfile, MemoryProbe};
pub use dispatch::{ModelDispatcher, RouteDecision};
pub use engine::{EngineHandle, EngineVariant, InferenceEngine};
pub use error::{OrchestratorError, OrchestratorResult};
pub use lifecycle::{LifecycleEvent, ManagedModel, ModelLifecycleManager, ModelState};
pub use memory::{MemoryConfig, MemoryService};
pub use router::{Intent, IntentRouter, RouterConfig, RoutingResult};
pub use storage::{FileSystemStorage, StorageBackend};
pub use vector_store::{VectorStore, cosine_similarity};
