//! Artifact resolution: model slug -> ready engine handle
//!
//! Resolution runs three stages in strict order and the first one that yields
//! an engine wins:
//! 1. Remote registry: download the listed files and initialize the primary
//!    engine, falling back to the alternate engine over the same files.
//! 2. Local storage: scan the models directory for a weight folder or file.
//! 3. Remote repository: for catalog entries that declare one, download the
//!    full file set into `<models_dir>/<slug>.partial/`, promote it to
//!    `<models_dir>/<slug>/` once every file is present, and initialize.
//!
//! A local artifact whose engine fails to start does not end resolution; the
//! repository stage still gets its turn.

pub mod hub;
pub mod local;

use crate::catalog::CatalogEntry;
use crate::engine::{EngineFactory, EngineHandle, EngineVariant};
use crate::error::{OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub use hub::{HubRegistry, HubRepository};

/// Shape of the on-disk weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Directory holding weight and config files
    WeightFolder,
    /// A single weight file (e.g. `.gguf`)
    SingleFile,
}

/// Which resolution stage located the weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    Registry,
    Local,
    Repository,
}

/// Model weights ready to hand to an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub slug: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub origin: ArtifactOrigin,
}

impl Artifact {
    pub fn new(slug: &str, path: PathBuf, kind: ArtifactKind, origin: ArtifactOrigin) -> Self {
        Self {
            slug: slug.to_string(),
            path,
            kind,
            origin,
        }
    }

    /// Total bytes on disk
    pub fn size_bytes(&self) -> u64 {
        match self.kind {
            ArtifactKind::WeightFolder => local::dir_size(&self.path),
            ArtifactKind::SingleFile => std::fs::metadata(&self.path)
                .map(|m| m.len())
                .unwrap_or(0),
        }
    }
}

/// Download progress sink, receives a fraction in [0, 1]
pub type DownloadProgress = Arc<dyn Fn(f32) + Send + Sync>;

/// A slug listed by the remote registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryListing {
    pub slug: String,
    pub repo_id: String,
    pub files: Vec<String>,
}

/// Remote model registry keyed by slug
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// Listing for `slug`, or `None` when the registry does not carry it
    async fn lookup(&self, slug: &str) -> OrchestratorResult<Option<RegistryListing>>;

    /// Fetch every listed file; repeated calls reuse completed files.
    /// Returns the directory holding the files.
    async fn download(
        &self,
        listing: &RegistryListing,
        progress: DownloadProgress,
    ) -> OrchestratorResult<PathBuf>;
}

/// Remote repository addressed by repository id
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    async fn list_files(&self, repo_id: &str) -> OrchestratorResult<Vec<String>>;

    /// Download one file to `dest`, replacing it atomically
    async fn download_file(&self, repo_id: &str, file: &str, dest: &Path)
    -> OrchestratorResult<()>;
}

/// Turns a slug into an initialized engine; the lifecycle manager's only view
/// of artifact resolution
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn resolve(
        &self,
        slug: &str,
        entry: Option<&CatalogEntry>,
    ) -> OrchestratorResult<EngineHandle>;
}

/// Multi-stage resolver over registry, local files and repository
pub struct ArtifactResolver {
    engines: Arc<dyn EngineFactory>,
    models_dir: PathBuf,
    registry: Option<Arc<dyn RemoteRegistry>>,
    repository: Option<Arc<dyn RemoteRepository>>,
}

impl ArtifactResolver {
    pub fn new(engines: Arc<dyn EngineFactory>, models_dir: PathBuf) -> Self {
        Self {
            engines,
            models_dir,
            registry: None,
            repository: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn RemoteRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn RemoteRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Primary engine first, alternate engine over the same files second
    async fn initialize(&self, artifact: &Artifact) -> OrchestratorResult<EngineHandle> {
        tracing::info!(
            slug = %artifact.slug,
            path = ?artifact.path,
            origin = ?artifact.origin,
            "Initializing primary engine"
        );

        let primary_err = match self
            .engines
            .initialize(EngineVariant::Primary, artifact)
            .await
        {
            Ok(engine) => return Ok(EngineHandle::new(EngineVariant::Primary, engine)),
            Err(e) => e,
        };

        tracing::warn!(
            slug = %artifact.slug,
            error = %primary_err,
            "Primary engine failed, falling back to alternate engine"
        );

        match self
            .engines
            .initialize(EngineVariant::Fallback, artifact)
            .await
        {
            Ok(engine) => {
                tracing::info!(slug = %artifact.slug, "Fallback engine initialized");
                Ok(EngineHandle::new(EngineVariant::Fallback, engine))
            }
            Err(fallback_err) => Err(OrchestratorError::EngineInitFailure {
                slug: artifact.slug.clone(),
                reason: format!("primary: {primary_err}; fallback: {fallback_err}"),
            }),
        }
    }

    /// Stage 1. `Ok(None)` means the stage did not produce files.
    async fn fetch_from_registry(
        &self,
        registry: &dyn RemoteRegistry,
        slug: &str,
        misses: &mut Vec<String>,
    ) -> Option<Artifact> {
        let listing = match registry.lookup(slug).await {
            Ok(Some(listing)) => listing,
            Ok(None) => {
                tracing::debug!(slug = %slug, "Slug not listed in remote registry");
                misses.push("not listed in remote registry".to_string());
                return None;
            }
            Err(e) => {
                tracing::warn!(slug = %slug, error = %e, "Registry lookup failed");
                misses.push(format!("registry lookup: {e}"));
                return None;
            }
        };

        match registry.download(&listing, progress_logger(slug)).await {
            Ok(dir) => Some(Artifact::new(
                slug,
                dir,
                ArtifactKind::WeightFolder,
                ArtifactOrigin::Registry,
            )),
            Err(e) => {
                tracing::warn!(slug = %slug, error = %e, "Registry download failed");
                misses.push(format!("registry download: {e}"));
                None
            }
        }
    }

    /// Stage 3: full file set into a per-slug directory.
    ///
    /// Files land in a staging directory first. Files already there from an
    /// interrupted attempt are kept, so a retry only fetches what is missing.
    async fn fetch_from_repository(
        &self,
        repository: &dyn RemoteRepository,
        slug: &str,
        repo_id: &str,
    ) -> OrchestratorResult<Artifact> {
        let files = repository.list_files(repo_id).await?;
        if files.is_empty() {
            return Err(OrchestratorError::unavailable(
                slug,
                format!("repository {repo_id} has no files"),
            ));
        }
        if let Some(bad) = files.iter().find(|f| !is_relative_file(f)) {
            return Err(OrchestratorError::unavailable(
                slug,
                format!("repository {repo_id} lists unsafe path {bad:?}"),
            ));
        }

        let dest_dir = self.models_dir.join(slug);
        let staging_dir = self
            .models_dir
            .join(format!("{slug}{}", local::STAGING_SUFFIX));
        tokio::fs::create_dir_all(&staging_dir).await?;

        tracing::info!(
            slug = %slug,
            repo_id = %repo_id,
            file_count = files.len(),
            staging = ?staging_dir,
            "Downloading repository file set"
        );

        let progress = progress_logger(slug);
        let total = files.len();
        for (i, file) in files.iter().enumerate() {
            let dest = staging_dir.join(file);
            if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                tracing::debug!(slug = %slug, file = %file, "File already present, skipping");
            } else {
                repository.download_file(repo_id, file, &dest).await?;
            }
            progress((i + 1) as f32 / total as f32);
        }

        if tokio::fs::try_exists(&dest_dir).await.unwrap_or(false) {
            tracing::info!(slug = %slug, dest = ?dest_dir, "Replacing existing model folder");
            tokio::fs::remove_dir_all(&dest_dir).await?;
        }
        tokio::fs::rename(&staging_dir, &dest_dir).await?;

        Ok(Artifact::new(
            slug,
            dest_dir,
            ArtifactKind::WeightFolder,
            ArtifactOrigin::Repository,
        ))
    }
}

/// Repository file names must stay inside the destination directory
fn is_relative_file(file: &str) -> bool {
    !file.is_empty()
        && Path::new(file)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl ArtifactSource for ArtifactResolver {
    async fn resolve(
        &self,
        slug: &str,
        entry: Option<&CatalogEntry>,
    ) -> OrchestratorResult<EngineHandle> {
        let mut misses = Vec::new();

        if let Some(registry) = &self.registry
            && let Some(artifact) = self
                .fetch_from_registry(registry.as_ref(), slug, &mut misses)
                .await
        {
            return self.initialize(&artifact).await;
        }

        let remote_repo = entry.and_then(|e| e.remote_repo.as_deref());

        // Entries backed by a repository download their own weights rather
        // than borrowing an unrelated local model
        let allow_any = remote_repo.is_none();
        let mut local_failure = None;
        match local::find_artifact(&self.models_dir, slug, allow_any) {
            Some(artifact) => match self.initialize(&artifact).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::warn!(
                        slug = %slug,
                        path = ?artifact.path,
                        error = %e,
                        "Local artifact failed to initialize"
                    );
                    misses.push(format!("local {:?}: {e}", artifact.path));
                    local_failure = Some(e);
                }
            },
            None => misses.push(format!("no local artifact in {:?}", self.models_dir)),
        }

        match (remote_repo, &self.repository) {
            (Some(repo_id), Some(repository)) => {
                match self
                    .fetch_from_repository(repository.as_ref(), slug, repo_id)
                    .await
                {
                    Ok(artifact) => return self.initialize(&artifact).await,
                    Err(e) => {
                        tracing::warn!(slug = %slug, repo_id = %repo_id, error = %e, "Repository download failed");
                        misses.push(format!("repository {repo_id}: {e}"));
                    }
                }
            }
            (Some(repo_id), None) => {
                misses.push(format!("repository {repo_id} configured but no client"))
            }
            (None, _) => {}
        }

        Err(local_failure
            .unwrap_or_else(|| OrchestratorError::unavailable(slug, misses.join("; "))))
    }
}

/// Logs download progress at 25% steps
pub fn progress_logger(slug: &str) -> DownloadProgress {
    let slug = slug.to_string();
    let last_quarter = AtomicU8::new(0);
    Arc::new(move |fraction: f32| {
        let quarter = (fraction.clamp(0.0, 1.0) * 4.0).floor() as u8;
        if quarter > last_quarter.fetch_max(quarter, Ordering::SeqCst) {
            tracing::info!(
                slug = %slug,
                percent = u32::from(quarter) * 25,
                "Download progress"
            );
        }
    })
}
