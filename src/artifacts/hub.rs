//! Remote registry and repository clients backed by hf-hub
//!
//! Files land in the standard hub cache, so repeated downloads are free.
//! The registry addresses models as `<org>/<slug>`; the repository client
//! takes full repository ids from the catalog.

use super::{DownloadProgress, RegistryListing, RemoteRegistry, RemoteRepository};
use crate::error::{OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiError};
use std::path::{Path, PathBuf};

/// Repository metadata files that are never needed to run a model
const SKIPPED_FILES: &[&str] = &[".gitattributes", "README.md"];

/// Build an hf-hub client, optionally with a custom cache directory
pub fn hub_api(cache_dir: Option<PathBuf>) -> OrchestratorResult<Api> {
    let api = match cache_dir {
        Some(dir) => ApiBuilder::new().with_cache_dir(dir).build(),
        None => Api::new(),
    };
    api.map_err(|e| OrchestratorError::network(format!("failed to create hub client: {e}")))
}

fn is_not_found(err: &ApiError) -> bool {
    let message = err.to_string();
    message.contains("404") || message.contains("Not Found")
}

async fn list_repo_files(api: &Api, repo_id: &str) -> Result<Vec<String>, ApiError> {
    let info = api.model(repo_id.to_string()).info().await?;
    Ok(info
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .filter(|name| !SKIPPED_FILES.contains(&name.as_str()))
        .collect())
}

/// Strip `rfilename`'s components off a downloaded file path to get the
/// snapshot directory
fn snapshot_root(downloaded: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    let mut root = downloaded.to_path_buf();
    for _ in 0..depth {
        if !root.pop() {
            return None;
        }
    }
    Some(root)
}

/// Registry of prebuilt weights published under one organisation
pub struct HubRegistry {
    api: Api,
    org: String,
}

impl HubRegistry {
    pub fn new(api: Api, org: impl Into<String>) -> Self {
        Self {
            api,
            org: org.into(),
        }
    }

    fn repo_id(&self, slug: &str) -> String {
        format!("{}/{}", self.org, slug)
    }
}

#[async_trait]
impl RemoteRegistry for HubRegistry {
    async fn lookup(&self, slug: &str) -> OrchestratorResult<Option<RegistryListing>> {
        let repo_id = self.repo_id(slug);
        match list_repo_files(&self.api, &repo_id).await {
            Ok(files) if files.is_empty() => Ok(None),
            Ok(files) => Ok(Some(RegistryListing {
                slug: slug.to_string(),
                repo_id,
                files,
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(OrchestratorError::network(e)),
        }
    }

    async fn download(
        &self,
        listing: &RegistryListing,
        progress: DownloadProgress,
    ) -> OrchestratorResult<PathBuf> {
        tracing::info!(
            slug = %listing.slug,
            repo_id = %listing.repo_id,
            file_count = listing.files.len(),
            "Starting registry download via hf-hub"
        );

        let repo = self.api.model(listing.repo_id.clone());
        let total = listing.files.len();
        let mut root = None;

        for (i, file) in listing.files.iter().enumerate() {
            tracing::debug!(slug = %listing.slug, file = %file, "Downloading file");
            let path = repo.get(file).await.map_err(|e| {
                OrchestratorError::network(format!("failed to download {file}: {e}"))
            })?;
            if root.is_none() {
                root = snapshot_root(&path, file);
            }
            progress((i + 1) as f32 / total as f32);
        }

        root.ok_or_else(|| {
            OrchestratorError::unavailable(
                &listing.slug,
                "registry download produced no snapshot directory",
            )
        })
    }
}

/// Arbitrary repositories named by catalog entries
pub struct HubRepository {
    api: Api,
}

impl HubRepository {
    pub fn new(api: Api) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RemoteRepository for HubRepository {
    async fn list_files(&self, repo_id: &str) -> OrchestratorResult<Vec<String>> {
        list_repo_files(&self.api, repo_id)
            .await
            .map_err(OrchestratorError::network)
    }

    async fn download_file(
        &self,
        repo_id: &str,
        file: &str,
        dest: &Path,
    ) -> OrchestratorResult<()> {
        let cached = self
            .api
            .model(repo_id.to_string())
            .get(file)
            .await
            .map_err(|e| OrchestratorError::network(format!("failed to download {file}: {e}")))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Copy to a sibling temp file first so a partial copy is never
        // mistaken for a complete one
        let mut partial = dest.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        tokio::fs::copy(&cached, &partial).await?;
        tokio::fs::rename(&partial, dest).await?;

        tracing::debug!(repo_id = %repo_id, file = %file, dest = ?dest, "Downloaded repository file");
        Ok(())
    }
}
