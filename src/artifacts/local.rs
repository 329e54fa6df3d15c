//! Local weight discovery
//!
//! Scans the models directory for usable artifacts. Layout:
//! ```text
//! models/
//! ├── lfm2-350m/              weight folder
//! │   ├── config.json
//! │   └── model.gguf
//! ├── qwen3-embedding-0.6b.gguf   single file
//! └── notes.txt               ignored
//! ```

use super::{Artifact, ArtifactKind, ArtifactOrigin};
use std::path::{Path, PathBuf};

/// File extensions recognised as model weights
pub const WEIGHT_EXTENSIONS: &[&str] = &["gguf", "bin", "safetensors", "onnx"];

/// A weight folder or file found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCandidate {
    /// Folder name, or file name without extension
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

fn is_weight_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                WEIGHT_EXTENSIONS
                    .iter()
                    .any(|w| w.eq_ignore_ascii_case(ext))
            })
}

/// Suffix of directories that hold an unfinished repository download
pub const STAGING_SUFFIX: &str = ".partial";

fn is_staging_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(STAGING_SUFFIX))
}

/// A directory counts as a weight folder when it holds a config or weight file
fn is_weight_folder(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    if path.join("config.json").is_file() {
        return true;
    }
    std::fs::read_dir(path)
        .map(|entries| entries.flatten().any(|e| is_weight_file(&e.path())))
        .unwrap_or(false)
}

/// First weight file in `dir`, preferring `.gguf`, name-ordered.
///
/// Looks one subdirectory level down when the top level has no weights.
pub fn first_weight_file(dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .collect();
    entries.sort();

    if let Some(file) = preferred_weight(&entries) {
        return Some(file);
    }

    entries
        .iter()
        .filter(|p| p.is_dir())
        .find_map(|sub| {
            let mut nested: Vec<PathBuf> = std::fs::read_dir(sub)
                .ok()?
                .flatten()
                .map(|e| e.path())
                .collect();
            nested.sort();
            preferred_weight(&nested)
        })
}

fn preferred_weight(sorted: &[PathBuf]) -> Option<PathBuf> {
    let weights: Vec<&PathBuf> = sorted.iter().filter(|p| is_weight_file(p)).collect();
    let is_gguf = |p: &PathBuf| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
    weights
        .iter()
        .find(|p| is_gguf(p))
        .or_else(|| weights.first())
        .map(|p| (*p).clone())
}

/// Every candidate in `models_dir`, folders first, each group sorted by name
pub fn list_candidates(models_dir: &Path) -> Vec<LocalCandidate> {
    let Ok(entries) = std::fs::read_dir(models_dir) else {
        return Vec::new();
    };

    let mut folders = Vec::new();
    let mut files = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        if is_staging_dir(&path) {
            continue;
        }
        if is_weight_folder(&path) {
            folders.push(LocalCandidate {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                kind: ArtifactKind::WeightFolder,
            });
        } else if is_weight_file(&path) {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            files.push(LocalCandidate {
                name,
                path,
                kind: ArtifactKind::SingleFile,
            });
        }
    }

    folders.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    folders.extend(files);
    folders
}

/// Match `slug` against local candidates.
///
/// Exact name across all candidates first, then case-insensitive substring,
/// then (if `allow_any`) the first candidate. Folders win ties within a pass.
pub fn find_artifact(models_dir: &Path, slug: &str, allow_any: bool) -> Option<Artifact> {
    let candidates = list_candidates(models_dir);
    let needle = slug.to_lowercase();

    let found = candidates
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(slug))
        .or_else(|| {
            candidates
                .iter()
                .find(|c| c.name.to_lowercase().contains(&needle))
        })
        .or_else(|| if allow_any { candidates.first() } else { None })?;

    tracing::debug!(
        slug = %slug,
        candidate = %found.name,
        path = ?found.path,
        "Found local artifact"
    );
    Some(Artifact::new(
        slug,
        found.path.clone(),
        found.kind,
        ArtifactOrigin::Local,
    ))
}

/// Recursively calculate directory size
pub fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}
