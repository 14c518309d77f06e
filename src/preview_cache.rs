//! Single-slot cache for before/after preview clips.
//!
//! The key is a typed record of every input that changes the rendered clips.
//! [`EncodeSettings`] is embedded whole, so a new setting automatically
//! becomes part of the key.

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::config::EncodeSettings;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewMode {
    Single,
    Batch,
}

/// A source file as it was when the preview was rendered. Editing the file
/// changes size or mtime and therefore the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified_ms: u64,
}

impl SourceIdentity {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified_ms,
        })
    }

    /// Identity for a path that could not be inspected. It still takes part
    /// in the key so the render attempt (and its error) is per source.
    pub fn unreadable(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            size: 0,
            modified_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewCacheKey {
    pub mode: PreviewMode,
    pub sources: Vec<SourceIdentity>,
    pub output_extension: String,
    pub settings: EncodeSettings,
    pub preview_seconds: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewPair {
    pub source: PathBuf,
    pub source_clip: PathBuf,
    pub compressed_clip: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewFailure {
    pub source: PathBuf,
    pub error: String,
}

/// What a generator produced for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generated {
    pub pairs: Vec<PreviewPair>,
    pub failures: Vec<PreviewFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    Hit,
    Miss,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewArtifacts {
    pub outcome: CacheOutcome,
    pub pairs: Vec<PreviewPair>,
    /// Sources that failed to render. Non-empty alongside `pairs` means a
    /// partial result.
    pub failures: Vec<PreviewFailure>,
}

impl PreviewArtifacts {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct CacheEntry {
    key: PreviewCacheKey,
    pairs: Vec<PreviewPair>,
    owned: Vec<PathBuf>,
    /// False when some sources failed; such an entry still owns its files
    /// but never counts as a hit.
    complete: bool,
}

#[derive(Default)]
pub struct PreviewCache {
    entry: Option<CacheEntry>,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached pairs when `key` matches and every file is still on
    /// disk; otherwise evict, run `generate`, and keep what it produced.
    ///
    /// A generation with failures is returned but never served as a hit, so
    /// asking again retries the sources that failed.
    pub async fn get_or_generate<F, Fut>(
        &mut self,
        key: PreviewCacheKey,
        generate: F,
    ) -> Result<PreviewArtifacts, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Generated>,
    {
        if let Some(entry) = &self.entry
            && entry.complete
            && entry.key == key
            && entry.owned.iter().all(|p| p.is_file())
        {
            log::debug!(target: "compresso::preview_cache", "Preview cache hit");
            return Ok(PreviewArtifacts {
                outcome: CacheOutcome::Hit,
                pairs: entry.pairs.clone(),
                failures: Vec::new(),
            });
        }

        self.clear();
        let generated = generate().await;

        if generated.pairs.is_empty() {
            let message = generated
                .failures
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_else(|| "Nothing to preview".to_string());
            return Err(AppError::Preview(message));
        }

        let owned: Vec<PathBuf> = generated
            .pairs
            .iter()
            .flat_map(|p| [p.source_clip.clone(), p.compressed_clip.clone()])
            .collect();
        let complete = generated.failures.is_empty();
        if !complete {
            log::warn!(
                target: "compresso::preview_cache",
                "Preview partially failed for {} source(s)",
                generated.failures.len()
            );
        }
        self.entry = Some(CacheEntry {
            key,
            pairs: generated.pairs.clone(),
            owned,
            complete,
        });

        Ok(PreviewArtifacts {
            outcome: CacheOutcome::Miss,
            pairs: generated.pairs,
            failures: generated.failures,
        })
    }

    /// Delete every file owned by the current entry. Failures are logged and
    /// swallowed.
    pub fn clear(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        for path in entry.owned {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    target: "compresso::preview_cache",
                    "Could not delete preview file {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }

    pub fn owned_paths(&self) -> Vec<PathBuf> {
        self.entry
            .as_ref()
            .map(|e| e.owned.clone())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}

impl Drop for PreviewCache {
    fn drop(&mut self) {
        self.clear();
    }
}
