//! Filesystem collaborator and input discovery.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use walkdir::WalkDir;

use crate::config::is_supported_extension;
use crate::error::AppError;
use crate::ffmpeg::TEMP_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    /// Lowercased, without the dot. Empty when the file has none.
    pub extension: String,
}

/// What the orchestrator needs from the filesystem.
pub trait MediaFs: Send + Sync {
    fn metadata(&self, path: &Path) -> Result<FileMetadata, AppError>;
    fn exists(&self, path: &Path) -> bool;
    /// Move `from` to `to`, replacing `to` if present.
    fn move_file(&self, from: &Path, to: &Path) -> Result<(), AppError>;
    /// Delete `path`. A file that is already gone is not an error.
    fn delete_file(&self, path: &Path) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

pub fn file_metadata(path: &Path) -> Result<FileMetadata, AppError> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(AppError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Not a file: {}", path.display()),
        )));
    }
    Ok(FileMetadata {
        path: path.to_path_buf(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size: meta.len(),
        extension: path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default(),
    })
}

fn is_cross_device_rename_error(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(18) // EXDEV
    }
    #[cfg(windows)]
    {
        e.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = e;
        false
    }
}

/// Sibling of `to` in the same directory, so the final rename never
/// crosses a device.
fn staging_path(to: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staged = format!(
        ".{}{}-{}.{}.part",
        TEMP_PREFIX,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed),
        name
    );
    match to.parent() {
        Some(parent) => parent.join(staged),
        None => PathBuf::from(staged),
    }
}

/// Copy `from` next to `to`, then rename it over `to`. `to` keeps its old
/// contents until the rename, and the staged copy is removed on failure.
fn replace_by_copy(from: &Path, to: &Path) -> io::Result<()> {
    let staged = staging_path(to);
    let result = fs::copy(from, &staged).and_then(|_| fs::rename(&staged, to));
    if result.is_err()
        && let Err(e) = fs::remove_file(&staged)
        && e.kind() != io::ErrorKind::NotFound
    {
        log::warn!(
            target: "compresso::fs",
            "Could not remove staged copy {}: {}",
            staged.display(),
            e
        );
    }
    result
}

impl MediaFs for LocalFs {
    fn metadata(&self, path: &Path) -> Result<FileMetadata, AppError> {
        file_metadata(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), AppError> {
        if let Some(parent) = to.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device_rename_error(&e) => {
                log::debug!(
                    target: "compresso::fs",
                    "Cross-device move, copying {} -> {}",
                    from.display(),
                    to.display()
                );
                replace_by_copy(from, to)?;
                if let Err(e) = fs::remove_file(from) {
                    log::warn!(
                        target: "compresso::fs",
                        "Could not remove {} after copying: {}",
                        from.display(),
                        e
                    );
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_file(&self, path: &Path) -> Result<(), AppError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFiles {
    pub files: Vec<FileMetadata>,
    /// Inputs that do not exist or could not be read.
    pub invalid_paths: Vec<PathBuf>,
    /// Explicitly given files that are not supported videos.
    pub skipped_paths: Vec<PathBuf>,
    /// Non-video files found while walking folders.
    pub ignored_count: u64,
}

fn is_supported_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(is_supported_extension)
}

/// Expand files and folders into a sorted, de-duplicated list of supported
/// videos. Folders are walked fully when `recursive`, else one level deep.
pub fn resolve_video_files(paths: &[PathBuf], recursive: bool) -> ResolvedFiles {
    let mut found: BTreeMap<PathBuf, FileMetadata> = BTreeMap::new();
    let mut result = ResolvedFiles::default();

    for path in paths {
        if path.is_file() {
            if !is_supported_video_file(path) {
                result.skipped_paths.push(path.clone());
                continue;
            }
            match file_metadata(path) {
                Ok(meta) => {
                    found.entry(path.clone()).or_insert(meta);
                }
                Err(_) => result.invalid_paths.push(path.clone()),
            }
            continue;
        }

        if !path.is_dir() {
            result.invalid_paths.push(path.clone());
            continue;
        }

        let mut walker = WalkDir::new(path).follow_links(false).min_depth(1);
        if !recursive {
            walker = walker.max_depth(1);
        }
        for entry in walker.into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let entry_path = entry.path();
            if !is_supported_video_file(entry_path) {
                result.ignored_count += 1;
                continue;
            }
            if found.contains_key(entry_path) {
                continue;
            }
            if let Ok(meta) = file_metadata(entry_path) {
                found.insert(entry_path.to_path_buf(), meta);
            }
        }
    }

    result.files = found.into_values().collect();
    result
}
