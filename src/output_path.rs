//! Destination path resolution for batch items.

use std::path::{Path, PathBuf};

use crate::config::{BatchConfig, DestinationMode, NamingMode};
use crate::error::PathError;

/// Numeric suffixes tried before giving up on a free name.
pub const MAX_COLLISION_ATTEMPTS: u32 = 10_000;

/// Collision-free destination for `source` under `config`, probing the real
/// filesystem.
pub fn resolve_output_path(source: &Path, config: &BatchConfig) -> Result<PathBuf, PathError> {
    resolve_output_path_with(source, config, |p| p.exists())
}

/// Same as [`resolve_output_path`] with an injectable existence probe.
///
/// `replace` returns the source untouched. Everything else builds
/// `<dir>/<prefix><stem><suffix>.<ext>` and, while that exists, tries
/// `<stem>_1`, `<stem>_2`, … before the extension.
pub fn resolve_output_path_with(
    source: &Path,
    config: &BatchConfig,
    exists: impl Fn(&Path) -> bool,
) -> Result<PathBuf, PathError> {
    if config.naming_mode == NamingMode::Replace {
        return Ok(source.to_path_buf());
    }

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PathError::MissingFileName(source.display().to_string()))?;

    let dir = match config.destination_mode {
        DestinationMode::SourceAdjacent => source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
        DestinationMode::CustomFolder => match config.custom_folder.as_deref() {
            Some(folder) if !folder.as_os_str().is_empty() => folder.to_path_buf(),
            _ => return Err(PathError::CustomFolderUnset),
        },
    };

    let base = match config.naming_mode {
        NamingMode::Prefix => format!("{}{}", config.prefix, stem),
        NamingMode::Suffix => format!("{}{}", stem, config.suffix),
        NamingMode::Replace => stem,
    };
    let extension = config.output_extension_for(source);

    let candidate = dir.join(format!("{}.{}", base, extension));
    if !exists(&candidate) {
        return Ok(candidate);
    }
    for n in 1..=MAX_COLLISION_ATTEMPTS {
        let candidate = dir.join(format!("{}_{}.{}", base, n, extension));
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }
    Err(PathError::TooManyCollisions {
        attempts: MAX_COLLISION_ATTEMPTS,
    })
}
