use crate::error::AppError;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

/// Base name of the FFmpeg build shipped alongside the app.
pub const BUNDLED_FFMPEG_NAME: &str = "compresso_ffmpeg";

const PATH_ENV_VARS: [&str; 2] = ["COMPRESSO_FFMPEG_PATH", "FFMPEG_PATH"];

#[cfg(target_os = "windows")]
fn find_in_path() -> Option<PathBuf> {
    first_line_of(Command::new("where").arg("ffmpeg"))
}

#[cfg(not(target_os = "windows"))]
fn find_in_path() -> Option<PathBuf> {
    first_line_of(Command::new("which").arg("ffmpeg"))
}

fn first_line_of(cmd: &mut Command) -> Option<PathBuf> {
    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim();
    (!first.is_empty()).then(|| PathBuf::from(first))
}

fn common_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/opt/local/bin/ffmpeg"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\ffmpeg\\bin\\ffmpeg.exe"),
            PathBuf::from("C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe"),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        vec![]
    }
}

static FFMPEG_PATH_CACHE: OnceLock<PathBuf> = OnceLock::new();

/// Candidate locations for a bundled binary: next to the executable, then in
/// its `bin/` subdirectory.
pub fn bundled_candidates(exe_dir: &Path, base_name: &str) -> Vec<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{}.exe", base_name.trim_end_matches(".exe"))
    } else {
        base_name.trim_end_matches(".exe").to_string()
    };
    vec![exe_dir.join(&file_name), exe_dir.join("bin").join(&file_name)]
}

fn resolve_bundled_path(base_name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let exe_dir = exe.parent()?;
    let found = bundled_candidates(exe_dir, base_name)
        .into_iter()
        .find(|p| p.exists())?;
    log::debug!(
        target: "compresso::ffmpeg::discovery",
        "FFmpeg found as bundled binary: {}",
        found.display()
    );
    Some(found)
}

fn path_from_env() -> Option<PathBuf> {
    for var in PATH_ENV_VARS {
        let Ok(value) = std::env::var(var) else {
            continue;
        };
        let p = PathBuf::from(value.trim());
        if p.exists() {
            log::debug!(
                target: "compresso::ffmpeg::discovery",
                "FFmpeg path from {} env: {}",
                var,
                p.display()
            );
            return Some(p);
        }
        log::warn!(
            target: "compresso::ffmpeg::discovery",
            "{} points to a missing file: {}",
            var,
            p.display()
        );
    }
    None
}

/// Resolve FFmpeg without consulting the process cache.
pub fn resolve_ffmpeg_path() -> Result<PathBuf, AppError> {
    if let Some(p) = path_from_env() {
        return Ok(p);
    }

    if let Some(p) = find_in_path()
        && p.exists()
    {
        log::debug!(
            target: "compresso::ffmpeg::discovery",
            "FFmpeg found in PATH: {}",
            p.display()
        );
        return Ok(p);
    }

    for path in common_paths() {
        if path.exists() {
            log::debug!(
                target: "compresso::ffmpeg::discovery",
                "FFmpeg found in common path: {}",
                path.display()
            );
            return Ok(path);
        }
    }

    if let Some(p) = resolve_bundled_path(BUNDLED_FFMPEG_NAME) {
        return Ok(p);
    }

    log::error!(
        target: "compresso::ffmpeg::discovery",
        "FFmpeg not found in env, PATH, common locations or next to the executable"
    );
    Err(AppError::FfmpegNotFound(
        "FFmpeg not found. Please install FFmpeg on your system:\n  - macOS: brew install ffmpeg\n  - Linux: sudo apt install ffmpeg\n  - Windows: Download from https://ffmpeg.org/download.html"
            .to_string(),
    ))
}

/// Get FFmpeg path. Cached for process lifetime.
/// Env overrides (`COMPRESSO_FFMPEG_PATH`, then `FFMPEG_PATH`) take precedence.
pub fn get_ffmpeg_path() -> Result<&'static Path, AppError> {
    if let Some(path) = FFMPEG_PATH_CACHE.get() {
        return Ok(path.as_path());
    }
    let path = resolve_ffmpeg_path()?;
    Ok(FFMPEG_PATH_CACHE.get_or_init(|| path).as_path())
}

/// Paths to try for ffprobe given an ffmpeg binary path (suffixed first, then plain).
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let parent = match ffmpeg_path.parent() {
        Some(p) => p,
        None => return vec![],
    };
    let mut candidates = Vec::with_capacity(2);
    let stem = ffmpeg_path.file_stem().and_then(|s| s.to_str());
    if let Some(stem) = stem {
        let suffix = stem
            .strip_prefix(BUNDLED_FFMPEG_NAME)
            .or_else(|| stem.strip_prefix("ffmpeg"));
        if let Some(suffix) = suffix
            && !suffix.is_empty()
        {
            candidates.push(parent.join(exe_name(&format!("ffprobe{suffix}"))));
        }
    }
    candidates.push(parent.join(exe_name("ffprobe")));
    candidates
}

fn exe_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

/// Get ffprobe path. Same directory as ffmpeg (ffmpeg/ffprobe ship together).
pub fn get_ffprobe_path() -> Result<PathBuf, AppError> {
    let ffmpeg = get_ffmpeg_path()?;
    ffprobe_candidates(ffmpeg)
        .into_iter()
        .find(|c| c.exists())
        .ok_or_else(|| {
            AppError::from(format!(
                "ffprobe not found next to FFmpeg ({})",
                ffmpeg.display()
            ))
        })
}
