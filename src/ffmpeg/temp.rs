use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Every file this crate writes to the assets dir starts with this.
pub const TEMP_PREFIX: &str = "compresso-";

/// Directory for preview artifacts and in-flight encoder outputs.
/// `COMPRESSO_ASSETS_DIR` overrides `<system temp>/compresso`.
pub fn assets_dir() -> PathBuf {
    match std::env::var_os("COMPRESSO_ASSETS_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("compresso"),
    }
}

/// Factory for uniquely named files in one directory. Callers own the paths
/// it hands out and are responsible for deleting them.
#[derive(Debug, Clone)]
pub struct TempFileManager {
    dir: PathBuf,
}

impl Default for TempFileManager {
    fn default() -> Self {
        Self::new(assets_dir())
    }
}

/// Generates a short suffix for temp filenames. For uniqueness only.
fn random_alphanumeric_suffix(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    static STATE: AtomicU64 = AtomicU64::new(0);
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mut x = STATE.fetch_add(1, Ordering::Relaxed) ^ seed.rotate_left(17);
    let mut s = String::with_capacity(len);
    for _ in 0..len {
        // xorshift
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.push(CHARS[(x % CHARS.len() as u64) as usize] as char);
    }
    s
}

impl TempFileManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a path named `compresso-<millis>-<rand>-<suffix>`. The file
    /// itself is not created; the directory is.
    pub fn create(&self, suffix: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let name = format!(
            "{}{}-{}-{}",
            TEMP_PREFIX,
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            random_alphanumeric_suffix(9),
            suffix
        );
        Ok(self.dir.join(name))
    }
}

fn temp_entries(dir: &Path) -> Vec<(PathBuf, fs::Metadata)> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };
    read_dir
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            meta.is_file().then(|| (e.path(), meta))
        })
        .collect()
}

/// Delete artifacts older than `max_age`, left behind by a crash or a killed
/// process. Returns how many files were removed.
pub fn cleanup_old_temp_files(dir: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    for (path, meta) in temp_entries(dir) {
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => log::trace!(
                target: "compresso::ffmpeg::temp",
                "Could not remove stale temp file {}: {}",
                path.display(),
                e
            ),
        }
    }
    if removed > 0 {
        log::info!(
            target: "compresso::ffmpeg::temp",
            "Removed {} stale temp file(s) from {}",
            removed,
            dir.display()
        );
    }
    removed
}

/// Delete every artifact in the assets dir regardless of age.
pub fn delete_cache(dir: &Path) -> usize {
    temp_entries(dir)
        .into_iter()
        .filter(|(path, _)| fs::remove_file(path).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn create_names_are_unique_and_prefixed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let temp = TempFileManager::new(dir.path().join("assets"));
        let a = temp.create("out.mp4").expect("create");
        let b = temp.create("out.mp4").expect("create");
        assert_ne!(a, b);
        assert!(dir.path().join("assets").is_dir());
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(TEMP_PREFIX));
        assert!(name.ends_with("-out.mp4"));
    }

    #[test]
    fn cleanup_respects_age_and_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ours = dir.path().join("compresso-1-abc-preview.mp4");
        let foreign = dir.path().join("holiday.mp4");
        fs::write(&ours, b"x").unwrap();
        fs::write(&foreign, b"x").unwrap();

        assert_eq!(cleanup_old_temp_files(dir.path(), Duration::from_secs(3600)), 0);
        assert!(ours.exists());

        assert_eq!(cleanup_old_temp_files(dir.path(), Duration::ZERO), 1);
        assert!(!ours.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn delete_cache_removes_all_owned_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..3 {
            fs::write(dir.path().join(format!("compresso-{i}-x-a.mp4")), b"x").unwrap();
        }
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        assert_eq!(delete_cache(dir.path()), 3);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    #[serial]
    fn assets_dir_env_override() {
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::set_var("COMPRESSO_ASSETS_DIR", "/tmp/compresso-test-assets") };
        assert_eq!(assets_dir(), PathBuf::from("/tmp/compresso-test-assets"));
        unsafe { std::env::remove_var("COMPRESSO_ASSETS_DIR") };
        assert_eq!(assets_dir(), std::env::temp_dir().join("compresso"));
    }
}
