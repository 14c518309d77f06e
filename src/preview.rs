//! Before/after preview clips for the current settings.
//!
//! [`PreviewService`] samples the requested sources, builds the cache key and
//! asks a [`PreviewRenderer`] for one clip pair per source on a miss.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{EncodeSettings, effective_preview_seconds};
use crate::error::AppError;
use crate::ffmpeg::ffprobe::probe_duration;
use crate::ffmpeg::{
    ClipWindow, FfmpegRunner, TempFileManager, build_compress_args, build_source_clip_args,
};
use crate::preview_cache::{
    Generated, PreviewArtifacts, PreviewCache, PreviewCacheKey, PreviewFailure, PreviewMode,
    PreviewPair, SourceIdentity,
};

/// Batch previews render at most this many sources.
pub const MAX_PREVIEW_SOURCES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedClips {
    pub source_clip: PathBuf,
    pub compressed_clip: PathBuf,
}

/// Renders one before/after clip pair. A failure must leave no files behind.
pub trait PreviewRenderer: Send + Sync {
    fn render(
        &self,
        source: &Path,
        settings: &EncodeSettings,
        preview_seconds: u16,
    ) -> Result<RenderedClips, AppError>;
}

/// Start of a window of `preview_seconds` centred in the source. Sources
/// shorter than the window, or of unknown length, start at 0.
pub fn middle_seek_seconds(total_secs: Option<f64>, preview_seconds: u16) -> f64 {
    let preview = f64::from(preview_seconds);
    match total_secs {
        Some(total) if total.is_finite() && total > preview => {
            (total / 2.0 - preview / 2.0).max(0.0)
        }
        _ => 0.0,
    }
}

/// Deletes registered paths on drop unless [`TempCleanup::keep`] was called.
struct TempCleanup {
    paths: Vec<PathBuf>,
    keep: bool,
}

impl TempCleanup {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            keep: false,
        }
    }

    fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for TempCleanup {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for path in &self.paths {
            let _ = fs::remove_file(path);
        }
    }
}

type DurationProbe = fn(&Path) -> Result<Option<f64>, AppError>;

/// [`PreviewRenderer`] that cuts both clips with FFmpeg.
pub struct FfmpegPreviewRenderer {
    runner: FfmpegRunner,
    temp: TempFileManager,
    probe: DurationProbe,
    next_job: AtomicU64,
}

impl FfmpegPreviewRenderer {
    pub fn new(temp: TempFileManager) -> Self {
        Self::with_runner(FfmpegRunner::new(), temp)
    }

    pub fn with_runner(runner: FfmpegRunner, temp: TempFileManager) -> Self {
        Self {
            runner,
            temp,
            probe: probe_duration,
            next_job: AtomicU64::new(1),
        }
    }

    /// Replace the source duration lookup.
    pub fn with_probe(mut self, probe: DurationProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn terminate_all(&self) {
        self.runner.terminate_all();
    }
}

impl PreviewRenderer for FfmpegPreviewRenderer {
    fn render(
        &self,
        source: &Path,
        settings: &EncodeSettings,
        preview_seconds: u16,
    ) -> Result<RenderedClips, AppError> {
        if !source.is_file() {
            return Err(AppError::Preview(format!(
                "Source file does not exist: {}",
                source.display()
            )));
        }

        let total = (self.probe)(source).unwrap_or_else(|e| {
            log::debug!(
                target: "compresso::preview",
                "Duration unknown for {}: {}",
                source.display(),
                e
            );
            None
        });
        let clip = ClipWindow {
            start_secs: middle_seek_seconds(total, preview_seconds),
            duration_secs: preview_seconds,
        };
        let compressed_ext = if settings.output_extension_for(source) == "webm" {
            "webm"
        } else {
            "mp4"
        };

        let mut cleanup = TempCleanup::new();
        let source_clip = self.temp.create("preview-source.mp4")?;
        cleanup.add(source_clip.clone());
        let compressed_clip = self
            .temp
            .create(&format!("preview-compressed.{}", compressed_ext))?;
        cleanup.add(compressed_clip.clone());

        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        log::info!(
            target: "compresso::preview",
            "Rendering {}s preview of {} from {:.3}s",
            preview_seconds,
            source.display(),
            clip.start_secs
        );
        self.runner.run(
            job_id,
            build_source_clip_args(source, &source_clip, settings, clip),
            None,
        )?;
        self.runner.run(
            job_id,
            build_compress_args(source, &compressed_clip, settings, Some(clip)),
            None,
        )?;
        if !source_clip.is_file() || !compressed_clip.is_file() {
            return Err(AppError::Preview(
                "FFmpeg exited without writing the preview clips".to_string(),
            ));
        }

        cleanup.keep();
        Ok(RenderedClips {
            source_clip,
            compressed_clip,
        })
    }
}

/// Serves preview requests through the single-slot [`PreviewCache`].
///
/// The cache sits behind an async mutex, so a request issued while another
/// is rendering waits for it and then evicts its result.
pub struct PreviewService {
    renderer: Arc<dyn PreviewRenderer>,
    cache: tokio::sync::Mutex<PreviewCache>,
}

impl PreviewService {
    pub fn new(renderer: Arc<dyn PreviewRenderer>) -> Self {
        Self {
            renderer,
            cache: tokio::sync::Mutex::new(PreviewCache::new()),
        }
    }

    pub async fn request(
        &self,
        paths: &[PathBuf],
        settings: &EncodeSettings,
        preview_seconds: Option<u16>,
    ) -> Result<PreviewArtifacts, AppError> {
        let Some(first) = paths.first() else {
            return Err(AppError::invalid_config("No videos selected for preview"));
        };
        let preview_seconds = effective_preview_seconds(preview_seconds);
        let mode = if paths.len() > 1 {
            PreviewMode::Batch
        } else {
            PreviewMode::Single
        };
        let sampled: Vec<PathBuf> = paths.iter().take(MAX_PREVIEW_SOURCES).cloned().collect();
        let key = PreviewCacheKey {
            mode,
            sources: sampled
                .iter()
                .map(|p| SourceIdentity::from_path(p).unwrap_or_else(|_| SourceIdentity::unreadable(p)))
                .collect(),
            output_extension: settings.output_extension_for(first),
            settings: settings.clone(),
            preview_seconds,
        };

        let mut cache = self.cache.lock().await;
        let renderer = Arc::clone(&self.renderer);
        let settings = settings.clone();
        let artifacts = cache
            .get_or_generate(key, move || {
                render_sources(renderer, sampled, settings, preview_seconds)
            })
            .await?;
        log::info!(
            target: "compresso::preview",
            "Preview {:?}: {} pair(s), {} failure(s)",
            artifacts.outcome,
            artifacts.pairs.len(),
            artifacts.failures.len()
        );
        Ok(artifacts)
    }

    /// Drop the cached generation and delete its files.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

async fn render_sources(
    renderer: Arc<dyn PreviewRenderer>,
    sources: Vec<PathBuf>,
    settings: EncodeSettings,
    preview_seconds: u16,
) -> Generated {
    let mut generated = Generated::default();
    for source in sources {
        let worker = Arc::clone(&renderer);
        let path = source.clone();
        let worker_settings = settings.clone();
        let result = tokio::task::spawn_blocking(move || {
            worker.render(&path, &worker_settings, preview_seconds)
        })
        .await
        .map_err(|e| AppError::Preview(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(clips) => generated.pairs.push(PreviewPair {
                source,
                source_clip: clips.source_clip,
                compressed_clip: clips.compressed_clip,
            }),
            Err(e) => {
                log::warn!(
                    target: "compresso::preview",
                    "Preview failed for {}: {}",
                    source.display(),
                    e
                );
                generated.failures.push(PreviewFailure {
                    source,
                    error: e.user_message(),
                });
            }
        }
    }
    generated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_centres_the_window() {
        assert_eq!(middle_seek_seconds(Some(100.0), 20), 40.0);
        assert_eq!(middle_seek_seconds(Some(21.0), 20), 0.5);
    }

    #[test]
    fn short_or_unknown_sources_start_at_zero() {
        assert_eq!(middle_seek_seconds(Some(20.0), 20), 0.0);
        assert_eq!(middle_seek_seconds(Some(5.0), 20), 0.0);
        assert_eq!(middle_seek_seconds(None, 20), 0.0);
        assert_eq!(middle_seek_seconds(Some(f64::NAN), 20), 0.0);
    }

    #[test]
    fn cleanup_guard_deletes_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = dir.path().join("a.mp4");
        let kept = dir.path().join("b.mp4");
        fs::write(&dropped, b"a").unwrap();
        fs::write(&kept, b"b").unwrap();
        {
            let mut guard = TempCleanup::new();
            guard.add(dropped.clone());
        }
        let mut guard = TempCleanup::new();
        guard.add(kept.clone());
        guard.keep();
        assert!(!dropped.exists());
        assert!(kept.exists());
    }

    #[cfg(unix)]
    mod ffmpeg {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("ffmpeg");
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn renderer(dir: &Path, body: &str) -> FfmpegPreviewRenderer {
            FfmpegPreviewRenderer::with_runner(
                FfmpegRunner::with_binary(script(dir, body)),
                TempFileManager::new(dir.join("assets")),
            )
            .with_probe(|_| Ok(Some(100.0)))
        }

        fn source(dir: &Path, name: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, b"src").unwrap();
            path
        }

        #[test]
        fn renders_both_clips_from_the_middle() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("args.log");
            let body = format!(
                r#"echo "$@" >> "{}"
for a in "$@"; do prev="$last"; last="$a"; done
printf clip > "$prev""#,
                log.display()
            );
            let clips = renderer(dir.path(), &body)
                .render(
                    &source(dir.path(), "in.webm"),
                    &EncodeSettings::default(),
                    20,
                )
                .unwrap();

            assert!(clips.source_clip.is_file());
            assert!(clips.compressed_clip.is_file());
            assert_eq!(
                clips.compressed_clip.extension().and_then(|e| e.to_str()),
                Some("webm")
            );
            let calls = fs::read_to_string(&log).unwrap();
            assert_eq!(calls.lines().count(), 2);
            assert!(calls.lines().all(|l| l.contains("-ss 40.000")));
        }

        #[test]
        fn second_step_failure_leaves_nothing_behind() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("ran");
            let body = format!(
                r#"if [ -f "{m}" ]; then echo 'Invalid argument' >&2; exit 1; fi
touch "{m}"
for a in "$@"; do prev="$last"; last="$a"; done
printf clip > "$prev""#,
                m = marker.display()
            );
            let err = renderer(dir.path(), &body)
                .render(
                    &source(dir.path(), "in.mp4"),
                    &EncodeSettings::default(),
                    20,
                )
                .unwrap_err();
            assert!(matches!(err, AppError::FfmpegFailed { code: 1, .. }));
            let left = fs::read_dir(dir.path().join("assets")).unwrap().count();
            assert_eq!(left, 0);
        }

        #[test]
        fn missing_source_is_a_preview_error() {
            let dir = tempfile::tempdir().unwrap();
            let err = renderer(dir.path(), "exit 0")
                .render(
                    &dir.path().join("gone.mp4"),
                    &EncodeSettings::default(),
                    20,
                )
                .unwrap_err();
            assert!(matches!(err, AppError::Preview(_)));
        }
    }
}
