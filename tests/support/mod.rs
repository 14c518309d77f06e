#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use compresso_core::config::EncodeSettings;
use compresso_core::encoder::{EncodeJob, EncodeProgress, Encoder, ProgressSink};
use compresso_core::error::AppError;
use compresso_core::fs::{FileMetadata, LocalFs, MediaFs};
use compresso_core::model::{BatchEvent, BatchItem, BatchRunSnapshot, ItemId, ItemStatus};
use compresso_core::preview::{PreviewRenderer, RenderedClips};
use compresso_core::shutdown::{ShutdownPlatform, ShutdownScheduler};
use compresso_core::{BatchOrchestrator, PreviewService};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Temp directory holding source videos, encoder scratch and preview clips.
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("scratch")).expect("scratch dir");
        fs::create_dir_all(dir.path().join("clips")).expect("clips dir");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn scratch(&self) -> PathBuf {
        self.path("scratch")
    }

    pub fn clips(&self) -> PathBuf {
        self.path("clips")
    }

    /// Write a fake source video and return its path.
    pub fn video(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("video parent");
        }
        fs::write(&path, format!("source:{}", name)).expect("write video");
        path
    }

    pub fn videos(&self, names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| self.video(n)).collect()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Encoder double. Writes `encoded:<source name>` to a scratch file and
/// reports a fixed progress sequence. Sources can be told to fail or to
/// block until cancelled.
pub struct FakeEncoder {
    scratch: PathBuf,
    duration: Option<f64>,
    progress: Vec<f64>,
    failing: Mutex<HashSet<String>>,
    blocking: Mutex<HashSet<String>>,
    cancelled: Mutex<HashSet<u64>>,
    encoded: Mutex<Vec<PathBuf>>,
    cancel_calls: AtomicUsize,
}

impl FakeEncoder {
    pub fn new(scratch: PathBuf) -> Self {
        Self {
            scratch,
            duration: Some(10.0),
            progress: vec![2.0, 5.0, 4.0, 8.0, 10.0],
            failing: Mutex::new(HashSet::new()),
            blocking: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            encoded: Mutex::new(Vec::new()),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn without_duration(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn succeed_on(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    pub fn block_on(&self, name: &str) {
        self.blocking.lock().insert(name.to_string());
    }

    pub fn encoded(&self) -> Vec<PathBuf> {
        self.encoded.lock().clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

impl Encoder for FakeEncoder {
    fn probe_duration(&self, _source: &Path) -> Result<Option<f64>, AppError> {
        Ok(self.duration)
    }

    fn encode(&self, job: &EncodeJob, progress: ProgressSink) -> Result<PathBuf, AppError> {
        let name = file_name(&job.source);
        self.encoded.lock().push(job.source.clone());

        if self.blocking.lock().contains(&name) {
            while !self.cancelled.lock().contains(&job.job_id) {
                thread::sleep(Duration::from_millis(5));
            }
            return Err(AppError::aborted());
        }
        if self.failing.lock().contains(&name) {
            return Err(AppError::ffmpeg_failed(
                1,
                format!("{}: Invalid data found when processing input", name),
            ));
        }

        for elapsed_secs in &self.progress {
            progress(EncodeProgress {
                job_id: job.job_id,
                elapsed_secs: *elapsed_secs,
            });
        }
        let output = self
            .scratch
            .join(format!("job{}.{}", job.job_id, job.output_extension));
        fs::write(&output, format!("encoded:{}", name))?;
        Ok(output)
    }

    fn cancel(&self, job_id: u64) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.lock().insert(job_id);
    }
}

/// Preview renderer double. Each call writes a fresh clip pair.
pub struct FakeRenderer {
    clips: PathBuf,
    delay: Duration,
    calls: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl FakeRenderer {
    pub fn new(clips: PathBuf) -> Self {
        Self {
            clips,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PreviewRenderer for FakeRenderer {
    fn render(
        &self,
        source: &Path,
        settings: &EncodeSettings,
        preview_seconds: u16,
    ) -> Result<RenderedClips, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let name = file_name(source);
        if self.failing.lock().contains(&name) {
            return Err(AppError::Preview(format!("Could not render {}", name)));
        }
        let source_clip = self.clips.join(format!("{}-{}-source.mp4", call, name));
        let compressed_clip = self.clips.join(format!("{}-{}-compressed.mp4", call, name));
        fs::write(&source_clip, format!("{}s", preview_seconds))?;
        fs::write(&compressed_clip, format!("q{}", settings.quality))?;
        Ok(RenderedClips {
            source_clip,
            compressed_clip,
        })
    }
}

#[derive(Default)]
pub struct FakeShutdown {
    scheduled: Mutex<Vec<u64>>,
    cancels: AtomicUsize,
    fail: AtomicBool,
}

impl FakeShutdown {
    pub fn scheduled(&self) -> Vec<u64> {
        self.scheduled.lock().clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl ShutdownPlatform for FakeShutdown {
    fn schedule(&self, delay_secs: u64) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Shutdown(
                "Failed to schedule shutdown: must be superuser".into(),
            ));
        }
        self.scheduled.lock().push(delay_secs);
        Ok(())
    }

    fn cancel(&self) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Shutdown("Failed to cancel shutdown".into()));
        }
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local filesystem with rigged answers. Output names starting with a
/// `taken` prefix always exist; moves onto a `failing` name return an I/O
/// error without touching either file.
#[derive(Default)]
pub struct RiggedFs {
    taken: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
}

impl RiggedFs {
    pub fn take_names_starting_with(&self, prefix: &str) {
        self.taken.lock().push(prefix.to_string());
    }

    pub fn fail_moves_onto(&self, name: &str) {
        self.failing.lock().push(name.to_string());
    }
}

impl MediaFs for RiggedFs {
    fn metadata(&self, path: &Path) -> Result<FileMetadata, AppError> {
        LocalFs.metadata(path)
    }

    fn exists(&self, path: &Path) -> bool {
        let name = file_name(path);
        self.taken.lock().iter().any(|p| name.starts_with(p.as_str())) || LocalFs.exists(path)
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), AppError> {
        if self.failing.lock().contains(&file_name(to)) {
            return Err(AppError::Io(std::io::Error::other(
                "No space left on device",
            )));
        }
        LocalFs.move_file(from, to)
    }

    fn delete_file(&self, path: &Path) -> Result<(), AppError> {
        LocalFs.delete_file(path)
    }
}

pub struct Harness {
    pub ws: Workspace,
    pub encoder: Arc<FakeEncoder>,
    pub platform: Arc<FakeShutdown>,
    pub orchestrator: Arc<BatchOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        let ws = Workspace::new();
        let encoder = Arc::new(FakeEncoder::new(ws.scratch()));
        Self::with_encoder(ws, encoder)
    }

    pub fn with_encoder(ws: Workspace, encoder: Arc<FakeEncoder>) -> Self {
        Self::with_parts(ws, encoder, Arc::new(LocalFs))
    }

    pub fn with_fs(fs: Arc<dyn MediaFs>) -> Self {
        let ws = Workspace::new();
        let encoder = Arc::new(FakeEncoder::new(ws.scratch()));
        Self::with_parts(ws, encoder, fs)
    }

    fn with_parts(ws: Workspace, encoder: Arc<FakeEncoder>, fs: Arc<dyn MediaFs>) -> Self {
        let platform = Arc::new(FakeShutdown::default());
        let scheduler = Arc::new(ShutdownScheduler::new(platform.clone()));
        let orchestrator = Arc::new(BatchOrchestrator::new(encoder.clone(), fs, scheduler));
        Self {
            ws,
            encoder,
            platform,
            orchestrator,
        }
    }

    /// Create the named sources and queue them.
    pub fn queue(&self, names: &[&str]) -> Vec<PathBuf> {
        let paths = self.ws.videos(names);
        self.orchestrator
            .add_items(&paths, false)
            .expect("queue videos");
        paths
    }

    pub fn scratch_is_empty(&self) -> bool {
        fs::read_dir(self.ws.scratch())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

pub fn item_named<'a>(snapshot: &'a BatchRunSnapshot, name: &str) -> &'a BatchItem {
    snapshot
        .items
        .iter()
        .find(|i| i.name == name)
        .unwrap_or_else(|| panic!("no item named {}", name))
}

/// Wait until `item_id` reports `Compressing`.
pub async fn wait_until_compressing(events: &mut broadcast::Receiver<BatchEvent>, item_id: ItemId) {
    loop {
        match events.recv().await {
            Ok(BatchEvent::ItemStatus {
                item_id: id,
                status: ItemStatus::Compressing,
                ..
            }) if id == item_id => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        }
    }
}

pub fn preview_service(renderer: FakeRenderer) -> (Arc<FakeRenderer>, PreviewService) {
    let renderer = Arc::new(renderer);
    let service = PreviewService::new(renderer.clone());
    (renderer, service)
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}
