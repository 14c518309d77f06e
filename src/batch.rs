//! Sequential batch runner.
//!
//! [`BatchOrchestrator`] owns the item list and run flags. Observers read
//! [`BatchRunSnapshot`]s and subscribe to [`BatchEvent`]s; only the commands
//! on the orchestrator mutate state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cancel::{CancellationController, RunId};
use crate::config::BatchConfig;
use crate::encoder::{EncodeJob, EncodeProgress, Encoder, ProgressSink};
use crate::error::AppError;
use crate::fs::{FileMetadata, MediaFs, ResolvedFiles, resolve_video_files};
use crate::model::{
    BatchEvent, BatchItem, BatchRunSnapshot, ItemId, ItemStatus, OutputDescriptor, RunPhase,
};
use crate::output_path::resolve_output_path_with;
use crate::progress::ProgressTracker;
use crate::shutdown::ShutdownScheduler;

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct BatchRun {
    items: Vec<BatchItem>,
    phase: RunPhase,
    cancel_requested: bool,
    current_item_id: Option<ItemId>,
    run_id: Option<RunId>,
    completed: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    /// Live [`IdleGuard`]s. `start` is refused while non-zero.
    idle_holds: usize,
}

impl BatchRun {
    fn is_running(&self) -> bool {
        self.phase == RunPhase::Running
    }

    fn snapshot(&self) -> BatchRunSnapshot {
        let phase = self.phase;
        BatchRunSnapshot {
            items: self.items.clone(),
            phase,
            is_running: phase == RunPhase::Running,
            is_completed: matches!(phase, RunPhase::Completed | RunPhase::Cancelled),
            cancel_requested: self.cancel_requested,
            current_item_id: self.current_item_id,
            completed_count: self.completed,
            failed_count: self.failed,
            skipped_count: self.skipped,
            cancelled_count: self.cancelled,
        }
    }

    fn item_mut(&mut self, id: ItemId) -> Option<&mut BatchItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    fn begin(&mut self, run_id: RunId) {
        for item in &mut self.items {
            item.reset();
        }
        self.phase = RunPhase::Running;
        self.cancel_requested = false;
        self.current_item_id = None;
        self.run_id = Some(run_id);
        self.completed = 0;
        self.failed = 0;
        self.skipped = 0;
        self.cancelled = 0;
    }

    /// Move `id` into `Compressing`. Returns its source path.
    fn start_item(&mut self, id: ItemId) -> Option<PathBuf> {
        self.current_item_id = Some(id);
        let item = self.item_mut(id)?;
        if !item.status.can_transition_to(ItemStatus::Compressing) {
            return None;
        }
        item.status = ItemStatus::Compressing;
        item.progress = 0.0;
        Some(item.path.clone())
    }

    /// Move `id` into a terminal status and count it.
    fn settle(
        &mut self,
        id: ItemId,
        status: ItemStatus,
        error: Option<String>,
        output: Option<OutputDescriptor>,
    ) -> Option<BatchEvent> {
        let item = self.item_mut(id)?;
        if !item.status.can_transition_to(status) {
            log::warn!(
                target: "compresso::batch",
                "Ignoring {:?} -> {:?} for item {}",
                item.status,
                status,
                id
            );
            return None;
        }
        item.status = status;
        item.error = error.clone();
        item.output = output.clone();
        if status == ItemStatus::Success {
            item.progress = 100.0;
        }
        match status {
            ItemStatus::Success => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Cancelled => self.cancelled += 1,
            ItemStatus::Pending | ItemStatus::Compressing => {}
        }
        Some(BatchEvent::ItemStatus {
            item_id: id,
            status,
            error,
            output,
        })
    }

    fn settle_pending(&mut self, status: ItemStatus) -> Vec<BatchEvent> {
        let pending: Vec<ItemId> = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .map(|i| i.id)
            .collect();
        pending
            .into_iter()
            .filter_map(|id| self.settle(id, status, None, None))
            .collect()
    }

    fn finish(&mut self, cancelled: bool) -> Vec<BatchEvent> {
        let events = self.settle_pending(ItemStatus::Cancelled);
        self.current_item_id = None;
        self.phase = if cancelled {
            RunPhase::Cancelled
        } else {
            RunPhase::Completed
        };
        events
    }
}

enum ItemOutcome {
    Success,
    Failed,
    Cancelled,
    /// The worker died; nothing after this item should run.
    Crashed,
}

/// Keeps the orchestrator from starting a run until dropped. Hold one while
/// doing work that must not overlap a batch, such as wiping the assets dir.
pub struct IdleGuard {
    state: Arc<Mutex<BatchRun>>,
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        let mut run = self.state.lock();
        run.idle_holds = run.idle_holds.saturating_sub(1);
    }
}

/// Result of [`BatchOrchestrator::start`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub snapshot: BatchRunSnapshot,
    pub shutdown_armed: bool,
    /// Set when a shutdown was configured but the platform refused it.
    pub shutdown_error: Option<String>,
}

pub struct BatchOrchestrator {
    state: Arc<Mutex<BatchRun>>,
    events: broadcast::Sender<BatchEvent>,
    encoder: Arc<dyn Encoder>,
    fs: Arc<dyn MediaFs>,
    cancellation: CancellationController,
    shutdown: Arc<ShutdownScheduler>,
    next_job: AtomicU64,
}

impl BatchOrchestrator {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        fs: Arc<dyn MediaFs>,
        shutdown: Arc<ShutdownScheduler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BatchRun::default())),
            events,
            cancellation: CancellationController::new(Arc::clone(&encoder)),
            encoder,
            fs,
            shutdown,
            next_job: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> BatchRunSnapshot {
        self.state.lock().snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_scheduler(&self) -> &Arc<ShutdownScheduler> {
        &self.shutdown
    }

    fn emit(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<BatchEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Expand `paths` and queue every video not already in the list.
    pub fn add_items(&self, paths: &[PathBuf], recursive: bool) -> Result<ResolvedFiles, AppError> {
        let resolved = resolve_video_files(paths, recursive);
        self.add_files(resolved.files.clone())?;
        Ok(resolved)
    }

    /// Queue already-inspected files. Returns how many were new.
    pub fn add_files(&self, files: Vec<FileMetadata>) -> Result<usize, AppError> {
        let mut run = self.state.lock();
        if run.is_running() {
            return Err(AppError::invalid_config(
                "Cannot add videos while a batch is running",
            ));
        }
        let mut added = 0;
        for meta in files {
            if run.items.iter().any(|i| i.path == meta.path) {
                continue;
            }
            run.items.push(BatchItem::new(meta));
            added += 1;
        }
        if added > 0 {
            run.phase = RunPhase::Idle;
        }
        log::debug!(target: "compresso::batch", "Queued {} new item(s)", added);
        Ok(added)
    }

    pub fn remove_item(&self, id: ItemId) -> Result<bool, AppError> {
        let mut run = self.state.lock();
        if run.is_running() {
            return Err(AppError::invalid_config(
                "Cannot remove videos while a batch is running",
            ));
        }
        let before = run.items.len();
        run.items.retain(|i| i.id != id);
        Ok(run.items.len() != before)
    }

    pub fn clear(&self) -> Result<(), AppError> {
        let mut run = self.state.lock();
        if run.is_running() {
            return Err(AppError::invalid_config(
                "Cannot clear the list while a batch is running",
            ));
        }
        *run = BatchRun {
            idle_holds: run.idle_holds,
            ..BatchRun::default()
        };
        Ok(())
    }

    /// Fails when a run is in progress. Otherwise no run can start until the
    /// returned guard is dropped.
    pub fn hold_idle(&self) -> Result<IdleGuard, AppError> {
        let mut run = self.state.lock();
        if run.is_running() {
            return Err(AppError::invalid_config("A batch is running"));
        }
        run.idle_holds += 1;
        Ok(IdleGuard {
            state: Arc::clone(&self.state),
        })
    }

    /// Ask the running batch to stop. Returns false when nothing is running
    /// or cancellation was already requested.
    pub fn cancel(&self) -> bool {
        let run_id = {
            let mut run = self.state.lock();
            match run.run_id {
                Some(run_id) if run.is_running() && !run.cancel_requested => {
                    run.cancel_requested = true;
                    run_id
                }
                _ => return false,
            }
        };
        self.cancellation.request_cancel(run_id)
    }

    /// Run every queued item in order and return the final state.
    ///
    /// Rejected without touching any state when a run is in progress, an
    /// [`IdleGuard`] is held, the list is empty, or the configuration is
    /// incomplete.
    pub async fn start(&self, config: BatchConfig) -> Result<RunReport, AppError> {
        let config = config.normalized();
        let (run_id, token, ids) = {
            let mut run = self.state.lock();
            if run.is_running() {
                return Err(AppError::invalid_config("A batch is already running"));
            }
            if run.idle_holds > 0 {
                return Err(AppError::invalid_config(
                    "Temporary files are being cleaned up, try again shortly",
                ));
            }
            if run.items.is_empty() {
                return Err(AppError::invalid_config(
                    "Add at least one video before starting",
                ));
            }
            config.validate()?;
            let (run_id, token) = self.cancellation.begin_run();
            run.begin(run_id);
            let ids: Vec<ItemId> = run.items.iter().map(|i| i.id).collect();
            (run_id, token, ids)
        };
        log::info!(
            target: "compresso::batch",
            "Run {} started with {} item(s)",
            run_id,
            ids.len()
        );
        self.emit(BatchEvent::RunStarted {
            item_count: ids.len(),
        });

        for id in ids {
            if token.is_cancelled() {
                break;
            }
            let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
            if !self.cancellation.begin_job(run_id, job_id) {
                break;
            }
            let outcome = self.run_item(id, job_id, &config, &token).await;
            self.cancellation.finish_job(run_id, job_id);
            match outcome {
                ItemOutcome::Success | ItemOutcome::Failed => {}
                ItemOutcome::Cancelled => break,
                ItemOutcome::Crashed => {
                    let events = self.state.lock().settle_pending(ItemStatus::Skipped);
                    self.emit_all(events);
                    break;
                }
            }
        }

        let cancelled = token.is_cancelled();
        let (snapshot, events) = {
            let mut run = self.state.lock();
            let events = run.finish(cancelled);
            (run.snapshot(), events)
        };
        self.emit_all(events);
        log::info!(
            target: "compresso::batch",
            "Run {} finished: {} succeeded, {} failed, {} cancelled, {} skipped",
            run_id,
            snapshot.completed_count,
            snapshot.failed_count,
            snapshot.cancelled_count,
            snapshot.skipped_count
        );
        self.emit(BatchEvent::RunFinished(snapshot.clone()));

        let mut report = RunReport {
            snapshot,
            shutdown_armed: false,
            shutdown_error: None,
        };
        if !cancelled && config.shutdown_delay_secs > 0 {
            match self.shutdown.arm(config.shutdown_delay_secs).await {
                Ok(()) => report.shutdown_armed = true,
                Err(e) => {
                    log::warn!(target: "compresso::batch", "Could not schedule shutdown: {}", e);
                    report.shutdown_error = Some(e.user_message());
                }
            }
        }
        Ok(report)
    }

    fn settle(
        &self,
        id: ItemId,
        status: ItemStatus,
        error: Option<String>,
        output: Option<OutputDescriptor>,
    ) {
        let event = self.state.lock().settle(id, status, error, output);
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn fail(&self, id: ItemId, error: &AppError) -> ItemOutcome {
        log::warn!(target: "compresso::batch", "Item {} failed: {}", id, error);
        self.settle(id, ItemStatus::Failed, Some(error.user_message()), None);
        ItemOutcome::Failed
    }

    async fn run_item(
        &self,
        id: ItemId,
        job_id: u64,
        config: &BatchConfig,
        token: &CancellationToken,
    ) -> ItemOutcome {
        let Some(source) = self.state.lock().start_item(id) else {
            return ItemOutcome::Failed;
        };
        self.emit(BatchEvent::ItemStatus {
            item_id: id,
            status: ItemStatus::Compressing,
            error: None,
            output: None,
        });

        let duration = self.probe_duration(&source).await;
        if let Some(item) = self.state.lock().item_mut(id) {
            item.duration = duration;
        }

        let destination = match resolve_output_path_with(&source, config, |p| self.fs.exists(p))
        {
            Ok(path) => path,
            Err(e) => return self.fail(id, &AppError::from(e)),
        };

        let job = EncodeJob {
            job_id,
            output_extension: config.output_extension_for(&source),
            source,
            settings: config.settings.clone(),
        };
        let sink = self.progress_sink(id, duration.unwrap_or(0.0));
        let encoder = Arc::clone(&self.encoder);
        let result = tokio::task::spawn_blocking(move || encoder.encode(&job, sink)).await;

        match result {
            Err(join) => {
                log::error!(target: "compresso::batch", "Encoder worker for item {} died: {}", id, join);
                self.settle(
                    id,
                    ItemStatus::Failed,
                    Some("Encoder stopped unexpectedly".to_string()),
                    None,
                );
                ItemOutcome::Crashed
            }
            Ok(Err(e)) if e.is_cancelled() || token.is_cancelled() => {
                log::info!(target: "compresso::batch", "Item {} cancelled", id);
                self.settle(id, ItemStatus::Cancelled, None, None);
                ItemOutcome::Cancelled
            }
            Ok(Err(e)) => self.fail(id, &e),
            Ok(Ok(temp_output)) => self.place_output(id, temp_output, destination).await,
        }
    }

    async fn probe_duration(&self, source: &Path) -> Option<f64> {
        let encoder = Arc::clone(&self.encoder);
        let path = source.to_path_buf();
        match tokio::task::spawn_blocking(move || encoder.probe_duration(&path)).await {
            Ok(Ok(duration)) => duration,
            Ok(Err(e)) => {
                log::debug!(
                    target: "compresso::batch",
                    "Duration unknown for {}: {}",
                    source.display(),
                    e
                );
                None
            }
            Err(e) => {
                log::warn!(target: "compresso::batch", "Duration probe died: {}", e);
                None
            }
        }
    }

    fn progress_sink(&self, id: ItemId, total_duration: f64) -> ProgressSink {
        let tracker = Mutex::new(ProgressTracker::new());
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        Arc::new(move |p: EncodeProgress| {
            let pct = tracker.lock().update(p.elapsed_secs, total_duration);
            let changed = {
                let mut run = state.lock();
                match run.item_mut(id) {
                    Some(item) if item.status == ItemStatus::Compressing && pct > item.progress => {
                        item.progress = pct;
                        true
                    }
                    _ => false,
                }
            };
            if changed {
                let _ = events.send(BatchEvent::ItemProgress {
                    item_id: id,
                    progress: pct,
                });
            }
        })
    }

    /// Move the encoder's temp file to `destination` and record the result.
    async fn place_output(
        &self,
        id: ItemId,
        temp_output: PathBuf,
        destination: PathBuf,
    ) -> ItemOutcome {
        let fs = Arc::clone(&self.fs);
        let from = temp_output.clone();
        let to = destination.clone();
        let moved = tokio::task::spawn_blocking(move || {
            fs.move_file(&from, &to)?;
            fs.metadata(&to)
        })
        .await
        .map_err(|e| AppError::from(e.to_string()))
        .and_then(|r| r);

        match moved {
            Ok(meta) => {
                log::info!(
                    target: "compresso::batch",
                    "Item {} written to {}",
                    id,
                    destination.display()
                );
                self.settle(id, ItemStatus::Success, None, Some(meta.into()));
                ItemOutcome::Success
            }
            Err(e) => {
                if let Err(rm) = self.fs.delete_file(&temp_output) {
                    log::warn!(
                        target: "compresso::batch",
                        "Could not delete temp output {}: {}",
                        temp_output.display(),
                        rm
                    );
                }
                self.fail(id, &e)
            }
        }
    }
}
