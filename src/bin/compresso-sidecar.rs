use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use compresso_core::error::AppError;
use compresso_core::ffmpeg::ffprobe::get_video_metadata;
use compresso_core::ffmpeg::{
    FfmpegEncoder, TempFileManager, assets_dir, cleanup_old_temp_files, delete_cache,
    parse_ffmpeg_error,
};
use compresso_core::fs::{LocalFs, resolve_video_files};
use compresso_core::model::{BatchEvent, ItemId};
use compresso_core::preview::FfmpegPreviewRenderer;
use compresso_core::preview_cache::CacheOutcome;
use compresso_core::shutdown::SystemShutdown;
use compresso_core::{
    BatchConfig, BatchOrchestrator, EncodeSettings, PreviewService, ShutdownScheduler, logging,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const STARTUP_CLEANUP_MAX_AGE_HOURS: u64 = 24;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: RpcErrorPayload,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcErrorPayload {
    summary: String,
    detail: String,
}

#[derive(Debug, serde::Serialize)]
struct RpcEvent {
    event: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesParams {
    paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InspectParams {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveParams {
    item_id: ItemId,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct StartParams {
    config: BatchConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewParams {
    paths: Vec<PathBuf>,
    #[serde(default)]
    settings: EncodeSettings,
    preview_seconds: Option<u16>,
}

fn default_true() -> bool {
    true
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn emit_rpc_event(writer: &SharedWriter, event: &str, payload: Value) {
    let message = RpcEvent {
        event: event.to_string(),
        payload,
    };
    let _ = write_json_line_shared(writer, &message);
}

fn parse_error_payload(err: &AppError) -> RpcErrorPayload {
    match err {
        AppError::Aborted => RpcErrorPayload {
            summary: "Aborted".to_string(),
            detail: "Aborted".to_string(),
        },
        AppError::FfmpegFailed { code, stderr } if *code == -1 => RpcErrorPayload {
            summary: stderr.clone(),
            detail: stderr.clone(),
        },
        AppError::FfmpegFailed { code, stderr } => {
            let parsed = parse_ffmpeg_error(stderr, Some(*code));
            RpcErrorPayload {
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        _ => {
            let text = err.to_string();
            RpcErrorPayload {
                summary: text.clone(),
                detail: text,
            }
        }
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params)
        .map_err(|e| AppError::invalid_config(format!("Invalid params payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T, what: &str) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::from(format!("Failed to serialize {}: {}", what, e)))
}

fn respond(writer: &SharedWriter, id: u64, result: Result<Value, AppError>) {
    let written = match result {
        Ok(result) => write_json_line_shared(writer, &RpcSuccess { id, result }),
        Err(err) => {
            log::debug!(target: "compresso::sidecar", "Request {} failed: {}", id, err);
            write_json_line_shared(
                writer,
                &RpcFailure {
                    id,
                    error: parse_error_payload(&err),
                },
            )
        }
    };
    if let Err(err) = written {
        let failure = RpcFailure {
            id,
            error: RpcErrorPayload {
                summary: "Serialization error".to_string(),
                detail: err.to_string(),
            },
        };
        let _ = write_json_line_shared(writer, &failure);
    }
}

struct App {
    batch: Arc<BatchOrchestrator>,
    previews: Arc<PreviewService>,
    encoder: Arc<FfmpegEncoder>,
    renderer: Arc<FfmpegPreviewRenderer>,
    shutdown: Arc<ShutdownScheduler>,
    assets: PathBuf,
}

impl App {
    fn new(assets: PathBuf) -> Self {
        let encoder = Arc::new(FfmpegEncoder::new(TempFileManager::new(&assets)));
        let renderer = Arc::new(FfmpegPreviewRenderer::new(TempFileManager::new(&assets)));
        let shutdown = Arc::new(ShutdownScheduler::new(Arc::new(SystemShutdown)));
        let batch = Arc::new(BatchOrchestrator::new(
            encoder.clone(),
            Arc::new(LocalFs),
            Arc::clone(&shutdown),
        ));
        let previews = Arc::new(PreviewService::new(renderer.clone()));
        Self {
            batch,
            previews,
            encoder,
            renderer,
            shutdown,
            assets,
        }
    }
}

fn is_async_request(method: &str) -> bool {
    matches!(
        method,
        "batch.start"
            | "preview.request"
            | "preview.clear"
            | "shutdown.disarm"
            | "cache.delete"
            | "media.inspect"
    )
}

fn dispatch_sync(method: &str, params: Value, app: &App) -> Result<Value, AppError> {
    match method {
        "files.resolve" => {
            let parsed: FilesParams = params_from_value(params)?;
            to_value(
                resolve_video_files(&parsed.paths, parsed.recursive),
                "resolved files",
            )
        }
        "batch.add" => {
            let parsed: FilesParams = params_from_value(params)?;
            let resolved = app.batch.add_items(&parsed.paths, parsed.recursive)?;
            Ok(json!({
                "resolved": to_value(resolved, "resolved files")?,
                "snapshot": to_value(app.batch.snapshot(), "snapshot")?,
            }))
        }
        "batch.remove" => {
            let parsed: RemoveParams = params_from_value(params)?;
            let removed = app.batch.remove_item(parsed.item_id)?;
            Ok(json!({ "removed": removed }))
        }
        "batch.clear" => {
            app.batch.clear()?;
            to_value(app.batch.snapshot(), "snapshot")
        }
        "batch.snapshot" => to_value(app.batch.snapshot(), "snapshot"),
        "batch.cancel" => Ok(json!({ "cancelled": app.batch.cancel() })),
        "shutdown.state" => to_value(app.shutdown.state(), "shutdown state"),
        _ => Err(AppError::invalid_config(format!("Unknown method: {}", method))),
    }
}

async fn dispatch_async(method: &str, params: Value, app: &App) -> Result<Value, AppError> {
    match method {
        "batch.start" => {
            let parsed: StartParams = params_from_value(params)?;
            let report = app.batch.start(parsed.config).await?;
            to_value(report, "run report")
        }
        "preview.request" => {
            let parsed: PreviewParams = params_from_value(params)?;
            let artifacts = app
                .previews
                .request(&parsed.paths, &parsed.settings, parsed.preview_seconds)
                .await?;
            let cache_hit = artifacts.outcome == CacheOutcome::Hit;
            let mut value = to_value(artifacts, "preview result")?;
            value["cacheHit"] = json!(cache_hit);
            Ok(value)
        }
        "media.inspect" => {
            let parsed: InspectParams = params_from_value(params)?;
            let metadata = tokio::task::spawn_blocking(move || get_video_metadata(&parsed.path))
                .await
                .map_err(|e| AppError::from(e.to_string()))??;
            to_value(metadata, "video metadata")
        }
        "preview.clear" => {
            app.previews.clear().await;
            Ok(json!({ "cleared": true }))
        }
        "shutdown.disarm" => {
            app.shutdown.disarm().await?;
            to_value(app.shutdown.state(), "shutdown state")
        }
        "cache.delete" => {
            let idle = app.batch.hold_idle().map_err(|_| {
                AppError::invalid_config("Cannot delete the cache while a batch is running")
            })?;
            app.previews.clear().await;
            let assets = app.assets.clone();
            let deleted = tokio::task::spawn_blocking(move || {
                let _idle = idle;
                delete_cache(&assets)
            })
                .await
                .map_err(|e| AppError::from(e.to_string()))?;
            Ok(json!({ "deleted": deleted }))
        }
        _ => Err(AppError::invalid_config(format!("Unknown method: {}", method))),
    }
}

/// Forward orchestrator events to the RPC stream until the channel closes.
fn spawn_batch_event_forwarder(app: &App, writer: SharedWriter) -> JoinHandle<()> {
    let mut events = app.batch.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(
                        target: "compresso::sidecar",
                        "Dropped {} batch event(s)",
                        skipped
                    );
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let name = match &event {
                BatchEvent::RunStarted { .. } => "batch.started",
                BatchEvent::ItemStatus { .. } => "batch.item.status",
                BatchEvent::ItemProgress { .. } => "batch.item.progress",
                BatchEvent::RunFinished(_) => "batch.complete",
            };
            match serde_json::to_value(&event) {
                Ok(payload) => emit_rpc_event(&writer, name, payload),
                Err(e) => log::warn!(target: "compresso::sidecar", "Unserializable event: {}", e),
            }
        }
    })
}

fn spawn_shutdown_forwarder(app: &App, writer: SharedWriter) -> JoinHandle<()> {
    let mut countdown = app.shutdown.subscribe();
    tokio::spawn(async move {
        while countdown.changed().await.is_ok() {
            let state = *countdown.borrow_and_update();
            match serde_json::to_value(state) {
                Ok(payload) => emit_rpc_event(&writer, "shutdown.countdown", payload),
                Err(e) => log::warn!(target: "compresso::sidecar", "Unserializable state: {}", e),
            }
        }
    })
}

fn main() -> io::Result<()> {
    logging::init();
    let assets = assets_dir();
    let removed = cleanup_old_temp_files(
        &assets,
        Duration::from_secs(STARTUP_CLEANUP_MAX_AGE_HOURS * 3600),
    );
    if removed > 0 {
        log::info!(target: "compresso::sidecar", "Removed {} stale temp file(s)", removed);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let stdin = io::stdin();
    let stdout: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let app = Arc::new(App::new(assets));

    let forwarders = {
        let _guard = runtime.enter();
        [
            spawn_batch_event_forwarder(&app, Arc::clone(&stdout)),
            spawn_shutdown_forwarder(&app, Arc::clone(&stdout)),
        ]
    };
    let mut async_workers: Vec<JoinHandle<()>> = Vec::new();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid input stream".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&stdout, &failure);
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid request".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&stdout, &failure);
                continue;
            }
        };

        if is_async_request(&request.method) {
            let writer = Arc::clone(&stdout);
            let app = Arc::clone(&app);
            async_workers.push(runtime.spawn(async move {
                let result = dispatch_async(&request.method, request.params, &app).await;
                respond(&writer, request.id, result);
            }));
        } else {
            let result = dispatch_sync(&request.method, request.params, &app);
            respond(&stdout, request.id, result);
        }
        async_workers.retain(|worker| !worker.is_finished());
    }

    // Host closed stdin: stop in-flight work, then join.
    if app.batch.cancel() {
        log::info!(target: "compresso::sidecar", "Input closed, cancelling running batch");
    }
    app.encoder.terminate_all();
    app.renderer.terminate_all();
    runtime.block_on(async {
        for worker in async_workers {
            let _ = worker.await;
        }
        app.previews.clear().await;
    });
    for forwarder in forwarders {
        forwarder.abort();
    }
    Ok(())
}
