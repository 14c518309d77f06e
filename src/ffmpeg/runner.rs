//! FFmpeg process spawning and progress parsing.
//!
//! Spawns FFmpeg as a child process, parses `-progress -` output from stdout
//! on a reader thread and keeps a bounded stderr tail on another while the
//! calling thread waits. Each runner owns one active-process slot keyed by
//! job id, so `terminate(job_id)` stops exactly the job it names.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

#[cfg(windows)]
use std::os::windows::process::CommandExt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::discovery::get_ffmpeg_path;
use super::progress::{ProgressLine, parse_progress_line};
use crate::error::AppError;

/// Minimum interval between progress callbacks.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(150);
/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Receives seconds of output encoded so far.
pub type ElapsedCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct ActiveProcess {
    job_id: u64,
    child: Child,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveProcess>,
    /// Cancel that arrived before the process was registered.
    pending_cancel: Option<u64>,
}

#[derive(Default)]
pub struct FfmpegRunner {
    binary: Option<PathBuf>,
    slot: Mutex<Slot>,
}

impl FfmpegRunner {
    /// Runner that resolves the FFmpeg binary on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner pinned to an explicit binary.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary: Some(binary),
            slot: Mutex::new(Slot::default()),
        }
    }

    fn binary(&self) -> Result<PathBuf, AppError> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => Ok(get_ffmpeg_path()?.to_path_buf()),
        }
    }

    /// Run FFmpeg and block until it exits.
    ///
    /// Returns `Aborted` when the process was stopped through
    /// [`FfmpegRunner::terminate`], `FfmpegFailed` with the stderr tail on a
    /// non-zero exit.
    pub fn run(
        &self,
        job_id: u64,
        args: Vec<String>,
        on_elapsed: Option<ElapsedCallback>,
    ) -> Result<(), AppError> {
        let ffmpeg_path = self.binary()?;

        let input_arg = args
            .iter()
            .position(|a| a == "-i")
            .and_then(|i| args.get(i + 1));
        let output_arg = args.iter().rev().nth(1);
        log::debug!(
            target: "compresso::ffmpeg::runner",
            "Spawning FFmpeg: job={}, path={}, input={:?}, output={:?}",
            job_id,
            ffmpeg_path.display(),
            input_arg,
            output_arg
        );

        let mut cmd = Command::new(&ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn FFmpeg: {}", e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::from("Failed to capture FFmpeg output"));
        };

        {
            let mut slot = self.slot.lock();
            if slot.pending_cancel == Some(job_id) {
                slot.pending_cancel = None;
                drop(slot);
                let _ = child.kill();
                let _ = child.wait();
                log::info!(
                    target: "compresso::ffmpeg::runner",
                    "FFmpeg job {} cancelled before it started",
                    job_id
                );
                return Err(AppError::aborted());
            }
            slot.active = Some(ActiveProcess { job_id, child });
        }

        let stderr_buffer = Arc::new(Mutex::new(Vec::new()));
        let stdout_handle = read_progress(stdout, on_elapsed);
        let stderr_handle = read_stderr_tail(stderr, Arc::clone(&stderr_buffer));
        let _ = stdout_handle.join();
        let _ = stderr_handle.join();

        let active = {
            let mut slot = self.slot.lock();
            match slot.active.take() {
                Some(active) if active.job_id == job_id => Some(active),
                other => {
                    slot.active = other;
                    None
                }
            }
        };

        let status = match active {
            Some(mut active) => active.child.wait()?,
            None => {
                log::warn!(
                    target: "compresso::ffmpeg::runner",
                    "FFmpeg job {} was aborted (terminated externally)",
                    job_id
                );
                return Err(AppError::aborted());
            }
        };

        let stderr_str = String::from_utf8_lossy(&stderr_buffer.lock()).to_string();

        if status.success() {
            log::info!(
                target: "compresso::ffmpeg::runner",
                "FFmpeg job {} completed successfully",
                job_id
            );
            Ok(())
        } else {
            let code = status.code().unwrap_or(-1);
            let err_preview = stderr_str
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .join("; ");
            log::error!(
                target: "compresso::ffmpeg::runner",
                "FFmpeg job {} failed (code={}): {}",
                job_id,
                code,
                err_preview
            );
            Err(AppError::ffmpeg_failed(code, stderr_str))
        }
    }

    /// Kill the process for `job_id`. A cancel for a job that has not spawned
    /// yet is remembered and applied when it does. Returns whether a running
    /// process was killed.
    pub fn terminate(&self, job_id: u64) -> bool {
        let mut slot = self.slot.lock();
        let active = match slot.active.take() {
            Some(active) if active.job_id == job_id => active,
            other => {
                slot.active = other;
                slot.pending_cancel = Some(job_id);
                return false;
            }
        };
        drop(slot);
        kill(active);
        true
    }

    /// Kill whatever is running, regardless of job.
    pub fn terminate_all(&self) {
        let active = self.slot.lock().active.take();
        if let Some(active) = active {
            kill(active);
        }
    }

    pub fn active_job(&self) -> Option<u64> {
        self.slot.lock().active.as_ref().map(|a| a.job_id)
    }
}

fn kill(mut active: ActiveProcess) {
    log::info!(
        target: "compresso::ffmpeg::runner",
        "Terminating FFmpeg job {}",
        active.job_id
    );
    let _ = active.child.kill();
    let _ = active.child.wait();
}

fn read_progress<R: std::io::Read + Send + 'static>(
    reader: R,
    on_elapsed: Option<ElapsedCallback>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_emit: Option<Instant> = None;
        let mut last_elapsed = 0.0_f64;
        let mut stream_reader = BufReader::new(reader);
        let mut line_buf = Vec::with_capacity(128);
        while stream_reader.read_until(b'\n', &mut line_buf).unwrap_or(0) > 0 {
            let line = String::from_utf8_lossy(&line_buf);
            let elapsed = match parse_progress_line(&line) {
                Some(ProgressLine::Elapsed(secs)) => Some((secs, false)),
                Some(ProgressLine::End) => Some((last_elapsed, true)),
                None => None,
            };
            if let (Some((secs, force)), Some(cb)) = (elapsed, on_elapsed.as_ref()) {
                let now = Instant::now();
                let due = last_emit
                    .is_none_or(|at| now.duration_since(at) >= PROGRESS_EMIT_INTERVAL);
                if force || due {
                    last_emit = Some(now);
                    cb(secs);
                }
                last_elapsed = last_elapsed.max(secs);
            }
            line_buf.clear();
        }
    })
}

fn read_stderr_tail<R: std::io::Read + Send + 'static>(
    reader: R,
    buffer: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut stream_reader = BufReader::new(reader);
        let mut line_buf = Vec::with_capacity(256);
        while stream_reader.read_until(b'\n', &mut line_buf).unwrap_or(0) > 0 {
            let mut guard = buffer.lock();
            guard.extend_from_slice(&line_buf);
            if guard.len() > MAX_STDERR_BYTES {
                let excess = guard.len() - MAX_STDERR_BYTES;
                guard.drain(..excess);
            }
            line_buf.clear();
        }
    })
}
