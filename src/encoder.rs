//! The encoder seam: what the orchestrator needs from whatever actually
//! re-encodes video. [`crate::ffmpeg::FfmpegEncoder`] is the real one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EncodeSettings;
use crate::error::AppError;

/// One invocation of the encoder for one batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub job_id: u64,
    pub source: PathBuf,
    /// Extension of the file the encoder must produce, without the dot.
    pub output_extension: String,
    pub settings: EncodeSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeProgress {
    pub job_id: u64,
    /// Seconds of output encoded so far.
    pub elapsed_secs: f64,
}

pub type ProgressSink = Arc<dyn Fn(EncodeProgress) + Send + Sync>;

/// Blocking encoder contract. The orchestrator calls it from
/// `spawn_blocking`, one job at a time.
pub trait Encoder: Send + Sync {
    /// Total media duration in seconds, if it can be determined.
    fn probe_duration(&self, source: &Path) -> Result<Option<f64>, AppError>;

    /// Encode `job` into a temporary file and return its path. The caller
    /// owns (and moves or deletes) the returned file. Must return
    /// [`AppError::Aborted`] when stopped through [`Encoder::cancel`] and
    /// must not leave partial output behind on failure.
    fn encode(&self, job: &EncodeJob, progress: ProgressSink) -> Result<PathBuf, AppError>;

    /// Ask the invocation for `job_id` to stop. No-op when it is not running.
    fn cancel(&self, job_id: u64);
}
