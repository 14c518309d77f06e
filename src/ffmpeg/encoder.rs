use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::builder::build_compress_args;
use super::ffprobe::probe_duration;
use super::runner::{ElapsedCallback, FfmpegRunner};
use super::temp::TempFileManager;
use crate::config::is_supported_extension;
use crate::encoder::{EncodeJob, EncodeProgress, Encoder, ProgressSink};
use crate::error::AppError;

/// [`Encoder`] backed by an FFmpeg child process per job.
pub struct FfmpegEncoder {
    runner: FfmpegRunner,
    temp: TempFileManager,
}

impl FfmpegEncoder {
    pub fn new(temp: TempFileManager) -> Self {
        Self {
            runner: FfmpegRunner::new(),
            temp,
        }
    }

    pub fn with_runner(runner: FfmpegRunner, temp: TempFileManager) -> Self {
        Self { runner, temp }
    }

    /// Kill any running job, e.g. on process exit.
    pub fn terminate_all(&self) {
        self.runner.terminate_all();
    }
}

impl Encoder for FfmpegEncoder {
    fn probe_duration(&self, source: &Path) -> Result<Option<f64>, AppError> {
        probe_duration(source)
    }

    fn encode(&self, job: &EncodeJob, progress: ProgressSink) -> Result<PathBuf, AppError> {
        if !job.source.is_file() {
            return Err(AppError::from(format!(
                "Source file does not exist: {}",
                job.source.display()
            )));
        }
        if !is_supported_extension(&job.output_extension) {
            return Err(AppError::invalid_config(format!(
                "Unsupported output format: {}",
                job.output_extension
            )));
        }

        let output = self
            .temp
            .create(&format!("job{}.{}", job.job_id, job.output_extension))?;
        let args = build_compress_args(&job.source, &output, &job.settings, None);
        let job_id = job.job_id;
        let on_elapsed: ElapsedCallback = Arc::new(move |elapsed_secs: f64| {
            progress(EncodeProgress {
                job_id,
                elapsed_secs,
            })
        });

        let result = self
            .runner
            .run(job.job_id, args, Some(on_elapsed))
            .and_then(|()| {
                if output.is_file() {
                    Ok(())
                } else {
                    Err(AppError::from("FFmpeg exited without writing an output file"))
                }
            });

        match result {
            Ok(()) => Ok(output),
            Err(e) => {
                if let Err(rm) = fs::remove_file(&output)
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    log::warn!(
                        target: "compresso::ffmpeg::encoder",
                        "Could not remove partial output {}: {}",
                        output.display(),
                        rm
                    );
                }
                Err(e)
            }
        }
    }

    fn cancel(&self, job_id: u64) {
        self.runner.terminate(job_id);
    }
}
