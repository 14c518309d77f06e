//! Everything that talks to the FFmpeg binary: discovery, argument building,
//! the process runner, probing, and the temp files it writes.

mod builder;
pub mod discovery;
mod encoder;
mod error;
pub mod ffprobe;
mod progress;
mod runner;
mod temp;

pub use builder::{
    ClipWindow, build_compress_args, build_source_clip_args, quality_to_crf, transform_filters,
    video_filter,
};
pub use encoder::FfmpegEncoder;
pub use error::{FfmpegErrorPayload, parse_ffmpeg_error};
pub use progress::{ProgressLine, parse_duration_banner, parse_progress_line};
pub use runner::{ElapsedCallback, FfmpegRunner};
pub use temp::{TEMP_PREFIX, TempFileManager, assets_dir, cleanup_old_temp_files, delete_cache};

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
