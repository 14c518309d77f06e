//! FFprobe-based duration and metadata probing, with a fallback to the
//! `Duration:` banner of `ffmpeg -i` when ffprobe is not shipped.

use crate::error::AppError;
use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Stdio};

use super::discovery::{get_ffmpeg_path, get_ffprobe_path};
use super::progress::parse_duration_banner;

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    /// Seconds; None when the container does not report one.
    pub duration: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub fps: f64,
    pub codec_name: Option<String>,
    pub format_name: Option<String>,
}

/// Parse ffprobe JSON output into VideoMetadata.
pub fn parse_ffprobe_json(json: &str) -> Result<VideoMetadata, AppError> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| AppError::from(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let format = output.format.as_ref();
    let duration = format
        .and_then(|f| f.duration.as_ref())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);
    let size = format
        .and_then(|f| f.size.as_ref())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let video_stream = output
        .streams
        .as_ref()
        .and_then(|streams| streams.iter().find(|s| s.codec_type.as_deref() == Some("video")));

    Ok(VideoMetadata {
        duration,
        width: video_stream.and_then(|s| s.width).unwrap_or(0),
        height: video_stream.and_then(|s| s.height).unwrap_or(0),
        size,
        fps: video_stream
            .and_then(|s| s.r_frame_rate.as_deref())
            .and_then(parse_frame_rate)
            .unwrap_or(0.0),
        codec_name: video_stream.and_then(|s| s.codec_name.clone()),
        format_name: format.and_then(|f| f.format_name.clone()),
    })
}

/// Run ffprobe on a video file and return metadata.
pub fn get_video_metadata(path: &Path) -> Result<VideoMetadata, AppError> {
    let ffprobe = get_ffprobe_path()?;
    log::debug!(
        target: "compresso::ffmpeg::ffprobe",
        "get_video_metadata: path={}",
        path.display()
    );

    let output = Command::new(&ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| AppError::from(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::from(format!("ffprobe failed: {}", stderr.trim())));
    }

    let json = String::from_utf8(output.stdout)
        .map_err(|_| AppError::from("ffprobe output was not valid UTF-8"))?;
    parse_ffprobe_json(&json)
}

/// Read the duration from `ffmpeg -i <path>`. FFmpeg exits non-zero because
/// no output is given; the banner on stderr is all we need.
pub fn probe_duration_with_ffmpeg(path: &Path) -> Result<Option<f64>, AppError> {
    let ffmpeg = get_ffmpeg_path()?;
    let output = Command::new(ffmpeg)
        .arg("-hide_banner")
        .arg("-i")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| AppError::from(format!("Failed to run FFmpeg: {}", e)))?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(parse_duration_banner(&stderr))
}

/// Best-effort duration: ffprobe first, FFmpeg banner second.
pub fn probe_duration(path: &Path) -> Result<Option<f64>, AppError> {
    match get_video_metadata(path) {
        Ok(meta) if meta.duration.is_some() => Ok(meta.duration),
        Ok(_) => probe_duration_with_ffmpeg(path),
        Err(e) => {
            log::debug!(
                target: "compresso::ffmpeg::ffprobe",
                "ffprobe unavailable for {} ({}), falling back to ffmpeg -i",
                path.display(),
                e
            );
            probe_duration_with_ffmpeg(path)
        }
    }
}
