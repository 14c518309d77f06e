//! FFmpeg argument construction for full compressions and preview clips.

use std::path::Path;

use super::path_to_string;
use crate::config::{EncodeSettings, Preset, Transform};

const MIN_CRF: u8 = 24;
const MAX_CRF: u8 = 36;
const DEFAULT_CRF: u8 = 28;

const EVEN_PADDING: &str = "pad=ceil(iw/2)*2:ceil(ih/2)*2";

/// Time window cut out of the source for a preview.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipWindow {
    pub start_secs: f64,
    pub duration_secs: u16,
}

/// Maps quality (0 = smallest, 100 = best) onto CRF 36..=24.
pub fn quality_to_crf(quality: u8) -> u8 {
    if quality > 100 {
        return DEFAULT_CRF;
    }
    let span = u16::from(MAX_CRF - MIN_CRF);
    let reduction = span * u16::from(quality) / 100;
    MIN_CRF + (span - reduction) as u8
}

/// Filters for the edit history, in order. Only the last crop is applied and
/// it always runs after rotations and flips.
pub fn transform_filters(transforms: &[Transform]) -> Vec<String> {
    let mut filters = Vec::new();
    let mut latest_crop = None;
    for transform in transforms {
        match transform {
            Transform::Rotate(degrees) => match degrees % 360 {
                -90 | 270 => filters.push("transpose=2".to_string()),
                90 | -270 => filters.push("transpose=1".to_string()),
                180 | -180 => filters.push("hflip,vflip".to_string()),
                _ => {}
            },
            Transform::Flip {
                horizontal,
                vertical,
            } => {
                if *horizontal {
                    filters.push("hflip".to_string());
                }
                if *vertical {
                    filters.push("vflip".to_string());
                }
            }
            Transform::Crop(rect) => latest_crop = Some(rect),
        }
    }
    if let Some(c) = latest_crop {
        filters.push(format!("crop={}:{}:{}:{}", c.width, c.height, c.left, c.top));
    }
    filters
}

/// Full `-vf` value: transforms, optional scale, then even-dimension padding
/// (H.264 rejects odd frame sizes).
pub fn video_filter(settings: &EncodeSettings) -> String {
    let mut parts = transform_filters(&settings.transforms);
    if let Some((width, height)) = settings.dimensions {
        parts.push(format!("scale={}:{}", width, height));
    }
    parts.push(EVEN_PADDING.to_string());
    parts.join(",")
}

fn input_args(input: &Path) -> Vec<String> {
    vec![
        "-i".into(),
        path_to_string(input),
        "-hide_banner".into(),
        "-progress".into(),
        "-".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
    ]
}

fn clip_args(args: &mut Vec<String>, clip: Option<ClipWindow>) {
    if let Some(clip) = clip {
        args.extend([
            "-ss".into(),
            format!("{:.3}", clip.start_secs),
            "-t".into(),
            clip.duration_secs.to_string(),
        ]);
    }
}

fn preset_args(preset: Preset, crf: u8) -> Vec<String> {
    match preset {
        Preset::Thunderbolt => vec![
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            crf.to_string(),
        ],
        Preset::Ironclad => vec![
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:v".into(),
            "libx264".into(),
            "-b:v".into(),
            "0".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-preset".into(),
            "slow".into(),
            "-qp".into(),
            "0".into(),
            "-crf".into(),
            crf.to_string(),
        ],
    }
}

fn is_webm(output: &Path) -> bool {
    output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("webm"))
}

/// Arguments for compressing `input` into `output` with the user's settings.
/// With `clip` set, only that window is encoded (the "after" side of a preview).
pub fn build_compress_args(
    input: &Path,
    output: &Path,
    settings: &EncodeSettings,
    clip: Option<ClipWindow>,
) -> Vec<String> {
    let mut args = input_args(input);
    clip_args(&mut args, clip);
    args.extend(preset_args(
        settings.preset,
        quality_to_crf(settings.effective_quality()),
    ));
    args.push("-vf".into());
    args.push(video_filter(settings));
    if let Some(fps) = settings.fps {
        args.push("-r".into());
        args.push(fps.to_string());
    }
    if is_webm(output) {
        args.push("-c:v".into());
        args.push("libvpx-vp9".into());
    }
    if settings.mute {
        args.push("-an".into());
    }
    args.push(path_to_string(output));
    args.push("-y".into());
    args
}

/// Arguments for the "before" side of a preview: a visually lossless,
/// muted H.264 cut with the same geometry as the compressed clip.
pub fn build_source_clip_args(
    input: &Path,
    output: &Path,
    settings: &EncodeSettings,
    clip: ClipWindow,
) -> Vec<String> {
    let mut args = input_args(input);
    clip_args(&mut args, Some(clip));
    args.extend(
        [
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-crf",
            "18",
            "-movflags",
            "+faststart",
            "-vf",
        ]
        .map(String::from),
    );
    args.push(video_filter(settings));
    if let Some(fps) = settings.fps {
        args.push("-r".into());
        args.push(fps.to_string());
    }
    args.push("-an".into());
    args.push(path_to_string(output));
    args.push("-y".into());
    args
}
