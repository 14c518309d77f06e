//! Batch and encode configuration as received from the presentation layer.
//!
//! Everything here is plain data: deserialized camelCase, defaulted, and
//! normalized before a run starts so the orchestrator never sees an
//! inconsistent combination (e.g. `replace` with a custom folder).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AppError;

/// Containers the encoder can write.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["mp4", "mov", "webm", "avi", "mkv"];

pub const DEFAULT_SUFFIX: &str = "_compressed";
pub const DEFAULT_PREVIEW_SECONDS: u16 = 20;
pub const MIN_PREVIEW_SECONDS: u16 = 1;
pub const MAX_PREVIEW_SECONDS: u16 = 120;

pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(ext))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingMode {
    #[default]
    Suffix,
    Prefix,
    Replace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationMode {
    #[default]
    SourceAdjacent,
    CustomFolder,
}

/// Named bundle of encoder tuning flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Size-optimized: slow preset, yuv420p, faststart.
    #[default]
    Ironclad,
    /// Speed-optimized: codec defaults plus CRF only.
    Thunderbolt,
}

impl Preset {
    pub fn id(self) -> &'static str {
        match self {
            Preset::Ironclad => "ironclad",
            Preset::Thunderbolt => "thunderbolt",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Same,
    Mp4,
    Mov,
    Webm,
    Avi,
    Mkv,
}

impl OutputFormat {
    /// Fixed extension, or None for "same as source".
    pub fn extension(self) -> Option<&'static str> {
        match self {
            OutputFormat::Same => None,
            OutputFormat::Mp4 => Some("mp4"),
            OutputFormat::Mov => Some("mov"),
            OutputFormat::Webm => Some("webm"),
            OutputFormat::Avi => Some("avi"),
            OutputFormat::Mkv => Some("mkv"),
        }
    }
}

/// One step of the user's edit history, applied in order before scaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Transform {
    /// Degrees; only multiples of 90 have an effect.
    Rotate(i32),
    Flip {
        #[serde(default)]
        horizontal: bool,
        #[serde(default)]
        vertical: bool,
    },
    Crop(CropRect),
}

/// Crop rectangle in source pixels. The editor sends fractional values; they
/// are rounded on the way in so the rectangle can be hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropRect {
    #[serde(deserialize_with = "rounded_i64")]
    pub width: i64,
    #[serde(deserialize_with = "rounded_i64")]
    pub height: i64,
    #[serde(deserialize_with = "rounded_i64")]
    pub left: i64,
    #[serde(deserialize_with = "rounded_i64")]
    pub top: i64,
}

fn rounded_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(value.round() as i64)
}

/// Every knob that changes what the encoder produces. Shared by batch runs
/// and previews; the preview cache key embeds this struct whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodeSettings {
    pub output_format: OutputFormat,
    pub preset: Preset,
    pub mute: bool,
    /// 0..=100, higher is better looking and larger.
    pub quality: u8,
    pub dimensions: Option<(u32, u32)>,
    pub fps: Option<u32>,
    pub transforms: Vec<Transform>,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Same,
            preset: Preset::Ironclad,
            mute: false,
            quality: 50,
            dimensions: None,
            fps: None,
            transforms: Vec::new(),
        }
    }
}

impl EncodeSettings {
    pub fn effective_quality(&self) -> u8 {
        self.quality.min(100)
    }

    /// Extension the encoder should write for `source`.
    pub fn output_extension_for(&self, source: &Path) -> String {
        match self.output_format.extension() {
            Some(ext) => ext.to_string(),
            None => source_extension(source),
        }
    }
}

/// Lowercased source extension, "mp4" when there is none.
pub fn source_extension(source: &Path) -> String {
    source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "mp4".to_string())
}

pub fn effective_preview_seconds(requested: Option<u16>) -> u16 {
    requested
        .unwrap_or(DEFAULT_PREVIEW_SECONDS)
        .clamp(MIN_PREVIEW_SECONDS, MAX_PREVIEW_SECONDS)
}

/// Naming, destination and post-batch behaviour for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub naming_mode: NamingMode,
    pub prefix: String,
    pub suffix: String,
    pub destination_mode: DestinationMode,
    pub custom_folder: Option<PathBuf>,
    pub recurse_subfolders: bool,
    /// 0 disables the post-batch shutdown.
    pub shutdown_delay_secs: u64,
    pub settings: EncodeSettings,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            naming_mode: NamingMode::Suffix,
            prefix: String::new(),
            suffix: DEFAULT_SUFFIX.to_string(),
            destination_mode: DestinationMode::SourceAdjacent,
            custom_folder: None,
            recurse_subfolders: true,
            shutdown_delay_secs: 0,
            settings: EncodeSettings::default(),
        }
    }
}

impl BatchConfig {
    /// Sanitizes affixes and applies the `replace` invariants: in-place
    /// rewrites stay next to the source and keep its container.
    pub fn normalized(mut self) -> Self {
        self.prefix = sanitize_affix(&self.prefix);
        self.suffix = sanitize_affix(&self.suffix);
        if self.naming_mode == NamingMode::Replace {
            self.destination_mode = DestinationMode::SourceAdjacent;
            self.settings.output_format = OutputFormat::Same;
        }
        if self.destination_mode == DestinationMode::SourceAdjacent {
            self.custom_folder = None;
        }
        self
    }

    /// Rejects configurations that cannot start a run.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.destination_mode == DestinationMode::CustomFolder {
            match self.custom_folder.as_deref() {
                None => {
                    return Err(AppError::invalid_config(
                        "Choose a destination folder before starting.",
                    ));
                }
                Some(folder) if folder.as_os_str().is_empty() => {
                    return Err(AppError::invalid_config(
                        "Choose a destination folder before starting.",
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn output_extension_for(&self, source: &Path) -> String {
        if self.naming_mode == NamingMode::Replace {
            return source_extension(source);
        }
        self.settings.output_extension_for(source)
    }
}

/// Strips characters that would escape the file name (path separators) or
/// that common filesystems reject.
pub fn sanitize_affix(raw: &str) -> String {
    raw.chars()
        .filter(|c| {
            !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control()
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_forces_source_adjacent_and_same_extension() {
        let config = BatchConfig {
            naming_mode: NamingMode::Replace,
            destination_mode: DestinationMode::CustomFolder,
            custom_folder: Some(PathBuf::from("/out")),
            settings: EncodeSettings {
                output_format: OutputFormat::Webm,
                ..Default::default()
            },
            ..Default::default()
        }
        .normalized();

        assert_eq!(config.destination_mode, DestinationMode::SourceAdjacent);
        assert_eq!(config.custom_folder, None);
        assert_eq!(config.output_extension_for(Path::new("/v/clip.MOV")), "mov");
    }

    #[test]
    fn custom_folder_required_in_custom_mode() {
        let config = BatchConfig {
            destination_mode: DestinationMode::CustomFolder,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));

        let config = BatchConfig {
            destination_mode: DestinationMode::CustomFolder,
            custom_folder: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sanitize_affix_drops_separators() {
        assert_eq!(sanitize_affix(" ../small\\_v2: "), ".._small_v2");
        assert_eq!(sanitize_affix("_small"), "_small");
    }

    #[test]
    fn preview_seconds_clamped() {
        assert_eq!(effective_preview_seconds(None), 20);
        assert_eq!(effective_preview_seconds(Some(0)), 1);
        assert_eq!(effective_preview_seconds(Some(500)), 120);
    }

    #[test]
    fn deserializes_camel_case_with_transforms() {
        let json = r#"{
            "namingMode": "prefix",
            "prefix": "min_",
            "destinationMode": "custom-folder",
            "customFolder": "/exports",
            "shutdownDelaySecs": 600,
            "settings": {
                "outputFormat": "webm",
                "preset": "thunderbolt",
                "mute": true,
                "quality": 80,
                "dimensions": [1280, 720],
                "fps": 30,
                "transforms": [
                    {"type": "rotate", "value": 90},
                    {"type": "flip", "value": {"horizontal": true}},
                    {"type": "crop", "value": {"width": 100.4, "height": 50.6, "left": 0, "top": 2.5}}
                ]
            }
        }"#;
        let config: BatchConfig = serde_json::from_str(json).expect("parse config");
        assert_eq!(config.naming_mode, NamingMode::Prefix);
        assert_eq!(config.destination_mode, DestinationMode::CustomFolder);
        assert_eq!(config.shutdown_delay_secs, 600);
        assert_eq!(config.suffix, DEFAULT_SUFFIX);
        assert_eq!(config.settings.preset, Preset::Thunderbolt);
        assert_eq!(config.settings.dimensions, Some((1280, 720)));
        assert_eq!(
            config.settings.transforms[1],
            Transform::Flip {
                horizontal: true,
                vertical: false
            }
        );
        assert_eq!(
            config.settings.transforms[2],
            Transform::Crop(CropRect {
                width: 100,
                height: 51,
                left: 0,
                top: 3
            })
        );
    }

    #[test]
    fn output_extension_uses_fixed_format() {
        let settings = EncodeSettings {
            output_format: OutputFormat::Mkv,
            ..Default::default()
        };
        assert_eq!(settings.output_extension_for(Path::new("a.mp4")), "mkv");
        assert_eq!(
            EncodeSettings::default().output_extension_for(Path::new("noext")),
            "mp4"
        );
    }
}
