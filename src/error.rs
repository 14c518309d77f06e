//! App error type for the compression core. Implements Display and Serialize for the sidecar.

use crate::ffmpeg::parse_ffmpeg_error;

/// Output path resolution failures. Only the affected item fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Destination folder is not set")]
    CustomFolderUnset,

    #[error("Source path has no file name: {0}")]
    MissingFileName(String),

    #[error("Could not find a free output name after {attempts} attempts")]
    TooManyCollisions { attempts: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    FfmpegNotFound(String),

    #[error("FFmpeg failed (code {code}): {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    /// Cooperative cancellation marker. The job was stopped, not broken.
    #[error("Aborted")]
    Aborted,

    #[error("{0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("{0}")]
    Shutdown(String),

    #[error("{0}")]
    Preview(String),
}

impl AppError {
    pub fn aborted() -> Self {
        Self::Aborted
    }

    pub fn ffmpeg_failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::FfmpegFailed {
            code,
            stderr: stderr.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Short message suitable for an item's `error` field.
    pub fn user_message(&self) -> String {
        match self {
            AppError::FfmpegFailed { code, stderr } if *code != -1 => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                match payload.detail.lines().rev().find(|l| !l.trim().is_empty()) {
                    Some(last) => format!("{} {}", payload.summary, last.trim()),
                    None => payload.summary,
                }
            }
            AppError::FfmpegFailed { stderr, .. } => stderr.clone(),
            _ => self.to_string(),
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AppError::FfmpegFailed { code, stderr } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                let json =
                    serde_json::json!({ "summary": payload.summary, "detail": payload.detail });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        if s == "Aborted" {
            AppError::Aborted
        } else {
            AppError::FfmpegFailed {
                code: -1,
                stderr: s,
            }
        }
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
