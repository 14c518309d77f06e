pub mod batch;
pub mod cancel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod fs;
pub mod logging;
pub mod model;
pub mod output_path;
pub mod preview;
pub mod preview_cache;
pub mod progress;
pub mod shutdown;

pub use batch::{BatchOrchestrator, IdleGuard, RunReport};
pub use config::{BatchConfig, EncodeSettings};
pub use error::AppError;
pub use preview::PreviewService;
pub use shutdown::ShutdownScheduler;
