// Downloader module - extraction, format selection and download jobs

pub mod errors;
pub mod extractors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod traits;
pub mod utils;

pub use errors::{DownloadError, ErrorKind};
pub use extractors::{CascadePosition, ExtractionClient, Extractor, YtDlpCli};
pub use format_selector::FormatSelector;
pub use models::{is_youtube_url, AudioCodec, DownloadEvent, ExtractionRequest, MediaKind, Quality, VideoMetadata};
pub use orchestrator::{DownloadHandle, DownloadJob, DownloadOptions, DownloadOrchestrator};
pub use traits::{CallbackSink, NullSink, ProgressSink};
