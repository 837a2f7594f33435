// Extractor boundary: the black-box media extractor and its typed failures

use std::fmt;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::cookies::CookieJarHandle;
use crate::downloader::errors::ErrorKind;
use crate::downloader::models::{AudioCodec, TransferEvent, VideoMetadata};

/// Identity the extractor presents to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAgentProfile {
    Desktop,
    Mobile,
}

impl fmt::Display for UserAgentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Desktop => write!(f, "desktop"),
            Self::Mobile => write!(f, "mobile"),
        }
    }
}

/// Where the extractor gets its cookies from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    /// The persisted session jar
    Jar(CookieJarHandle),
    /// Let the extractor read installed browser profiles, in this order
    Browsers(Vec<String>),
    None,
}

impl CookieSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Jar(_) => "session jar",
            Self::Browsers(_) => "browser profiles",
            Self::None => "no cookies",
        }
    }
}

/// Option set for one extractor invocation.
#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub profile: UserAgentProfile,
    pub user_agent: String,
    /// Extra request headers sent alongside the user agent
    pub headers: Vec<(String, String)>,
    pub cookies: CookieSource,
    pub visitor_token: Option<String>,
    pub socket_timeout_secs: u32,
    /// Wall-clock limit for metadata extraction
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConversion {
    pub codec: AudioCodec,
    pub bitrate_kbps: u32,
}

/// What to download and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub selector: String,
    /// Set for audio requests: extract and convert the audio track
    pub audio: Option<AudioConversion>,
    /// Set for video requests: container split streams are merged into
    pub merge_container: Option<String>,
    pub output_dir: PathBuf,
    pub output_template: String,
}

/// Called for every transfer event; returning `Break` aborts the transfer.
pub type TransferHook = dyn Fn(&TransferEvent) -> ControlFlow<()> + Send + Sync;

/// Typed failure returned by an extractor. The kind is decided once, at the
/// boundary; `detail` is the extractor's own text for display only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct ExtractorFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ExtractorFailure {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "transfer aborted")
    }
}

/// Result class of one cascade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Retryable(ErrorKind),
    Fatal(ErrorKind),
}

/// Record of one try of the retry cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionAttempt {
    pub profile: UserAgentProfile,
    /// Session generation the attempt ran with
    pub session_generation: u64,
    pub cookies: &'static str,
    pub outcome: AttemptOutcome,
}

/// The external media extractor.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Name of the extractor (for logging)
    fn name(&self) -> &'static str;

    /// Resolve `url` into metadata without downloading media.
    async fn extract_info(
        &self,
        url: &str,
        options: &ExtractorOptions,
    ) -> Result<VideoMetadata, ExtractorFailure>;

    /// Download according to `spec`, reporting through `hook`. Returns the
    /// final file path.
    async fn download(
        &self,
        url: &str,
        options: &ExtractorOptions,
        spec: &DownloadSpec,
        hook: &TransferHook,
    ) -> Result<PathBuf, ExtractorFailure>;
}
