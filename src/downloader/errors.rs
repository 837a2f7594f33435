// Error taxonomy surfaced to the UI collaborator

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure classes the core reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The platform wants a signed-in session (age gate, private video, "sign in")
    AuthRequired,

    /// The platform flagged the request as automated traffic
    BotDetected,

    /// The user never finished the interactive login
    AcquisitionTimeout,

    /// Timeouts, resets, 5xx and throttling that may clear up on their own
    NetworkTransient,

    /// Video removed, deleted or never existed
    NotFound,

    /// URL or content the extractor cannot handle (DRM, unsupported site)
    Unsupported,

    /// The requested format/quality does not exist for this video
    FormatUnavailable,

    /// Every identity of the retry cascade was tried and failed
    ExtractionFatal,

    /// The user cancelled the download
    Cancelled,

    /// The input is not a link to a single YouTube video
    InvalidUrl,

    /// Local file system refused a read or write (output directory, data files)
    Storage,
}

impl ErrorKind {
    /// Failures that rotating session or user-agent may fix.
    pub fn is_identity_failure(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::BotDetected)
    }

    /// Failures retried with the same identity after a backoff.
    pub fn is_simple_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient | Self::NotFound | Self::Unsupported)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::BotDetected => "bot_detected",
            Self::AcquisitionTimeout => "acquisition_timeout",
            Self::NetworkTransient => "network_transient",
            Self::NotFound => "not_found",
            Self::Unsupported => "unsupported",
            Self::FormatUnavailable => "format_unavailable",
            Self::ExtractionFatal => "extraction_fatal",
            Self::Cancelled => "cancelled",
            Self::InvalidUrl => "invalid_url",
            Self::Storage => "storage",
        }
    }

    /// Sentence the UI can show when no more specific message exists.
    pub fn description(&self) -> &'static str {
        match self {
            Self::AuthRequired => "YouTube requires you to sign in to access this video",
            Self::BotDetected => "YouTube flagged the request as automated traffic",
            Self::AcquisitionTimeout => "Sign-in was not completed in time",
            Self::NetworkTransient => "Network problem while talking to YouTube",
            Self::NotFound => "Video not found or no longer available",
            Self::Unsupported => "This URL or video cannot be downloaded",
            Self::FormatUnavailable => "Requested format is not available",
            Self::ExtractionFatal => "Could not access the video after trying every sign-in option",
            Self::Cancelled => "Download cancelled",
            Self::InvalidUrl => "Please enter a valid YouTube video URL",
            Self::Storage => "Could not read or write local files",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by the core: a kind plus a message a person can act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DownloadError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DownloadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Message built from the kind's description, with the first line of the
    /// underlying detail appended when there is one.
    pub fn with_detail(kind: ErrorKind, detail: &str) -> Self {
        let first = detail
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");
        if first.is_empty() {
            Self::new(kind, kind.description())
        } else {
            Self::new(kind, format!("{}\n\nDetails: {}", kind.description(), first))
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, ErrorKind::Cancelled.description())
    }

    pub fn format_unavailable(quality: &str) -> Self {
        Self::new(
            ErrorKind::FormatUnavailable,
            format!("Requested quality '{}' is not available for this video", quality),
        )
    }

    pub fn invalid_url(url: &str) -> Self {
        Self::new(
            ErrorKind::InvalidUrl,
            format!("{}: '{}'", ErrorKind::InvalidUrl.description(), url.trim()),
        )
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Storage, format!("{}: {}", context, err))
    }
}
