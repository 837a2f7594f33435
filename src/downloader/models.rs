// Data models shared by the extractor boundary and the orchestrator

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::{DownloadError, ErrorKind};

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_AUTHOR: &str = "Unknown Channel";

lazy_static! {
    // host, then an optional watch/embed/v path, then an 11-character video id
    static ref YOUTUBE_URL_RE: Regex = Regex::new(
        r"^(https?://)?(www\.|m\.|music\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/(watch\?v=|embed/|v/|.+\?v=)?([^&=%?]{11})"
    )
    .unwrap();
}

/// Whether `url` looks like a link to a single YouTube video.
pub fn is_youtube_url(url: &str) -> bool {
    YOUTUBE_URL_RE.is_match(url.trim())
}

/// Thumbnail the platform serves for every video id.
pub fn default_thumbnail_url(video_id: &str) -> String {
    format!("https://img.youtube.com/vi/{}/maxresdefault.jpg", video_id)
}

/// What the user wants out of the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl FromStr for MediaKind {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            other => Err(DownloadError::new(
                ErrorKind::FormatUnavailable,
                format!("Unknown format '{}', expected video or audio", other),
            )),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Parsed video quality preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Highest,
    /// Maximum frame height in pixels
    Ceiling(u32),
}

impl FromStr for Quality {
    type Err = DownloadError;

    /// Accepts "Highest"/"best" or a height like "720p" / "720".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("highest") || trimmed.eq_ignore_ascii_case("best") {
            return Ok(Self::Highest);
        }
        let digits = trimmed.strip_suffix(['p', 'P']).unwrap_or(trimmed);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Ok(Self::Ceiling(height)),
            _ => Err(DownloadError::format_unavailable(trimmed)),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Highest => write!(f, "Highest"),
            Self::Ceiling(h) => write!(f, "{}p", h),
        }
    }
}

/// Target codec for audio requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Mp3,
    M4a,
    Opus,
    Flac,
    Wav,
}

impl AudioCodec {
    /// Name understood by the extractor's audio post-processor.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }
}

impl FromStr for AudioCodec {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "m4a" | "aac" => Ok(Self::M4a),
            "opus" => Ok(Self::Opus),
            "flac" => Ok(Self::Flac),
            "wav" => Ok(Self::Wav),
            other => Err(DownloadError::new(
                ErrorKind::FormatUnavailable,
                format!("Audio codec '{}' is not supported", other),
            )),
        }
    }
}

/// One resolution request. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    url: String,
    format: MediaKind,
    quality: String,
}

impl ExtractionRequest {
    pub fn new(url: impl Into<String>, format: MediaKind, quality: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format,
            quality: quality.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format(&self) -> MediaKind {
        self.format
    }

    /// Quality exactly as the user supplied it.
    pub fn quality_label(&self) -> &str {
        &self.quality
    }

    /// Reject anything that is not a YouTube video link before the
    /// extractor sees it.
    pub fn validate_url(&self) -> Result<(), DownloadError> {
        if is_youtube_url(&self.url) {
            Ok(())
        } else {
            Err(DownloadError::invalid_url(&self.url))
        }
    }

    /// Parsed quality. Audio requests ignore the field entirely.
    pub fn quality(&self) -> Result<Quality, DownloadError> {
        match self.format {
            MediaKind::Audio => Ok(Quality::Highest),
            MediaKind::Video => self.quality.parse(),
        }
    }
}

/// A candidate media stream reported by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub format_id: String,
    pub ext: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    /// Total bitrate in kbps
    pub tbr: Option<f32>,
    /// Audio bitrate in kbps
    pub abr: Option<f32>,
    pub video_only: bool,
    pub audio_only: bool,
}

impl StreamFormat {
    pub fn effective_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    /// Carries both a video and an audio track.
    pub fn is_combined(&self) -> bool {
        has_codec(&self.vcodec) && has_codec(&self.acodec)
    }
}

fn has_codec(codec: &Option<String>) -> bool {
    codec.as_deref().map_or(false, |c| c != "none" && !c.is_empty())
}

/// Normalized metadata for one video. Title and author are never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub author: String,
    pub duration_seconds: u64,
    pub thumbnail_url: Option<String>,
    pub formats: Vec<StreamFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    tbr: Option<f32>,
    abr: Option<f32>,
}

impl From<RawFormat> for StreamFormat {
    fn from(f: RawFormat) -> Self {
        let video_only = has_codec(&f.vcodec) && !has_codec(&f.acodec);
        let audio_only = has_codec(&f.acodec) && !has_codec(&f.vcodec);
        Self {
            format_id: f.format_id.unwrap_or_default(),
            ext: f.ext.unwrap_or_default(),
            width: f.width,
            height: f.height,
            fps: f.fps,
            vcodec: f.vcodec,
            acodec: f.acodec,
            filesize: f.filesize,
            filesize_approx: f.filesize_approx,
            tbr: f.tbr,
            abr: f.abr,
            video_only,
            audio_only,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl VideoMetadata {
    /// Parse the extractor's info JSON, substituting fallbacks for
    /// missing title/author.
    pub fn from_info_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawInfo = serde_json::from_slice(json)?;
        let id = non_blank(raw.id).unwrap_or_default();
        let thumbnail_url = non_blank(raw.thumbnail)
            .or_else(|| (!id.is_empty()).then(|| default_thumbnail_url(&id)));
        Ok(Self {
            id,
            title: non_blank(raw.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            author: non_blank(raw.uploader)
                .or_else(|| non_blank(raw.channel))
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            duration_seconds: raw.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
            thumbnail_url,
            formats: raw
                .formats
                .into_iter()
                .filter(|f| f.format_id.is_some())
                .map(StreamFormat::from)
                .collect(),
        })
    }
}

/// Byte counters reported by the extractor while a stream transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded_bytes: u64,
    /// Unknown until the server tells us
    pub total_bytes: Option<u64>,
    /// Final path of the stream being written
    pub filename: Option<PathBuf>,
}

/// Everything the extractor reports during a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Bytes(TransferProgress),
    /// Merging, converting and similar steps after the transfer
    Postprocessing(String),
}

/// Event delivered to the UI collaborator. Exactly one terminal event
/// (`Completed`, `Failed`, `Cancelled`) ends every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress { percent: f32, message: String },
    Completed { file_path: PathBuf },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

impl From<DownloadError> for DownloadEvent {
    fn from(e: DownloadError) -> Self {
        if e.kind == ErrorKind::Cancelled {
            return Self::Cancelled;
        }
        Self::Failed {
            kind: e.kind,
            message: e.message,
        }
    }
}
