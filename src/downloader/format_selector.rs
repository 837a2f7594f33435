// Format/quality selection
//
// Produces the selector string handed to the extractor and, given resolved
// metadata, the concrete stream(s) that selector lands on. Both follow the
// same fallback chain:
//
//   audio      bestaudio / best
//   Highest    bestvideo[mp4] + bestaudio[m4a] / best[mp4] / best
//   <= H       bestvideo[h<=H][mp4] + bestaudio[m4a] / best[h<=H][mp4] / best

use std::cmp::Ordering;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::extractors::{AudioConversion, DownloadSpec};
use super::models::{AudioCodec, MediaKind, Quality, StreamFormat};

pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
pub const MERGE_CONTAINER: &str = "mp4";

/// The stream the selector resolves to, plus the audio stream merged into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPick {
    pub stream_id: String,
    pub merge_with: Option<String>,
    pub height: Option<u32>,
}

impl StreamPick {
    /// Number of separate transfers the download will make.
    pub fn transfer_count(&self) -> u32 {
        if self.merge_with.is_some() {
            2
        } else {
            1
        }
    }

    pub fn label(&self) -> String {
        let mut label = match self.merge_with.as_deref() {
            Some(audio) => format!("{} + {}", self.stream_id, audio),
            None => self.stream_id.clone(),
        };
        if let Some(h) = self.height {
            label.push_str(&format!(" ({}p)", h));
        }
        label
    }
}

pub struct FormatSelector;

impl FormatSelector {
    /// Extractor selector string for a request.
    pub fn selector(kind: MediaKind, quality: Quality) -> String {
        match (kind, quality) {
            (MediaKind::Audio, _) => "bestaudio/best".to_string(),
            (MediaKind::Video, Quality::Highest) => {
                "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string()
            }
            (MediaKind::Video, Quality::Ceiling(h)) => format!(
                "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[height<={h}][ext=mp4]/best",
                h = h
            ),
        }
    }

    /// Full download plan: selector, post-processing and output naming.
    pub fn plan(
        kind: MediaKind,
        quality: Quality,
        codec: AudioCodec,
        audio_bitrate_kbps: u32,
        output_dir: PathBuf,
    ) -> DownloadSpec {
        let (audio, merge_container) = match kind {
            MediaKind::Audio => (
                Some(AudioConversion {
                    codec,
                    bitrate_kbps: audio_bitrate_kbps,
                }),
                None,
            ),
            MediaKind::Video => (None, Some(MERGE_CONTAINER.to_string())),
        };
        DownloadSpec {
            selector: Self::selector(kind, quality),
            audio,
            merge_container,
            output_dir,
            output_template: OUTPUT_TEMPLATE.to_string(),
        }
    }

    /// Resolve the selector against known streams. `None` when nothing fits.
    pub fn pick(formats: &[StreamFormat], kind: MediaKind, quality: Quality) -> Option<StreamPick> {
        match kind {
            MediaKind::Audio => {
                if let Some(audio) = Self::best_audio(formats, None) {
                    return Some(StreamPick {
                        stream_id: audio.format_id.clone(),
                        merge_with: None,
                        height: None,
                    });
                }
                Self::best_combined(formats, None, None).map(single)
            }
            MediaKind::Video => {
                let ceiling = match quality {
                    Quality::Highest => None,
                    Quality::Ceiling(h) => Some(h),
                };
                if let (Some(video), Some(audio)) = (
                    Self::best_video(formats, ceiling, Some("mp4")),
                    Self::best_audio(formats, Some("m4a")),
                ) {
                    return Some(StreamPick {
                        stream_id: video.format_id.clone(),
                        merge_with: Some(audio.format_id.clone()),
                        height: video.height,
                    });
                }
                Self::best_combined(formats, ceiling, Some("mp4"))
                    .or_else(|| Self::best_combined(formats, None, None))
                    .map(single)
            }
        }
    }

    fn best_video<'a>(
        formats: &'a [StreamFormat],
        ceiling: Option<u32>,
        ext: Option<&str>,
    ) -> Option<&'a StreamFormat> {
        formats
            .iter()
            .filter(|f| f.video_only)
            .filter(|f| within(f, ceiling) && ext_matches(f, ext))
            .max_by(|a, b| rank_video(a, b))
    }

    fn best_combined<'a>(
        formats: &'a [StreamFormat],
        ceiling: Option<u32>,
        ext: Option<&str>,
    ) -> Option<&'a StreamFormat> {
        formats
            .iter()
            .filter(|f| f.is_combined())
            .filter(|f| within(f, ceiling) && ext_matches(f, ext))
            .max_by(|a, b| rank_video(a, b))
    }

    fn best_audio<'a>(formats: &'a [StreamFormat], ext: Option<&str>) -> Option<&'a StreamFormat> {
        formats
            .iter()
            .filter(|f| f.audio_only && ext_matches(f, ext))
            .max_by(|a, b| {
                cmp_f32(a.abr.or(a.tbr), b.abr.or(b.tbr))
                    .then_with(|| a.effective_size().cmp(&b.effective_size()))
            })
    }
}

fn single(f: &StreamFormat) -> StreamPick {
    StreamPick {
        stream_id: f.format_id.clone(),
        merge_with: None,
        height: f.height,
    }
}

/// Streams without a known height never satisfy a ceiling.
fn within(f: &StreamFormat, ceiling: Option<u32>) -> bool {
    match ceiling {
        None => true,
        Some(max) => f.height.map_or(false, |h| h <= max),
    }
}

fn ext_matches(f: &StreamFormat, ext: Option<&str>) -> bool {
    ext.map_or(true, |e| f.ext.eq_ignore_ascii_case(e))
}

fn rank_video(a: &StreamFormat, b: &StreamFormat) -> Ordering {
    a.height
        .cmp(&b.height)
        .then_with(|| cmp_f32(a.fps, b.fps))
        .then_with(|| cmp_f32(a.tbr, b.tbr))
        .then_with(|| a.effective_size().cmp(&b.effective_size()))
}

fn cmp_f32(a: Option<f32>, b: Option<f32>) -> Ordering {
    a.unwrap_or(0.0)
        .partial_cmp(&b.unwrap_or(0.0))
        .unwrap_or(Ordering::Equal)
}
