// yt-dlp CLI extractor
//
// Metadata comes from `--dump-json`; downloads stream machine-readable
// progress lines through `--progress-template` and report the final path
// with `--print after_move:`. `--print` implies quiet mode, which moves the
// progress lines to stderr, so both pipes feed the same parser.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::diagnostics::{classify, error_context};
use super::traits::{
    CookieSource, DownloadSpec, Extractor, ExtractorFailure, ExtractorOptions, TransferHook,
};
use crate::downloader::errors::ErrorKind;
use crate::downloader::models::{TransferEvent, TransferProgress, VideoMetadata};
use crate::downloader::utils::{browser_profile_exists, find_executable, run_output_with_timeout, ProcessError};

const PROGRESS_PREFIX: &str = "[progress]";
const POSTPROCESS_PREFIX: &str = "[postprocess]";
const FINAL_PREFIX: &str = "[final]";

const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.filename)s";
const POSTPROCESS_TEMPLATE: &str = "postprocess:[postprocess] %(progress.status)s %(progress.postprocessor)s";
const FINAL_TEMPLATE: &str = "after_move:[final] %(filepath)s";

lazy_static! {
    static ref MERGE_RE: Regex = Regex::new(r"^\[Merger?\]\s+Merging").unwrap();
    static ref EXTRACT_AUDIO_RE: Regex = Regex::new(r"^\[ExtractAudio\]\s+Destination:").unwrap();
}

pub struct YtDlpCli {
    ytdlp_path: String,
}

impl YtDlpCli {
    pub fn new(explicit_path: Option<&str>) -> Self {
        let ytdlp_path = find_executable("yt-dlp", explicit_path);
        debug!("Using yt-dlp at {}", ytdlp_path);
        Self { ytdlp_path }
    }

    pub fn path(&self) -> &str {
        &self.ytdlp_path
    }

    /// Arguments shared by metadata and download invocations.
    fn common_args(options: &ExtractorOptions) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-update".to_string(),
            "--socket-timeout".to_string(),
            options.socket_timeout_secs.to_string(),
            "--user-agent".to_string(),
            options.user_agent.clone(),
        ];

        for (name, value) in &options.headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }

        match &options.cookies {
            CookieSource::Jar(handle) => match handle.path() {
                Some(path) => {
                    args.push("--cookies".to_string());
                    args.push(path.to_string_lossy().to_string());
                }
                None => debug!("Session jar only in memory, sending no cookies"),
            },
            CookieSource::Browsers(browsers) => {
                match browsers.iter().find(|b| browser_profile_exists(b)) {
                    Some(browser) => {
                        args.push("--cookies-from-browser".to_string());
                        args.push(browser.clone());
                    }
                    None => debug!("No installed browser profile found for cookies"),
                }
            }
            CookieSource::None => {}
        }

        if let Some(token) = options.visitor_token.as_deref().filter(|t| !t.is_empty()) {
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:visitor_data={}", token));
        }

        args
    }

    fn info_args(url: &str, options: &ExtractorOptions) -> Vec<String> {
        let mut args = vec!["--dump-json".to_string(), "--skip-download".to_string()];
        args.extend(Self::common_args(options));
        args.push(url.to_string());
        args
    }

    fn download_args(url: &str, options: &ExtractorOptions, spec: &DownloadSpec) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            spec.selector.clone(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-simulate".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--progress-template".to_string(),
            POSTPROCESS_TEMPLATE.to_string(),
            "--print".to_string(),
            FINAL_TEMPLATE.to_string(),
            "-P".to_string(),
            spec.output_dir.to_string_lossy().to_string(),
            "-o".to_string(),
            spec.output_template.clone(),
        ];

        if let Some(container) = &spec.merge_container {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }

        if let Some(audio) = &spec.audio {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(audio.codec.as_str().to_string());
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", audio.bitrate_kbps));
        }

        args.extend(Self::common_args(options));
        args.push(url.to_string());
        args
    }
}

/// One parsed output line of a download run.
#[derive(Debug, PartialEq, Eq)]
enum OutputLine {
    Transfer(TransferEvent),
    Final(PathBuf),
}

fn parse_count(field: &str) -> Option<u64> {
    // yt-dlp prints "NA" for unknown fields and floats for estimates
    field.parse::<u64>().ok().or_else(|| {
        field
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
    })
}

fn parse_output_line(line: &str) -> Option<OutputLine> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        let mut fields = rest.trim_start().splitn(4, ' ');
        let downloaded_bytes = parse_count(fields.next()?)?;
        let total = fields.next().and_then(parse_count);
        let estimate = fields.next().and_then(parse_count);
        let filename = fields
            .next()
            .map(str::trim)
            .filter(|f| !f.is_empty() && *f != "NA")
            .map(PathBuf::from);
        return Some(OutputLine::Transfer(TransferEvent::Bytes(TransferProgress {
            downloaded_bytes,
            total_bytes: total.or(estimate).filter(|t| *t > 0),
            filename,
        })));
    }
    if let Some(rest) = line.strip_prefix(POSTPROCESS_PREFIX) {
        let mut fields = rest.split_whitespace();
        if fields.next() != Some("started") {
            return None;
        }
        let message = match fields.next()? {
            "Merger" => "Merging video and audio",
            "ExtractAudio" => "Converting audio",
            _ => return None,
        };
        return Some(OutputLine::Transfer(TransferEvent::Postprocessing(message.to_string())));
    }
    if let Some(rest) = line.strip_prefix(FINAL_PREFIX) {
        let path = rest.trim();
        return (!path.is_empty()).then(|| OutputLine::Final(PathBuf::from(path)));
    }
    if MERGE_RE.is_match(line) {
        return Some(OutputLine::Transfer(TransferEvent::Postprocessing(
            "Merging video and audio".to_string(),
        )));
    }
    if EXTRACT_AUDIO_RE.is_match(line) {
        return Some(OutputLine::Transfer(TransferEvent::Postprocessing(
            "Converting audio".to_string(),
        )));
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Forward every line of `pipe` to `tx`, decoded lossily. Progress lines
/// aside, stderr text is also collected for failure classification. Keeps
/// reading after the receiver is gone so the child never blocks on a full
/// pipe.
async fn pump_lines<R>(pipe: R, source: Pipe, tx: mpsc::UnboundedSender<(Pipe, String)>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(pipe).split(b'\n');
    let mut collected = String::new();
    loop {
        let bytes = match segments.next_segment().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed reading yt-dlp {:?}: {}", source, e);
                break;
            }
        };
        let line = String::from_utf8_lossy(&bytes);
        let line = line.trim_end_matches('\r');
        if source == Pipe::Stderr && !line.starts_with(PROGRESS_PREFIX) {
            collected.push_str(line);
            collected.push('\n');
        }
        let _ = tx.send((source, line.to_string()));
    }
    collected
}

fn failure_from_stderr(stderr: &str) -> ExtractorFailure {
    ExtractorFailure::new(classify(stderr), error_context(stderr))
}

fn failure_from_process(e: ProcessError) -> ExtractorFailure {
    match e {
        ProcessError::Timeout(_) => ExtractorFailure::new(ErrorKind::NetworkTransient, e.to_string()),
        ProcessError::Spawn { .. } | ProcessError::Io(_) => {
            ExtractorFailure::new(ErrorKind::Unsupported, e.to_string())
        }
    }
}

#[async_trait]
impl Extractor for YtDlpCli {
    fn name(&self) -> &'static str {
        "cli-yt-dlp"
    }

    async fn extract_info(
        &self,
        url: &str,
        options: &ExtractorOptions,
    ) -> Result<VideoMetadata, ExtractorFailure> {
        let args = Self::info_args(url, options);
        debug!(
            profile = %options.profile,
            cookies = options.cookies.label(),
            "Running {} --dump-json",
            self.ytdlp_path
        );

        let output = run_output_with_timeout(&self.ytdlp_path, &args, options.timeout)
            .await
            .map_err(failure_from_process)?;

        if !output.status.success() {
            return Err(failure_from_stderr(&String::from_utf8_lossy(&output.stderr)));
        }

        VideoMetadata::from_info_json(&output.stdout).map_err(|e| {
            ExtractorFailure::new(ErrorKind::Unsupported, format!("Invalid metadata JSON: {}", e))
        })
    }

    async fn download(
        &self,
        url: &str,
        options: &ExtractorOptions,
        spec: &DownloadSpec,
        hook: &TransferHook,
    ) -> Result<PathBuf, ExtractorFailure> {
        let args = Self::download_args(url, options, spec);
        info!(profile = %options.profile, selector = %spec.selector, "Starting yt-dlp download");

        let mut child = TokioCommand::new(&self.ytdlp_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExtractorFailure::new(ErrorKind::Unsupported, format!("Failed to start yt-dlp: {}", e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorFailure::new(ErrorKind::Unsupported, "Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractorFailure::new(ErrorKind::Unsupported, "Failed to capture stderr"))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(pump_lines(stdout, Pipe::Stdout, tx.clone()));
        let stderr_task = tokio::spawn(pump_lines(stderr, Pipe::Stderr, tx));

        let mut final_path = None;
        let mut last_file = None;

        // ends once both pipes hit EOF
        while let Some((source, line)) = rx.recv().await {
            match parse_output_line(&line) {
                Some(OutputLine::Transfer(event)) => {
                    if let TransferEvent::Bytes(progress) = &event {
                        if progress.filename.is_some() {
                            last_file = progress.filename.clone();
                        }
                    }
                    if let ControlFlow::Break(()) = hook(&event) {
                        info!("Download aborted, stopping yt-dlp");
                        let _ = child.kill().await;
                        stdout_task.abort();
                        stderr_task.abort();
                        return Err(ExtractorFailure::cancelled());
                    }
                }
                Some(OutputLine::Final(path)) => final_path = Some(path),
                None => {
                    if source == Pipe::Stderr || line.starts_with("[download]") {
                        debug!("[yt-dlp] {}", line);
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| {
            ExtractorFailure::new(ErrorKind::Unsupported, format!("Process error: {}", e))
        })?;
        let _ = stdout_task.await;
        let stderr_output = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(failure_from_stderr(&stderr_output));
        }

        final_path.or(last_file).ok_or_else(|| {
            ExtractorFailure::new(ErrorKind::Unsupported, "yt-dlp did not report an output file")
        })
    }
}
