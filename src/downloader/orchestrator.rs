// DownloadOrchestrator - one worker task per download
//
// resolve -> pick streams -> download through the retry cascade, relaying
// progress to the job's sink. Cancellation is checked on every transfer
// event; a cancelled job removes whatever it wrote.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::errors::{DownloadError, ErrorKind};
use super::extractors::{ExtractionClient, TransferHook};
use super::format_selector::FormatSelector;
use super::models::{AudioCodec, DownloadEvent, ExtractionRequest, MediaKind, TransferEvent};
use super::traits::ProgressSink;
use super::utils::{ensure_output_dir, remove_partial_files};

/// Where and how a job writes its output.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub output_dir: PathBuf,
    pub audio_codec: AudioCodec,
}

/// One user-initiated download.
pub struct DownloadJob {
    request: ExtractionRequest,
    options: DownloadOptions,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl DownloadJob {
    pub fn new(request: ExtractionRequest, options: DownloadOptions, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            request,
            options,
            cancel: CancellationToken::new(),
            sink,
        }
    }

    /// Use an externally owned token, e.g. one shared with the sink.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn request(&self) -> &ExtractionRequest {
        &self.request
    }
}

/// Handle to a running job.
pub struct DownloadHandle {
    cancel: CancellationToken,
    task: JoinHandle<DownloadEvent>,
}

impl DownloadHandle {
    /// Ask the worker to stop. The job ends with `Cancelled` unless it
    /// already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal event (also delivered to the sink).
    pub async fn join(self) -> DownloadEvent {
        match self.task.await {
            Ok(event) => event,
            Err(e) => {
                error!("Download worker failed: {}", e);
                DownloadEvent::Failed {
                    kind: ErrorKind::ExtractionFatal,
                    message: format!("Download worker stopped unexpectedly: {}", e),
                }
            }
        }
    }
}

pub struct DownloadOrchestrator {
    client: Arc<ExtractionClient>,
}

impl DownloadOrchestrator {
    pub fn new(client: Arc<ExtractionClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ExtractionClient> {
        &self.client
    }

    /// Spawn the job on its own task and return immediately.
    pub fn start(&self, job: DownloadJob) -> DownloadHandle {
        let cancel = job.cancel.clone();
        let client = Arc::clone(&self.client);
        let task = tokio::spawn(async move {
            let sink = Arc::clone(&job.sink);
            let event = run_job(&client, job).await;
            sink.emit(event.clone());
            event
        });
        DownloadHandle { cancel, task }
    }
}

async fn run_job(client: &ExtractionClient, job: DownloadJob) -> DownloadEvent {
    let url = job.request.url().to_string();
    match execute(client, &job).await {
        Ok(path) => {
            info!("Download finished: {}", path.display());
            DownloadEvent::Completed { file_path: path }
        }
        Err(e) if e.kind == ErrorKind::Cancelled => {
            info!("Download cancelled: {}", url);
            DownloadEvent::Cancelled
        }
        Err(e) => {
            warn!("Download failed ({}): {}", e.kind, url);
            e.into()
        }
    }
}

async fn execute(client: &ExtractionClient, job: &DownloadJob) -> Result<PathBuf, DownloadError> {
    let request = &job.request;
    request.validate_url()?;
    let quality = request.quality()?;

    let dir = job.options.output_dir.clone();
    let output_dir = tokio::task::spawn_blocking(move || ensure_output_dir(&dir))
        .await
        .map_err(|e| DownloadError::new(ErrorKind::Storage, format!("Output directory check failed: {}", e)))?
        .map_err(|e| {
            DownloadError::io(
                &format!("Output directory {} is not usable", job.options.output_dir.display()),
                e,
            )
        })?;

    if job.cancel.is_cancelled() {
        return Err(DownloadError::cancelled());
    }
    job.sink.emit(DownloadEvent::Progress {
        percent: 0.0,
        message: "Fetching video information".to_string(),
    });

    let (metadata, position) = client.resolve_resumable(request).await?;
    if job.cancel.is_cancelled() {
        return Err(DownloadError::cancelled());
    }

    let pick = FormatSelector::pick(&metadata.formats, request.format(), quality);
    if pick.is_none() && !metadata.formats.is_empty() {
        let label = match request.format() {
            MediaKind::Audio => "audio",
            MediaKind::Video => request.quality_label(),
        };
        return Err(DownloadError::format_unavailable(label));
    }
    let transfers = pick.as_ref().map_or(1, |p| p.transfer_count());
    let label = pick.as_ref().map(|p| p.label()).unwrap_or_else(|| quality.to_string());
    info!("Downloading '{}' as {} [{}]", metadata.title, request.format(), label);

    job.sink.emit(DownloadEvent::Progress {
        percent: 0.0,
        message: format!("Downloading {}", metadata.title),
    });

    let spec = FormatSelector::plan(
        request.format(),
        quality,
        job.options.audio_codec,
        client.config().audio_bitrate_kbps,
        output_dir,
    );

    let tracker = Arc::new(Mutex::new(ProgressTracker::new(transfers)));
    let hook: Arc<TransferHook> = {
        let tracker = Arc::clone(&tracker);
        let cancel = job.cancel.clone();
        let sink = Arc::clone(&job.sink);
        Arc::new(move |event: &TransferEvent| {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            let update = lock(&tracker).observe(event);
            if let Some(update) = update {
                sink.emit(update);
            }
            ControlFlow::Continue(())
        })
    };

    match client.download(request, &spec, hook, position).await {
        Ok(path) => {
            let last = lock(&tracker).finish();
            if let Some(last) = last {
                job.sink.emit(last);
            }
            Ok(path)
        }
        Err(e) if e.kind == ErrorKind::Cancelled || job.cancel.is_cancelled() => {
            let files = lock(&tracker).files.clone();
            let removed = tokio::task::spawn_blocking(move || {
                files.iter().map(|f| remove_partial_files(f)).sum::<usize>()
            })
            .await
            .unwrap_or(0);
            info!("Removed {} partial file(s)", removed);
            Err(DownloadError::cancelled())
        }
        Err(e) => Err(e),
    }
}

fn lock(tracker: &Mutex<ProgressTracker>) -> std::sync::MutexGuard<'_, ProgressTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns per-stream byte counters into one overall, non-decreasing percentage.
#[derive(Debug)]
struct ProgressTracker {
    transfers: u32,
    completed: u32,
    current: Option<PathBuf>,
    last_percent: Option<f32>,
    /// Every file the extractor reported writing
    files: Vec<PathBuf>,
}

impl ProgressTracker {
    fn new(transfers: u32) -> Self {
        Self {
            transfers: transfers.max(1),
            completed: 0,
            current: None,
            last_percent: None,
            files: Vec::new(),
        }
    }

    fn observe(&mut self, event: &TransferEvent) -> Option<DownloadEvent> {
        match event {
            TransferEvent::Bytes(progress) => {
                if let Some(name) = &progress.filename {
                    if self.current.as_ref() != Some(name) {
                        if self.current.is_some() {
                            self.completed += 1;
                        }
                        self.current = Some(name.clone());
                        if !self.files.contains(name) {
                            self.files.push(name.clone());
                        }
                    }
                }

                // unknown size: say nothing rather than something wrong
                let total = progress.total_bytes.filter(|t| *t > 0)?;
                let fraction = (progress.downloaded_bytes as f64 / total as f64).clamp(0.0, 1.0);
                let stage = self.completed.min(self.transfers - 1) as f64;
                let percent = ((stage + fraction) / self.transfers as f64 * 100.0).clamp(0.0, 100.0) as f32;

                if self.last_percent.map_or(false, |last| percent <= last) {
                    return None;
                }
                self.last_percent = Some(percent);
                Some(DownloadEvent::Progress {
                    percent,
                    message: format!("Downloading... {:.1}%", percent),
                })
            }
            TransferEvent::Postprocessing(message) => Some(DownloadEvent::Progress {
                percent: self.last_percent.unwrap_or(0.0),
                message: message.clone(),
            }),
        }
    }

    /// Final 100% event, unless one was already sent.
    fn finish(&mut self) -> Option<DownloadEvent> {
        if self.last_percent == Some(100.0) {
            return None;
        }
        self.last_percent = Some(100.0);
        Some(DownloadEvent::Progress {
            percent: 100.0,
            message: "Download complete".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::extractors::CookieSource;
    use crate::downloader::models::TransferProgress;
    use crate::downloader::traits::CallbackSink;
    use crate::testing::{harness, Scripted, Transfer, VISITOR_TOKEN};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn recorder() -> (Arc<StdMutex<Vec<DownloadEvent>>>, Arc<dyn ProgressSink>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = {
            let events = Arc::clone(&events);
            CallbackSink(move |e| events.lock().unwrap().push(e))
        };
        (events, Arc::new(sink))
    }

    fn percents(events: &[DownloadEvent]) -> Vec<f32> {
        events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    fn audio_job(out: &TempDir, sink: Arc<dyn ProgressSink>) -> DownloadJob {
        DownloadJob::new(
            ExtractionRequest::new("https://youtu.be/jNQXAC9IVRw", MediaKind::Audio, "Highest"),
            DownloadOptions {
                output_dir: out.path().to_path_buf(),
                audio_codec: AudioCodec::Mp3,
            },
            sink,
        )
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_100() {
        let h = harness(vec![]);
        let out = TempDir::new().unwrap();
        let (events, sink) = recorder();

        let orchestrator = DownloadOrchestrator::new(Arc::clone(&h.client));
        let terminal = orchestrator.start(audio_job(&out, sink)).join().await;

        let expected = out.path().join("Me at the zoo.mp4");
        assert_eq!(terminal, DownloadEvent::Completed { file_path: expected.clone() });
        assert!(expected.is_file());

        let events = events.lock().unwrap();
        let seq = percents(&events);
        assert!(seq.windows(2).all(|w| w[0] <= w[1]), "not monotonic: {:?}", seq);
        assert_eq!(seq.last().copied(), Some(100.0));
        assert_eq!(seq.iter().filter(|p| **p > 0.0).count(), 10);
        assert_eq!(events.last(), Some(&terminal));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn cancel_after_fourth_chunk_leaves_nothing_behind() {
        let h = harness(vec![]);
        let out = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink: Arc<dyn ProgressSink> = {
            let events = Arc::clone(&events);
            let token = token.clone();
            Arc::new(CallbackSink(move |e: DownloadEvent| {
                if let DownloadEvent::Progress { percent, .. } = &e {
                    if *percent >= 40.0 {
                        token.cancel();
                    }
                }
                events.lock().unwrap().push(e);
            }))
        };

        let orchestrator = DownloadOrchestrator::new(Arc::clone(&h.client));
        let handle = orchestrator.start(audio_job(&out, sink).with_cancellation(token));
        let terminal = handle.join().await;

        assert_eq!(terminal, DownloadEvent::Cancelled);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);

        let seq = percents(&events.lock().unwrap());
        assert_eq!(seq.iter().copied().fold(0.0f32, f32::max), 40.0);
        assert!(!events.lock().unwrap().iter().any(|e| matches!(e, DownloadEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn unknown_total_emits_no_intermediate_progress() {
        let h = harness(vec![]);
        *h.extractor.transfer.lock().unwrap() = Transfer {
            total_known: false,
            ..Transfer::default()
        };
        let out = TempDir::new().unwrap();
        let (events, sink) = recorder();

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client))
            .start(audio_job(&out, sink))
            .join()
            .await;
        assert!(matches!(terminal, DownloadEvent::Completed { .. }));
        let seq = percents(&events.lock().unwrap());
        assert!(seq.iter().all(|p| *p == 0.0 || *p == 100.0), "{:?}", seq);
    }

    #[tokio::test]
    async fn bad_quality_fails_before_extraction() {
        let h = harness(vec![]);
        let out = TempDir::new().unwrap();
        let (_, sink) = recorder();
        let job = DownloadJob::new(
            ExtractionRequest::new("https://youtu.be/jNQXAC9IVRw", MediaKind::Video, "ultra"),
            DownloadOptions {
                output_dir: out.path().to_path_buf(),
                audio_codec: AudioCodec::Mp3,
            },
            sink,
        );

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client)).start(job).join().await;
        match terminal {
            DownloadEvent::Failed { kind, message } => {
                assert_eq!(kind, ErrorKind::FormatUnavailable);
                assert!(message.contains("ultra"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.extractor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unusable_output_dir_fails() {
        let h = harness(vec![]);
        let out = TempDir::new().unwrap();
        let blocker = out.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let (_, sink) = recorder();
        let job = DownloadJob::new(
            ExtractionRequest::new("https://youtu.be/jNQXAC9IVRw", MediaKind::Audio, ""),
            DownloadOptions {
                output_dir: blocker,
                audio_codec: AudioCodec::Mp3,
            },
            sink,
        );

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client)).start(job).join().await;
        assert!(matches!(terminal, DownloadEvent::Failed { kind: ErrorKind::Storage, .. }));
        assert!(h.extractor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbage_url_fails_without_extraction() {
        let h = harness(vec![]);
        let out = TempDir::new().unwrap();
        let (_, sink) = recorder();
        let job = DownloadJob::new(
            ExtractionRequest::new("https://youtu.be/x", MediaKind::Audio, ""),
            DownloadOptions {
                output_dir: out.path().to_path_buf(),
                audio_codec: AudioCodec::Mp3,
            },
            sink,
        );

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client)).start(job).join().await;
        assert!(matches!(terminal, DownloadEvent::Failed { kind: ErrorKind::InvalidUrl, .. }));
        assert!(h.extractor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_job_logs_in_at_most_once() {
        // lookup needs a fresh session and then mobile; the transfer is flagged again
        let h = harness(vec![
            Scripted::Fail(ErrorKind::BotDetected),
            Scripted::Fail(ErrorKind::BotDetected),
            Scripted::Ok,
            Scripted::Fail(ErrorKind::BotDetected),
        ]);
        let out = TempDir::new().unwrap();
        let (_, sink) = recorder();

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client))
            .start(audio_job(&out, sink))
            .join()
            .await;
        assert!(matches!(terminal, DownloadEvent::Failed { kind: ErrorKind::ExtractionFatal, .. }));
        assert_eq!(h.acquirer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.storage.clears.load(Ordering::SeqCst), 1);
        assert_eq!(h.extractor.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn transfer_keeps_identity_won_during_lookup() {
        let h = harness(vec![Scripted::Fail(ErrorKind::BotDetected), Scripted::Ok, Scripted::Ok]);
        let out = TempDir::new().unwrap();
        let (_, sink) = recorder();

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client))
            .start(audio_job(&out, sink))
            .join()
            .await;
        assert!(matches!(terminal, DownloadEvent::Completed { .. }));
        assert_eq!(h.acquirer.calls.load(Ordering::SeqCst), 1);

        let calls = h.extractor.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[2].cookies, CookieSource::Jar(_)));
        assert_eq!(calls[2].visitor_token.as_deref(), Some(VISITOR_TOKEN));
    }

    #[tokio::test]
    async fn extraction_failure_is_reported_with_kind() {
        let h = harness(vec![Scripted::Fail(ErrorKind::NotFound); 3]);
        let out = TempDir::new().unwrap();
        let (_, sink) = recorder();

        let terminal = DownloadOrchestrator::new(Arc::clone(&h.client))
            .start(audio_job(&out, sink))
            .join()
            .await;
        assert!(matches!(terminal, DownloadEvent::Failed { kind: ErrorKind::NotFound, .. }));
    }

    #[test]
    fn split_streams_share_the_scale() {
        let mut tracker = ProgressTracker::new(2);
        let bytes = |name: &str, done: u64| {
            TransferEvent::Bytes(TransferProgress {
                downloaded_bytes: done,
                total_bytes: Some(100),
                filename: Some(PathBuf::from(name)),
            })
        };

        let pct = |e: Option<DownloadEvent>| match e {
            Some(DownloadEvent::Progress { percent, .. }) => percent,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(pct(tracker.observe(&bytes("v.f136.mp4", 100))), 50.0);
        assert_eq!(pct(tracker.observe(&bytes("v.f140.m4a", 50))), 75.0);
        // a restarted transfer never moves the bar backwards
        assert!(tracker.observe(&bytes("v.f140.m4a", 10)).is_none());
        assert_eq!(tracker.files.len(), 2);
        assert_eq!(pct(tracker.finish()), 100.0);
        assert!(tracker.finish().is_none());
    }
}
