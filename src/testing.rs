// Test doubles for the extractor, credential acquirer and cookie storage

use std::collections::VecDeque;
use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::auth::browser::{AcquireError, CredentialAcquirer};
use crate::auth::cookies::{Cookie, CookieJar, CookieJarHandle, CookieStorage, CookieStore};
use crate::auth::session::{AuthSession, SessionManager, SessionStore};
use crate::config::CoreConfig;
use crate::downloader::errors::ErrorKind;
use crate::downloader::extractors::{
    DownloadSpec, ExtractionClient, Extractor, ExtractorFailure, ExtractorOptions, TransferHook,
};
use crate::downloader::models::{StreamFormat, TransferEvent, TransferProgress, VideoMetadata};

pub const VISITOR_TOKEN: &str = "CgtWaXNpdG9yRGF0YQ";

/// One scripted extractor response; calls past the end of the script succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Ok,
    Fail(ErrorKind),
}

pub fn big_jar() -> CookieJar {
    (0..6)
        .map(|i| {
            Cookie::normalized(
                "youtube.com",
                false,
                "/",
                true,
                1_799_665_392,
                &format!("COOKIE{}", i),
                "0123456789abcdef0123456789abcdef",
            )
        })
        .collect()
}

pub fn sample_metadata() -> VideoMetadata {
    let video = |id: &str, height: u32| StreamFormat {
        format_id: id.to_string(),
        ext: "mp4".to_string(),
        height: Some(height),
        vcodec: Some("avc1.4d401f".to_string()),
        acodec: Some("none".to_string()),
        video_only: true,
        ..Default::default()
    };
    VideoMetadata {
        id: "jNQXAC9IVRw".to_string(),
        title: "Me at the zoo".to_string(),
        author: "jawed".to_string(),
        duration_seconds: 19,
        thumbnail_url: None,
        formats: vec![
            video("137", 1080),
            video("136", 720),
            video("135", 480),
            StreamFormat {
                format_id: "140".to_string(),
                ext: "m4a".to_string(),
                vcodec: Some("none".to_string()),
                acodec: Some("mp4a.40.2".to_string()),
                abr: Some(129.5),
                audio_only: true,
                ..Default::default()
            },
        ],
    }
}

/// Plain best-video spec writing into `dir`.
pub fn spec_in(dir: &std::path::Path) -> DownloadSpec {
    DownloadSpec {
        selector: "bv*+ba/b".to_string(),
        audio: None,
        merge_container: Some("mp4".to_string()),
        output_dir: dir.to_path_buf(),
        output_template: "%(title)s.%(ext)s".to_string(),
    }
}

/// Shape of the simulated transfer.
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub chunks: u64,
    pub chunk_size: u64,
    pub total_known: bool,
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            chunks: 10,
            chunk_size: 100_000,
            total_known: true,
        }
    }
}

pub struct StubExtractor {
    script: Mutex<VecDeque<Scripted>>,
    pub calls: Mutex<Vec<ExtractorOptions>>,
    pub transfer: Mutex<Transfer>,
    delay: Duration,
}

impl StubExtractor {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            transfer: Mutex::new(Transfer::default()),
            delay: Duration::from_millis(10),
        }
    }

    fn next(&self, options: &ExtractorOptions) -> Result<(), ExtractorFailure> {
        self.calls.lock().unwrap().push(options.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Fail(kind)) => Err(ExtractorFailure::new(kind, format!("ERROR: scripted {}", kind))),
            Some(Scripted::Ok) | None => Ok(()),
        }
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn extract_info(
        &self,
        _url: &str,
        options: &ExtractorOptions,
    ) -> Result<VideoMetadata, ExtractorFailure> {
        let result = self.next(options);
        tokio::time::sleep(self.delay).await;
        result.map(|_| sample_metadata())
    }

    async fn download(
        &self,
        _url: &str,
        options: &ExtractorOptions,
        spec: &DownloadSpec,
        hook: &TransferHook,
    ) -> Result<PathBuf, ExtractorFailure> {
        self.next(options)?;
        let transfer = *self.transfer.lock().unwrap();

        let final_path = spec.output_dir.join("Me at the zoo.mp4");
        let part = spec.output_dir.join("Me at the zoo.mp4.part");
        std::fs::write(&part, b"")
            .map_err(|e| ExtractorFailure::new(ErrorKind::Unsupported, e.to_string()))?;

        let total = transfer.chunks * transfer.chunk_size;
        for i in 1..=transfer.chunks {
            let event = TransferEvent::Bytes(TransferProgress {
                downloaded_bytes: i * transfer.chunk_size,
                total_bytes: transfer.total_known.then_some(total),
                filename: Some(final_path.clone()),
            });
            if let ControlFlow::Break(()) = hook(&event) {
                // a killed process leaves its .part file behind
                return Err(ExtractorFailure::cancelled());
            }
            tokio::task::yield_now().await;
        }

        std::fs::rename(&part, &final_path)
            .map_err(|e| ExtractorFailure::new(ErrorKind::Unsupported, e.to_string()))?;
        Ok(final_path)
    }
}

#[derive(Default)]
pub struct StubAcquirer {
    pub calls: AtomicUsize,
    pub time_out: AtomicBool,
}

#[async_trait]
impl CredentialAcquirer for StubAcquirer {
    async fn acquire(&self) -> Result<AuthSession, AcquireError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.time_out.load(Ordering::SeqCst) {
            return Err(AcquireError::Timeout(300));
        }
        Ok(AuthSession::new(big_jar(), VISITOR_TOKEN))
    }
}

/// File-backed storage that counts invalidations.
pub struct CountingStorage {
    inner: CookieStore,
    pub clears: AtomicUsize,
}

impl CookieStorage for CountingStorage {
    fn load(&self) -> CookieJarHandle {
        self.inner.load()
    }

    fn clear(&self) -> io::Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear()
    }

    fn save(&self, jar: &CookieJar) -> io::Result<CookieJarHandle> {
        self.inner.save(jar)
    }

    fn is_likely_valid(&self, handle: &CookieJarHandle) -> bool {
        self.inner.is_likely_valid(handle)
    }
}

pub struct Harness {
    pub client: Arc<ExtractionClient>,
    pub extractor: Arc<StubExtractor>,
    pub acquirer: Arc<StubAcquirer>,
    pub storage: Arc<CountingStorage>,
    pub config: Arc<CoreConfig>,
    pub dir: TempDir,
}

/// Client wired to stubs, with millisecond backoff.
pub fn harness(script: Vec<Scripted>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = CoreConfig::with_data_dir(dir.path().join("data"));
    config.backoff_base_ms = 1;
    config.backoff_max_ms = 5;
    let config = Arc::new(config);

    let storage = Arc::new(CountingStorage {
        inner: CookieStore::new(config.cookie_file(), config.min_valid_jar_bytes),
        clears: AtomicUsize::new(0),
    });
    let acquirer = Arc::new(StubAcquirer::default());
    let extractor = Arc::new(StubExtractor::new(script));

    let cookies: Arc<dyn CookieStorage> = storage.clone();
    let credentials: Arc<dyn CredentialAcquirer> = acquirer.clone();
    let session = Arc::new(SessionManager::new(
        cookies,
        SessionStore::new(config.session_file()),
        credentials,
        config.min_valid_jar_bytes,
    ));
    let backend: Arc<dyn Extractor> = extractor.clone();
    let client = Arc::new(ExtractionClient::new(backend, session, Arc::clone(&config)));

    Harness {
        client,
        extractor,
        acquirer,
        storage,
        config,
        dir,
    }
}
