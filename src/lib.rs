pub mod auth;
pub mod config;
pub mod downloader;
pub mod logging;
pub mod paths;
pub mod settings;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use auth::{BrowserLogin, ChromeLauncher, CookieStorage, CookieStore, CredentialAcquirer, LoginSettings};
use auth::{SessionManager, SessionStore, SessionView};
use config::CoreConfig;
use downloader::{
    DownloadError, DownloadHandle, DownloadJob, DownloadOptions, DownloadOrchestrator,
    ExtractionClient, ExtractionRequest, Extractor, MediaKind, ProgressSink, YtDlpCli,
};
use settings::{Settings, SettingsError};

/// Everything a front end needs, wired once and shared.
pub struct Core {
    config: Arc<CoreConfig>,
    settings: Arc<Settings>,
    session: Arc<SessionManager>,
    orchestrator: DownloadOrchestrator,
}

impl Core {
    /// Open the core on `data_dir` (the per-user data directory when `None`)
    /// with yt-dlp as extractor and Chrome for interactive login.
    pub fn open(data_dir: Option<PathBuf>) -> Result<Self, SettingsError> {
        let dir = data_dir.unwrap_or_else(paths::default_data_dir);
        let settings = Settings::in_dir(&dir)?;
        let mut config = settings.core_config()?;
        if let Some(kbps) = settings.preferences().audio_bitrate_kbps() {
            config.audio_bitrate_kbps = kbps;
        }

        let extractor: Arc<dyn Extractor> = Arc::new(YtDlpCli::new(config.ytdlp_path.as_deref()));
        let acquirer: Arc<dyn CredentialAcquirer> = Arc::new(BrowserLogin::new(
            ChromeLauncher::from_config(&config),
            LoginSettings::from_config(&config),
        ));
        info!("Core opened on {}", config.data_dir.display());
        Ok(Self::with_parts(config, settings, extractor, acquirer))
    }

    /// Assemble from explicit parts.
    pub fn with_parts(
        config: CoreConfig,
        settings: Settings,
        extractor: Arc<dyn Extractor>,
        acquirer: Arc<dyn CredentialAcquirer>,
    ) -> Self {
        let config = Arc::new(config);
        let cookies: Arc<dyn CookieStorage> =
            Arc::new(CookieStore::new(config.cookie_file(), config.min_valid_jar_bytes));
        let session = Arc::new(SessionManager::new(
            cookies,
            SessionStore::new(config.session_file()),
            acquirer,
            config.min_valid_jar_bytes,
        ));
        let client = Arc::new(ExtractionClient::new(extractor, Arc::clone(&session), Arc::clone(&config)));
        Self {
            config,
            settings: Arc::new(settings),
            session,
            orchestrator: DownloadOrchestrator::new(client),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn client(&self) -> &Arc<ExtractionClient> {
        self.orchestrator.client()
    }

    /// Start a download. Quality and output directory fall back to the saved
    /// preferences.
    pub fn download(
        &self,
        url: &str,
        format: MediaKind,
        quality: Option<&str>,
        output_dir: Option<PathBuf>,
        sink: Arc<dyn ProgressSink>,
    ) -> DownloadHandle {
        let prefs = self.settings.preferences();
        let quality = quality.map(str::to_string).unwrap_or_else(|| prefs.video_quality.clone());
        let request = ExtractionRequest::new(url, format, quality);
        let options = DownloadOptions {
            output_dir: output_dir.unwrap_or_else(|| prefs.output_directory.clone()),
            audio_codec: prefs.audio_codec(),
        };
        self.orchestrator.start(DownloadJob::new(request, options, sink))
    }

    /// Run the interactive login now, replacing whatever session exists.
    pub async fn login(&self) -> Result<SessionView, DownloadError> {
        let observed = self.session.current().await.generation;
        self.session.refresh(observed).await
    }

    /// Forget the stored cookies and visitor token.
    pub async fn clear_session(&self) -> Result<(), DownloadError> {
        self.session.invalidate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{DownloadEvent, ErrorKind};
    use crate::testing::{Scripted, StubAcquirer, StubExtractor, VISITOR_TOKEN};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn core(dir: &TempDir, script: Vec<Scripted>) -> (Core, Arc<StubExtractor>, Arc<StubAcquirer>) {
        let settings = Settings::in_dir(dir.path()).unwrap();
        let mut config = settings.core_config().unwrap();
        config.backoff_base_ms = 1;
        config.backoff_max_ms = 2;
        let extractor = Arc::new(StubExtractor::new(script));
        let acquirer = Arc::new(StubAcquirer::default());
        let core = Core::with_parts(config, settings, extractor.clone(), acquirer.clone());
        (core, extractor, acquirer)
    }

    #[tokio::test]
    async fn download_uses_saved_preferences() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let (core, extractor, _) = core(&dir, vec![]);
        core.settings()
            .set(settings::OUTPUT_DIRECTORY, out.to_string_lossy().to_string())
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let terminal = core
            .download("https://youtu.be/jNQXAC9IVRw", MediaKind::Video, None, None, Arc::new(tx))
            .join()
            .await;

        assert_eq!(
            terminal,
            DownloadEvent::Completed {
                file_path: out.join("Me at the zoo.mp4")
            }
        );
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(terminal));
        assert_eq!(extractor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bot_detection_triggers_one_login() {
        let dir = TempDir::new().unwrap();
        let (core, _, acquirer) = core(&dir, vec![Scripted::Fail(ErrorKind::BotDetected)]);

        let request = ExtractionRequest::new("https://youtu.be/jNQXAC9IVRw", MediaKind::Video, "720p");
        let metadata = core.client().resolve(&request).await.unwrap();
        assert_eq!(metadata.title, "Me at the zoo");
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
        assert!(core.config().session_file().is_file());
    }

    #[tokio::test]
    async fn login_then_clear() {
        let dir = TempDir::new().unwrap();
        let (core, _, acquirer) = core(&dir, vec![]);

        let view = core.login().await.unwrap();
        assert!(view.is_authenticated());
        assert_eq!(view.visitor_token.as_deref(), Some(VISITOR_TOKEN));
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);

        core.clear_session().await.unwrap();
        let view = core.session().current().await;
        assert!(!view.is_authenticated());
        assert!(!view.cookies_likely_valid);
        assert!(!core.config().session_file().exists());
    }

    #[tokio::test]
    async fn login_timeout_surfaces_kind() {
        let dir = TempDir::new().unwrap();
        let (core, _, acquirer) = core(&dir, vec![]);
        acquirer.time_out.store(true, Ordering::SeqCst);

        let err = core.login().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AcquisitionTimeout);
    }
}
