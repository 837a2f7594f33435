// ExtractionClient - bounded retry cascade around the extractor
//
// Strategy, at most `max_attempts` tries, strictly sequential:
// 1. Desktop user agent with the stored session (or browser-profile cookies)
// 2. Auth/bot failure: invalidate, re-acquire, desktop again with the fresh session
// 3. Same class again: mobile user agent
// Network/not-found/unsupported failures keep the identity and back off instead.
// A job's download continues from the identity its metadata lookup ended on,
// so one job triggers at most one re-acquisition.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::traits::{
    AttemptOutcome, CookieSource, DownloadSpec, ExtractionAttempt, Extractor, ExtractorFailure,
    ExtractorOptions, TransferHook, UserAgentProfile,
};
use crate::auth::session::{SessionManager, SessionView};
use crate::config::CoreConfig;
use crate::downloader::errors::{DownloadError, ErrorKind};
use crate::downloader::models::{ExtractionRequest, MediaKind, VideoMetadata};

/// Headers every attempt sends next to the user agent.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    ),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("Upgrade-Insecure-Requests", "1"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Identity {
    #[default]
    Initial,
    Refreshed,
    Mobile,
}

/// Where a finished cascade left off. Hand it to
/// [`ExtractionClient::download`] to keep rotating from there instead of
/// starting over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadePosition(Identity);

impl CascadePosition {
    /// The session has already been re-acquired once on this path.
    pub fn has_refreshed(&self) -> bool {
        self.0 != Identity::Initial
    }

    pub fn profile(&self) -> UserAgentProfile {
        match self.0 {
            Identity::Initial | Identity::Refreshed => UserAgentProfile::Desktop,
            Identity::Mobile => UserAgentProfile::Mobile,
        }
    }
}

struct Run<T> {
    result: Result<T, DownloadError>,
    attempts: Vec<ExtractionAttempt>,
    position: CascadePosition,
}

enum Next {
    Rotate,
    Backoff(Duration),
    Stop(DownloadError),
}

/// Resolves requests through the extractor, recovering from auth and bot
/// failures by rotating identity. Construct once and share.
pub struct ExtractionClient {
    extractor: Arc<dyn Extractor>,
    session: Arc<SessionManager>,
    config: Arc<CoreConfig>,
}

impl ExtractionClient {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        session: Arc<SessionManager>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            extractor,
            session,
            config,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Resolve a request into normalized metadata.
    pub async fn resolve(&self, request: &ExtractionRequest) -> Result<VideoMetadata, DownloadError> {
        self.resolve_traced(request).await.0
    }

    /// Like [`resolve`](Self::resolve), also returning every attempt made.
    pub async fn resolve_traced(
        &self,
        request: &ExtractionRequest,
    ) -> (Result<VideoMetadata, DownloadError>, Vec<ExtractionAttempt>) {
        let run = self.lookup(request).await;
        (run.result, run.attempts)
    }

    /// Resolve and report where the cascade stopped, for a download that
    /// should pick up from the same identity.
    pub async fn resolve_resumable(
        &self,
        request: &ExtractionRequest,
    ) -> Result<(VideoMetadata, CascadePosition), DownloadError> {
        let run = self.lookup(request).await;
        run.result.map(|meta| (meta, run.position))
    }

    async fn lookup(&self, request: &ExtractionRequest) -> Run<VideoMetadata> {
        let extractor = Arc::clone(&self.extractor);
        let url = request.url().to_string();
        self.cascade(request, CascadePosition::default(), move |options| {
            let extractor = Arc::clone(&extractor);
            let url = url.clone();
            async move { extractor.extract_info(&url, &options).await }
        })
        .await
    }

    /// Download through the same cascade, starting at `from`. A `Break` from
    /// `hook` ends the cascade with `Cancelled`.
    pub async fn download(
        &self,
        request: &ExtractionRequest,
        spec: &DownloadSpec,
        hook: Arc<TransferHook>,
        from: CascadePosition,
    ) -> Result<PathBuf, DownloadError> {
        let extractor = Arc::clone(&self.extractor);
        let url = request.url().to_string();
        let spec = spec.clone();
        self.cascade(request, from, move |options| {
            let extractor = Arc::clone(&extractor);
            let url = url.clone();
            let spec = spec.clone();
            let hook = Arc::clone(&hook);
            async move { extractor.download(&url, &options, &spec, &*hook).await }
        })
        .await
        .result
    }

    async fn cascade<T, F, Fut>(&self, request: &ExtractionRequest, from: CascadePosition, mut op: F) -> Run<T>
    where
        F: FnMut(ExtractorOptions) -> Fut,
        Fut: Future<Output = Result<T, ExtractorFailure>>,
    {
        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        let mut identity = from.0;
        if let Err(err) = request.validate_url() {
            warn!("Refusing to extract {}", request.url());
            return Run {
                result: Err(err),
                attempts,
                position: CascadePosition(identity),
            };
        }

        let max_attempts = self.config.max_attempts.max(1) as usize;
        let mut transient_retries = 0u32;
        let mut view = self.session.current().await;

        loop {
            let options = self.options_for(identity, &view);
            let profile = options.profile;
            let cookies = options.cookies.label();
            info!(
                attempt = attempts.len() + 1,
                profile = %profile,
                cookies,
                generation = view.generation,
                "[{}] Extraction attempt",
                self.extractor.name()
            );

            let failure = match op(options).await {
                Ok(value) => {
                    attempts.push(ExtractionAttempt {
                        profile,
                        session_generation: view.generation,
                        cookies,
                        outcome: AttemptOutcome::Success,
                    });
                    return Run {
                        result: Ok(value),
                        attempts,
                        position: CascadePosition(identity),
                    };
                }
                Err(failure) => failure,
            };

            let kind = failure.kind;
            let exhausted = attempts.len() + 1 >= max_attempts;
            let next = if kind.is_identity_failure() {
                if exhausted || identity == Identity::Mobile {
                    Next::Stop(DownloadError::with_detail(ErrorKind::ExtractionFatal, &failure.detail))
                } else {
                    Next::Rotate
                }
            } else if kind.is_simple_retryable() {
                if exhausted || transient_retries >= self.config.transient_retries {
                    Next::Stop(DownloadError::with_detail(kind, &failure.detail))
                } else {
                    transient_retries += 1;
                    Next::Backoff(self.config.backoff(transient_retries))
                }
            } else {
                Next::Stop(surface(kind, &failure, request))
            };

            attempts.push(ExtractionAttempt {
                profile,
                session_generation: view.generation,
                cookies,
                outcome: match next {
                    Next::Stop(_) => AttemptOutcome::Fatal(kind),
                    _ => AttemptOutcome::Retryable(kind),
                },
            });

            match next {
                Next::Stop(err) => {
                    warn!("Giving up after {} attempt(s): {}", attempts.len(), kind);
                    return Run {
                        result: Err(err),
                        attempts,
                        position: CascadePosition(identity),
                    };
                }
                Next::Backoff(delay) => {
                    warn!("{} failure, retrying in {:?}", kind, delay);
                    tokio::time::sleep(delay).await;
                }
                Next::Rotate => {
                    identity = match identity {
                        Identity::Initial => {
                            warn!("{} with current session, re-acquiring credentials", kind);
                            match self.session.refresh(view.generation).await {
                                Ok(fresh) => view = fresh,
                                Err(e) if e.kind == ErrorKind::AcquisitionTimeout => {
                                    return Run {
                                        result: Err(e),
                                        attempts,
                                        position: CascadePosition(Identity::Refreshed),
                                    };
                                }
                                Err(e) => {
                                    warn!("Continuing without a fresh session: {}", e);
                                    view = self.session.current().await;
                                }
                            }
                            Identity::Refreshed
                        }
                        Identity::Refreshed | Identity::Mobile => {
                            warn!("{} again, switching to mobile user agent", kind);
                            Identity::Mobile
                        }
                    };
                }
            }
        }
    }

    fn options_for(&self, identity: Identity, view: &SessionView) -> ExtractorOptions {
        let (profile, user_agent) = match identity {
            Identity::Initial | Identity::Refreshed => {
                (UserAgentProfile::Desktop, self.config.desktop_user_agent.clone())
            }
            Identity::Mobile => (UserAgentProfile::Mobile, self.config.mobile_user_agent.clone()),
        };

        let cookies = if view.cookies_likely_valid {
            CookieSource::Jar(view.cookies.clone())
        } else if !self.config.browser_cookie_sources.is_empty() {
            CookieSource::Browsers(self.config.browser_cookie_sources.clone())
        } else {
            CookieSource::None
        };

        ExtractorOptions {
            profile,
            user_agent,
            headers: BROWSER_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            cookies,
            visitor_token: view.visitor_token.clone(),
            socket_timeout_secs: self.config.socket_timeout_secs,
            timeout: self.config.extract_timeout(),
        }
    }
}

/// Error for failures that are never retried.
fn surface(kind: ErrorKind, failure: &ExtractorFailure, request: &ExtractionRequest) -> DownloadError {
    match kind {
        ErrorKind::Cancelled => DownloadError::cancelled(),
        ErrorKind::FormatUnavailable => {
            let quality = match request.format() {
                MediaKind::Audio => "audio",
                MediaKind::Video => request.quality_label(),
            };
            let mut err = DownloadError::format_unavailable(quality);
            if !failure.detail.is_empty() {
                err.message = format!("{}\n\nDetails: {}", err.message, failure.detail);
            }
            err
        }
        other => DownloadError::with_detail(other, &failure.detail),
    }
}
