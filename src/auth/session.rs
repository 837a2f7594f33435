//! Authenticated session: cookie jar + visitor token, and the manager that
//! serializes invalidation and re-acquisition across concurrent jobs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::browser::{AcquireError, CredentialAcquirer};
use super::cookies::{CookieJar, CookieJarHandle, CookieStorage};
use crate::paths::write_atomic;
use crate::downloader::errors::{DownloadError, ErrorKind};

/// Cookies and anti-bot token harvested from one successful login.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub cookies: CookieJar,
    pub visitor_token: String,
    pub acquired_at: OffsetDateTime,
}

impl AuthSession {
    pub fn new(cookies: CookieJar, visitor_token: impl Into<String>) -> Self {
        Self {
            cookies,
            visitor_token: visitor_token.into(),
            acquired_at: OffsetDateTime::now_utc(),
        }
    }

    /// Usable only with a non-trivial jar and a non-empty token.
    pub fn is_usable(&self, min_jar_bytes: u64) -> bool {
        self.cookies.to_netscape().len() as u64 > min_jar_bytes
            && !self.visitor_token.trim().is_empty()
    }
}

/// On-disk form of the sibling token record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// Netscape serialization of the jar at acquisition time
    pub cookies: String,
    pub visitor_data: String,
}

/// JSON token store living next to the cookie jar.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<SessionRecord> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read session record {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring corrupt session record {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, session: &AuthSession) -> io::Result<()> {
        let record = SessionRecord {
            last_updated: session.acquired_at,
            cookies: session.cookies.to_netscape(),
            visitor_data: session.visitor_token.clone(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.path, &json)
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// What one extraction attempt sees of the shared session.
#[derive(Debug, Clone)]
pub struct SessionView {
    /// Bumped on every successful re-acquisition
    pub generation: u64,
    pub cookies: CookieJarHandle,
    pub cookies_likely_valid: bool,
    pub visitor_token: Option<String>,
}

impl SessionView {
    pub fn is_authenticated(&self) -> bool {
        self.cookies_likely_valid && self.visitor_token.is_some()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    generation: u64,
    visitor_token: Option<String>,
    last_refresh_error: Option<DownloadError>,
}

/// Owner of the single shared session.
///
/// Readers take a [`SessionView`] concurrently. Invalidation plus
/// re-acquisition runs under one async mutex: a caller that failed on
/// generation `g` and finds the generation already past `g` reuses the
/// newer session instead of launching a second browser.
pub struct SessionManager {
    cookies: Arc<dyn CookieStorage>,
    tokens: SessionStore,
    acquirer: Arc<dyn CredentialAcquirer>,
    min_jar_bytes: u64,
    state: RwLock<SessionState>,
    refresh_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        cookies: Arc<dyn CookieStorage>,
        tokens: SessionStore,
        acquirer: Arc<dyn CredentialAcquirer>,
        min_jar_bytes: u64,
    ) -> Self {
        let visitor_token = tokens
            .load()
            .map(|r| r.visitor_data)
            .filter(|t| !t.trim().is_empty());
        debug!("Session manager starting, visitor token present: {}", visitor_token.is_some());
        Self {
            cookies,
            tokens,
            acquirer,
            min_jar_bytes,
            state: RwLock::new(SessionState {
                generation: 0,
                visitor_token,
                last_refresh_error: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn cookie_storage(&self) -> &Arc<dyn CookieStorage> {
        &self.cookies
    }

    /// Current session as seen by an extraction attempt.
    pub async fn current(&self) -> SessionView {
        let (generation, visitor_token) = {
            let state = self.state.read().await;
            (state.generation, state.visitor_token.clone())
        };
        let storage = Arc::clone(&self.cookies);
        let (handle, valid) = tokio::task::spawn_blocking(move || {
            let handle = storage.load();
            let valid = storage.is_likely_valid(&handle);
            (handle, valid)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Cookie load task failed: {}", e);
            (CookieJarHandle::Memory(CookieJar::new().to_netscape()), false)
        });
        SessionView {
            generation,
            cookies: handle,
            cookies_likely_valid: valid,
            visitor_token,
        }
    }

    /// Invalidate the session observed at `observed_generation` and acquire a
    /// fresh one. Concurrent callers that observed the same generation wait
    /// for the first one and share its result.
    pub async fn refresh(&self, observed_generation: u64) -> Result<SessionView, DownloadError> {
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.generation != observed_generation {
                debug!("Session already refreshed by another job, reusing it");
                if let Some(err) = state.last_refresh_error.clone() {
                    return Err(err);
                }
                drop(state);
                return Ok(self.current().await);
            }
        }

        info!("Invalidating stale session (generation {})", observed_generation);
        self.invalidate().await?;

        let outcome = match self.acquirer.acquire().await {
            Ok(session) if !session.is_usable(self.min_jar_bytes) => {
                warn!(
                    "Login returned an unusable session ({} cookies), not installing it",
                    session.cookies.len()
                );
                Err(DownloadError::new(
                    ErrorKind::AuthRequired,
                    "Sign-in finished but YouTube did not hand out a usable session. Log in again and wait for the home page to load.",
                ))
            }
            Ok(session) => self.install(session).await,
            Err(AcquireError::Timeout(secs)) => {
                warn!("Login not completed within {}s", secs);
                Err(DownloadError::new(
                    ErrorKind::AcquisitionTimeout,
                    format!(
                        "Sign-in was not completed within {} seconds. Start the download again when you are ready to log in.",
                        secs
                    ),
                ))
            }
            Err(e) => {
                warn!("Credential acquisition failed: {}", e);
                Err(DownloadError::new(
                    ErrorKind::AuthRequired,
                    format!("Could not obtain a fresh YouTube session: {}", e),
                ))
            }
        };

        match outcome {
            Ok(()) => Ok(self.current().await),
            Err(err) => {
                // Jobs queued behind this refresh share its failure instead of
                // opening another browser window.
                let mut state = self.state.write().await;
                state.generation += 1;
                state.last_refresh_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Persist a freshly acquired session and publish it to readers.
    pub async fn install(&self, session: AuthSession) -> Result<(), DownloadError> {
        let storage = Arc::clone(&self.cookies);
        let tokens = self.tokens.clone();
        let to_save = session.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            storage.save(&to_save.cookies)?;
            tokens.save(&to_save)
        })
        .await
        .map_err(|e| DownloadError::new(ErrorKind::AuthRequired, format!("Session save task failed: {}", e)))?
        .map_err(|e| DownloadError::io("Could not save session", e))?;

        let mut state = self.state.write().await;
        state.generation += 1;
        state.visitor_token = Some(session.visitor_token).filter(|t| !t.trim().is_empty());
        state.last_refresh_error = None;
        info!(
            "Installed session generation {} ({} cookies)",
            state.generation,
            session.cookies.len()
        );
        Ok(())
    }

    /// Drop the persisted jar and token. Readers see an empty session until
    /// the next install.
    pub async fn invalidate(&self) -> Result<(), DownloadError> {
        let storage = Arc::clone(&self.cookies);
        let tokens = self.tokens.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            storage.clear()?;
            tokens.clear()
        })
        .await
        .map_err(|e| DownloadError::new(ErrorKind::AuthRequired, format!("Session clear task failed: {}", e)))?
        .map_err(|e| DownloadError::io("Could not clear session", e))?;

        self.state.write().await.visitor_token = None;
        Ok(())
    }
}
