// Tunables for the extraction and download core

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths;

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";
pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_7_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.2 Mobile/15E148 Safari/604.1";
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";

/// Thresholds, timeouts and identity profiles used by the core.
///
/// Every field has a default, so a partial `"core"` object in the settings
/// file is enough to override a single value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Directory holding cookies.txt, youtube_auth.json and settings.json
    pub data_dir: PathBuf,
    /// A jar must serialize to more bytes than this to count as likely valid
    pub min_valid_jar_bytes: u64,
    /// How long the interactive login may take before it counts as abandoned
    pub login_timeout_secs: u64,
    /// How long to look for the sign-in affordance on the home page
    pub sign_in_wait_secs: u64,
    /// Pause after each login-browser navigation
    pub page_settle_ms: u64,
    /// Attempts per extraction cascade
    pub max_attempts: u32,
    /// Same-identity retries for network/not-found/unsupported failures
    pub transient_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub socket_timeout_secs: u32,
    /// Wall-clock limit for a single metadata extraction
    pub extract_timeout_secs: u64,
    pub desktop_user_agent: String,
    pub mobile_user_agent: String,
    /// User-agent the login browser presents
    pub browser_user_agent: String,
    /// Installed browsers to borrow cookies from when the jar is not usable
    pub browser_cookie_sources: Vec<String>,
    /// yt-dlp executable; detected when unset
    pub ytdlp_path: Option<String>,
    /// Chrome/Chromium executable; detected by the driver when unset
    pub chrome_path: Option<PathBuf>,
    pub audio_bitrate_kbps: u32,
    pub home_url: String,
    pub fallback_video_url: String,
    pub sign_in_selector: String,
    pub signed_in_selector: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::default_data_dir(),
            min_valid_jar_bytes: 256,
            login_timeout_secs: 300,
            sign_in_wait_secs: 10,
            page_settle_ms: 3000,
            max_attempts: 3,
            transient_retries: 2,
            backoff_base_ms: 1000,
            backoff_max_ms: 8000,
            socket_timeout_secs: 30,
            extract_timeout_secs: 60,
            desktop_user_agent: DESKTOP_USER_AGENT.to_string(),
            mobile_user_agent: MOBILE_USER_AGENT.to_string(),
            browser_user_agent: BROWSER_USER_AGENT.to_string(),
            browser_cookie_sources: ["chrome", "edge", "firefox", "opera", "safari", "brave"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ytdlp_path: std::env::var("YTDLP_PATH").ok(),
            chrome_path: std::env::var("CHROME_PATH").ok().map(PathBuf::from),
            audio_bitrate_kbps: 320,
            home_url: "https://www.youtube.com".to_string(),
            fallback_video_url: "https://www.youtube.com/watch?v=jNQXAC9IVRw".to_string(),
            sign_in_selector: "a[href*='accounts.google.com/ServiceLogin']".to_string(),
            signed_in_selector: "#avatar-btn".to_string(),
        }
    }
}

impl CoreConfig {
    /// Config rooted at `data_dir`, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn cookie_file(&self) -> PathBuf {
        self.data_dir.join(paths::COOKIE_FILE)
    }

    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join(paths::SESSION_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(paths::SETTINGS_FILE)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn sign_in_wait(&self) -> Duration {
        Duration::from_secs(self.sign_in_wait_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    /// Exponential backoff before the `retry`-th same-identity retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}
