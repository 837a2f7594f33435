//! Interactive credential acquisition through a real browser window.
//!
//! The platform offers no token login for automated clients, so the user
//! signs in through the normal UI while we wait for the signed-in marker,
//! then harvest every cookie and the visitor token from the page.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{self, GetAllCookiesParams};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cookies::{Cookie, CookieJar};
use super::session::AuthSession;
use crate::config::CoreConfig;

/// Hides `navigator.webdriver` before any page script runs.
const HIDE_WEBDRIVER_JS: &str = r#"
Object.defineProperty(navigator, 'webdriver', {
    get: () => undefined
})
"#;

/// Visitor token lookup: global config object, then meta tag, then initial data.
const VISITOR_TOKEN_JS: &str = r#"
(() => {
    try {
        if (typeof ytcfg !== 'undefined' && ytcfg.data_ && ytcfg.data_.VISITOR_DATA) {
            return ytcfg.data_.VISITOR_DATA;
        }
        var visitorMeta = document.querySelector('meta[name="visitor-data"]');
        if (visitorMeta && visitorMeta.getAttribute('content')) {
            return visitorMeta.getAttribute('content');
        }
        var initial = window.ytInitialData;
        if (initial && initial.responseContext && initial.responseContext.visitorData) {
            return initial.responseContext.visitorData;
        }
        return null;
    } catch (e) {
        return null;
    }
})()
"#;

#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    /// Browser could not be started; fatal for this acquisition
    #[error("could not launch browser: {0}")]
    Launch(String),

    /// The signed-in marker never appeared: the user walked away or gave up
    #[error("login not completed within {0}s")]
    Timeout(u64),

    #[error("browser automation failed: {0}")]
    Browser(String),

    #[error("signed in, but the page exposed no visitor token")]
    MissingVisitorToken,
}

impl From<chromiumoxide::error::CdpError> for AcquireError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        Self::Browser(e.to_string())
    }
}

/// Produces a fresh [`AuthSession`].
#[async_trait]
pub trait CredentialAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<AuthSession, AcquireError>;
}

/// Cookie as reported by the browser context.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserCookie {
    /// Leading dot for domain cookies, bare host for host-only ones
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Unix seconds, fractional; ignored for session cookies
    pub expires: f64,
    pub session: bool,
    pub name: String,
    pub value: String,
}

impl From<network::Cookie> for BrowserCookie {
    fn from(c: network::Cookie) -> Self {
        Self {
            domain: c.domain,
            path: c.path,
            secure: c.secure,
            expires: c.expires,
            session: c.session,
            name: c.name,
            value: c.value,
        }
    }
}

impl BrowserCookie {
    fn into_cookie(self, now: i64) -> Cookie {
        let host_only = !self.domain.starts_with('.');
        // session cookies get an hour so the extractor does not discard them
        let expires_at = if self.session || self.expires <= 0.0 {
            now + 3600
        } else {
            self.expires as i64
        };
        Cookie::normalized(
            &self.domain,
            host_only,
            &self.path,
            self.secure,
            expires_at,
            &self.name,
            &self.value,
        )
    }
}

/// Browser automation primitives the login flow needs.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), AcquireError>;

    /// Whether an element matching the CSS selector is currently present.
    async fn has_element(&mut self, selector: &str) -> Result<bool, AcquireError>;

    async fn click(&mut self, selector: &str) -> Result<(), AcquireError>;

    /// Evaluate a read-only expression and return its JSON value.
    async fn execute_script(&mut self, script: &str) -> Result<Value, AcquireError>;

    /// Every cookie visible to the browser context.
    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, AcquireError>;

    /// Shut the browser down. Must be safe to call once after any outcome.
    async fn close(&mut self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserDriver>, AcquireError>;
}

/// Timing and selectors for the login protocol.
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub home_url: String,
    pub fallback_video_url: String,
    pub sign_in_selector: String,
    pub signed_in_selector: String,
    pub sign_in_wait: Duration,
    pub login_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause after navigation so page scripts populate their config objects
    pub page_settle: Duration,
}

impl LoginSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            home_url: config.home_url.clone(),
            fallback_video_url: config.fallback_video_url.clone(),
            sign_in_selector: config.sign_in_selector.clone(),
            signed_in_selector: config.signed_in_selector.clone(),
            sign_in_wait: config.sign_in_wait(),
            login_timeout: config.login_timeout(),
            poll_interval: Duration::from_millis(500),
            page_settle: Duration::from_millis(config.page_settle_ms),
        }
    }
}

/// The interactive login protocol, generic over how the browser is launched.
pub struct BrowserLogin<L> {
    launcher: L,
    settings: LoginSettings,
}

impl<L: BrowserLauncher> BrowserLogin<L> {
    pub fn new(launcher: L, settings: LoginSettings) -> Self {
        Self { launcher, settings }
    }

    async fn run(&self, driver: &mut dyn BrowserDriver) -> Result<AuthSession, AcquireError> {
        let s = &self.settings;

        driver.navigate(&s.home_url).await?;
        tokio::time::sleep(s.page_settle).await;

        if wait_for_element(driver, &s.sign_in_selector, s.sign_in_wait, s.poll_interval).await? {
            driver.click(&s.sign_in_selector).await?;
        } else {
            info!("No sign in button found, assuming the login page is already showing");
        }

        info!("Waiting up to {}s for the user to sign in", s.login_timeout.as_secs());
        if !wait_for_element(driver, &s.signed_in_selector, s.login_timeout, s.poll_interval).await? {
            warn!("Login timed out or user cancelled");
            return Err(AcquireError::Timeout(s.login_timeout.as_secs()));
        }

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let cookies: CookieJar = driver
            .cookies()
            .await?
            .into_iter()
            .map(|c| c.into_cookie(now))
            .collect();
        info!("Harvested {} cookies", cookies.len());

        let token = self.visitor_token(driver).await?;
        debug!("Visitor token length {}", token.len());
        Ok(AuthSession::new(cookies, token))
    }

    async fn visitor_token(&self, driver: &mut dyn BrowserDriver) -> Result<String, AcquireError> {
        let s = &self.settings;

        driver.navigate(&s.home_url).await?;
        tokio::time::sleep(s.page_settle).await;
        if let Some(token) = read_token(driver).await {
            return Ok(token);
        }

        debug!("Visitor token not on home page, trying a public video page");
        driver.navigate(&s.fallback_video_url).await?;
        tokio::time::sleep(s.page_settle).await;
        read_token(driver).await.ok_or(AcquireError::MissingVisitorToken)
    }
}

#[async_trait]
impl<L: BrowserLauncher> CredentialAcquirer for BrowserLogin<L> {
    async fn acquire(&self) -> Result<AuthSession, AcquireError> {
        let mut driver = self.launcher.launch().await?;
        let result = self.run(driver.as_mut()).await;
        // Released on every path; a dropped future falls back to the driver's Drop.
        driver.close().await;
        result
    }
}

async fn read_token(driver: &mut dyn BrowserDriver) -> Option<String> {
    match driver.execute_script(VISITOR_TOKEN_JS).await {
        Ok(Value::String(token)) if !token.trim().is_empty() => Some(token),
        Ok(_) => None,
        Err(e) => {
            debug!("Visitor token script failed: {}", e);
            None
        }
    }
}

/// Poll for `selector` until it shows up or `timeout` elapses.
async fn wait_for_element(
    driver: &mut dyn BrowserDriver,
    selector: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, AcquireError> {
    let deadline = Instant::now() + timeout;
    loop {
        if driver.has_element(selector).await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

/// Launches a visible Chrome configured to look like a regular user's browser.
pub struct ChromeLauncher {
    user_agent: String,
    executable: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new(user_agent: impl Into<String>, executable: Option<PathBuf>) -> Self {
        Self {
            user_agent: user_agent.into(),
            executable,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.browser_user_agent.clone(), config.chrome_path.clone())
    }

    fn args(&self) -> Vec<String> {
        // default args are disabled because they include --enable-automation
        vec![
            "--incognito".to_string(),
            format!("--user-agent={}", self.user_agent),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-background-networking".to_string(),
            "--disable-popup-blocking".to_string(),
            "--password-store=basic".to_string(),
        ]
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserDriver>, AcquireError> {
        let mut builder = BrowserConfig::builder()
            .with_head()
            .disable_default_args()
            .args(self.args())
            .window_size(1280, 900);
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(AcquireError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AcquireError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let mut driver = ChromeDriver {
            browser,
            page: None,
            handler,
            closed: false,
        };
        let page = match driver.browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                driver.close().await;
                return Err(AcquireError::Launch(e.to_string()));
            }
        };
        if let Err(e) = page.evaluate_on_new_document(HIDE_WEBDRIVER_JS).await {
            warn!("Could not install webdriver mask: {}", e);
        }
        driver.page = Some(page);
        info!("Browser launched for sign-in");
        Ok(Box::new(driver))
    }
}

/// chromiumoxide-backed driver. Dropping it kills the browser process.
pub struct ChromeDriver {
    browser: Browser,
    page: Option<Page>,
    handler: JoinHandle<()>,
    closed: bool,
}

impl ChromeDriver {
    fn page(&self) -> Result<&Page, AcquireError> {
        self.page
            .as_ref()
            .ok_or_else(|| AcquireError::Browser("no open page".to_string()))
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), AcquireError> {
        debug!("Navigating to {}", url);
        self.page()?.goto(url).await?;
        Ok(())
    }

    async fn has_element(&mut self, selector: &str) -> Result<bool, AcquireError> {
        Ok(self.page()?.find_element(selector).await.is_ok())
    }

    async fn click(&mut self, selector: &str) -> Result<(), AcquireError> {
        self.page()?.find_element(selector).await?.click().await?;
        Ok(())
    }

    async fn execute_script(&mut self, script: &str) -> Result<Value, AcquireError> {
        let result = self.page()?.evaluate(script).await?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, AcquireError> {
        // every cookie in the browser context, not just the current page's
        let response = self.page()?.execute(GetAllCookiesParams::default()).await?;
        Ok(response.result.cookies.into_iter().map(BrowserCookie::from).collect())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.browser.close().await {
            debug!("Browser close failed, killing process: {}", e);
            let _ = self.browser.kill().await;
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        info!("Browser closed");
    }
}

impl Drop for ChromeDriver {
    fn drop(&mut self) {
        // Browser's own Drop kills the child; the CDP handler task must go too
        self.handler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        /// polls before the avatar shows up; None = never
        avatar_after: Option<usize>,
        sign_in_present: bool,
        token_on_home: Option<&'static str>,
        token_on_video: Option<&'static str>,
    }

    #[derive(Default)]
    struct Trace {
        visited: Vec<String>,
        clicked: Vec<String>,
        closes: usize,
    }

    struct StubDriver {
        script: Arc<Script>,
        trace: Arc<Mutex<Trace>>,
        url: String,
        avatar_polls: usize,
    }

    #[async_trait]
    impl BrowserDriver for StubDriver {
        async fn navigate(&mut self, url: &str) -> Result<(), AcquireError> {
            self.url = url.to_string();
            self.trace.lock().unwrap().visited.push(url.to_string());
            Ok(())
        }

        async fn has_element(&mut self, selector: &str) -> Result<bool, AcquireError> {
            if selector.contains("ServiceLogin") {
                return Ok(self.script.sign_in_present);
            }
            self.avatar_polls += 1;
            Ok(matches!(self.script.avatar_after, Some(n) if self.avatar_polls > n))
        }

        async fn click(&mut self, selector: &str) -> Result<(), AcquireError> {
            self.trace.lock().unwrap().clicked.push(selector.to_string());
            Ok(())
        }

        async fn execute_script(&mut self, _script: &str) -> Result<Value, AcquireError> {
            let token = if self.url.contains("watch?v=") {
                self.script.token_on_video
            } else {
                self.script.token_on_home
            };
            Ok(token.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null))
        }

        async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, AcquireError> {
            Ok(vec![
                BrowserCookie {
                    domain: ".youtube.com".to_string(),
                    path: "/".to_string(),
                    secure: true,
                    expires: 1_799_665_392.5,
                    session: false,
                    name: "SID".to_string(),
                    value: "abc".to_string(),
                },
                BrowserCookie {
                    domain: "www.youtube.com".to_string(),
                    path: "/".to_string(),
                    secure: false,
                    expires: -1.0,
                    session: true,
                    name: "YSC".to_string(),
                    value: "xyz".to_string(),
                },
            ])
        }

        async fn close(&mut self) {
            self.trace.lock().unwrap().closes += 1;
        }
    }

    struct StubLauncher {
        script: Arc<Script>,
        trace: Arc<Mutex<Trace>>,
        launches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BrowserLauncher for StubLauncher {
        async fn launch(&self) -> Result<Box<dyn BrowserDriver>, AcquireError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AcquireError::Launch("chrome not found".to_string()));
            }
            Ok(Box::new(StubDriver {
                script: Arc::clone(&self.script),
                trace: Arc::clone(&self.trace),
                url: String::new(),
                avatar_polls: 0,
            }))
        }
    }

    fn settings() -> LoginSettings {
        LoginSettings {
            home_url: "https://www.youtube.com".to_string(),
            fallback_video_url: "https://www.youtube.com/watch?v=jNQXAC9IVRw".to_string(),
            sign_in_selector: "a[href*='accounts.google.com/ServiceLogin']".to_string(),
            signed_in_selector: "#avatar-btn".to_string(),
            sign_in_wait: Duration::from_millis(20),
            login_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            page_settle: Duration::ZERO,
        }
    }

    fn login(script: Script, fail: bool) -> (BrowserLogin<StubLauncher>, Arc<Mutex<Trace>>) {
        let trace = Arc::new(Mutex::new(Trace::default()));
        let launcher = StubLauncher {
            script: Arc::new(script),
            trace: Arc::clone(&trace),
            launches: AtomicUsize::new(0),
            fail,
        };
        (BrowserLogin::new(launcher, settings()), trace)
    }

    #[tokio::test]
    async fn successful_login_harvests_cookies_and_token() {
        let (login, trace) = login(
            Script {
                avatar_after: Some(3),
                sign_in_present: true,
                token_on_home: Some("CgtIb21lVG9rZW4"),
                ..Default::default()
            },
            false,
        );

        let session = login.acquire().await.unwrap();
        assert_eq!(session.visitor_token, "CgtIb21lVG9rZW4");
        assert_eq!(session.cookies.len(), 2);

        let sid = &session.cookies.cookies()[0];
        assert_eq!(sid.domain, ".youtube.com");
        assert!(sid.include_subdomains);
        assert_eq!(sid.expires_at, 1_799_665_392);

        let ysc = &session.cookies.cookies()[1];
        assert_eq!(ysc.domain, "www.youtube.com");
        assert!(!ysc.include_subdomains);
        assert!(ysc.expires_at > 0);

        let trace = trace.lock().unwrap();
        assert_eq!(trace.clicked.len(), 1);
        assert_eq!(trace.closes, 1);
    }

    #[tokio::test]
    async fn token_falls_back_to_video_page_once() {
        let (login, trace) = login(
            Script {
                avatar_after: Some(0),
                token_on_video: Some("CgtWaWRlb1Rva2Vu"),
                ..Default::default()
            },
            false,
        );

        let session = login.acquire().await.unwrap();
        assert_eq!(session.visitor_token, "CgtWaWRlb1Rva2Vu");

        let trace = trace.lock().unwrap();
        assert!(trace.clicked.is_empty());
        assert_eq!(
            trace.visited.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=jNQXAC9IVRw")
        );
        assert_eq!(trace.visited.iter().filter(|u| u.contains("watch?v=")).count(), 1);
    }

    #[tokio::test]
    async fn missing_token_everywhere_produces_no_session() {
        let (login, trace) = login(
            Script {
                avatar_after: Some(0),
                ..Default::default()
            },
            false,
        );
        assert!(matches!(login.acquire().await, Err(AcquireError::MissingVisitorToken)));
        assert_eq!(trace.lock().unwrap().closes, 1);
    }

    #[tokio::test]
    async fn abandoned_login_times_out_and_releases_browser() {
        let (login, trace) = login(
            Script {
                avatar_after: None,
                sign_in_present: true,
                ..Default::default()
            },
            false,
        );

        let err = login.acquire().await.unwrap_err();
        assert!(matches!(err, AcquireError::Timeout(_)));
        assert_eq!(trace.lock().unwrap().closes, 1);
    }

    #[tokio::test]
    async fn launch_failure_is_not_retried() {
        let (login, trace) = login(Script::default(), true);
        assert!(matches!(login.acquire().await, Err(AcquireError::Launch(_))));
        assert_eq!(login.launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(trace.lock().unwrap().closes, 0);
    }

    #[test]
    fn devtools_cookie_maps_to_jar_line() {
        let wire = serde_json::json!({
            "name": "SID",
            "value": "g.a000abc",
            "domain": ".youtube.com",
            "path": "/",
            "expires": 1799665392.5,
            "size": 12,
            "httpOnly": true,
            "secure": true,
            "session": false,
            "priority": "Medium",
            "sameParty": false,
            "sourceScheme": "Secure",
            "sourcePort": 443
        });
        let cdp: network::Cookie = serde_json::from_value(wire).unwrap();
        let cookie = BrowserCookie::from(cdp);

        assert_eq!(cookie.domain, ".youtube.com");
        assert_eq!(cookie.name, "SID");
        assert_eq!(cookie.value, "g.a000abc");
        assert!(cookie.secure && !cookie.session);
        assert_eq!(cookie.expires, 1799665392.5);
    }
}
