// Authentication: cookie jar persistence, the shared session and
// interactive browser login.

pub mod browser;
pub mod cookies;
pub mod session;

pub use browser::{AcquireError, BrowserLogin, ChromeLauncher, CredentialAcquirer, LoginSettings};
pub use cookies::{Cookie, CookieJar, CookieJarHandle, CookieStorage, CookieStore};
pub use session::{AuthSession, SessionManager, SessionStore, SessionView};
