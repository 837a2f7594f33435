//! Session cookie jar persisted in Netscape `cookies.txt` format.
//!
//! The jar file is the handle handed to the extractor (`--cookies <path>`).
//! [`CookieStore::load`] never fails: when the file cannot be created the
//! caller still gets an in-memory empty jar and the error goes to the log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::paths::write_atomic;

/// Header every serialized jar starts with, even an empty one.
pub const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File\n\
# https://curl.haxx.se/rfc/cookie_spec.html\n\
# This is a generated file!  Do not edit.\n\n";

/// A single cookie line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Leading-dot form for domain cookies, bare host for host-only ones
    pub domain: String,
    /// Netscape "domain flag": cookie also applies to subdomains
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix seconds; 0 marks a session cookie
    pub expires_at: i64,
    pub name: String,
    pub value: String,
}

impl Cookie {
    /// Build a cookie from browser fields, applying the domain rule:
    /// non-host-only cookies always carry a leading dot.
    pub fn normalized(
        domain: &str,
        host_only: bool,
        path: &str,
        secure: bool,
        expires_at: i64,
        name: &str,
        value: &str,
    ) -> Self {
        let bare = domain.trim_start_matches('.');
        let domain = if host_only {
            bare.to_string()
        } else {
            format!(".{}", bare)
        };
        Self {
            domain,
            include_subdomains: !host_only,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            secure,
            expires_at,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.domain,
            flag(self.include_subdomains),
            self.path,
            flag(self.secure),
            self.expires_at,
            self.name,
            self.value
        )
    }

    fn from_line(line: &str) -> Option<Self> {
        // curl marks HttpOnly cookies with this prefix on an otherwise normal line
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            return None;
        }
        Some(Self {
            domain: fields[0].to_string(),
            include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
            path: fields[2].to_string(),
            secure: fields[3].eq_ignore_ascii_case("TRUE"),
            expires_at: fields[4].parse().ok()?,
            name: fields[5].to_string(),
            value: fields[6].to_string(),
        })
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

/// Ordered set of cookies; insertion order is preserved on output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing an existing cookie with the same (domain, path, name).
    pub fn insert(&mut self, cookie: Cookie) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| {
            c.domain == cookie.domain && c.path == cookie.path && c.name == cookie.name
        }) {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Serialize as a Netscape cookie file: header, then one line per cookie.
    pub fn to_netscape(&self) -> String {
        let mut out = String::from(NETSCAPE_HEADER);
        for cookie in &self.cookies {
            out.push_str(&cookie.to_line());
            out.push('\n');
        }
        out
    }

    /// Parse a Netscape cookie file, skipping comments and malformed lines.
    pub fn parse_netscape(text: &str) -> Self {
        let mut jar = Self::new();
        for line in text.lines() {
            let trimmed = line.trim_end_matches('\r');
            if trimmed.is_empty() || (trimmed.starts_with('#') && !trimmed.starts_with("#HttpOnly_")) {
                continue;
            }
            match Cookie::from_line(trimmed) {
                Some(cookie) => jar.insert(cookie),
                None => debug!("Skipping malformed cookie line ({} bytes)", trimmed.len()),
            }
        }
        jar
    }
}

impl FromIterator<Cookie> for CookieJar {
    fn from_iter<I: IntoIterator<Item = Cookie>>(iter: I) -> Self {
        let mut jar = Self::new();
        for cookie in iter {
            jar.insert(cookie);
        }
        jar
    }
}

/// Opaque token the extractor understands as "these cookies".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieJarHandle {
    /// Persisted jar on disk
    File(PathBuf),
    /// Disk was unusable; serialized jar kept in memory
    Memory(String),
}

impl CookieJarHandle {
    /// Path to pass to the extractor, if the jar lives on disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }

    /// Serialized size in bytes.
    pub fn serialized_len(&self) -> u64 {
        match self {
            Self::File(path) => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            Self::Memory(text) => text.len() as u64,
        }
    }
}

/// Storage seam for the session jar, so the retry cascade can be exercised
/// against counting or failing stores.
pub trait CookieStorage: Send + Sync {
    /// Handle to the persisted jar; creates an empty one when missing.
    fn load(&self) -> CookieJarHandle;

    /// Delete the persisted jar and recreate it empty.
    fn clear(&self) -> io::Result<()>;

    /// Overwrite the persisted jar wholesale.
    fn save(&self, jar: &CookieJar) -> io::Result<CookieJarHandle>;

    /// Size heuristic: only jars larger than the threshold count.
    fn is_likely_valid(&self, handle: &CookieJarHandle) -> bool;
}

/// File-backed cookie store.
#[derive(Debug, Clone)]
pub struct CookieStore {
    path: PathBuf,
    min_valid_bytes: u64,
}

impl CookieStore {
    pub fn new(path: impl Into<PathBuf>, min_valid_bytes: u64) -> Self {
        Self {
            path: path.into(),
            min_valid_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted jar text, if any.
    pub fn read(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    fn create_empty(&self) -> io::Result<()> {
        write_atomic(&self.path, CookieJar::new().to_netscape().as_bytes())?;
        info!("Created empty cookie file at {}", self.path.display());
        Ok(())
    }
}

impl CookieStorage for CookieStore {
    fn load(&self) -> CookieJarHandle {
        if self.path.is_file() {
            return CookieJarHandle::File(self.path.clone());
        }
        match self.create_empty() {
            Ok(()) => CookieJarHandle::File(self.path.clone()),
            Err(e) => {
                error!("Error creating cookie file {}: {}", self.path.display(), e);
                CookieJarHandle::Memory(CookieJar::new().to_netscape())
            }
        }
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.create_empty()
    }

    fn save(&self, jar: &CookieJar) -> io::Result<CookieJarHandle> {
        write_atomic(&self.path, jar.to_netscape().as_bytes())?;
        info!("Saved {} cookies to {}", jar.len(), self.path.display());
        Ok(CookieJarHandle::File(self.path.clone()))
    }

    fn is_likely_valid(&self, handle: &CookieJarHandle) -> bool {
        handle.serialized_len() > self.min_valid_bytes
    }
}
