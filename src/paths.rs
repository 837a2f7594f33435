use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const APP_DIR: &str = "youtube-converter";
pub const COOKIE_FILE: &str = "cookies.txt";
pub const SESSION_FILE: &str = "youtube_auth.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Per-user data directory, falling back to `./data` when the platform has none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Default download directory for the settings defaults.
pub fn default_output_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
