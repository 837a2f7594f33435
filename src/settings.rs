// User preferences persisted as settings.json in the data directory

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::downloader::models::AudioCodec;
use crate::paths;

pub const OUTPUT_DIRECTORY: &str = "output_directory";
pub const VIDEO_QUALITY: &str = "video_quality";
pub const AUDIO_FORMAT: &str = "audio_format";
pub const AUDIO_QUALITY: &str = "audio_quality";
pub const CORE: &str = "core";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings value: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of the preferences a download needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    pub output_directory: PathBuf,
    pub video_quality: String,
    pub audio_format: String,
    pub audio_quality: String,
}

impl Preferences {
    /// Falls back to mp3 for anything the post-processor doesn't know.
    pub fn audio_codec(&self) -> AudioCodec {
        self.audio_format.parse().unwrap_or_default()
    }

    /// "320kbps" -> 320
    pub fn audio_bitrate_kbps(&self) -> Option<u32> {
        let trimmed = self.audio_quality.trim();
        let digits = trimmed
            .strip_suffix("kbps")
            .or_else(|| trimmed.strip_suffix('k'))
            .unwrap_or(trimmed);
        digits.trim().parse().ok().filter(|k| *k > 0)
    }
}

fn defaults() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        OUTPUT_DIRECTORY.to_string(),
        json!(paths::default_output_dir().to_string_lossy()),
    );
    map.insert(VIDEO_QUALITY.to_string(), json!("Highest"));
    map.insert(AUDIO_FORMAT.to_string(), json!("MP3"));
    map.insert(AUDIO_QUALITY.to_string(), json!("320kbps"));
    map
}

/// Key/value settings store. The lock covers the in-memory map and the
/// file write, nothing else.
pub struct Settings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl Settings {
    /// Load `path`, creating it with defaults when missing. Missing keys are
    /// filled from the defaults; an unreadable file is kept as-is and the
    /// defaults are used until the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let mut values = defaults();
        let mut write_back = true;

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(stored) => {
                    write_back = defaults().keys().any(|k| !stored.contains_key(k));
                    values.extend(stored);
                }
                Err(e) => {
                    warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
                    write_back = false;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Creating settings file {}", path.display());
            }
            Err(source) => return Err(SettingsError::Io { path, source }),
        }

        let settings = Self {
            path,
            values: Mutex::new(values),
        };
        if write_back {
            settings.persist(&settings.lock())?;
        }
        Ok(settings)
    }

    /// settings.json inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Result<Self, SettingsError> {
        Self::open(data_dir.join(paths::SETTINGS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str, default: Value) -> Value {
        self.lock().get(key).cloned().unwrap_or(default)
    }

    /// Typed read; `None` when the key is missing or has the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), SettingsError> {
        let mut values = self.lock();
        values.insert(key.to_string(), value.into());
        self.persist(&values)
    }

    /// Apply several keys with a single write.
    pub fn update(&self, entries: Map<String, Value>) -> Result<(), SettingsError> {
        let mut values = self.lock();
        values.extend(entries);
        self.persist(&values)
    }

    pub fn preferences(&self) -> Preferences {
        let values = self.lock();
        let text = |key: &str| {
            values
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| defaults().get(key).and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default()
        };
        Preferences {
            output_directory: PathBuf::from(text(OUTPUT_DIRECTORY)),
            video_quality: text(VIDEO_QUALITY),
            audio_format: text(AUDIO_FORMAT),
            audio_quality: text(AUDIO_QUALITY),
        }
    }

    /// Core tunables from the `"core"` object. Unset fields keep their
    /// defaults and the data directory defaults to this file's directory.
    pub fn core_config(&self) -> Result<CoreConfig, SettingsError> {
        let mut core = match self.lock().get(CORE) {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                warn!("Ignoring non-object \"core\" setting: {}", other);
                Map::new()
            }
        };
        if !core.contains_key("data_dir") {
            if let Some(dir) = self.path.parent() {
                core.insert("data_dir".to_string(), json!(dir.to_string_lossy()));
            }
        }
        Ok(serde_json::from_value(Value::Object(core))?)
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), SettingsError> {
        let io_err = |source: io::Error| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        let serialized = serde_json::to_string_pretty(values)?;
        paths::write_atomic(&self.path, serialized.as_bytes()).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_open_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::in_dir(dir.path()).unwrap();

        assert!(settings.path().is_file());
        let prefs = settings.preferences();
        assert_eq!(prefs.video_quality, "Highest");
        assert_eq!(prefs.audio_format, "MP3");
        assert_eq!(prefs.audio_codec(), AudioCodec::Mp3);
        assert_eq!(prefs.audio_bitrate_kbps(), Some(320));
    }

    #[test]
    fn set_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::in_dir(dir.path()).unwrap();
        settings.set(VIDEO_QUALITY, "720p").unwrap();
        settings.set("theme", json!({"dark": true})).unwrap();

        let reopened = Settings::in_dir(dir.path()).unwrap();
        assert_eq!(reopened.get(VIDEO_QUALITY, json!("x")), json!("720p"));
        assert_eq!(reopened.get("missing", json!(7)), json!(7));
        assert_eq!(reopened.get_as::<bool>("theme"), None);
        assert_eq!(reopened.preferences().video_quality, "720p");
    }

    #[test]
    fn writes_replace_the_file_whole() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::open(dir.path().join("conf").join("settings.json")).unwrap();
        settings.set(VIDEO_QUALITY, "1080p").unwrap();

        assert!(!dir.path().join("conf").join("settings.json.tmp").exists());
        let stored: Map<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(settings.path()).unwrap()).unwrap();
        assert_eq!(stored.get(VIDEO_QUALITY), Some(&json!("1080p")));
    }

    #[test]
    fn partial_file_is_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"audio_format": "FLAC"}"#).unwrap();

        let settings = Settings::open(&path).unwrap();
        assert_eq!(settings.preferences().audio_codec(), AudioCodec::Flac);
        let stored: Map<String, Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(stored.contains_key(VIDEO_QUALITY));
    }

    #[test]
    fn corrupt_file_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let settings = Settings::open(&path).unwrap();
        assert_eq!(settings.preferences().audio_quality, "320kbps");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn core_config_overrides_and_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::in_dir(dir.path()).unwrap();
        assert_eq!(settings.core_config().unwrap().data_dir, dir.path());

        let mut entries = Map::new();
        entries.insert(CORE.to_string(), json!({"max_attempts": 5, "login_timeout_secs": 60}));
        entries.insert(AUDIO_QUALITY.to_string(), json!("192k"));
        settings.update(entries).unwrap();

        let config = settings.core_config().unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.login_timeout_secs, 60);
        assert_eq!(config.transient_retries, 2);
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(settings.preferences().audio_bitrate_kbps(), Some(192));
    }

    #[test]
    fn bad_core_value_is_an_error() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::in_dir(dir.path()).unwrap();
        settings.set(CORE, json!({"max_attempts": "three"})).unwrap();
        assert!(matches!(settings.core_config(), Err(SettingsError::Json(_))));
    }
}
