// Process and filesystem helpers shared by the extractor and orchestrator

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Io(String),
}

/// Run a command to completion, killing it if it outlives `limit`.
pub async fn run_output_with_timeout(
    program: &str,
    args: &[String],
    limit: Duration,
) -> Result<std::process::Output, ProcessError> {
    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::Io(format!("Failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| ProcessError::Io(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| ProcessError::Io(format!("Failed to wait for {}: {}", program, e)))?;
            let stdout = join_pipe(stdout_task, "stdout").await?;
            let stderr = join_pipe(stderr_task, "stderr").await?;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(ProcessError::Timeout(limit.as_secs()))
        }
    }
}

async fn join_pipe(
    task: tokio::task::JoinHandle<io::Result<Vec<u8>>>,
    name: &str,
) -> Result<Vec<u8>, ProcessError> {
    task.await
        .map_err(|e| ProcessError::Io(format!("{} task failed: {}", name, e)))?
        .map_err(|e| ProcessError::Io(format!("Failed to read {}: {}", name, e)))
}

/// Locate an executable: explicit override, well-known install paths, then PATH.
pub fn find_executable(name: &str, explicit: Option<&str>) -> String {
    if let Some(path) = explicit.filter(|p| !p.trim().is_empty()) {
        return path.to_string();
    }

    let mut candidates: Vec<PathBuf> = [
        "/opt/homebrew/bin", // Homebrew on Apple Silicon
        "/usr/local/bin",    // Homebrew on Intel Mac
        "/usr/bin",
    ]
    .iter()
    .map(|dir| Path::new(dir).join(name))
    .collect();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin").join(name));
    }
    if let Some(path) = candidates.into_iter().find(|p| p.is_file()) {
        return path.to_string_lossy().to_string();
    }

    if let Some(path) = std::env::var_os("PATH") {
        let exe = if cfg!(windows) { format!("{}.exe", name) } else { name.to_string() };
        if let Some(found) = std::env::split_paths(&path).map(|d| d.join(&exe)).find(|p| p.is_file()) {
            return found.to_string_lossy().to_string();
        }
    }

    // hope it's resolvable at spawn time
    name.to_string()
}

/// Whether a browser's profile data exists for the current user.
pub fn browser_profile_exists(browser: &str) -> bool {
    browser_profile_dirs(browser).iter().any(|d| d.is_dir())
}

fn browser_profile_dirs(browser: &str) -> Vec<PathBuf> {
    let config = dirs::config_dir();
    let data = dirs::data_local_dir();
    let home = dirs::home_dir();
    let join = |base: &Option<PathBuf>, rel: &str| base.as_ref().map(|b| b.join(rel));

    let dirs: Vec<Option<PathBuf>> = match browser {
        "chrome" => vec![
            join(&config, "google-chrome"),
            join(&config, "Google/Chrome"),
            join(&data, "Google/Chrome/User Data"),
        ],
        "chromium" => vec![join(&config, "chromium"), join(&data, "Chromium/User Data")],
        "edge" => vec![
            join(&config, "microsoft-edge"),
            join(&config, "Microsoft Edge"),
            join(&data, "Microsoft/Edge/User Data"),
        ],
        "brave" => vec![
            join(&config, "BraveSoftware/Brave-Browser"),
            join(&data, "BraveSoftware/Brave-Browser/User Data"),
        ],
        "opera" => vec![
            join(&config, "opera"),
            join(&config, "com.operasoftware.Opera"),
            join(&config, "Opera Software/Opera Stable"),
        ],
        "firefox" => vec![
            join(&home, ".mozilla/firefox"),
            join(&config, "Firefox"),
            join(&config, "Mozilla/Firefox"),
        ],
        "safari" => vec![join(&home, "Library/Cookies")],
        other => {
            debug!("No profile locations known for browser '{}'", other);
            Vec::new()
        }
    };
    dirs.into_iter().flatten().collect()
}

/// Remove a partially written file together with the extractor's
/// `.part` / `.ytdl` siblings. Returns how many files were removed.
pub fn remove_partial_files(path: &Path) -> usize {
    let mut removed = 0;
    let mut candidates = vec![path.to_path_buf()];
    for suffix in [".part", ".ytdl"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        candidates.push(PathBuf::from(sibling));
    }
    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {
                debug!("Removed partial file {}", candidate.display());
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", candidate.display(), e),
        }
    }
    removed
}

/// Make sure `dir` exists and is a directory.
pub fn ensure_output_dir(dir: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} is not a directory", dir.display()),
        ));
    }
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_files_and_siblings_are_removed() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("clip.mp4");
        std::fs::write(dir.path().join("clip.mp4.part"), b"half").unwrap();
        std::fs::write(dir.path().join("clip.mp4.ytdl"), b"state").unwrap();

        assert_eq!(remove_partial_files(&target), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(remove_partial_files(&target), 0);
    }

    #[test]
    fn output_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        assert_eq!(ensure_output_dir(&nested).unwrap(), nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn output_dir_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("taken");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_output_dir(&file).is_err());
    }

    #[test]
    fn explicit_executable_wins() {
        assert_eq!(find_executable("yt-dlp", Some("/custom/yt-dlp")), "/custom/yt-dlp");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let args = vec!["5".to_string()];
        let result = run_output_with_timeout("sleep", &args, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let result = run_output_with_timeout("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
