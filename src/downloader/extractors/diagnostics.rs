// Extractor error translation
//
// The one place that reads yt-dlp's error text. Everything past the
// extractor boundary works with `ErrorKind` only.

use crate::downloader::errors::ErrorKind;

/// Map extractor stderr to the failure taxonomy.
///
/// Patterns are checked in order of specificity: the bot check must win
/// over the generic "sign in" check since its message contains both.
pub fn classify(stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(&[
        "requested format is not available",
        "requested format not available",
        "format is not available",
    ]) {
        return ErrorKind::FormatUnavailable;
    }

    if has(&[
        "not a bot",
        "bot detection",
        "captcha",
        "unusual traffic",
        "automated queries",
        "po token",
        "proof of origin",
        "sabr",
        "http error 403",
        "403: forbidden",
        "http error 429",
        "too many requests",
        "rate limit",
    ]) {
        return ErrorKind::BotDetected;
    }

    if has(&[
        "sign in to confirm your age",
        "age-restricted",
        "age restricted",
        "private video",
        "video is private",
        "members only",
        "members-only",
        "join this channel",
        "login required",
        "use --cookies",
        "cookies-from-browser",
        "sign in",
    ]) {
        return ErrorKind::AuthRequired;
    }

    if has(&[
        "video unavailable",
        "video is unavailable",
        "video has been removed",
        "no longer available",
        "does not exist",
        "http error 404",
        "404: not found",
    ]) {
        return ErrorKind::NotFound;
    }

    if has(&[
        "unsupported url",
        "drm",
        "widevine",
        "premium",
        "requires purchase",
        "rental",
        "not available in your country",
        "blocked in your country",
        "no video formats found",
    ]) {
        return ErrorKind::Unsupported;
    }

    if has(&[
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "network is unreachable",
        "network unreachable",
        "temporary failure in name resolution",
        "name or service not known",
        "unable to download webpage",
        "urlopen error",
        "remote end closed connection",
        "http error 5",
        "incompleteread",
    ]) {
        return ErrorKind::NetworkTransient;
    }

    ErrorKind::Unsupported
}

/// The most useful single line of an error dump: the first `ERROR:` line,
/// else the last non-empty one.
pub fn error_context(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .find(|l| l.to_lowercase().starts_with("error:"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_default()
}
