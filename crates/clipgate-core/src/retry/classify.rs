//! Classify fetch-tool exits, stderr messages and HTTP statuses into error kinds.

use super::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u16) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code),
        404 | 410 | 451 => ErrorKind::Permanent,
        _ => ErrorKind::Unknown,
    }
}

/// Extract the status from yt-dlp's `HTTP Error NNN:` message, if present.
fn http_status_in(lower: &str) -> Option<u16> {
    let idx = lower.find("http error ")?;
    let digits: String = lower[idx + "http error ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Classify yt-dlp stderr output.
///
/// Messages are matched case-insensitively; the first matching rule wins.
/// Anything unrecognised is `Unknown` (and therefore retried).
pub fn classify_tool_output(stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();

    if lower.contains("unsupported url")
        || lower.contains("is not a valid url")
        || lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
        || lower.contains("copyright")
        || lower.contains("no video formats")
        || lower.contains("sign in to confirm")
        || lower.contains("login required")
    {
        return ErrorKind::Permanent;
    }

    if lower.contains("proxyerror")
        || lower.contains("tunnel connection failed")
        || lower.contains("proxy authentication required")
        || lower.contains("unable to connect to proxy")
    {
        return ErrorKind::Proxy;
    }

    if let Some(code) = http_status_in(&lower) {
        return classify_http_status(code);
    }
    if lower.contains("too many requests") {
        return ErrorKind::Throttled;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorKind::Timeout;
    }
    if lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("connection aborted")
        || lower.contains("network is unreachable")
        || lower.contains("name resolution")
        || lower.contains("getaddrinfo failed")
        || lower.contains("unable to download webpage")
        || lower.contains("incomplete read")
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Unknown
}

/// Classify a finished tool process by exit code and stderr.
///
/// yt-dlp exits 2 on invalid command-line options, which no retry can fix.
pub fn classify_exit(code: Option<i32>, stderr: &str) -> ErrorKind {
    match code {
        Some(2) => ErrorKind::Permanent,
        _ => classify_tool_output(stderr),
    }
}
