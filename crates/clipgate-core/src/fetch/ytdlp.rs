//! `yt-dlp` child-process fetcher.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::retry::{classify_exit, ErrorKind};

use super::{FetchError, FetchOutput, FetchRequest, MediaMetadata, ProgressReporter, VideoFetcher};

/// How often the abort token is checked while yt-dlp is silent.
const ABORT_POLL: Duration = Duration::from_millis(250);

/// Printed once the file has been moved to its final name.
const PRINT_TEMPLATE: &str = "after_move:%(.{filepath,duration,thumbnail,title})j";

/// Runs `yt-dlp` through the job's proxy and streams its progress.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: PathBuf,
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl YtDlpFetcher {
    /// `binary` defaults to `yt-dlp` on PATH.
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| PathBuf::from("yt-dlp")),
        }
    }

    fn args(request: &FetchRequest) -> Vec<String> {
        let output = request.work_dir.join("%(id)s.%(ext)s");
        vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            "download:%(progress._percent_str)s".to_string(),
            "--print".to_string(),
            PRINT_TEMPLATE.to_string(),
            "--socket-timeout".to_string(),
            "30".to_string(),
            "--proxy".to_string(),
            request.proxy.address.clone(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "--".to_string(),
            request.source_url.clone(),
        ]
    }
}

/// Parse a progress line (`download: 45.2%`, or a bare `  92.5%`).
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let line = line.trim();
    let pct_str = if let Some(rest) = line.strip_prefix("download:") {
        rest.trim().trim_end_matches('%')
    } else if line.ends_with('%') {
        line.trim_end_matches('%').split_whitespace().last()?
    } else {
        return None;
    };
    pct_str.trim().parse::<f64>().ok()
}

#[derive(Debug, Deserialize)]
struct PrintedInfo {
    filepath: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    title: Option<String>,
}

/// Parse the JSON line produced by [`PRINT_TEMPLATE`].
fn parse_info_line(line: &str) -> Option<(PathBuf, MediaMetadata)> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let info: PrintedInfo = serde_json::from_str(line).ok()?;
    let path = PathBuf::from(info.filepath?);
    Some((
        path,
        MediaMetadata {
            duration_secs: info.duration,
            thumbnail_url: info.thumbnail,
            title: info.title,
        },
    ))
}

/// Last `ERROR:` line of stderr, or its last non-empty line.
fn error_summary(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.to_lowercase().starts_with("error"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "yt-dlp failed without output".to_string())
}

async fn ensure_dir(dir: &Path) -> Result<(), FetchError> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        FetchError::transient(
            ErrorKind::Unknown,
            format!("create work dir {}: {}", dir.display(), e),
        )
    })
}

#[async_trait]
impl VideoFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressReporter,
    ) -> Result<FetchOutput, FetchError> {
        progress.check()?;
        ensure_dir(&request.work_dir).await?;

        let mut child = Command::new(&self.binary)
            .args(Self::args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FetchError::Permanent(format!("failed to start {}: {}", self.binary.display(), e))
            })?;
        tracing::debug!(job_id = request.job_id, proxy_id = %request.proxy.id, "yt-dlp spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::transient(ErrorKind::Unknown, "yt-dlp stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::transient(ErrorKind::Unknown, "yt-dlp stderr unavailable"))?;

        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut info = None;
        let mut poll = tokio::time::interval(ABORT_POLL);
        loop {
            let checkpoint = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(pct) = parse_progress_line(&line) {
                            progress.report(pct)
                        } else {
                            if let Some(parsed) = parse_info_line(&line) {
                                info = Some(parsed);
                            }
                            Ok(())
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = poll.tick() => progress.check(),
            };
            if let Err(e) = checkpoint {
                let _ = child.kill().await;
                stderr_reader.abort();
                tracing::info!(job_id = request.job_id, "yt-dlp stopped: {}", e);
                return Err(e);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::transient(ErrorKind::Unknown, format!("yt-dlp wait: {e}")))?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            let kind = classify_exit(status.code(), &stderr);
            let message = error_summary(&stderr);
            tracing::warn!(job_id = request.job_id, kind = kind.as_str(), "yt-dlp failed: {}", message);
            return Err(FetchError::classified(kind, message));
        }

        let (file_path, metadata) = info.ok_or_else(|| {
            FetchError::transient(ErrorKind::Unknown, "yt-dlp did not report an output file")
        })?;
        progress.report(100.0)?;
        Ok(FetchOutput {
            file_path,
            metadata,
        })
    }
}
