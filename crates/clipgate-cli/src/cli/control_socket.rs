//! Control socket: server (during `clipgate run`) and client (for `clipgate cancel`).
//! Protocol: one line per command, "cancel <id>".

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clipgate_core::control::JobControl;
use clipgate_core::job_queue::JobId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Parses one control line. Anything other than "cancel <id>" is ignored.
fn parse_command(line: &str) -> Option<JobId> {
    line.trim().strip_prefix("cancel ")?.trim().parse().ok()
}

/// Spawns a task that listens on `path` and calls `job_control.request_abort(id)`
/// for each "cancel <id>" line.
pub fn spawn_control_listener(
    job_control: Arc<JobControl>,
    path: impl AsRef<Path>,
) -> Result<tokio::task::JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    tracing::debug!(path = %path.display(), "control socket listening");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let control = Arc::clone(&job_control);
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stream).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            match parse_command(&line) {
                                Some(id) => {
                                    let found = control.request_abort(id);
                                    tracing::debug!(job_id = id, found, "cancel via control socket");
                                }
                                None => tracing::debug!(line = %line, "ignoring control line"),
                            }
                        }
                    });
                }
                Err(e) => tracing::debug!("control socket accept: {}", e),
            }
        }
    });
    Ok(handle)
}

/// Sends "cancel <job_id>\n" to the control socket. No-op if the path does not exist.
pub async fn send_cancel(socket_path: &Path, job_id: JobId) -> Result<()> {
    if !socket_path.exists() {
        return Ok(());
    }
    let mut stream = UnixStream::connect(socket_path).await?;
    stream
        .write_all(format!("cancel {}\n", job_id).as_bytes())
        .await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_cancel_lines_only() {
        assert_eq!(parse_command("cancel 42"), Some(42));
        assert_eq!(parse_command("  cancel   7 \n"), Some(7));
        assert_eq!(parse_command("pause 42"), None);
        assert_eq!(parse_command("cancel abc"), None);
        assert_eq!(parse_command(""), None);
    }

    #[tokio::test]
    async fn cancel_line_sets_abort_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let control = Arc::new(JobControl::new());
        let token = control.register(5);
        let handle = spawn_control_listener(Arc::clone(&control), &path).unwrap();

        send_cancel(&path, 5).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !token.load(std::sync::atomic::Ordering::SeqCst) {
            assert!(tokio::time::Instant::now() < deadline, "abort not requested");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
    }

    #[tokio::test]
    async fn send_cancel_without_socket_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        send_cancel(&dir.path().join("missing.sock"), 1).await.unwrap();
    }
}
