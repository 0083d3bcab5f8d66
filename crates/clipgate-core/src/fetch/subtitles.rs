//! Subtitle pipeline backed by an external command.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{FetchError, ProgressReporter, SubtitlePipeline};

const ABORT_POLL: Duration = Duration::from_millis(250);

/// Runs `<command> <input> <output>` and returns `<output>`.
///
/// The command string is split on whitespace, so extra arguments can be
/// configured (`whisper-burn --model small`). Without a command every job
/// with subtitles fails permanently.
#[derive(Debug, Clone, Default)]
pub struct CommandSubtitler {
    command: Option<String>,
}

impl CommandSubtitler {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// `<dir>/<stem>.subtitled.<ext>` next to the input.
fn output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());
    input.with_file_name(format!("{stem}.subtitled.{ext}"))
}

#[async_trait]
impl SubtitlePipeline for CommandSubtitler {
    async fn generate(
        &self,
        input: &Path,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, FetchError> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| FetchError::Permanent("no subtitle command configured".to_string()))?;
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| FetchError::Permanent("empty subtitle command".to_string()))?;
        let output = output_path(input);

        progress.report(0.0)?;
        let mut child = Command::new(program)
            .args(parts)
            .arg(input)
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::Permanent(format!("failed to start {program}: {e}")))?;

        let mut poll = tokio::time::interval(ABORT_POLL);
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = poll.tick() => {
                    if let Err(e) = progress.check() {
                        let _ = child.kill().await;
                        return Err(e);
                    }
                }
            }
        };

        let status = status.map_err(|e| FetchError::Permanent(format!("{program} wait: {e}")))?;
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let last = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(FetchError::Permanent(format!(
                "{program} exited with {status}: {last}"
            )));
        }
        progress.report(100.0)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn detached() -> ProgressReporter {
        ProgressReporter::detached(1, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn output_is_next_to_input() {
        assert_eq!(
            output_path(Path::new("/w/abc.mp4")),
            PathBuf::from("/w/abc.subtitled.mp4")
        );
        assert_eq!(
            output_path(Path::new("/w/abc")),
            PathBuf::from("/w/abc.subtitled.mp4")
        );
    }

    #[tokio::test]
    async fn unconfigured_command_is_permanent() {
        let subs = CommandSubtitler::new(Some("   ".to_string()));
        assert!(matches!(
            subs.generate(Path::new("/w/a.mp4"), &detached()).await,
            Err(FetchError::Permanent(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_input_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.mp4");
        tokio::fs::write(&input, b"v").await.unwrap();
        // `cp <in> <out>` stands in for a real subtitle burner.
        let subs = CommandSubtitler::new(Some("cp".to_string()));
        let out = subs.generate(&input, &detached()).await.unwrap();
        assert_eq!(out, dir.path().join("a.subtitled.mp4"));
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"v");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_permanent() {
        let subs = CommandSubtitler::new(Some("false".to_string()));
        assert!(matches!(
            subs.generate(Path::new("/w/a.mp4"), &detached()).await,
            Err(FetchError::Permanent(_))
        ));
    }
}
