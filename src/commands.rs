//! Shell command execution for stage checks: bounded run time, bounded
//! captured output.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::PhaseError;

/// Characters of output kept when recording a status event.
pub const DEFAULT_OUTPUT_LIMIT: usize = 2000;
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Bytes read from each of stdout and stderr before the rest is discarded.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;
/// Grace period for pipe readers once the process has exited or been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Keep at most `limit` characters, marking the cut.
pub fn truncate_output(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, lossily decoded
    pub output: String,
}

/// Runs `sh -c <command>` with a deadline.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutcome, PhaseError> {
        self.run_with_env(command, cwd, &[]).await
    }

    /// Like [`ShellRunner::run`] with extra environment variables.
    pub async fn run_with_env(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(&str, String)],
    ) -> Result<CommandOutcome, PhaseError> {
        debug!(command, cwd = %cwd.display(), "running command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PhaseError::Command)?;

        let stdout = tokio::spawn(read_bounded(child.stdout.take(), MAX_CAPTURE_BYTES));
        let stderr = tokio::spawn(read_bounded(child.stderr.take(), MAX_CAPTURE_BYTES));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => Some(status.map_err(PhaseError::Command)?),
            Err(_) => {
                warn!(command, timeout_secs = self.timeout.as_secs(), "command timed out, killing");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill timed out command: {}", e);
                }
                let _ = child.wait().await;
                None
            }
        };

        let mut output = drain(stdout).await;
        let err = drain(stderr).await;
        if !err.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err);
        }

        match status {
            Some(status) => Ok(CommandOutcome {
                success: status.success(),
                exit_code: status.code(),
                output,
            }),
            None => Err(PhaseError::TimedOut {
                secs: self.timeout.as_secs(),
                output,
            }),
        }
    }
}

async fn read_bounded<R>(reader: Option<R>, max: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

async fn drain(handle: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => String::new(),
    }
}
