//! Validation script process wrapper.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::ExecutorConfig;

/// How the script process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Non-zero exit, signal, or spawn failure, with a description.
    Failed(String),
}

/// Merged stdout/stderr of one script run plus its exit outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit: ExitOutcome,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit: ExitOutcome::Success,
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit: ExitOutcome::Failed(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit == ExitOutcome::Success
    }
}

/// Runs the external validation command.
///
/// Failing to start the process is reported through [`ExitOutcome::Failed`],
/// never as an error: every run produces classifiable output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> CommandOutput;
}

/// Spawns the configured script, optionally under `sudo`.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    script: PathBuf,
    working_dir: Option<PathBuf>,
    use_sudo: bool,
}

impl ScriptRunner {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            working_dir: None,
            use_sudo: false,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            script: config.script_path.clone(),
            working_dir: config.working_dir.clone(),
            use_sudo: config.use_sudo,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg(&self.script);
            c
        } else {
            Command::new(&self.script)
        };

        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // cancelling the executor drops the run future and must take the script down with it
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for ScriptRunner {
    async fn run(&self, args: &[String]) -> CommandOutput {
        tracing::info!(script = %self.script.display(), ?args, sudo = self.use_sudo, "Starting validation script");

        let mut child = match self.command(args).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(script = %self.script.display(), error = %e, "Failed to spawn script");
                return CommandOutput::failed(
                    String::new(),
                    format!("failed to spawn {}: {}", self.script.display(), e),
                );
            }
        };

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);
        let output = collect_merged(stdout, stderr).await;

        match child.wait().await {
            Ok(status) if status.success() => CommandOutput::success(output),
            Ok(status) => {
                let error = describe_exit(status);
                tracing::warn!(script = %self.script.display(), %error, "Script exited unsuccessfully");
                CommandOutput::failed(output, error)
            }
            Err(e) => CommandOutput::failed(output, format!("failed to wait for script: {}", e)),
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("script execution failed: exit status {}", code),
        None => "script execution failed: terminated by signal".to_string(),
    }
}

async fn read_chunk<R>(reader: &mut Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut chunk = Vec::new();
    if let Some(r) = reader {
        r.read_until(b'\n', &mut chunk).await?;
    }
    Ok(chunk)
}

/// Append one chunk to `merged`; false once the stream is done.
fn append_chunk(
    merged: &mut Vec<u8>,
    chunk: std::io::Result<Vec<u8>>,
    stream: &'static str,
) -> bool {
    match chunk {
        Ok(chunk) if chunk.is_empty() => false,
        Ok(chunk) => {
            tracing::debug!(stream, "{}", String::from_utf8_lossy(&chunk).trim_end());
            merged.extend_from_slice(&chunk);
            true
        }
        Err(e) => {
            tracing::warn!(stream, error = %e, "Failed to read script output, stream truncated");
            false
        }
    }
}

/// Interleave both pipes chunk by chunk (one line each) in arrival order.
///
/// Bytes are kept as written, including `\r` and a missing final newline.
/// Invalid UTF-8 is replaced, never a reason to stop reading.
async fn collect_merged<O, E>(mut stdout: Option<O>, mut stderr: Option<E>) -> String
where
    O: AsyncBufRead + Unpin,
    E: AsyncBufRead + Unpin,
{
    let mut merged = Vec::new();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            chunk = read_chunk(&mut stdout), if stdout.is_some() => {
                if !append_chunk(&mut merged, chunk, "stdout") {
                    stdout = None;
                }
            }
            chunk = read_chunk(&mut stderr), if stderr.is_some() => {
                if !append_chunk(&mut merged, chunk, "stderr") {
                    stderr = None;
                }
            }
        }
    }

    String::from_utf8_lossy(&merged).into_owned()
}
