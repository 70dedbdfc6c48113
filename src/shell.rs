//! Shell command execution.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::types::UpdateError;

/// Receives each line of standard output as it is produced.
pub type OutputCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub timeout: Duration,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<PathBuf>,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            env: None,
            cwd: None,
        }
    }
}

#[async_trait]
pub trait ShellExecutor: Send + Sync {
    /// Run a command to completion, returning its standard output.
    /// Non-zero exit and timeout are errors.
    async fn run(
        &self,
        request: &ShellRequest,
        on_output: Option<OutputCallback<'_>>,
    ) -> Result<String, UpdateError>;
}

/// Runs commands through `sh -c` on the tokio process driver.
#[derive(Debug, Default, Clone)]
pub struct TokioShell;

#[async_trait]
impl ShellExecutor for TokioShell {
    async fn run(
        &self,
        request: &ShellRequest,
        on_output: Option<OutputCallback<'_>>,
    ) -> Result<String, UpdateError> {
        debug!(command = %request.command, timeout = ?request.timeout, "Running shell command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &request.env {
            command.envs(env);
        }
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let execution = async move {
            let read_stdout = async {
                let mut collected = String::new();
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Some(line) = lines.next_line().await? {
                        if let Some(callback) = on_output {
                            callback(&line);
                        }
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                }
                Ok::<_, std::io::Error>(collected)
            };
            let read_stderr = async {
                let mut collected = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut collected).await;
                }
                collected
            };
            let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout?, stderr))
        };

        let (status, stdout, stderr) = tokio::time::timeout(request.timeout, execution)
            .await
            .map_err(|_| {
                UpdateError::Command(format!(
                    "Command `{}` timed out after {:?}",
                    request.command, request.timeout
                ))
            })??;

        if status.success() {
            return Ok(stdout);
        }

        let stderr = stderr.trim();
        Err(UpdateError::Command(if stderr.is_empty() {
            format!(
                "Command `{}` failed with status {}",
                request.command, status
            )
        } else {
            format!("Command `{}` failed: {}", request.command, stderr)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn captures_output_and_streams_lines() {
        let lines = Mutex::new(Vec::new());
        let callback = |line: &str| lines.lock().unwrap().push(line.to_string());
        let output = TokioShell
            .run(
                &ShellRequest::new("printf 'one\\ntwo\\n'", Duration::from_secs(5)),
                Some(&callback),
            )
            .await
            .expect("command");
        assert_eq!(output, "one\ntwo\n");
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn failure_reports_stderr() {
        let err = TokioShell
            .run(
                &ShellRequest::new("echo broken >&2; exit 3", Duration::from_secs(5)),
                None,
            )
            .await
            .expect_err("non-zero exit");
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn times_out() {
        let err = TokioShell
            .run(&ShellRequest::new("sleep 5", Duration::from_millis(100)), None)
            .await
            .expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }
}
