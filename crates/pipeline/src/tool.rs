use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {secs:.1}s and was killed")]
    Timeout { tool: String, secs: f64 },

    #[error("{tool} exited with code {code}: {stderr}")]
    Failed { tool: String, code: i32, stderr: String },

    #[error("I/O error while talking to {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a successful run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// An external binary invoked with a hard timeout. The child is killed on
/// every exit path: normal return, timeout, or the future being dropped.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    bin: PathBuf,
    timeout: Duration,
}

impl ExternalTool {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn name(&self) -> String {
        self.bin
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tool")
            .to_string()
    }

    /// Run to completion, capturing stdout as bytes and stderr as text
    pub async fn run(&self, args: &[String]) -> Result<ToolOutput, ToolError> {
        let tool = self.name();
        debug!("Executing {}: {}", self.bin.display(), args.join(" "));

        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| ToolError::Io {
            tool: tool.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| ToolError::Io {
            tool: tool.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "stderr not captured"),
        })?;

        // Drain both pipes while waiting so a chatty child never blocks on a full pipe
        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(result) => result.map_err(|source| ToolError::Io {
                tool: tool.clone(),
                source,
            })?,
            Err(_) => {
                // kill() also reaps, so the pipes close and the readers finish
                let _ = child.kill().await;
                stdout_handle.abort();
                stderr_handle.abort();
                return Err(ToolError::Timeout {
                    tool,
                    secs: self.timeout.as_secs_f64(),
                });
            }
        };

        let stdout = join_pipe(&tool, stdout_handle).await?;
        let stderr = String::from_utf8_lossy(&join_pipe(&tool, stderr_handle).await?).into_owned();

        if !status.success() {
            return Err(ToolError::Failed {
                tool,
                code: status.code().unwrap_or(-1),
                stderr: last_lines(&stderr, 8),
            });
        }

        debug!("{} completed, {} bytes on stdout", tool, stdout.len());
        Ok(ToolOutput { stdout, stderr })
    }
}

async fn join_pipe(
    tool: &str,
    handle: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, ToolError> {
    let io_err = |source| ToolError::Io {
        tool: tool.to_string(),
        source,
    };
    handle
        .await
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(io_err)
}

/// Keep error messages short; ffmpeg puts the useful part at the end
fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
