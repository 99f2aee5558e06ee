//! Running native firewall tools
//!
//! Every privileged process goes through [`ToolRunner`]: it resolves the
//! elevation wrapper, feeds stdin, enforces the per-invocation timeout and
//! turns failures into the crate's error taxonomy. A missing binary is
//! [`Error::BackendUnavailable`]; a non-zero exit is [`Error::Backend`].

use crate::core::error::{BackendErrorPattern, Error, Result};
use crate::elevation::{Tool, create_elevated_command};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// Captured result of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs a tool and returns its output whatever the exit status.
    ///
    /// The child is killed if the timeout expires.
    pub async fn run(&self, tool: Tool, args: &[&str], stdin: Option<&[u8]>) -> Result<ToolOutput> {
        if !tool.is_available() {
            return Err(Error::BackendUnavailable {
                backend: tool.to_string(),
                reason: format!("'{tool}' not found in PATH"),
            });
        }

        debug!("Running {tool} {}", args.join(" "));

        let mut child = create_elevated_command(tool, args)?
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {tool}: {e}");
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::BackendUnavailable {
                        backend: tool.to_string(),
                        reason: e.to_string(),
                    }
                } else {
                    Error::Internal(format!("Failed to spawn {tool}: {e}"))
                }
            })?;

        let interaction = async {
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input).await?;
                // Close stdin so the tool sees EOF
                drop(pipe);
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, interaction)
            .await
            .map_err(|_| {
                warn!("{tool} exceeded {:?}, killed", self.timeout);
                Error::Timeout(format!("{tool} {}", args.join(" ")))
            })??;

        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// Runs a tool and fails on a non-zero exit status.
    pub async fn run_checked(
        &self,
        tool: Tool,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<ToolOutput> {
        let output = self.run(tool, args, stdin).await?;
        if output.success() {
            return Ok(output);
        }
        Err(failure(tool, &output))
    }
}

/// Builds the error for a failed invocation and logs its translation.
pub fn failure(tool: Tool, output: &ToolOutput) -> Error {
    let stderr = output.stderr.trim().to_string();
    let translation = BackendErrorPattern::match_error(&stderr);
    error!("{tool} failed: {}", translation.user_message);
    for suggestion in &translation.suggestions {
        debug!("  suggestion: {suggestion}");
    }

    let message = stderr
        .lines()
        .next()
        .map_or_else(
            || format!("exited with status {:?}", output.exit_code),
            str::to_string,
        );

    Error::Backend {
        tool: tool.to_string(),
        message,
        stderr: (!stderr.is_empty()).then_some(stderr),
        exit_code: output.exit_code,
    }
}
