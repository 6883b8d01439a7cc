//! External command execution
//!
//! Every side effect on the host (container runtime, `tc`, `ip`, `ss`) goes
//! through [`CommandExecutor`], so the lifecycle and shaping layers can be
//! driven by a scripted host in tests.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors that can occur while running an external command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' exited with status {status}: {stderr}")]
    NonZero {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `-1` when terminated by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stderr followed by stdout, trimmed; used for error messages
    pub fn combined(&self) -> String {
        let mut text = self.stderr.trim().to_string();
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stdout);
        }
        text
    }

    /// Turn a non-zero exit into [`ExecError::NonZero`]
    pub fn into_result(self, program: &str, args: &[String]) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::NonZero {
                command: render_command(program, args),
                status: self.status,
                stderr: self.combined(),
            })
        }
    }
}

/// Render a command line for logs and error messages
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs one external command to completion
///
/// Implementations return `Ok` for any command that ran to completion, even
/// with a non-zero exit status; callers decide which failures are benign.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;
}

/// Executor backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        debug!("exec: {}", render_command(program, args));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|e| ExecError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    command: render_command(program, args),
                    timeout,
                })
            }
        };

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            status: 1,
            stdout: "partial\n".to_string(),
            stderr: "RTNETLINK answers: File exists\n".to_string(),
        };
        assert_eq!(out.combined(), "RTNETLINK answers: File exists\npartial");
        assert_eq!(CommandOutput::ok("  hi ").combined(), "hi");
    }

    #[test]
    fn test_into_result_non_zero() {
        let err = CommandOutput::failed(2, "boom")
            .into_result("tc", &args(&["qdisc", "show"]))
            .unwrap_err();
        assert_eq!(
            err,
            ExecError::NonZero {
                command: "tc qdisc show".to_string(),
                status: 2,
                stderr: "boom".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_process_executor_captures_stdout() {
        let exec = ProcessExecutor::new();
        let out = exec
            .run("sh", &args(&["-c", "echo hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_process_executor_reports_exit_status() {
        let exec = ProcessExecutor::new();
        let out = exec
            .run("sh", &args(&["-c", "echo nope >&2; exit 3"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stderr.trim(), "nope");
    }

    #[tokio::test]
    async fn test_process_executor_timeout() {
        let exec = ProcessExecutor::new();
        let result = exec
            .run("sleep", &args(&["5"]), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_process_executor_missing_binary() {
        let exec = ProcessExecutor::new();
        let result = exec
            .run("definitely-not-a-binary-xyz", &[], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ExecError::Spawn { .. })));
    }
}
