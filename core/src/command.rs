//! External tool execution.
//!
//! Everything that shells out (partitioning, encryption, TPM, pool status)
//! goes through [`CommandRunner`] so workflows can be driven against a fake.

use crate::StrataError;
use async_trait::async_trait;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stderr if the tool wrote anything there, stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// True if either stream mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

pub fn render_command(program: &str, args: &[&str]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. A non-zero exit is not an error here.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, StrataError>;

    /// Run `program` and treat a non-zero exit as [`StrataError::SubprocessFailure`].
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, StrataError> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(StrataError::SubprocessFailure {
                command: render_command(program, args),
                status: output.status,
                diagnostic: output.diagnostic().to_string(),
            })
        }
    }
}

/// Runs tools on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, StrataError> {
        use tokio::process::Command;

        let binary = which::which(program)
            .map_err(|_| StrataError::ToolNotFound(program.to_string()))?;

        log::debug!("Running {}", render_command(program, args));

        let output = Command::new(binary)
            .args(args)
            .kill_on_drop(false)
            .output()
            .await
            .map_err(StrataError::IoError)?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
