//! Command execution abstraction for testability.
//!
//! Every controller reaches the OS (`ipset`, `iptables-save`, the setup
//! script) through [`CommandExecutor`], so unit tests can mock command
//! calls without running anything.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

/// Trait for command execution, allowing dependency injection for testing.
///
/// A non-zero exit is not an error at this level: callers inspect
/// [`CommandOutput::success`] and `stderr` themselves. `Err` means the
/// command could not be run at all.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with the given arguments.
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Execute a command, writing `stdin` to its standard input.
    async fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin: &str,
    ) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for RealCommandExecutor {
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    async fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_data.as_bytes()).await?;
            // Dropping stdin closes the pipe so the child sees EOF
        }

        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Build the program and argument list for a privileged invocation.
///
/// With `use_sudo` the real binary becomes the first argument of `sudo`.
pub fn privileged(use_sudo: bool, program: &str, args: &[&str]) -> (String, Vec<String>) {
    if use_sudo {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(program.to_string());
        full.extend(args.iter().map(|s| s.to_string()));
        ("sudo".to_string(), full)
    } else {
        (program.to_string(), args_to_strings(args))
    }
}

/// Run a command, failing if it does not finish within `limit`.
///
/// The child is killed when the timeout elapses (`kill_on_drop`).
pub async fn execute_with_timeout(
    executor: &dyn CommandExecutor,
    cmd: &str,
    args: &[String],
    limit: Duration,
) -> Result<CommandOutput> {
    match tokio::time::timeout(limit, executor.execute(cmd, args)).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{} timed out after {:?}", cmd, limit),
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes
/// `&[String]` instead.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
