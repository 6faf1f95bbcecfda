//! Command execution abstraction for testability.
//!
//! Every enforcement tool (`nft`, `ipset`, `iptables`, `firewall-cmd`, user
//! scripts) is invoked through [`CommandExecutor`], so unit tests can mock the
//! system without touching the kernel. The real executor runs each command
//! under a hard timeout so a stalled tool cannot block its caller forever.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::AclError;

/// Default timeout for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

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

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given stderr and exit code.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }
}

/// Extra process environment for a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandEnv {
    /// Variables appended to the inherited environment
    pub vars: Vec<(String, String)>,
    /// Working directory, inherited when `None`
    pub cwd: Option<PathBuf>,
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with the given arguments.
    ///
    /// A missing executable yields [`AclError::ToolNotFound`] and an expired
    /// timeout yields [`AclError::Timeout`]; a non-zero exit is *not* an
    /// error and is reported through [`CommandOutput::success`].
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Execute a command with additional environment variables.
    async fn execute_with_env(
        &self,
        cmd: &str,
        args: &[String],
        env: &CommandEnv,
    ) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone)]
pub struct RealCommandExecutor {
    timeout: Duration,
}

impl RealCommandExecutor {
    /// Create a new RealCommandExecutor with the default timeout
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }

    /// Create an executor that kills commands running longer than `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, mut command: Command, program: &str) -> Result<CommandOutput> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AclError::ToolNotFound(program.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(AclError::Timeout {
                    program: program.to_string(),
                    secs: self.timeout.as_secs(),
                }
                .into())
            }
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        };
        debug!("{} exited with {:?}", program, result.code);
        Ok(result)
    }
}

impl Default for RealCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for RealCommandExecutor {
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let mut command = Command::new(cmd);
        command.args(args);
        self.run(command, cmd).await
    }

    async fn execute_with_env(
        &self,
        cmd: &str,
        args: &[String],
        env: &CommandEnv,
    ) -> Result<CommandOutput> {
        let mut command = Command::new(cmd);
        command.args(args);
        command.envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(ref cwd) = env.cwd {
            command.current_dir(cwd);
        }
        self.run(command, cmd).await
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// This is needed because mockall has issues with lifetimes in `&[&str]`,
/// so we use `&[String]` in the trait signature instead.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run a command and turn a non-zero exit into an error carrying stderr.
pub async fn exec_checked<E: CommandExecutor + ?Sized>(
    executor: &E,
    cmd: &str,
    args: &[&str],
) -> Result<String> {
    let output = executor.execute(cmd, &args_to_strings(args)).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        anyhow::bail!("{} {} failed: {}", cmd, args.join(" "), output.stderr.trim())
    }
}
