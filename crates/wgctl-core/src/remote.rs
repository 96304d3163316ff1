//! Command execution transport
//!
//! Everything that talks to the VPN host goes through [`CommandRunner`]:
//! key generation, the address counter, the host CLI and the daemon
//! reload. Implementations:
//!
//! - [`LocalShell`]: `sh -c` on this machine (used on the VPN host itself)
//! - [`SshRunner`]: OpenSSH client in batch mode, one session per call
//!
//! Every call is bounded by a timeout; a timed-out child is killed and the
//! call reported as failed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (`None` if killed by a signal)
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// First non-empty stdout line, trimmed
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Runs a shell command and collects its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`. A non-zero exit is *not* an error at this level;
    /// only spawn failures and timeouts are.
    async fn run(&self, command: &str) -> Result<CommandOutput, TransportError>;
}

async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput, TransportError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = cmd.spawn().map_err(TransportError::Spawn)?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(TransportError::Spawn)?,
        Err(_) => return Err(TransportError::Timeout(timeout)),
    };

    debug!(
        exit_code = ?output.status.code(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Command finished"
    );

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

/// Runs commands through `sh -c` on the local host
#[derive(Debug, Clone)]
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for LocalShell {
    async fn run(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_with_timeout(cmd, self.timeout).await
    }
}

/// SSH connection parameters
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key for authentication (agent/default keys when `None`)
    pub identity_file: Option<PathBuf>,
}

/// Runs commands on a remote host with the OpenSSH client.
///
/// Each call opens its own session; there is no connection pool, so
/// concurrent callers never share channel state.
#[derive(Debug, Clone)]
pub struct SshRunner {
    target: SshTarget,
    timeout: Duration,
}

impl SshRunner {
    pub fn new(target: SshTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.timeout.as_secs().max(1)))
            .arg("-p")
            .arg(self.target.port.to_string());
        if let Some(identity) = &self.target.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.target.user, self.target.host))
            .arg("--")
            .arg(remote);
        cmd
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let output = run_with_timeout(self.command(command), self.timeout).await?;

        // ssh reserves 255 for its own connection/auth failures
        if output.exit_code == Some(255) {
            return Err(TransportError::Connection {
                host: self.target.host.clone(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to run command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("SSH connection to {host} failed: {stderr}")]
    Connection { host: String, stderr: String },
}
