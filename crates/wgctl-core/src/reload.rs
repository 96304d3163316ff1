//! Service Reloader
//!
//! Tells the WireGuard daemon to re-read the registry after a mutation
//! and keeps an audit trail in the alert log. The alert log has its own
//! lock, separate from the registry lock, so reloads stay serialized even
//! when several registries share one log.

use crate::keys::PublicKey;
use crate::lock::{self, LockError};
use crate::remote::{CommandRunner, TransportError};
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Reloads the VPN daemon
pub struct ServiceReloader {
    runner: Arc<dyn CommandRunner>,
    command: String,
    alert_log: PathBuf,
    lock_timeout: Duration,
}

impl ServiceReloader {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command: impl Into<String>,
        alert_log: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            command: command.into(),
            alert_log: alert_log.into(),
            lock_timeout,
        }
    }

    pub fn alert_log(&self) -> &Path {
        &self.alert_log
    }

    /// Run the reload command.
    ///
    /// `op` and `peer` only label the audit entry; `peer` is `None` for
    /// a bare reload retry.
    pub async fn reload(&self, op: &str, peer: Option<&PublicKey>) -> Result<(), ReloadError> {
        let peer = peer.map_or_else(|| "-".to_string(), PublicKey::short);

        let log = open_append(&self.alert_log)?;
        let guard = lock::lock_exclusive(&log, self.lock_timeout).await?;
        let mut out = guard.file();

        write!(
            out,
            "{} :: {} :: {} :: ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            op,
            peer
        )?;

        let started = Instant::now();
        let result = self.runner.run(&self.command).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) if output.success() => {
                writeln!(out, "ok ({elapsed_ms} ms)")?;
                info!(op, peer = %peer, elapsed_ms, "Daemon reloaded");
                Ok(())
            }
            Ok(output) => {
                let stderr = output.stderr.trim().to_string();
                writeln!(out, "exit {:?}: {}", output.exit_code, stderr)?;
                error!(op, peer = %peer, exit_code = ?output.exit_code, %stderr, "Daemon reload failed");
                Err(ReloadError::Failed {
                    exit_code: output.exit_code,
                    stderr,
                })
            }
            Err(e) => {
                writeln!(out, "error: {e}")?;
                error!(op, peer = %peer, error = %e, "Daemon reload could not run");
                Err(ReloadError::Transport(e))
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Reload errors
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("Reload command failed with exit code {exit_code:?}: {stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },

    #[error("Reload command could not run: {0}")]
    Transport(#[from] TransportError),

    #[error("Alert log lock: {0}")]
    Lock(#[from] LockError),

    #[error("Alert log I/O: {0}")]
    Io(#[from] io::Error),
}
