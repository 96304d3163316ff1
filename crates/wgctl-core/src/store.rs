//! Config Store
//!
//! Owns the registry file and performs every mutation as one critical
//! section:
//!
//! ```text
//! lock ─▶ read ─▶ parse ─▶ mutate ─▶ rewrite ─▶ reload ─▶ unlock
//! ```
//!
//! Two locks are held for the whole cycle: an async mutex around the
//! single open handle (callers in this process) and an exclusive
//! `flock` on the file (other processes, e.g. a second CLI invocation).
//! All peers share the one lock.

use crate::keys::PublicKey;
use crate::lock::{self, LockError};
use crate::registry::{PeerEntry, PeerOp, Registry, RegistryError};
use crate::reload::{ReloadError, ServiceReloader};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Open registry file; only reachable through the store's mutex
struct RegistryFile {
    path: PathBuf,
    file: File,
}

impl RegistryFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn read(mut file: &File) -> io::Result<Registry> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)?;
        Ok(Registry::parse(&content))
    }

    fn write(mut file: &File, registry: &Registry) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(registry.render().as_bytes())?;
        file.sync_data()
    }
}

/// Lock-protected owner of the peer registry
pub struct ConfigStore {
    file: Mutex<RegistryFile>,
    reloader: ServiceReloader,
    keepalive: u16,
    lock_timeout: Duration,
}

impl ConfigStore {
    /// Open the registry at `path`. The file must already exist.
    pub fn open(
        path: impl AsRef<Path>,
        reloader: ServiceReloader,
        keepalive: u16,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let file = RegistryFile::open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
            reloader,
            keepalive,
            lock_timeout,
        })
    }

    /// Apply one operation to the registry and reload the daemon.
    ///
    /// Precondition failures leave the file untouched. A
    /// [`StoreError::Reload`] means the file *was* rewritten but the
    /// daemon has not picked it up; retry with [`ConfigStore::reload`],
    /// not by repeating the edit.
    pub async fn apply(&self, op: &PeerOp, key: &PublicKey) -> Result<(), StoreError> {
        let handle = self.file.lock().await;
        let started = Instant::now();

        let result = self.critical_section(&handle, op, key).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        };
        debug!(target: "wgctl::metric", op = op.name(), outcome, elapsed_ms, "Registry critical section");

        match &result {
            Ok(()) => info!(op = op.name(), peer = %key.short(), "Peer updated"),
            Err(StoreError::Reload(e)) => {
                error!(op = op.name(), peer = %key.short(), error = %e, "Registry rewritten but daemon reload failed")
            }
            Err(StoreError::Registry(RegistryError::Structural(reason))) => {
                error!(op = op.name(), peer = %key.short(), path = %handle.path.display(), %reason, "Registry is corrupt")
            }
            Err(e) => warn!(op = op.name(), peer = %key.short(), error = %e, "Peer update rejected"),
        }
        result
    }

    async fn critical_section(&self, handle: &RegistryFile, op: &PeerOp, key: &PublicKey) -> Result<(), StoreError> {
        let guard = lock::lock_exclusive(&handle.file, self.lock_timeout).await?;

        let mut registry = RegistryFile::read(guard.file())?;
        registry.apply(op, key, self.keepalive)?;
        RegistryFile::write(guard.file(), &registry)?;

        self.reloader.reload(op.name(), Some(key)).await?;
        Ok(())
    }

    /// List all peers under the registry lock.
    pub async fn peers(&self) -> Result<Vec<PeerEntry>, StoreError> {
        let handle = self.file.lock().await;
        let guard = lock::lock_exclusive(&handle.file, self.lock_timeout).await?;
        Ok(RegistryFile::read(guard.file())?.peers())
    }

    /// Re-run only the daemon reload, under the registry lock.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let handle = self.file.lock().await;
        let _guard = lock::lock_exclusive(&handle.file, self.lock_timeout).await?;
        self.reloader.reload("reload", None).await?;
        Ok(())
    }
}

/// Config store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// File mutated, daemon not reloaded
    #[error("Registry updated but daemon reload failed: {0}")]
    Reload(#[from] ReloadError),

    #[error("Registry lock: {0}")]
    Lock(#[from] LockError),

    #[error("Registry I/O: {0}")]
    Io(#[from] io::Error),

    /// Remote host CLI failed with an exit code outside the contract
    #[error("Remote registry command failed (exit {exit_code:?}): {stderr}")]
    Remote { exit_code: Option<i32>, stderr: String },

    #[error("Remote registry transport: {0}")]
    Transport(#[from] crate::remote::TransportError),

    #[error("Malformed remote peer list: {0}")]
    MalformedPeerList(#[from] serde_json::Error),
}

/// Process exit codes shared by the host CLI and [`crate::control::RemoteControl`]
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const DUPLICATE_PEER: i32 = 3;
    pub const ALREADY_BANNED: i32 = 4;
    pub const ALREADY_ACTIVE: i32 = 5;
    pub const PEER_NOT_FOUND: i32 = 6;
    pub const STRUCTURAL: i32 = 7;
    pub const RELOAD_FAILED: i32 = 8;
}

impl StoreError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Registry(RegistryError::DuplicatePeer(_)) => "duplicate_peer",
            StoreError::Registry(RegistryError::AlreadyBanned(_)) => "already_banned",
            StoreError::Registry(RegistryError::AlreadyActive(_)) => "already_active",
            StoreError::Registry(RegistryError::PeerNotFound(_)) => "peer_not_found",
            StoreError::Registry(RegistryError::Structural(_)) => "structural",
            StoreError::Registry(_) => "invalid_request",
            StoreError::Reload(_) => "reload_failed",
            StoreError::Lock(_) => "lock",
            StoreError::Io(_) => "io",
            StoreError::Remote { .. } | StoreError::Transport(_) | StoreError::MalformedPeerList(_) => "remote",
        }
    }

    /// Exit code reported by the host CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::Registry(RegistryError::DuplicatePeer(_)) => exit_code::DUPLICATE_PEER,
            StoreError::Registry(RegistryError::AlreadyBanned(_)) => exit_code::ALREADY_BANNED,
            StoreError::Registry(RegistryError::AlreadyActive(_)) => exit_code::ALREADY_ACTIVE,
            StoreError::Registry(RegistryError::PeerNotFound(_)) => exit_code::PEER_NOT_FOUND,
            StoreError::Registry(RegistryError::Structural(_)) => exit_code::STRUCTURAL,
            StoreError::Reload(_) => exit_code::RELOAD_FAILED,
            _ => exit_code::FAILURE,
        }
    }

    /// Rebuild the error a remote CLI run reported through its exit code.
    pub fn from_exit(code: Option<i32>, key: &PublicKey, stderr: &str) -> Self {
        let stderr = stderr.trim().to_string();
        match code {
            Some(exit_code::DUPLICATE_PEER) => RegistryError::DuplicatePeer(*key).into(),
            Some(exit_code::ALREADY_BANNED) => RegistryError::AlreadyBanned(*key).into(),
            Some(exit_code::ALREADY_ACTIVE) => RegistryError::AlreadyActive(*key).into(),
            Some(exit_code::PEER_NOT_FOUND) => RegistryError::PeerNotFound(*key).into(),
            Some(exit_code::STRUCTURAL) => RegistryError::Structural(stderr).into(),
            Some(exit_code::RELOAD_FAILED) => ReloadError::Failed {
                exit_code: None,
                stderr,
            }
            .into(),
            _ => StoreError::Remote {
                exit_code: code,
                stderr,
            },
        }
    }

    /// True for the "peer already in the requested state" answers
    pub fn is_already_applied(&self, op: &PeerOp) -> bool {
        matches!(
            (op, self),
            (PeerOp::Ban, StoreError::Registry(RegistryError::AlreadyBanned(_)))
                | (PeerOp::Unban, StoreError::Registry(RegistryError::AlreadyActive(_)))
        )
    }
}
