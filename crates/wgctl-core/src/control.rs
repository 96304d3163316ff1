//! Peer control seam
//!
//! The reconciler and the onboarding flow only need "apply this change",
//! "list peers" and "redo the reload". [`ConfigStore`] provides them on
//! the VPN host itself; [`RemoteControl`] provides them from the
//! controller by running the `wgctl` host CLI through a
//! [`CommandRunner`] and decoding its exit codes.

use crate::keys::PublicKey;
use crate::registry::{PeerEntry, PeerOp};
use crate::remote::CommandRunner;
use crate::store::{ConfigStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait PeerControl: Send + Sync {
    /// Apply one registry operation and reload the daemon
    async fn apply(&self, op: &PeerOp, key: &PublicKey) -> Result<(), StoreError>;

    /// Current peers, active and banned
    async fn peers(&self) -> Result<Vec<PeerEntry>, StoreError>;

    /// Reload the daemon without touching the registry
    async fn reload(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl PeerControl for ConfigStore {
    async fn apply(&self, op: &PeerOp, key: &PublicKey) -> Result<(), StoreError> {
        ConfigStore::apply(self, op, key).await
    }

    async fn peers(&self) -> Result<Vec<PeerEntry>, StoreError> {
        ConfigStore::peers(self).await
    }

    async fn reload(&self) -> Result<(), StoreError> {
        ConfigStore::reload(self).await
    }
}

/// Drives the host CLI (`wgctl peer ...`) over a command transport
pub struct RemoteControl {
    runner: Arc<dyn CommandRunner>,
    /// Command prefix invoking the host CLI, e.g. `sudo -n wgctl`
    program: String,
}

impl RemoteControl {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    fn peer_command(&self, op: &PeerOp, key: &PublicKey) -> String {
        match op {
            PeerOp::Add(ips) => {
                let ips: Vec<String> = ips.iter().map(ToString::to_string).collect();
                format!("{} peer add '{}' --allowed-ips {}", self.program, key, ips.join(" "))
            }
            PeerOp::Delete => format!("{} peer del '{}'", self.program, key),
            PeerOp::Ban => format!("{} peer ban '{}'", self.program, key),
            PeerOp::Unban => format!("{} peer unban '{}'", self.program, key),
        }
    }
}

#[async_trait]
impl PeerControl for RemoteControl {
    async fn apply(&self, op: &PeerOp, key: &PublicKey) -> Result<(), StoreError> {
        let output = self.runner.run(&self.peer_command(op, key)).await?;
        debug!(op = op.name(), peer = %key.short(), exit_code = ?output.exit_code, "Remote peer command");

        if output.success() {
            Ok(())
        } else {
            Err(StoreError::from_exit(output.exit_code, key, &output.stderr))
        }
    }

    async fn peers(&self) -> Result<Vec<PeerEntry>, StoreError> {
        let output = self
            .runner
            .run(&format!("{} peer list --json", self.program))
            .await?;
        if !output.success() {
            return Err(StoreError::Remote {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(serde_json::from_str(output.stdout.trim())?)
    }

    async fn reload(&self) -> Result<(), StoreError> {
        let output = self.runner.run(&format!("{} reload", self.program)).await?;
        if output.success() {
            return Ok(());
        }
        Err(crate::reload::ReloadError::Failed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }
        .into())
    }
}
