//! Peer Provisioner
//!
//! Creates key material and addresses for new peers on the VPN host.
//!
//! # Address counter
//!
//! The next free host suffix comes from a counter file on the VPN host,
//! incremented under `flock(1)`. This is a best-effort monotonic counter,
//! not compare-and-swap: it is only as atomic as the remote shell
//! commands are, and callers must tolerate the rare skew if several
//! provisioning calls race across hosts or bypass the lock.

use crate::control::PeerControl;
use crate::keys::{PrivateKey, ProvisionedKeyPair, PublicKey};
use crate::registry::{AllowedIp, PeerOp};
use crate::remote::{CommandOutput, CommandRunner, TransportError};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

// `printf` is a shell builtin, so the key stays out of /proc/*/cmdline
const KEYGEN_COMMAND: &str = r#"k=$(wg genkey) && printf '%s\n' "$k" && printf '%s\n' "$k" | wg pubkey"#;

/// Provisions keys and addresses through a remote command session
pub struct PeerProvisioner {
    runner: Arc<dyn CommandRunner>,
    counter_path: String,
}

impl PeerProvisioner {
    /// `counter_path` is the counter file on the VPN host.
    pub fn new(runner: Arc<dyn CommandRunner>, counter_path: impl Into<String>) -> Self {
        Self {
            runner,
            counter_path: counter_path.into(),
        }
    }

    async fn run_checked(&self, step: &'static str, command: &str) -> Result<CommandOutput, ProvisionError> {
        let output = self
            .runner
            .run(command)
            .await
            .map_err(|source| ProvisionError::Transport { step, source })?;

        if !output.success() {
            return Err(ProvisionError::CommandFailed {
                step,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Generate a key pair on the VPN host.
    ///
    /// One session runs `wg genkey` and feeds the result to `wg pubkey`
    /// through a shell variable, so the private key never appears in any
    /// argv. Output is the private key line then the public key line. The
    /// public key is checked against the one derived locally.
    pub async fn provision(&self) -> Result<ProvisionedKeyPair, ProvisionError> {
        let output = self.run_checked("keygen", KEYGEN_COMMAND).await?;
        let mut lines = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty());

        let private = lines
            .next()
            .and_then(|line| PrivateKey::from_base64(line).ok())
            .ok_or(ProvisionError::MalformedOutput { step: "keygen" })?;
        let public = lines
            .next()
            .and_then(|line| PublicKey::from_base64(line).ok())
            .ok_or(ProvisionError::MalformedOutput { step: "keygen" })?;

        let pair = ProvisionedKeyPair::from_private(private);
        if pair.public != public {
            return Err(ProvisionError::KeyMismatch);
        }
        Ok(pair)
    }

    /// Increment the remote counter and return its new value.
    pub async fn next_address_suffix(&self) -> Result<u32, ProvisionError> {
        let path = &self.counter_path;
        let command = format!(
            "mkdir -p $(dirname {path}) && touch {path} && flock {path} sh -c 'n=$(cat {path}); echo $((${{n:-0}} + 1)) > {path}; cat {path}'"
        );
        let output = self.run_checked("counter", &command).await?;

        output
            .first_line()
            .and_then(|line| line.parse().ok())
            .ok_or(ProvisionError::MalformedOutput { step: "counter" })
    }

    /// Full new-peer flow: keys, address, then registry `Add`.
    ///
    /// Fails as a whole; on a registry failure the generated keys are
    /// dropped and the consumed counter value is simply skipped.
    pub async fn onboard(&self, pool: &AddressPool, control: &dyn PeerControl) -> Result<NewPeer, OnboardError> {
        let keys = self.provision().await?;
        let suffix = self.next_address_suffix().await?;
        let address = pool.address(suffix)?;

        let allowed = AllowedIp::host(IpAddr::V4(address));
        if let Err(e) = control.apply(&PeerOp::Add(vec![allowed]), &keys.public).await {
            error!(peer = %keys.public.short(), %address, error = %e, "New peer could not be registered");
            return Err(e.into());
        }

        info!(peer = %keys.public.short(), %address, "New peer provisioned");
        Ok(NewPeer { keys, address })
    }
}

/// Result of a successful onboarding
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub keys: ProvisionedKeyPair,
    pub address: Ipv4Addr,
}

impl NewPeer {
    pub fn allowed_ip(&self) -> AllowedIp {
        AllowedIp::host(IpAddr::V4(self.address))
    }
}

/// IPv4 range peers are allocated from; suffix `n` maps to `network + n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AddressPool {
    network: Ipv4Addr,
    prefix: u8,
}

impl AddressPool {
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self, PoolError> {
        if !(1..=30).contains(&prefix) {
            return Err(PoolError::InvalidPrefix(prefix));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(network) & mask),
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of usable host suffixes (excludes network and broadcast)
    pub fn capacity(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 2
    }

    /// Host address for `suffix`.
    pub fn address(&self, suffix: u32) -> Result<Ipv4Addr, PoolError> {
        if suffix == 0 || suffix > self.capacity() {
            return Err(PoolError::Exhausted {
                suffix,
                pool: self.to_string(),
            });
        }
        Ok(Ipv4Addr::from(u32::from(self.network) + suffix))
    }
}

impl Default for AddressPool {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 1, 0, 0),
            prefix: 16,
        }
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for AddressPool {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (net, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| PoolError::Invalid(s.to_string()))?;
        let network = net.parse().map_err(|_| PoolError::Invalid(s.to_string()))?;
        let prefix = prefix.parse().map_err(|_| PoolError::Invalid(s.to_string()))?;
        Self::new(network, prefix)
    }
}

impl From<AddressPool> for String {
    fn from(pool: AddressPool) -> Self {
        pool.to_string()
    }
}

impl TryFrom<String> for AddressPool {
    type Error = PoolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Remote provisioning failure. Nothing was persisted; safe to retry.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Provisioning step '{step}' could not reach the VPN host: {source}")]
    Transport {
        step: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Provisioning step '{step}' exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        step: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Provisioning step '{step}' returned malformed output")]
    MalformedOutput { step: &'static str },

    #[error("Remote public key does not match the private key")]
    KeyMismatch,
}

/// Address pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid address pool '{0}' (expected a.b.c.d/prefix)")]
    Invalid(String),

    #[error("Address pool prefix /{0} out of range")]
    InvalidPrefix(u8),

    #[error("Suffix {suffix} is outside address pool {pool}")]
    Exhausted { suffix: u32, pool: String },
}

/// New-peer creation errors
#[derive(Debug, thiserror::Error)]
pub enum OnboardError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Peer registration failed: {0}")]
    Register(#[from] StoreError),
}
