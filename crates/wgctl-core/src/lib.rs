//! wgctl - WireGuard peer registry control
//!
//! Keeps the peer registry of a WireGuard host consistent with the
//! subscription state kept elsewhere:
//! - Lock-protected ban/unban/add/delete of peer blocks with a daemon
//!   reload after every change
//! - Remote key and address provisioning for new peers
//! - A periodic reconciler that settles pending freeze requests
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── controller ─────────────────┐
//! │                                             │
//! │  RecordStore ◀──▶ FreezeReconciler          │
//! │                        │                    │
//! │  PeerProvisioner       ▼ PeerControl        │
//! │        │          RemoteControl             │
//! └────────│───────────────│────────────────────┘
//!          │ CommandRunner │ (ssh)
//!          ▼               ▼
//! ┌──────────────── VPN host ───────────────────┐
//! │  wg genkey/pubkey   wgctl peer ... ──▶ ConfigStore
//! │  counter file                       ├─▶ registry file (flock)
//! │                                     └─▶ ServiceReloader
//! └─────────────────────────────────────────────┘
//! ```

mod config;
mod control;
mod counter;
mod freeze;
mod keys;
mod lock;
mod provision;
mod reconciler;
mod registry;
mod reload;
mod remote;
mod store;

pub use config::{
    ConfigError, PoolSettings, ReconcilerSettings, RegistrySettings, ReloadSettings, RemoteSettings, Settings,
};
pub use control::{PeerControl, RemoteControl};
pub use counter::{CounterError, increment_counter};
pub use freeze::{FreezeEvent, FreezeState, TransitionError};
pub use keys::{ENCODED_KEY_LEN, KeyError, PrivateKey, ProvisionedKeyPair, PublicKey};
pub use lock::{FileLock, LockError, lock_exclusive};
pub use provision::{AddressPool, NewPeer, OnboardError, PeerProvisioner, PoolError, ProvisionError};
pub use reconciler::{
    AttemptError, AuditReport, FreezeReconciler, FreezeRecord, ReconcilerConfig, RecordId, RecordStore, TickReport,
};
pub use registry::{
    AllowedIp, BlockState, PeerEntry, PeerOp, Registry, RegistryError, block_state, locate_block, locate_blocks,
};
pub use reload::{ReloadError, ServiceReloader};
pub use remote::{CommandOutput, CommandRunner, LocalShell, SshRunner, SshTarget, TransportError};
pub use store::{ConfigStore, StoreError, exit_code};
