//! Settings
//!
//! One TOML file for both the host CLI and the controller side. Every
//! field has a default, so an empty file (or no file) is valid.
//!
//! ```toml
//! [registry]
//! path = "/etc/wireguard/wg1.conf"
//!
//! [remote]
//! host = "vpn.example.net"
//! user = "wgctl"
//!
//! [pool]
//! network = "10.1.0.0/16"
//! ```

use crate::control::RemoteControl;
use crate::provision::{AddressPool, PeerProvisioner};
use crate::reconciler::ReconcilerConfig;
use crate::reload::ServiceReloader;
use crate::remote::{CommandRunner, LocalShell, SshRunner, SshTarget};
use crate::store::{ConfigStore, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub registry: RegistrySettings,
    pub reload: ReloadSettings,
    pub remote: RemoteSettings,
    pub pool: PoolSettings,
    pub reconciler: ReconcilerSettings,
}

/// Peer registry on the VPN host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySettings {
    pub path: PathBuf,
    /// `PersistentKeepalive` written for new peers
    pub keepalive_secs: u16,
    pub lock_timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/wireguard/wg1.conf"),
            keepalive_secs: 25,
            lock_timeout_secs: 10,
        }
    }
}

/// Daemon reload after each registry change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReloadSettings {
    pub command: String,
    pub alert_log: PathBuf,
    pub timeout_secs: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            command: "systemctl reload wg-quick@wg1.service".into(),
            alert_log: PathBuf::from("/var/log/wgctl/reload.log"),
            timeout_secs: 30,
        }
    }
}

/// Controller-side access to the VPN host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSettings {
    /// VPN host; commands run locally when unset
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Address counter file on the VPN host
    pub counter_file: String,
    /// Prefix that invokes the host CLI
    pub control_command: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            user: "root".into(),
            identity_file: None,
            timeout_secs: 15,
            counter_file: "~/.wgctl/last-peer".into(),
            control_command: "sudo -n wgctl".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub network: AddressPool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerSettings {
    pub interval_secs: u64,
    pub max_backoff_ticks: u32,
    /// Bound on one ban/unban attempt
    pub attempt_timeout_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_backoff_ticks: 8,
            attempt_timeout_secs: 60,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text and validate them.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from `path`.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Settings from `path`, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("registry.lock_timeout_secs", self.registry.lock_timeout_secs),
            ("reload.timeout_secs", self.reload.timeout_secs),
            ("remote.timeout_secs", self.remote.timeout_secs),
            ("reconciler.interval_secs", self.reconciler.interval_secs),
            ("reconciler.attempt_timeout_secs", self.reconciler.attempt_timeout_secs),
        ];
        if let Some((field, _)) = durations.into_iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ZeroDuration(field));
        }
        // Registry lock, then the alert log lock and the reload itself
        let minimum = self.registry.lock_timeout_secs.saturating_mul(2).saturating_add(self.reload.timeout_secs);
        if self.reconciler.attempt_timeout_secs <= minimum {
            return Err(ConfigError::AttemptTimeoutTooShort {
                attempt: self.reconciler.attempt_timeout_secs,
                minimum,
            });
        }
        if self.registry.keepalive_secs == 0 {
            return Err(ConfigError::ZeroKeepalive);
        }
        let prefix = self.pool.network.prefix();
        if !(8..=30).contains(&prefix) {
            return Err(ConfigError::PoolPrefix(prefix));
        }
        if self.reload.command.trim().is_empty() {
            return Err(ConfigError::EmptyReloadCommand);
        }
        if self.remote.host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(ConfigError::EmptyRemoteHost);
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.lock_timeout_secs)
    }

    /// Reloader running the reload command on this host
    pub fn reloader(&self) -> ServiceReloader {
        ServiceReloader::new(
            Arc::new(LocalShell::new(Duration::from_secs(self.reload.timeout_secs))),
            self.reload.command.clone(),
            self.reload.alert_log.clone(),
            self.lock_timeout(),
        )
    }

    /// Open the local registry
    pub fn open_store(&self) -> Result<ConfigStore, StoreError> {
        ConfigStore::open(
            &self.registry.path,
            self.reloader(),
            self.registry.keepalive_secs,
            self.lock_timeout(),
        )
    }

    pub fn ssh_target(&self) -> Option<SshTarget> {
        self.remote.host.as_ref().map(|host| SshTarget {
            host: host.clone(),
            port: self.remote.port,
            user: self.remote.user.clone(),
            identity_file: self.remote.identity_file.clone(),
        })
    }

    /// SSH runner for the configured host, or a local shell
    pub fn remote_runner(&self) -> Arc<dyn CommandRunner> {
        let timeout = Duration::from_secs(self.remote.timeout_secs);
        match self.ssh_target() {
            Some(target) => Arc::new(SshRunner::new(target, timeout)),
            None => Arc::new(LocalShell::new(timeout)),
        }
    }

    /// Host CLI driven over [`Settings::remote_runner`]
    pub fn remote_control(&self) -> RemoteControl {
        RemoteControl::new(self.remote_runner(), self.remote.control_command.clone())
    }

    pub fn provisioner(&self) -> PeerProvisioner {
        PeerProvisioner::new(self.remote_runner(), self.remote.counter_file.clone())
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconciler.interval_secs),
            max_backoff_ticks: self.reconciler.max_backoff_ticks,
            attempt_timeout: Duration::from_secs(self.reconciler.attempt_timeout_secs),
        }
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("reconciler.attempt_timeout_secs ({attempt}) must exceed twice registry.lock_timeout_secs plus reload.timeout_secs ({minimum})")]
    AttemptTimeoutTooShort { attempt: u64, minimum: u64 },

    #[error("registry.keepalive_secs must be greater than zero")]
    ZeroKeepalive,

    #[error("Address pool prefix /{0} outside /8../30")]
    PoolPrefix(u8),

    #[error("reload.command is empty")]
    EmptyReloadCommand,

    #[error("remote.host is empty")]
    EmptyRemoteHost,
}
