//! Peer Registry
//!
//! Line-oriented model of the WireGuard config file that lists every
//! peer the daemon accepts. Everything here is pure; locking, I/O and
//! daemon reloads live in [`crate::store`].
//!
//! # Block shape
//!
//! ```text
//! [Peer]                          <- marker
//! PublicKey = <44 char key>       <- key line
//! AllowedIPs = 10.1.0.7/32
//! PersistentKeepalive = 25
//!                                 <- blank line or next section ends the block
//! ```
//!
//! A banned peer is the same block with every line prefixed by `# `.

use crate::keys::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::ops::Range;
use std::str::FromStr;
use tracing::debug;

/// Marker line opening a peer block
pub const PEER_MARKER: &str = "[Peer]";

/// Prefix used to disable a line
const COMMENT_PREFIX: &str = "# ";

/// A CIDR range in an `AllowedIPs` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AllowedIp {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl AllowedIp {
    /// Single-host range (`/32` or `/128`)
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }
}

impl FromStr for AllowedIp {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidAllowedIp(s.to_string());
        let s = s.trim();

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }

        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl From<AllowedIp> for String {
    fn from(ip: AllowedIp) -> Self {
        ip.to_string()
    }
}

impl TryFrom<String> for AllowedIp {
    type Error = RegistryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Mutation requested against the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    /// Append a new active peer
    Add(Vec<AllowedIp>),
    /// Remove every block of the peer
    Delete,
    /// Comment out the peer's block
    Ban,
    /// Re-enable a commented-out block
    Unban,
}

impl PeerOp {
    /// Stable name used in logs, metrics and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            PeerOp::Add(_) => "add",
            PeerOp::Delete => "delete",
            PeerOp::Ban => "ban",
            PeerOp::Unban => "unban",
        }
    }
}

impl fmt::Display for PeerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a peer block is live or commented out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Active,
    Banned,
}

/// One peer as listed from the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: PublicKey,
    pub allowed_ips: Vec<AllowedIp>,
    pub keepalive: Option<u16>,
    pub enabled: bool,
}

fn is_commented(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Line content with one comment level removed, trimmed.
fn content(line: &str) -> &str {
    let trimmed = line.trim();
    trimmed.strip_prefix('#').map_or(trimmed, str::trim)
}

fn is_section(line: &str) -> bool {
    content(line).starts_with('[')
}

fn is_marker(line: &str) -> bool {
    content(line).eq_ignore_ascii_case(PEER_MARKER)
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    content(line)
        .split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
}

fn comment_out(line: &str) -> String {
    format!("{COMMENT_PREFIX}{line}")
}

/// Removes exactly one comment level so nested comments survive a
/// ban/unban cycle.
fn uncomment(line: &str) -> String {
    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];
    let rest = body.strip_prefix('#').unwrap_or(body);
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    format!("{indent}{rest}")
}

/// Resolve the block owning the key line at `key_line`.
///
/// The preceding line must be a peer marker. The block then extends over
/// every following non-empty line up to the next section header.
pub fn locate_block(lines: &[String], key_line: usize) -> Result<Range<usize>, RegistryError> {
    if key_line == 0 || key_line >= lines.len() || !is_marker(&lines[key_line - 1]) {
        return Err(RegistryError::Structural(format!(
            "line {} holds the key but is not preceded by a {PEER_MARKER} marker",
            key_line + 1
        )));
    }

    let mut end = key_line + 1;
    while end < lines.len() && !lines[end].trim().is_empty() && !is_section(&lines[end]) {
        end += 1;
    }

    Ok(key_line - 1..end)
}

/// Resolve every block whose key line mentions `key`.
pub fn locate_blocks(lines: &[String], key: &PublicKey) -> Result<Vec<Range<usize>>, RegistryError> {
    let needle = key.to_base64();
    let mut blocks: Vec<Range<usize>> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if !line.contains(&needle) {
            continue;
        }
        let block = locate_block(lines, i)?;
        if !blocks.contains(&block) {
            blocks.push(block);
        }
    }

    if blocks.is_empty() {
        return Err(RegistryError::PeerNotFound(*key));
    }
    Ok(blocks)
}

/// Decide a block's state from its marker and key lines.
pub fn block_state(lines: &[String], block: &Range<usize>) -> Result<BlockState, RegistryError> {
    let marker = &lines[block.start];
    let key = &lines[block.start + 1];

    match (is_commented(marker), is_commented(key)) {
        (false, false) => Ok(BlockState::Active),
        (true, true) => Ok(BlockState::Banned),
        _ => Err(RegistryError::Structural(format!(
            "peer block at line {} is partially commented",
            block.start + 1
        ))),
    }
}

/// A banned block must be commented on every line.
fn ensure_fully_commented(lines: &[String], block: &Range<usize>) -> Result<(), RegistryError> {
    match lines[block.clone()].iter().position(|l| !is_commented(l)) {
        Some(offset) => Err(RegistryError::Structural(format!(
            "banned peer block has an active line {}",
            block.start + offset + 1
        ))),
        None => Ok(()),
    }
}

/// In-memory registry contents
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registry {
    lines: Vec<String>,
}

impl Registry {
    /// Split file contents into lines. `render` reproduces the input byte
    /// for byte.
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.split('\n').map(str::to_owned).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }

    /// True if the key appears anywhere in the file
    pub fn contains_key(&self, key: &PublicKey) -> bool {
        let needle = key.to_base64();
        self.lines.iter().any(|line| line.contains(&needle))
    }

    /// Apply one operation. On error the registry is left untouched.
    pub fn apply(&mut self, op: &PeerOp, key: &PublicKey, keepalive: u16) -> Result<(), RegistryError> {
        match op {
            PeerOp::Add(allowed_ips) => self.add(key, allowed_ips, keepalive),
            PeerOp::Delete => self.delete(key).map(|_| ()),
            PeerOp::Ban => self.ban(key).map(|_| ()),
            PeerOp::Unban => self.unban(key).map(|_| ()),
        }
    }

    /// Append a new active peer block.
    pub fn add(&mut self, key: &PublicKey, allowed_ips: &[AllowedIp], keepalive: u16) -> Result<(), RegistryError> {
        if allowed_ips.is_empty() {
            return Err(RegistryError::NoAllowedIps);
        }
        if self.contains_key(key) {
            return Err(RegistryError::DuplicatePeer(*key));
        }

        // Keep the trailing newline at the end of the file
        if self.lines.last().is_some_and(|l| l.is_empty()) {
            self.lines.pop();
        }
        if self.lines.last().is_some_and(|l| !l.trim().is_empty()) {
            self.lines.push(String::new());
        }

        let ips = allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        self.lines.extend([
            PEER_MARKER.to_string(),
            format!("PublicKey = {key}"),
            format!("AllowedIPs = {ips}"),
            format!("PersistentKeepalive = {keepalive}"),
            String::new(),
        ]);
        Ok(())
    }

    /// Remove every block of the peer. Returns the number of blocks removed.
    pub fn delete(&mut self, key: &PublicKey) -> Result<usize, RegistryError> {
        let mut blocks = locate_blocks(&self.lines, key)?;
        blocks.sort_by_key(|b| std::cmp::Reverse(b.start));

        for block in &blocks {
            self.lines.drain(block.clone());
        }
        Ok(blocks.len())
    }

    /// Comment out every block of the peer.
    pub fn ban(&mut self, key: &PublicKey) -> Result<usize, RegistryError> {
        let blocks = locate_blocks(&self.lines, key)?;
        for block in &blocks {
            if block_state(&self.lines, block)? == BlockState::Banned {
                ensure_fully_commented(&self.lines, block)?;
                return Err(RegistryError::AlreadyBanned(*key));
            }
        }

        for block in &blocks {
            for line in &mut self.lines[block.clone()] {
                *line = comment_out(line);
            }
        }
        Ok(blocks.len())
    }

    /// Re-enable every block of the peer.
    pub fn unban(&mut self, key: &PublicKey) -> Result<usize, RegistryError> {
        let blocks = locate_blocks(&self.lines, key)?;
        for block in &blocks {
            if block_state(&self.lines, block)? == BlockState::Active {
                return Err(RegistryError::AlreadyActive(*key));
            }
            ensure_fully_commented(&self.lines, block)?;
        }

        for block in &blocks {
            for line in &mut self.lines[block.clone()] {
                *line = uncomment(line);
            }
        }
        Ok(blocks.len())
    }

    /// List every well-formed peer block, active or banned.
    pub fn peers(&self) -> Vec<PeerEntry> {
        let mut peers = Vec::new();

        for (i, line) in self.lines.iter().enumerate() {
            if !is_marker(line) {
                continue;
            }
            match self.entry_at(i + 1) {
                Some(entry) => peers.push(entry),
                None => debug!(line = i + 1, "Skipping malformed peer block"),
            }
        }
        peers
    }

    fn entry_at(&self, key_line: usize) -> Option<PeerEntry> {
        let (name, value) = key_value(self.lines.get(key_line)?)?;
        if !name.eq_ignore_ascii_case("PublicKey") {
            return None;
        }
        let public_key = PublicKey::from_base64(value).ok()?;
        let block = locate_block(&self.lines, key_line).ok()?;
        let enabled = block_state(&self.lines, &block).ok()? == BlockState::Active;

        let mut entry = PeerEntry {
            public_key,
            allowed_ips: Vec::new(),
            keepalive: None,
            enabled,
        };
        for line in &self.lines[block] {
            match key_value(line) {
                Some((k, v)) if k.eq_ignore_ascii_case("AllowedIPs") => {
                    entry.allowed_ips = v.split(',').filter_map(|ip| ip.parse().ok()).collect();
                }
                Some((k, v)) if k.eq_ignore_ascii_case("PersistentKeepalive") => {
                    entry.keepalive = v.parse().ok();
                }
                _ => {}
            }
        }
        Some(entry)
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Peer {} already present in registry", .0.short())]
    DuplicatePeer(PublicKey),

    #[error("Peer {} is already banned", .0.short())]
    AlreadyBanned(PublicKey),

    #[error("Peer {} is already active", .0.short())]
    AlreadyActive(PublicKey),

    #[error("Peer {} not found in registry", .0.short())]
    PeerNotFound(PublicKey),

    #[error("Registry structure violated: {0}")]
    Structural(String),

    #[error("New peer requires at least one allowed IP")]
    NoAllowedIps,

    #[error("Invalid allowed IP range: {0}")]
    InvalidAllowedIp(String),
}
