//! Freeze Reconciler
//!
//! Periodic control loop that drives the registry toward the freeze
//! state recorded per subscription. External logic moves a record from
//! `no`/`yes` into `wait_yes`/`wait_no`; this loop is the only writer of
//! the second half, and only after the registry confirmed the change.
//!
//! # Tick
//!
//! 1. Retry an outstanding daemon reload, if any
//! 2. `wait_no` records: unban, then commit `no` for those that succeeded
//! 3. `wait_yes` records: ban, then commit `yes` for those that succeeded
//!
//! A failing record never stops the batch. It stays pending and is
//! retried on a later tick, with exponential skip backoff after repeated
//! failures.

use crate::control::PeerControl;
use crate::freeze::{FreezeEvent, FreezeState};
use crate::keys::{KeyError, PublicKey};
use crate::registry::{AllowedIp, PeerEntry, PeerOp};
use crate::store::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub type RecordId = i64;

/// Subscription config record as seen by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeRecord {
    pub id: RecordId,
    /// Peer public key, base64
    pub public_key: String,
    /// Address recorded for the peer, e.g. `10.1.0.7/32`
    pub address: Option<String>,
    pub freeze: FreezeState,
}

/// The external subscription store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records currently in `state`
    async fn list_pending(&self, state: FreezeState) -> anyhow::Result<Vec<FreezeRecord>>;

    /// Persist `state` for every record in `ids`
    async fn commit_state(&self, ids: &[RecordId], state: FreezeState) -> anyhow::Result<()>;

    /// Every record with a peer, for [`FreezeReconciler::audit`]
    async fn list_all(&self) -> anyhow::Result<Vec<FreezeRecord>>;
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay between ticks
    pub interval: Duration,
    /// Upper bound on ticks skipped after repeated failures
    pub max_backoff_ticks: u32,
    /// Bound on one registry operation
    pub attempt_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_backoff_ticks: 8,
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records moved `wait_no -> no`
    pub unfrozen: Vec<RecordId>,
    /// Records moved `wait_yes -> yes`
    pub frozen: Vec<RecordId>,
    /// Attempted and failed; still pending
    pub failed: Vec<RecordId>,
    /// Skipped this tick because of backoff
    pub deferred: Vec<RecordId>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.unfrozen.is_empty() && self.frozen.is_empty() && self.failed.is_empty() && self.deferred.is_empty()
    }
}

/// Outcome of an audit pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Records corrected to `yes` because the peer is banned
    pub frozen: Vec<RecordId>,
    /// Records corrected to `no` because the peer is active
    pub unfrozen: Vec<RecordId>,
    /// Recorded address differs from the peer's allowed IPs
    pub mismatched: Vec<RecordId>,
    /// No peer with the recorded key
    pub unknown: Vec<RecordId>,
}

/// Per-record reconciliation failure; logged, never propagated
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("record {id} has an invalid public key: {source}")]
    InvalidKey {
        id: RecordId,
        #[source]
        source: KeyError,
    },

    #[error("record {id}: {source}")]
    Registry {
        id: RecordId,
        #[source]
        source: StoreError,
    },

    #[error("record {id}: registry operation timed out after {timeout:?}")]
    Timeout { id: RecordId, timeout: Duration },

    #[error("record {id}: peer already in place but a daemon reload is still outstanding")]
    ReloadOwed { id: RecordId },
}

#[derive(Debug, Default, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    skip: u32,
}

/// Consecutive failure `n` skips the next `min(2^(n-1) - 1, max)` ticks
#[derive(Debug, Default)]
struct RetryBackoff {
    max_skip: u32,
    entries: HashMap<RecordId, BackoffEntry>,
}

impl RetryBackoff {
    fn new(max_skip: u32) -> Self {
        Self {
            max_skip,
            entries: HashMap::new(),
        }
    }

    fn should_skip(&mut self, id: RecordId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.skip > 0 => {
                entry.skip -= 1;
                true
            }
            _ => false,
        }
    }

    fn record_failure(&mut self, id: RecordId) {
        let entry = self.entries.entry(id).or_default();
        entry.failures += 1;
        let exp = (entry.failures - 1).min(16);
        entry.skip = ((1u32 << exp) - 1).min(self.max_skip);
    }

    fn clear(&mut self, id: RecordId) {
        self.entries.remove(&id);
    }

    /// Forget records that are no longer pending
    fn retain(&mut self, seen: &HashSet<RecordId>) {
        self.entries.retain(|id, _| seen.contains(id));
    }
}

/// Drives pending freeze states to their terminal counterparts
pub struct FreezeReconciler {
    control: Arc<dyn PeerControl>,
    records: Arc<dyn RecordStore>,
    config: ReconcilerConfig,
    backoff: RetryBackoff,
    /// A registry edit went through but its daemon reload did not
    reload_owed: bool,
}

impl FreezeReconciler {
    pub fn new(control: Arc<dyn PeerControl>, records: Arc<dyn RecordStore>, config: ReconcilerConfig) -> Self {
        let backoff = RetryBackoff::new(config.max_backoff_ticks);
        Self {
            control,
            records,
            config,
            backoff,
            reload_owed: false,
        }
    }

    /// True while a daemon reload is outstanding
    pub fn reload_owed(&self) -> bool {
        self.reload_owed
    }

    /// Run one reconciliation pass.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let mut seen = HashSet::new();

        if self.reload_owed {
            match self.control.reload().await {
                Ok(()) => {
                    self.reload_owed = false;
                    info!("Outstanding daemon reload completed");
                }
                Err(e) => error!(error = %e, "Daemon reload still failing"),
            }
        }

        for pending in [FreezeState::WaitNo, FreezeState::WaitYes] {
            let settled = self.settle_batch(pending, &mut report, &mut seen).await;
            match pending {
                FreezeState::WaitNo => report.unfrozen = settled,
                _ => report.frozen = settled,
            }
        }

        self.backoff.retain(&seen);
        report
    }

    /// Settle every record in `pending`; returns the committed ids.
    async fn settle_batch(
        &mut self,
        pending: FreezeState,
        report: &mut TickReport,
        seen: &mut HashSet<RecordId>,
    ) -> Vec<RecordId> {
        let (Some(op), Some(event)) = (pending.pending_op(), pending.applied_event()) else {
            return Vec::new();
        };
        let terminal = match pending.transition(event) {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Freeze transition table rejected its own event");
                return Vec::new();
            }
        };

        let records = match self.records.list_pending(pending).await {
            Ok(records) => records,
            Err(e) => {
                error!(state = %pending, error = %format!("{e:#}"), "Could not list pending records");
                return Vec::new();
            }
        };

        let mut settled = Vec::new();
        for record in records {
            seen.insert(record.id);
            if self.backoff.should_skip(record.id) {
                report.deferred.push(record.id);
                continue;
            }

            match self.attempt(&record, &op).await {
                Ok(()) => {
                    self.backoff.clear(record.id);
                    settled.push(record.id);
                }
                Err(e) => {
                    warn!(op = op.name(), error = %e, "Reconciliation attempt failed");
                    // An outstanding reload is not the record's fault
                    if !matches!(e, AttemptError::ReloadOwed { .. }) {
                        self.backoff.record_failure(record.id);
                    }
                    report.failed.push(record.id);
                }
            }
        }

        if settled.is_empty() {
            return settled;
        }
        if let Err(e) = self.records.commit_state(&settled, terminal).await {
            // Peers are already in place; the next tick sees
            // "already banned/active" and commits again.
            error!(state = %terminal, records = ?settled, error = %format!("{e:#}"), "Could not commit freeze state");
            return Vec::new();
        }

        info!(state = %terminal, records = ?settled, "Freeze state settled");
        settled
    }

    async fn attempt(&mut self, record: &FreezeRecord, op: &PeerOp) -> Result<(), AttemptError> {
        let id = record.id;
        let key = PublicKey::from_base64(&record.public_key).map_err(|source| AttemptError::InvalidKey { id, source })?;

        let timeout = self.config.attempt_timeout;
        let result = match tokio::time::timeout(timeout, self.control.apply(op, &key)).await {
            Ok(result) => result,
            Err(_) => {
                // The registry may already be rewritten with its reload cut short
                self.reload_owed = true;
                warn!(record = id, peer = %key.short(), op = op.name(), "Apply timed out, reload now owed");
                return Err(AttemptError::Timeout { id, timeout });
            }
        };

        match result {
            Ok(()) => {
                // Every successful apply includes a reload
                self.reload_owed = false;
                Ok(())
            }
            Err(e) if e.is_already_applied(op) => {
                if self.reload_owed {
                    return Err(AttemptError::ReloadOwed { id });
                }
                debug!(record = id, peer = %key.short(), op = op.name(), "Peer already in requested state");
                Ok(())
            }
            Err(source) => {
                if matches!(source, StoreError::Reload(_)) {
                    self.reload_owed = true;
                }
                Err(AttemptError::Registry { id, source })
            }
        }
    }

    /// Compare recorded freeze states with the peers on the VPN host and
    /// correct records whose peer is observed in the other state.
    pub async fn audit(&self) -> anyhow::Result<AuditReport> {
        let peers: HashMap<String, PeerEntry> = self
            .control
            .peers()
            .await?
            .into_iter()
            .map(|peer| (peer.public_key.to_base64(), peer))
            .collect();
        let records = self.records.list_all().await?;

        let mut report = AuditReport::default();
        for record in &records {
            let Some(peer) = peers.get(record.public_key.trim()) else {
                warn!(record = record.id, "Record has no peer on the VPN host");
                report.unknown.push(record.id);
                continue;
            };

            if let Some(address) = &record.address {
                let matches = address
                    .parse::<AllowedIp>()
                    .is_ok_and(|ip| peer.allowed_ips.contains(&ip));
                if !matches {
                    warn!(record = record.id, %address, "Recorded address differs from the peer's allowed IPs");
                    report.mismatched.push(record.id);
                    continue;
                }
            }

            let observed = if peer.enabled {
                FreezeEvent::ObservedActive
            } else {
                FreezeEvent::ObservedBanned
            };
            match record.freeze.transition(observed) {
                Ok(FreezeState::Yes) => report.frozen.push(record.id),
                Ok(_) => report.unfrozen.push(record.id),
                Err(_) => {}
            }
        }

        for (ids, state) in [(&report.frozen, FreezeState::Yes), (&report.unfrozen, FreezeState::No)] {
            if !ids.is_empty() {
                self.records.commit_state(ids, state).await?;
                info!(state = %state, records = ?ids, "Freeze state corrected from peer list");
            }
        }
        Ok(report)
    }

    /// Tick every `interval` until `shutdown` turns true or its sender
    /// is dropped. Ticks never overlap.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), "Freeze reconciler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.is_idle() {
                        debug!(?report, "Reconciler tick finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Freeze reconciler stopped");
    }

    /// Spawn [`FreezeReconciler::run`] on the runtime
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryError;
    use crate::registry::tests::test_key;
    use crate::reload::ReloadError;
    use std::sync::Mutex;

    /// In-memory record store
    #[derive(Default)]
    struct MemoryRecords {
        records: Mutex<Vec<FreezeRecord>>,
        commits: Mutex<Vec<(Vec<RecordId>, FreezeState)>>,
        fail_commit: Mutex<bool>,
    }

    impl MemoryRecords {
        fn with(records: Vec<FreezeRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                ..Default::default()
            }
        }

        fn state_of(&self, id: RecordId) -> FreezeState {
            self.records.lock().unwrap().iter().find(|r| r.id == id).unwrap().freeze
        }
    }

    #[async_trait]
    impl RecordStore for MemoryRecords {
        async fn list_pending(&self, state: FreezeState) -> anyhow::Result<Vec<FreezeRecord>> {
            Ok(self.records.lock().unwrap().iter().filter(|r| r.freeze == state).cloned().collect())
        }

        async fn commit_state(&self, ids: &[RecordId], state: FreezeState) -> anyhow::Result<()> {
            if *self.fail_commit.lock().unwrap() {
                anyhow::bail!("database unavailable");
            }
            for record in self.records.lock().unwrap().iter_mut() {
                if ids.contains(&record.id) {
                    record.freeze = state;
                }
            }
            self.commits.lock().unwrap().push((ids.to_vec(), state));
            Ok(())
        }

        async fn list_all(&self) -> anyhow::Result<Vec<FreezeRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    /// Peer control backed by a key -> enabled map, with injectable failures
    #[derive(Default)]
    struct FakeControl {
        peers: Mutex<HashMap<PublicKey, bool>>,
        failing: Mutex<HashSet<PublicKey>>,
        reload_fails: Mutex<bool>,
        reloads: Mutex<usize>,
        stall: Mutex<Option<Duration>>,
    }

    impl FakeControl {
        fn with_peers(peers: &[(PublicKey, bool)]) -> Self {
            let control = Self::default();
            control.peers.lock().unwrap().extend(peers.iter().copied());
            control
        }
    }

    #[async_trait]
    impl PeerControl for FakeControl {
        async fn apply(&self, op: &PeerOp, key: &PublicKey) -> Result<(), StoreError> {
            if self.failing.lock().unwrap().contains(key) {
                return Err(crate::remote::TransportError::Timeout(Duration::from_secs(1)).into());
            }
            {
                let mut peers = self.peers.lock().unwrap();
                let enabled = peers.get_mut(key).ok_or(RegistryError::PeerNotFound(*key))?;
                match (op, *enabled) {
                    (PeerOp::Ban, false) => return Err(RegistryError::AlreadyBanned(*key).into()),
                    (PeerOp::Unban, true) => return Err(RegistryError::AlreadyActive(*key).into()),
                    (PeerOp::Ban, true) => *enabled = false,
                    (PeerOp::Unban, false) => *enabled = true,
                    _ => unreachable!("reconciler only bans and unbans"),
                }
            }
            // Slow reload after the registry change
            let stall = *self.stall.lock().unwrap();
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            if *self.reload_fails.lock().unwrap() {
                return Err(ReloadError::Failed {
                    exit_code: Some(1),
                    stderr: String::new(),
                }
                .into());
            }
            *self.reloads.lock().unwrap() += 1;
            Ok(())
        }

        async fn peers(&self) -> Result<Vec<PeerEntry>, StoreError> {
            Ok(self
                .peers
                .lock()
                .unwrap()
                .iter()
                .map(|(key, enabled)| PeerEntry {
                    public_key: *key,
                    allowed_ips: vec![AllowedIp::host(format!("10.1.0.{}", key.to_base64().as_bytes()[0]).parse().unwrap())],
                    keepalive: Some(25),
                    enabled: *enabled,
                })
                .collect())
        }

        async fn reload(&self) -> Result<(), StoreError> {
            if *self.reload_fails.lock().unwrap() {
                return Err(ReloadError::Failed {
                    exit_code: Some(1),
                    stderr: String::new(),
                }
                .into());
            }
            *self.reloads.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn record(id: RecordId, key: &PublicKey, freeze: FreezeState) -> FreezeRecord {
        FreezeRecord {
            id,
            public_key: key.to_base64(),
            address: None,
            freeze,
        }
    }

    fn reconciler(control: &Arc<FakeControl>, records: &Arc<MemoryRecords>) -> FreezeReconciler {
        FreezeReconciler::new(control.clone(), records.clone(), ReconcilerConfig::default())
    }

    #[tokio::test]
    async fn test_partial_failure_then_convergence() {
        let keys: Vec<PublicKey> = "abcde".chars().map(test_key).collect();
        let control = Arc::new(FakeControl::with_peers(&keys.iter().map(|k| (*k, true)).collect::<Vec<_>>()));
        let records = Arc::new(MemoryRecords::with(
            keys.iter()
                .enumerate()
                .map(|(i, k)| record(i as RecordId, k, FreezeState::WaitYes))
                .collect(),
        ));
        control.failing.lock().unwrap().extend([keys[1], keys[3]]);
        let mut reconciler = reconciler(&control, &records);

        let report = reconciler.tick().await;

        assert_eq!(report.frozen, vec![0, 2, 4]);
        assert_eq!(report.failed, vec![1, 3]);
        assert_eq!(records.state_of(1), FreezeState::WaitYes);
        assert_eq!(records.state_of(4), FreezeState::Yes);
        // One commit for the whole batch
        assert_eq!(records.commits.lock().unwrap().len(), 1);

        control.failing.lock().unwrap().clear();
        let report = reconciler.tick().await;

        assert_eq!(report.frozen, vec![1, 3]);
        assert!((0..5).all(|id| records.state_of(id) == FreezeState::Yes));
    }

    #[tokio::test]
    async fn test_unban_batch_before_ban_batch() {
        let a = test_key('a');
        let b = test_key('b');
        let control = Arc::new(FakeControl::with_peers(&[(a, false), (b, true)]));
        let records = Arc::new(MemoryRecords::with(vec![
            record(1, &a, FreezeState::WaitNo),
            record(2, &b, FreezeState::WaitYes),
            record(3, &b, FreezeState::Yes),
        ]));
        let mut reconciler = reconciler(&control, &records);

        let report = reconciler.tick().await;

        assert_eq!(report.unfrozen, vec![1]);
        assert_eq!(report.frozen, vec![2]);
        assert_eq!(
            *records.commits.lock().unwrap(),
            vec![(vec![1], FreezeState::No), (vec![2], FreezeState::Yes)]
        );
        assert!(reconciler.tick().await.is_idle());
    }

    #[tokio::test]
    async fn test_already_applied_counts_as_settled() {
        let a = test_key('a');
        let control = Arc::new(FakeControl::with_peers(&[(a, false)]));
        let records = Arc::new(MemoryRecords::with(vec![record(1, &a, FreezeState::WaitYes)]));
        let mut reconciler = reconciler(&control, &records);

        assert_eq!(reconciler.tick().await.frozen, vec![1]);
        assert_eq!(*control.reloads.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_retries_next_tick() {
        let a = test_key('a');
        let control = Arc::new(FakeControl::with_peers(&[(a, true)]));
        let records = Arc::new(MemoryRecords::with(vec![record(1, &a, FreezeState::WaitYes)]));
        *records.fail_commit.lock().unwrap() = true;
        let mut reconciler = reconciler(&control, &records);

        assert!(reconciler.tick().await.frozen.is_empty());
        assert_eq!(records.state_of(1), FreezeState::WaitYes);

        *records.fail_commit.lock().unwrap() = false;
        assert_eq!(reconciler.tick().await.frozen, vec![1]);
        assert_eq!(records.state_of(1), FreezeState::Yes);
    }

    #[tokio::test]
    async fn test_reload_failure_is_retried_alone() {
        let a = test_key('a');
        let control = Arc::new(FakeControl::with_peers(&[(a, true)]));
        let records = Arc::new(MemoryRecords::with(vec![record(1, &a, FreezeState::WaitYes)]));
        *control.reload_fails.lock().unwrap() = true;
        let mut reconciler = reconciler(&control, &records);

        assert_eq!(reconciler.tick().await.failed, vec![1]);
        assert!(reconciler.reload_owed());

        // Reload still broken: the peer is banned in the file but not live
        assert_eq!(reconciler.tick().await.failed, vec![1]);
        assert_eq!(records.state_of(1), FreezeState::WaitYes);

        *control.reload_fails.lock().unwrap() = false;
        let report = reconciler.tick().await;
        assert_eq!(report.frozen, vec![1]);
        assert!(!reconciler.reload_owed());
        assert_eq!(*control.reloads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_apply_owes_a_reload() {
        let a = test_key('a');
        let control = Arc::new(FakeControl::with_peers(&[(a, true)]));
        *control.stall.lock().unwrap() = Some(Duration::from_millis(500));
        let records = Arc::new(MemoryRecords::with(vec![record(1, &a, FreezeState::WaitYes)]));
        let config = ReconcilerConfig {
            attempt_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut reconciler = FreezeReconciler::new(control.clone(), records.clone(), config);

        // The ban landed but the reload was cut off
        assert_eq!(reconciler.tick().await.failed, vec![1]);
        assert!(reconciler.reload_owed());
        assert_eq!(*control.reloads.lock().unwrap(), 0);

        // An already-banned answer is not enough while the reload is owed
        *control.reload_fails.lock().unwrap() = true;
        assert_eq!(reconciler.tick().await.failed, vec![1]);
        assert_eq!(records.state_of(1), FreezeState::WaitYes);

        *control.reload_fails.lock().unwrap() = false;
        assert_eq!(reconciler.tick().await.frozen, vec![1]);
        assert!(!reconciler.reload_owed());
        assert_eq!(*control.reloads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_key_isolated() {
        let a = test_key('a');
        let control = Arc::new(FakeControl::with_peers(&[(a, true)]));
        let mut broken = record(1, &a, FreezeState::WaitYes);
        broken.public_key = "not a key".into();
        let records = Arc::new(MemoryRecords::with(vec![broken, record(2, &a, FreezeState::WaitYes)]));
        let mut reconciler = reconciler(&control, &records);

        let report = reconciler.tick().await;
        assert_eq!(report.failed, vec![1]);
        assert_eq!(report.frozen, vec![2]);
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = RetryBackoff::new(4);
        let mut skipped = Vec::new();

        for _ in 0..5 {
            backoff.record_failure(7);
            let mut n = 0;
            while backoff.should_skip(7) {
                n += 1;
            }
            skipped.push(n);
        }
        assert_eq!(skipped, vec![0, 1, 3, 4, 4]);

        backoff.clear(7);
        assert!(!backoff.should_skip(7));
    }

    #[tokio::test]
    async fn test_persistent_failure_is_deferred() {
        let a = test_key('a');
        let control = Arc::new(FakeControl::with_peers(&[(a, true)]));
        control.failing.lock().unwrap().insert(a);
        let records = Arc::new(MemoryRecords::with(vec![record(1, &a, FreezeState::WaitYes)]));
        let mut reconciler = reconciler(&control, &records);

        assert_eq!(reconciler.tick().await.failed, vec![1]);
        assert_eq!(reconciler.tick().await.failed, vec![1]);
        assert_eq!(reconciler.tick().await.deferred, vec![1]);
        assert_eq!(reconciler.tick().await.failed, vec![1]);
    }

    #[tokio::test]
    async fn test_audit_corrects_drift() {
        let keys: Vec<PublicKey> = "abcd".chars().map(test_key).collect();
        let control = Arc::new(FakeControl::with_peers(&[
            (keys[0], false),
            (keys[1], true),
            (keys[2], true),
        ]));
        let mut mismatched = record(3, &keys[2], FreezeState::No);
        mismatched.address = Some("10.9.9.9/32".into());
        let records = Arc::new(MemoryRecords::with(vec![
            record(1, &keys[0], FreezeState::No),
            record(2, &keys[1], FreezeState::WaitNo),
            mismatched,
            record(4, &keys[3], FreezeState::Yes),
        ]));
        let reconciler = reconciler(&control, &records);

        let report = reconciler.audit().await.unwrap();

        assert_eq!(report.frozen, vec![1]);
        assert_eq!(report.unfrozen, vec![2]);
        assert_eq!(report.mismatched, vec![3]);
        assert_eq!(report.unknown, vec![4]);
        assert_eq!(records.state_of(1), FreezeState::Yes);
        assert_eq!(records.state_of(2), FreezeState::No);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let control = Arc::new(FakeControl::default());
        let records = Arc::new(MemoryRecords::default());
        let reconciler = FreezeReconciler::new(
            control,
            records,
            ReconcilerConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let (tx, rx) = watch::channel(false);

        let handle = reconciler.spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
