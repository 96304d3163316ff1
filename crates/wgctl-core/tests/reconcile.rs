use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wgctl_core::{
    ConfigStore, FreezeReconciler, FreezeRecord, FreezeState, LocalShell, ProvisionedKeyPair, PublicKey,
    ReconcilerConfig, RecordId, RecordStore, ServiceReloader,
};

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Records(Mutex<Vec<FreezeRecord>>);

impl Records {
    fn state(&self, id: RecordId) -> FreezeState {
        self.0.lock().unwrap().iter().find(|r| r.id == id).unwrap().freeze
    }

    fn request(&self, id: RecordId, state: FreezeState) {
        self.0.lock().unwrap().iter_mut().find(|r| r.id == id).unwrap().freeze = state;
    }
}

#[async_trait]
impl RecordStore for Records {
    async fn list_pending(&self, state: FreezeState) -> anyhow::Result<Vec<FreezeRecord>> {
        Ok(self.0.lock().unwrap().iter().filter(|r| r.freeze == state).cloned().collect())
    }

    async fn commit_state(&self, ids: &[RecordId], state: FreezeState) -> anyhow::Result<()> {
        for record in self.0.lock().unwrap().iter_mut().filter(|r| ids.contains(&r.id)) {
            record.freeze = state;
        }
        Ok(())
    }

    async fn list_all(&self) -> anyhow::Result<Vec<FreezeRecord>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Registry with `keys` as active peers; the reload fails while
/// `reload-broken` exists in `dir`.
fn store_with_peers(dir: &Path, keys: &[PublicKey]) -> ConfigStore {
    let command = format!(
        "test ! -e {broken} && echo reload >> {reloads}",
        broken = dir.join("reload-broken").display(),
        reloads = dir.join("reloads").display(),
    );
    store_with_reload(dir, keys, command)
}

fn store_with_reload(dir: &Path, keys: &[PublicKey], command: String) -> ConfigStore {
    let mut text = String::from("[Interface]\nListenPort = 51820\n");
    for (i, key) in keys.iter().enumerate() {
        text.push_str(&format!("\n[Peer]\nPublicKey = {key}\nAllowedIPs = 10.1.0.{}/32\n", i + 2));
    }
    std::fs::write(dir.join("wg1.conf"), text).unwrap();

    let reloader = ServiceReloader::new(Arc::new(LocalShell::new(TIMEOUT)), command, dir.join("reload.log"), TIMEOUT);
    ConfigStore::open(dir.join("wg1.conf"), reloader, 25, TIMEOUT).unwrap()
}

fn records(keys: &[PublicKey], state: FreezeState) -> Vec<FreezeRecord> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| FreezeRecord {
            id: i as RecordId,
            public_key: key.to_base64(),
            address: Some(format!("10.1.0.{}/32", i + 2)),
            freeze: state,
        })
        .collect()
}

fn banned_peers(text: &str) -> usize {
    text.lines().filter(|l| *l == "# [Peer]").count()
}

#[tokio::test]
async fn freeze_and_thaw_converge_against_real_registry() {
    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<PublicKey> = (0..4).map(|_| ProvisionedKeyPair::generate().public).collect();
    let store = Arc::new(store_with_peers(dir.path(), &keys));

    // Record 4 points at a peer that is not in the registry
    let mut all = records(&keys, FreezeState::WaitYes);
    all.push(FreezeRecord {
        id: 4,
        public_key: ProvisionedKeyPair::generate().public.to_base64(),
        address: None,
        freeze: FreezeState::WaitYes,
    });
    let records = Arc::new(Records(Mutex::new(all)));
    let mut reconciler = FreezeReconciler::new(store.clone(), records.clone(), ReconcilerConfig::default());

    let report = reconciler.tick().await;

    assert_eq!(report.frozen, vec![0, 1, 2, 3]);
    assert_eq!(report.failed, vec![4]);
    assert_eq!(records.state(4), FreezeState::WaitYes);
    let text = std::fs::read_to_string(dir.path().join("wg1.conf")).unwrap();
    assert_eq!(banned_peers(&text), 4);

    records.request(1, FreezeState::WaitNo);
    records.request(3, FreezeState::WaitNo);
    let report = reconciler.tick().await;

    assert_eq!(report.unfrozen, vec![1, 3]);
    assert_eq!(records.state(0), FreezeState::Yes);
    assert_eq!(records.state(1), FreezeState::No);
    let peers = store.peers().await.unwrap();
    assert_eq!(peers.iter().filter(|p| p.enabled).count(), 2);
}

#[tokio::test]
async fn broken_reload_holds_records_until_it_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<PublicKey> = (0..2).map(|_| ProvisionedKeyPair::generate().public).collect();
    let store = Arc::new(store_with_peers(dir.path(), &keys));
    let records = Arc::new(Records(Mutex::new(records(&keys, FreezeState::WaitYes))));
    let mut reconciler = FreezeReconciler::new(store, records.clone(), ReconcilerConfig::default());

    std::fs::write(dir.path().join("reload-broken"), "").unwrap();
    let report = reconciler.tick().await;
    assert_eq!(report.failed, vec![0, 1]);
    assert!(reconciler.reload_owed());

    // The registry was rewritten even though the daemon never saw it
    let text = std::fs::read_to_string(dir.path().join("wg1.conf")).unwrap();
    assert_eq!(banned_peers(&text), 2);
    assert_eq!(records.state(0), FreezeState::WaitYes);

    std::fs::remove_file(dir.path().join("reload-broken")).unwrap();
    let report = reconciler.tick().await;
    assert_eq!(report.frozen, vec![0, 1]);
    assert!(!reconciler.reload_owed());

    let log = std::fs::read_to_string(dir.path().join("reload.log")).unwrap();
    assert!(log.lines().any(|l| l.contains(":: reload :: - :: ok")));
}

#[tokio::test]
async fn reload_cut_off_by_attempt_timeout_is_redone() {
    let dir = tempfile::tempdir().unwrap();
    let keys = [ProvisionedKeyPair::generate().public];
    let reloads = dir.path().join("reloads");
    let store = Arc::new(store_with_reload(
        dir.path(),
        &keys,
        format!("sleep 1 && echo reload >> {}", reloads.display()),
    ));
    let records = Arc::new(Records(Mutex::new(records(&keys, FreezeState::WaitYes))));
    let config = ReconcilerConfig {
        attempt_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let mut reconciler = FreezeReconciler::new(store, records.clone(), config);

    let report = reconciler.tick().await;
    assert_eq!(report.failed, vec![0]);
    assert!(reconciler.reload_owed());
    let text = std::fs::read_to_string(dir.path().join("wg1.conf")).unwrap();
    assert_eq!(banned_peers(&text), 1);
    assert!(!reloads.exists());

    // The owed reload runs outside the attempt timeout before the record settles
    let report = reconciler.tick().await;
    assert_eq!(report.frozen, vec![0]);
    assert!(!reconciler.reload_owed());
    assert_eq!(records.state(0), FreezeState::Yes);
    assert_eq!(std::fs::read_to_string(&reloads).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn audit_repairs_records_from_registry() {
    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<PublicKey> = (0..3).map(|_| ProvisionedKeyPair::generate().public).collect();
    let store = Arc::new(store_with_peers(dir.path(), &keys));
    store.apply(&wgctl_core::PeerOp::Ban, &keys[0]).await.unwrap();

    let mut all = records(&keys, FreezeState::No);
    all[2].freeze = FreezeState::Yes;
    let records = Arc::new(Records(Mutex::new(all)));
    let reconciler = FreezeReconciler::new(store, records.clone(), ReconcilerConfig::default());

    let report = reconciler.audit().await.unwrap();

    assert_eq!(report.frozen, vec![0]);
    assert_eq!(report.unfrozen, vec![2]);
    assert!(report.mismatched.is_empty() && report.unknown.is_empty());
    assert_eq!(records.state(0), FreezeState::Yes);
    assert_eq!(records.state(1), FreezeState::No);
    assert_eq!(records.state(2), FreezeState::No);
}
