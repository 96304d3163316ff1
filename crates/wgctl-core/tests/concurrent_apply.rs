use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wgctl_core::{
    AllowedIp, ConfigStore, LocalShell, PeerOp, ProvisionedKeyPair, PublicKey, Registry, RegistryError,
    ServiceReloader, StoreError,
};

const TIMEOUT: Duration = Duration::from_secs(30);

const INTERFACE: &str = "[Interface]\nAddress = 10.1.0.1/16\nListenPort = 51820\n";

/// Separate open handle on the same registry, as a second process would have
fn open_store(dir: &Path) -> ConfigStore {
    let reloader = ServiceReloader::new(
        Arc::new(LocalShell::new(TIMEOUT)),
        format!("echo reload >> {}", dir.join("reloads").display()),
        dir.join("reload.log"),
        TIMEOUT,
    );
    ConfigStore::open(dir.join("wg1.conf"), reloader, 25, TIMEOUT).unwrap()
}

fn reload_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("reloads"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn address(i: usize) -> AllowedIp {
    format!("10.1.0.{}/32", i + 2).parse().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_changes_from_two_handles_all_land() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("wg1.conf"), INTERFACE).unwrap();
    let stores = [Arc::new(open_store(dir.path())), Arc::new(open_store(dir.path()))];
    let keys: Vec<PublicKey> = (0..12).map(|_| ProvisionedKeyPair::generate().public).collect();

    let mut tasks = Vec::new();
    for (i, key) in keys.iter().copied().enumerate() {
        let store = stores[i % 2].clone();
        tasks.push(tokio::spawn(async move {
            store.apply(&PeerOp::Add(vec![address(i)]), &key).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut tasks = Vec::new();
    for (i, key) in keys.iter().copied().enumerate().filter(|(i, _)| i % 3 == 0) {
        let store = stores[(i + 1) % 2].clone();
        tasks.push(tokio::spawn(async move { store.apply(&PeerOp::Ban, &key).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let peers = stores[0].peers().await.unwrap();
    assert_eq!(peers.len(), keys.len());
    for (i, key) in keys.iter().enumerate() {
        let peer = peers.iter().find(|p| p.public_key == *key).unwrap();
        assert_eq!(peer.allowed_ips, vec![address(i)]);
        assert_eq!(peer.enabled, i % 3 != 0, "peer {i}");
    }
    assert_eq!(reload_count(dir.path()), 12 + 4);

    let text = std::fs::read_to_string(dir.path().join("wg1.conf")).unwrap();
    assert!(text.starts_with(INTERFACE));
    assert!(text.ends_with('\n'));
    assert_eq!(Registry::parse(&text).peers().len(), keys.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_bans_on_one_peer_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let key = ProvisionedKeyPair::generate().public;
    std::fs::write(
        dir.path().join("wg1.conf"),
        format!("{INTERFACE}\n[Peer]\nPublicKey = {key}\nAllowedIPs = 10.1.0.2/32\n"),
    )
    .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = open_store(dir.path());
        tasks.push(tokio::spawn(async move { store.apply(&PeerOp::Ban, &key).await }));
    }

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => applied += 1,
            Err(StoreError::Registry(RegistryError::AlreadyBanned(k))) => assert_eq!(k, key),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(reload_count(dir.path()), 1);
    let text = std::fs::read_to_string(dir.path().join("wg1.conf")).unwrap();
    assert!(text.contains(&format!("# [Peer]\n# PublicKey = {key}\n")));
    assert!(!text.contains("# # "));
}
