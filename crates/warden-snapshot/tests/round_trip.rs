use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use warden_ledger::{InMemoryLedger, Ledger, LedgerSigner};
use warden_security::{DenyAll, MasterKey};
use warden_snapshot::{BLOB_DIR, SnapshotConfig, SnapshotManager, SnapshotManifest};
use warden_state::{MemoryAlertSink, StateMachine};
use warden_types::{SystemMode, WardenError};

struct Fixture {
    _dir: tempfile::TempDir,
    manager: SnapshotManager,
    state: Arc<StateMachine>,
    ledger: Arc<InMemoryLedger>,
    source: std::path::PathBuf,
    snapshots: std::path::PathBuf,
    signer: Arc<LedgerSigner>,
    master: MasterKey,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("agents").join("planner");
    fs::create_dir_all(source.join("memory")).unwrap();
    fs::write(source.join("config.json"), r#"{"temperature":0.2}"#).unwrap();
    fs::write(source.join("memory").join("episodes.jsonl"), "{\"n\":1}\n{\"n\":2}\n").unwrap();
    fs::write(source.join("weights.bin"), vec![7u8; 4096]).unwrap();

    let signer = Arc::new(LedgerSigner::generate());
    let ledger = Arc::new(InMemoryLedger::new(signer.clone()));
    let state = Arc::new(StateMachine::new(
        ledger.clone(),
        Arc::new(MemoryAlertSink::new()),
        Arc::new(DenyAll),
    ));
    let master = MasterKey::generate();
    let snapshots = dir.path().join("snapshots");
    let mut config = SnapshotConfig::new(&snapshots);
    config.retention = 2;
    let manager = SnapshotManager::new(config, signer.clone(), master.clone(), state.clone());
    Fixture {
        _dir: dir,
        manager,
        state,
        ledger,
        source,
        snapshots,
        signer,
        master,
    }
}

fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap().display().to_string();
            out.push((rel, fs::read(entry.path()).unwrap()));
        }
    }
    out
}

#[tokio::test]
async fn test_restore_reproduces_state() {
    let f = fixture();
    let before = read_tree(&f.source);
    let created = f.manager.create("planner", &f.source).await.unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(created.files.len(), 3);

    // Plaintext never lands in the archive.
    let blob_dir = f.snapshots.join("planner").join("v000001").join(BLOB_DIR);
    for entry in fs::read_dir(&blob_dir).unwrap() {
        let blob = fs::read(entry.unwrap().path()).unwrap();
        assert!(!blob.windows(11).any(|w| w == b"temperature"));
    }

    fs::write(f.source.join("config.json"), "drifted").unwrap();
    fs::remove_file(f.source.join("weights.bin")).unwrap();
    fs::write(f.source.join("extra.tmp"), "junk").unwrap();

    let restored = f.manager.restore("planner", 1, &f.source).await.unwrap();
    assert_eq!(restored.merkle_root, created.merkle_root);
    assert_eq!(read_tree(&f.source), before);
    assert_eq!(f.state.mode(), SystemMode::Normal);

    let kinds: Vec<&str> = f
        .ledger
        .entries()
        .await
        .unwrap()
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert_eq!(kinds, vec!["snapshot_created", "snapshot_restored"]);
}

#[tokio::test]
async fn test_corrupt_blob_aborts_without_touching_live() {
    let f = fixture();
    f.manager.create("planner", &f.source).await.unwrap();
    fs::write(f.source.join("config.json"), "live edit").unwrap();
    let live_before = read_tree(&f.source);

    let blob_dir = f.snapshots.join("planner").join("v000001").join(BLOB_DIR);
    let victim = blob_dir.join(SnapshotManifest::blob_name("weights.bin"));
    let mut blob = fs::read(&victim).unwrap();
    blob[20] ^= 0xff;
    fs::write(&victim, blob).unwrap();

    let err = f.manager.restore("planner", 1, &f.source).await.unwrap_err();
    assert!(matches!(err, WardenError::SnapshotVerification(_)));
    assert_eq!(read_tree(&f.source), live_before);
    assert_eq!(f.state.mode(), SystemMode::SafeMode);

    let aborted = f
        .ledger
        .query_by_kind("snapshot_restore_aborted")
        .await
        .unwrap();
    assert_eq!(aborted.len(), 1);
    // No staging debris next to the live dir.
    let siblings = fs::read_dir(f.source.parent().unwrap()).unwrap().count();
    assert_eq!(siblings, 1);
}

#[tokio::test]
async fn test_edited_manifest_fails_signature() {
    let f = fixture();
    f.manager.create("planner", &f.source).await.unwrap();
    let manifest_path = f.snapshots.join("planner").join("v000001").join("manifest.json");
    let text = fs::read_to_string(&manifest_path).unwrap();
    let mut manifest: SnapshotManifest = serde_json::from_str(&text).unwrap();
    manifest.files.clear();
    fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();

    let err = f.manager.verify("planner", 1).await.unwrap_err();
    assert!(matches!(err, WardenError::SignatureInvalid(_)));
}

#[tokio::test]
async fn test_root_must_be_in_ledger() {
    let f = fixture();
    f.manager.create("planner", &f.source).await.unwrap();

    // Same keys, but a ledger that never saw the snapshot.
    let other_ledger = Arc::new(InMemoryLedger::new(f.signer.clone()));
    let other_state = Arc::new(StateMachine::new(
        other_ledger.clone(),
        Arc::new(MemoryAlertSink::new()),
        Arc::new(DenyAll),
    ));
    let manager = SnapshotManager::new(
        SnapshotConfig::new(&f.snapshots),
        f.signer.clone(),
        f.master.clone(),
        other_state.clone(),
    );
    let err = manager.restore("planner", 1, &f.source).await.unwrap_err();
    assert!(matches!(err, WardenError::SnapshotVerification(_)));
    assert_eq!(other_state.mode(), SystemMode::SafeMode);
}

#[tokio::test]
async fn test_missing_version_is_not_found() {
    let f = fixture();
    let err = f.manager.restore("planner", 9, &f.source).await.unwrap_err();
    assert!(matches!(err, WardenError::SnapshotNotFound { version: 9, .. }));
    assert_eq!(f.state.mode(), SystemMode::Normal);
}

#[tokio::test]
async fn test_retention_keeps_newest() {
    let f = fixture();
    for _ in 0..4 {
        f.manager.create("planner", &f.source).await.unwrap();
    }
    assert_eq!(f.manager.list("planner").unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(f.manager.prune("planner").await.unwrap(), vec![1, 2]);
    assert_eq!(f.manager.list("planner").unwrap(), vec![3, 4]);
    assert_eq!(f.manager.ids().unwrap(), vec!["planner".to_string()]);
    f.manager.verify("planner", 4).await.unwrap();
    assert_eq!(
        f.ledger.query_by_kind("snapshot_pruned").await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_restore_failure_after_verification_escalates() {
    let f = fixture();
    f.manager.create("planner", &f.source).await.unwrap();

    // The snapshot verifies, but staging cannot be created under a regular file.
    let blocker = f._dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let live = blocker.join("planner");

    let err = f.manager.restore("planner", 1, &live).await.unwrap_err();
    assert!(matches!(err, WardenError::Io(_)));
    assert_eq!(f.state.mode(), SystemMode::SafeMode);
    assert_eq!(fs::read_to_string(&blocker).unwrap(), "not a directory");
    assert_eq!(
        f.ledger
            .query_by_kind("snapshot_restore_aborted")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(f.ledger.query_by_kind("snapshot_restored").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_timeout_commits_nothing() {
    let f = fixture();
    for i in 0..64 {
        fs::write(f.source.join(format!("shard-{i:02}.bin")), vec![i as u8; 64 * 1024]).unwrap();
    }
    let mut config = SnapshotConfig::new(&f.snapshots);
    config.io_timeout = Duration::ZERO;
    let manager = SnapshotManager::new(config, f.signer.clone(), f.master.clone(), f.state.clone());

    let err = manager.create("planner", &f.source).await.unwrap_err();
    assert!(matches!(err, WardenError::Timeout(..)));

    // Nothing was published after the caller saw the failure.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.list("planner").unwrap().is_empty());
    let leftovers = match fs::read_dir(f.snapshots.join("planner")) {
        Ok(dir) => dir.count(),
        Err(_) => 0,
    };
    assert_eq!(leftovers, 0);
    assert!(f.ledger.query_by_kind("snapshot_created").await.unwrap().is_empty());
}
