use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use warden_ledger::LedgerSigner;
use warden_security::MasterKey;
use warden_state::StateMachine;
use warden_types::fsutil::write_atomic;
use warden_types::{Digest, LedgerEvent, Result, SystemMode, WardenError};

use crate::crypto::SnapshotCipher;
use crate::manifest::{
    BLOB_DIR, MANIFEST_FILE, SIGNATURE_FILE, SnapshotManifest, validate_rel_path,
};

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub snapshot_dir: PathBuf,
    /// Versions kept per snapshot id.
    pub retention: usize,
    pub io_timeout: Duration,
}

impl SnapshotConfig {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            retention: 10,
            io_timeout: Duration::from_secs(60),
        }
    }
}

/// A directory tracked by the periodic snapshot loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSource {
    pub id: String,
    pub dir: PathBuf,
}

/// Every subdirectory of `agent_state_dir` is one source, named after it.
pub fn discover_sources(agent_state_dir: &Path) -> Result<Vec<SnapshotSource>> {
    if !agent_state_dir.exists() {
        return Ok(Vec::new());
    }
    let mut sources = Vec::new();
    for entry in fs::read_dir(agent_state_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && !name.starts_with('.') {
            sources.push(SnapshotSource {
                id: name,
                dir: entry.path(),
            });
        }
    }
    sources.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(sources)
}

pub struct SnapshotManager {
    config: SnapshotConfig,
    signer: Arc<LedgerSigner>,
    master: MasterKey,
    state: Arc<StateMachine>,
    lock: Mutex<()>,
}

impl SnapshotManager {
    pub fn new(
        config: SnapshotConfig,
        signer: Arc<LedgerSigner>,
        master: MasterKey,
        state: Arc<StateMachine>,
    ) -> Self {
        Self {
            config,
            signer,
            master,
            state,
            lock: Mutex::new(()),
        }
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.config.snapshot_dir
    }

    fn version_dir(&self, id: &str, version: u64) -> PathBuf {
        self.config.snapshot_dir.join(id).join(format!("v{version:06}"))
    }

    /// Versions of `id`, ascending.
    pub fn list(&self, id: &str) -> Result<Vec<u64>> {
        validate_id(id)?;
        list_versions(&self.config.snapshot_dir.join(id))
    }

    /// Snapshot ids present on disk.
    pub fn ids(&self) -> Result<Vec<String>> {
        let root = &self.config.snapshot_dir;
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Run `f` on the blocking pool under the I/O timeout. On timeout the task
    /// is still awaited, so its side effects are finished before this returns.
    /// Callers keep commit steps out of `f`.
    async fn blocking<T, F>(&self, label: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.config.io_timeout, &mut task).await {
            Ok(joined) => settle(label, joined),
            Err(_) => {
                warn!(operation = label, "I/O timeout; waiting for the task to settle");
                let _ = settle(label, task.await);
                Err(WardenError::Timeout(self.config.io_timeout, label.to_string()))
            }
        }
    }

    /// Encrypt every file of `source_dir` into a new version of `id`, sign
    /// the manifest and ledger its Merkle root.
    pub async fn create(&self, id: &str, source_dir: &Path) -> Result<SnapshotManifest> {
        validate_id(id)?;
        let _guard = self.lock.lock().await;
        let version = self.list(id)?.last().copied().unwrap_or(0) + 1;
        let cipher = SnapshotCipher::for_snapshot(&self.master, id, version)?;
        let signer = self.signer.clone();
        let source = source_dir.to_path_buf();
        let final_dir = self.version_dir(id, version);
        let staging = sibling(&final_dir, "staging");
        let snapshot_id = id.to_string();

        let staged = {
            let staging = staging.clone();
            self.blocking("snapshot create", move || {
                write_snapshot(&snapshot_id, version, &source, &staging, &cipher, &signer)
            })
            .await
        };
        // The version only becomes visible once staging is complete.
        let committed = match staged {
            Ok(manifest) => tokio::fs::rename(&staging, &final_dir)
                .await
                .map(|_| manifest)
                .map_err(WardenError::from),
            Err(e) => Err(e),
        };
        let manifest = match committed {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        info!(
            snapshot = id,
            version,
            files = manifest.files.len(),
            root = %manifest.merkle_root,
            "Snapshot created"
        );
        self.state
            .audit(LedgerEvent::SnapshotCreated {
                snapshot_id: id.to_string(),
                version,
                merkle_root: manifest.merkle_root,
                file_count: manifest.files.len(),
            })
            .await?;
        Ok(manifest)
    }

    /// Full verification of one version without touching any live state.
    pub async fn verify(&self, id: &str, version: u64) -> Result<SnapshotManifest> {
        let (manifest, _) = self.verify_contents(id, version).await?;
        Ok(manifest)
    }

    async fn verify_contents(
        &self,
        id: &str,
        version: u64,
    ) -> Result<(SnapshotManifest, BTreeMap<String, Vec<u8>>)> {
        validate_id(id)?;
        let dir = self.version_dir(id, version);
        if !dir.join(MANIFEST_FILE).exists() {
            return Err(WardenError::SnapshotNotFound {
                id: id.to_string(),
                version,
            });
        }
        let cipher = SnapshotCipher::for_snapshot(&self.master, id, version)?;
        let key = self.signer.verifying_key();
        let (expected_id, expected_version) = (id.to_string(), version);
        let (manifest, contents) = self
            .blocking("snapshot verify", move || {
                read_verified(&dir, &key, &cipher, &expected_id, expected_version)
            })
            .await?;

        let recorded = self.ledger_root(id, version).await?;
        if recorded != manifest.merkle_root {
            return Err(WardenError::SnapshotVerification(format!(
                "{id}@{version}: Merkle root {} does not match ledger {recorded}",
                manifest.merkle_root
            )));
        }
        Ok((manifest, contents))
    }

    /// Root recorded for this version in a verified ledger.
    async fn ledger_root(&self, id: &str, version: u64) -> Result<Digest> {
        let ledger = self.state.ledger();
        ledger.verify_chain().await?;
        ledger
            .query_by_kind("snapshot_created")
            .await?
            .iter()
            .rev()
            .find_map(|entry| match &entry.event {
                LedgerEvent::SnapshotCreated {
                    snapshot_id,
                    version: v,
                    merkle_root,
                    ..
                } if snapshot_id == id && *v == version => Some(*merkle_root),
                _ => None,
            })
            .ok_or_else(|| {
                WardenError::SnapshotVerification(format!("{id}@{version} has no ledgered root"))
            })
    }

    /// Verify `id@version` completely, then replace `live_dir` with its
    /// contents through a staged rename. Any failure leaves `live_dir`
    /// untouched and escalates to SAFE_MODE.
    pub async fn restore(&self, id: &str, version: u64, live_dir: &Path) -> Result<SnapshotManifest> {
        let _guard = self.lock.lock().await;
        let result = self.verify_and_swap(id, version, live_dir).await;
        match result {
            Ok(manifest) => {
                info!(snapshot = id, version, live = %live_dir.display(), "Snapshot restored");
                self.state
                    .audit(LedgerEvent::SnapshotRestored {
                        snapshot_id: id.to_string(),
                        version,
                        merkle_root: manifest.merkle_root,
                    })
                    .await?;
                Ok(manifest)
            }
            Err(e @ WardenError::SnapshotNotFound { .. }) => Err(e),
            Err(e) => {
                self.abort_restore(id, version, &e).await;
                Err(e)
            }
        }
    }

    async fn verify_and_swap(
        &self,
        id: &str,
        version: u64,
        live_dir: &Path,
    ) -> Result<SnapshotManifest> {
        let (manifest, contents) = self.verify_contents(id, version).await?;
        let live = live_dir.to_path_buf();
        let staging = sibling(&live, "restore");

        let staged = {
            let staging = staging.clone();
            self.blocking("snapshot restore", move || stage_contents(&staging, &contents))
                .await
        };
        // The swap is not timed: once started it runs to completion.
        let swapped = match staged {
            Ok(()) => {
                let staging = staging.clone();
                settle(
                    "snapshot swap",
                    tokio::task::spawn_blocking(move || swap_into_place(&staging, &live)).await,
                )
            }
            Err(e) => Err(e),
        };
        if let Err(e) = swapped {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }
        Ok(manifest)
    }

    async fn abort_restore(&self, id: &str, version: u64, err: &WardenError) {
        let reason = err.to_string();
        error!(snapshot = id, version, error = %reason, "Snapshot restore aborted");
        if let Err(e) = self
            .state
            .audit(LedgerEvent::SnapshotRestoreAborted {
                snapshot_id: id.to_string(),
                version,
                reason,
            })
            .await
        {
            warn!(error = %e, "Could not ledger aborted restore");
        }
        if let Err(e) = self
            .state
            .escalate(SystemMode::SafeMode, &format!("snapshot restore aborted: {id}@{version}"))
            .await
        {
            error!(error = %e, "Escalation after aborted restore failed");
        }
    }

    /// Drop all but the newest `retention` versions of `id`.
    pub async fn prune(&self, id: &str) -> Result<Vec<u64>> {
        let _guard = self.lock.lock().await;
        let versions = self.list(id)?;
        let excess = versions.len().saturating_sub(self.config.retention.max(1));
        let mut pruned = Vec::new();
        for version in versions.into_iter().take(excess) {
            fs::remove_dir_all(self.version_dir(id, version))?;
            info!(snapshot = id, version, "Snapshot pruned");
            self.state
                .audit(LedgerEvent::SnapshotPruned {
                    snapshot_id: id.to_string(),
                    version,
                })
                .await?;
            pruned.push(version);
        }
        Ok(pruned)
    }

    /// Snapshot and prune every source once. Errors are logged per source.
    pub async fn snapshot_all(&self, sources: &[SnapshotSource]) -> usize {
        let mut created = 0;
        for source in sources {
            match self.create(&source.id, &source.dir).await {
                Ok(_) => created += 1,
                Err(e) => {
                    error!(snapshot = %source.id, error = %e, "Periodic snapshot failed");
                    continue;
                }
            }
            if let Err(e) = self.prune(&source.id).await {
                warn!(snapshot = %source.id, error = %e, "Prune failed");
            }
        }
        created
    }

    /// Periodic snapshot loop. Runs until `shutdown_rx` flips to true.
    pub async fn run(
        self: Arc<Self>,
        agent_state_dir: PathBuf,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match discover_sources(&agent_state_dir) {
                        Ok(sources) => {
                            self.snapshot_all(&sources).await;
                        }
                        Err(e) => error!(dir = %agent_state_dir.display(), error = %e, "Cannot list agent state"),
                    }
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Snapshot loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn settle<T>(label: &str, joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(|e| WardenError::Internal(format!("{label} task failed: {e}")))?
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(WardenError::SnapshotVerification(format!(
            "invalid snapshot id {id:?}"
        )));
    }
    Ok(())
}

fn list_versions(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut versions = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(v) = name.to_str().and_then(|n| n.strip_prefix('v')).and_then(|n| n.parse().ok()) {
            versions.push(v);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

/// Hidden sibling of `path` with a unique suffix.
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{tag}-{}", Uuid::new_v4().simple()))
}

fn rel_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| WardenError::Internal(format!("{} escapes {}", path.display(), root.display())))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn write_snapshot(
    id: &str,
    version: u64,
    source: &Path,
    staging: &Path,
    cipher: &SnapshotCipher,
    signer: &LedgerSigner,
) -> Result<SnapshotManifest> {
    if !source.is_dir() {
        return Err(WardenError::ArtifactNotFound(source.display().to_string()));
    }
    let blob_dir = staging.join(BLOB_DIR);
    fs::create_dir_all(&blob_dir)?;

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| WardenError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = rel_path(source, entry.path())?;
        let plaintext = fs::read(entry.path())?;
        files.insert(rel.clone(), Digest::of(&plaintext));
        let blob = cipher.seal(&rel, &plaintext)?;
        write_atomic(&blob_dir.join(SnapshotManifest::blob_name(&rel)), &blob)?;
    }

    let mut manifest = SnapshotManifest::new(id, version, files);
    manifest.sign(signer)?;
    write_atomic(&staging.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
    write_atomic(&staging.join(SIGNATURE_FILE), manifest.signature.as_bytes())?;
    Ok(manifest)
}

fn read_verified(
    dir: &Path,
    key: &VerifyingKey,
    cipher: &SnapshotCipher,
    expected_id: &str,
    expected_version: u64,
) -> Result<(SnapshotManifest, BTreeMap<String, Vec<u8>>)> {
    let manifest: SnapshotManifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;
    if manifest.snapshot_id != expected_id || manifest.version != expected_version {
        return Err(WardenError::SnapshotVerification(format!(
            "manifest names {}@{}",
            manifest.snapshot_id, manifest.version
        )));
    }
    let detached = fs::read_to_string(dir.join(SIGNATURE_FILE))?;
    if detached.trim() != manifest.signature {
        return Err(WardenError::SignatureInvalid(
            "detached signature differs from manifest".into(),
        ));
    }
    manifest.verify_signature(key)?;

    let blob_dir = dir.join(BLOB_DIR);
    let mut expected: BTreeMap<String, &str> = BTreeMap::new();
    for rel in manifest.files.keys() {
        validate_rel_path(rel)?;
        expected.insert(SnapshotManifest::blob_name(rel), rel.as_str());
    }
    for entry in fs::read_dir(&blob_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !expected.contains_key(&name) {
            return Err(WardenError::SnapshotVerification(format!(
                "unlisted blob {name}"
            )));
        }
    }

    let mut contents = BTreeMap::new();
    for (blob_name, rel) in expected {
        let blob = fs::read(blob_dir.join(&blob_name)).map_err(|e| {
            WardenError::SnapshotVerification(format!("{rel}: blob unreadable: {e}"))
        })?;
        let plaintext = cipher.open(rel, &blob)?;
        let actual = Digest::of(&plaintext);
        let listed = manifest.files.get(rel).copied().unwrap_or(Digest::ZERO);
        if actual != listed {
            return Err(WardenError::SnapshotVerification(format!(
                "{rel}: hash {actual} does not match manifest {listed}"
            )));
        }
        contents.insert(rel.to_string(), plaintext);
    }

    let root = SnapshotManifest::root_of(&manifest.files);
    if root != manifest.merkle_root {
        return Err(WardenError::SnapshotVerification(format!(
            "Merkle root {root} does not match manifest {}",
            manifest.merkle_root
        )));
    }
    Ok((manifest, contents))
}

fn stage_contents(staging: &Path, contents: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    fs::create_dir_all(staging)?;
    for (rel, data) in contents {
        write_atomic(&staging.join(rel), data)?;
    }
    Ok(())
}

/// Swap `staging` into `live`. The old tree is renamed aside first and put
/// back if the second rename fails.
fn swap_into_place(staging: &Path, live: &Path) -> Result<()> {
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent)?;
    }
    let had_live = live.exists();
    let backup = sibling(live, "old");
    if had_live {
        fs::rename(live, &backup)?;
    }
    if let Err(e) = fs::rename(staging, live) {
        if had_live {
            let _ = fs::rename(&backup, live);
        }
        return Err(e.into());
    }
    if had_live {
        fs::remove_dir_all(&backup)?;
    }
    Ok(())
}
