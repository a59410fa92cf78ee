use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use warden_security::RetryPolicy;
use warden_state::StateMachine;
use warden_types::fsutil::write_atomic;
use warden_types::{
    ArtifactRecord, ArtifactStatus, Digest, LedgerEvent, Result, SystemMode, VerifyResult,
    WardenError,
};

use crate::artifact::ArtifactKind;
use crate::store::IntegrityStore;

/// What to do with an artifact that has no stored baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstUsePolicy {
    /// Record the first observed hash as the baseline.
    #[default]
    Trust,
    /// Refuse until an operator attests the expected hash.
    Attested,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub ok: Vec<String>,
    pub new: Vec<String>,
    pub mismatched: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

struct GateInner {
    store: IntegrityStore,
    registry: BTreeMap<String, ArtifactKind>,
}

/// Decides OK / quarantine / escalate for model artifacts.
pub struct QuarantineGate {
    inner: Mutex<GateInner>,
    state: Arc<StateMachine>,
    quarantine_dir: PathBuf,
    policy: FirstUsePolicy,
    retry: RetryPolicy,
}

fn is_sticky(record: &ArtifactRecord) -> bool {
    matches!(
        record.status,
        ArtifactStatus::Mismatch | ArtifactStatus::Quarantined
    )
}

async fn digest_of(kind: &ArtifactKind) -> Result<Digest> {
    let kind = kind.clone();
    tokio::task::spawn_blocking(move || kind.digest())
        .await
        .map_err(|e| WardenError::Internal(format!("hashing task: {e}")))?
}

impl QuarantineGate {
    pub fn new(
        store: IntegrityStore,
        state: Arc<StateMachine>,
        quarantine_dir: impl Into<PathBuf>,
        policy: FirstUsePolicy,
    ) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                store,
                registry: BTreeMap::new(),
            }),
            state,
            quarantine_dir: quarantine_dir.into(),
            policy,
            retry: RetryPolicy::default(),
        }
    }

    /// Bounds for store writes and quarantine moves.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn persist(&self, store: &IntegrityStore) -> Result<()> {
        let bytes = store.encode()?;
        let path = store.path().to_path_buf();
        self.retry
            .run_blocking("integrity store save", move || write_atomic(&path, &bytes))
            .await
    }

    pub fn policy(&self) -> FirstUsePolicy {
        self.policy
    }

    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine_dir
    }

    /// Register `path` under `name`, resolving its kind.
    pub async fn register(&self, name: &str, path: impl Into<PathBuf>) -> Result<ArtifactKind> {
        let kind = ArtifactKind::resolve(path)?;
        self.inner
            .lock()
            .await
            .registry
            .insert(name.to_string(), kind.clone());
        Ok(kind)
    }

    pub async fn record(&self, name: &str) -> Option<ArtifactRecord> {
        self.inner.lock().await.store.get(name).cloned()
    }

    pub async fn records(&self) -> Vec<ArtifactRecord> {
        self.inner.lock().await.store.records().cloned().collect()
    }

    pub async fn kind(&self, name: &str) -> Option<ArtifactKind> {
        self.inner.lock().await.registry.get(name).cloned()
    }

    /// Verify a path, registering it under its file name.
    pub async fn verify_path(&self, path: &Path) -> Result<VerifyResult> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| WardenError::ArtifactNotFound(path.display().to_string()))?;
        self.register(&name, path).await?;
        self.verify_artifact(&name).await
    }

    /// Compare a registered artifact against its baseline.
    pub async fn verify_artifact(&self, name: &str) -> Result<VerifyResult> {
        let mut inner = self.inner.lock().await;
        let kind = inner
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::ArtifactNotFound(name.to_string()))?;

        if let Some(rec) = inner.store.get(name) {
            if is_sticky(rec) {
                return Err(WardenError::ArtifactQuarantined(name.to_string()));
            }
        }

        let actual = digest_of(&kind).await?;
        let now = Utc::now();

        let Some(baseline) = inner.store.get(name).map(|r| r.content_hash) else {
            if self.policy == FirstUsePolicy::Attested {
                warn!(artifact = name, hash = %actual, "Refusing unattested artifact");
                return Err(WardenError::Unattested(name.to_string()));
            }
            let mut rec = ArtifactRecord::new(name, actual, false);
            rec.last_verified_at = Some(now);
            inner.store.insert(rec);
            self.persist(&inner.store).await?;
            self.state
                .audit(LedgerEvent::ArtifactBaselined {
                    name: name.to_string(),
                    content_hash: actual,
                    attested: false,
                })
                .await?;
            info!(artifact = name, hash = %actual, "Baseline recorded on first use");
            return Ok(VerifyResult::New);
        };

        if baseline == actual {
            if let Some(rec) = inner.store.get_mut(name) {
                rec.status = ArtifactStatus::Ok;
                rec.last_verified_at = Some(now);
            }
            self.persist(&inner.store).await?;
            return Ok(VerifyResult::Ok);
        }

        self.quarantine(&mut inner, name, &kind, baseline, actual)
            .await?;
        Ok(VerifyResult::Mismatch {
            expected: baseline,
            actual,
        })
    }

    async fn quarantine(
        &self,
        inner: &mut GateInner,
        name: &str,
        kind: &ArtifactKind,
        expected: Digest,
        actual: Digest,
    ) -> Result<()> {
        error!(
            artifact = name,
            expected = %expected,
            actual = %actual,
            "Integrity mismatch"
        );
        if let Some(rec) = inner.store.get_mut(name) {
            rec.status = ArtifactStatus::Mismatch;
            rec.last_verified_at = Some(Utc::now());
        }
        // A failed save must not stop the move, the audit or the escalation.
        let marked = self.persist(&inner.store).await;
        if let Err(e) = &marked {
            error!(artifact = name, error = %e, "Could not persist mismatch status");
        }

        let dest = self.quarantine_dir.join(format!(
            "{name}.{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let moved = {
            let src = kind.path().to_path_buf();
            let dest = dest.clone();
            self.retry
                .run_blocking("quarantine move", move || move_path(&src, &dest))
                .await
        };
        let saved = match &moved {
            Ok(()) => {
                if let Some(rec) = inner.store.get_mut(name) {
                    rec.status = ArtifactStatus::Quarantined;
                }
                warn!(artifact = name, dest = %dest.display(), "Artifact quarantined");
                let saved = self.persist(&inner.store).await;
                if let Err(e) = &saved {
                    error!(artifact = name, error = %e, "Could not persist quarantined status");
                }
                saved
            }
            Err(e) => {
                error!(artifact = name, error = %e, "Failed to move artifact to quarantine");
                Ok(())
            }
        };

        let audited = self
            .state
            .audit(LedgerEvent::ArtifactQuarantined {
                name: name.to_string(),
                expected,
                actual,
                quarantine_path: dest.display().to_string(),
            })
            .await;

        let mut reason = format!("artifact integrity mismatch: {name}");
        if marked.is_err() || saved.is_err() {
            reason.push_str("; integrity store write failure");
        }
        self.state.escalate(SystemMode::SafeMode, &reason).await?;
        marked?;
        moved?;
        saved?;
        audited?;
        Ok(())
    }

    /// Clear a quarantined or mismatched record, re-baselining from the
    /// artifact currently at its registered path.
    pub async fn release(&self, name: &str) -> Result<Digest> {
        self.state.refuse_if_degraded("release artifact")?;
        let mut inner = self.inner.lock().await;
        match inner.store.get(name) {
            Some(rec) if is_sticky(rec) => {}
            Some(_) => {
                return Err(WardenError::OperationRefused {
                    mode: self.state.mode(),
                    operation: format!("release {name}: not quarantined"),
                });
            }
            None => return Err(WardenError::ArtifactNotFound(name.to_string())),
        }
        let kind = inner
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::ArtifactNotFound(name.to_string()))?;
        let actual = digest_of(&kind).await?;
        if let Some(rec) = inner.store.get_mut(name) {
            rec.content_hash = actual;
            rec.status = ArtifactStatus::Ok;
            rec.attested = false;
            rec.last_verified_at = Some(Utc::now());
        }
        self.persist(&inner.store).await?;
        self.state
            .audit(LedgerEvent::ArtifactReleased {
                name: name.to_string(),
                content_hash: actual,
            })
            .await?;
        info!(artifact = name, hash = %actual, "Artifact released from quarantine");
        Ok(actual)
    }

    /// Record an operator-supplied expected hash for `name`.
    pub async fn attest(&self, name: &str, content_hash: Digest) -> Result<()> {
        self.state.refuse_in_lockdown("attest artifact")?;
        let mut inner = self.inner.lock().await;
        if let Some(rec) = inner.store.get(name) {
            if is_sticky(rec) {
                return Err(WardenError::ArtifactQuarantined(name.to_string()));
            }
        }
        inner
            .store
            .insert(ArtifactRecord::new(name, content_hash, true));
        self.persist(&inner.store).await?;
        self.state
            .audit(LedgerEvent::ArtifactBaselined {
                name: name.to_string(),
                content_hash,
                attested: true,
            })
            .await?;
        info!(artifact = name, hash = %content_hash, "Artifact attested");
        Ok(())
    }

    /// Register every top-level entry of `models_dir`, then verify all registered artifacts.
    pub async fn scan(&self, models_dir: &Path) -> Result<ScanReport> {
        if models_dir.is_dir() {
            let mut entries = tokio::fs::read_dir(models_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                if let Err(e) = self.register(&name, entry.path()).await {
                    warn!(artifact = %name, error = %e, "Could not register artifact");
                }
            }
        } else {
            warn!(dir = %models_dir.display(), "Models directory missing");
        }

        let names: Vec<String> = self.inner.lock().await.registry.keys().cloned().collect();
        let mut report = ScanReport::default();
        for name in names {
            match self.verify_artifact(&name).await {
                Ok(VerifyResult::Ok) => report.ok.push(name),
                Ok(VerifyResult::New) => report.new.push(name),
                Ok(VerifyResult::Mismatch { .. }) => report.mismatched.push(name),
                Err(e) => report.skipped.push((name, e.to_string())),
            }
        }
        info!(
            ok = report.ok.len(),
            new = report.new.len(),
            mismatched = report.mismatched.len(),
            skipped = report.skipped.len(),
            "Integrity scan finished"
        );
        Ok(report)
    }
}

/// Rename `src` to `dst`, falling back to copy-then-remove across filesystems.
fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    if src.is_dir() {
        for entry in WalkDir::new(src) {
            let entry = entry.map_err(|e| WardenError::Io(std::io::Error::other(e.to_string())))?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| WardenError::Internal(e.to_string()))?;
            let target = dst.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        std::fs::remove_dir_all(src)?;
    } else {
        std::fs::copy(src, dst)?;
        std::fs::remove_file(src)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_ledger::{InMemoryLedger, Ledger};
    use warden_security::DenyAll;
    use warden_state::MemoryAlertSink;

    struct Fixture {
        _dir: tempfile::TempDir,
        models: PathBuf,
        quarantine: PathBuf,
        ledger: Arc<InMemoryLedger>,
        state: Arc<StateMachine>,
        gate: QuarantineGate,
    }

    fn fixture(policy: FirstUsePolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        let quarantine = dir.path().join("quarantine");
        std::fs::create_dir_all(&models).unwrap();
        let ledger = Arc::new(InMemoryLedger::with_generated_key());
        let state = Arc::new(StateMachine::new(
            ledger.clone(),
            Arc::new(MemoryAlertSink::new()),
            Arc::new(DenyAll),
        ));
        let store = IntegrityStore::load(dir.path().join("integrity.json")).unwrap();
        let gate = QuarantineGate::new(store, state.clone(), &quarantine, policy).with_retry(
            RetryPolicy::new(2, std::time::Duration::from_secs(5), std::time::Duration::from_millis(1)),
        );
        Fixture {
            _dir: dir,
            models,
            quarantine,
            ledger,
            state,
            gate,
        }
    }

    #[tokio::test]
    async fn test_first_use_then_ok() {
        let f = fixture(FirstUsePolicy::Trust);
        let path = f.models.join("model.bin");
        std::fs::write(&path, b"h0").unwrap();

        assert_eq!(f.gate.verify_path(&path).await.unwrap(), VerifyResult::New);
        assert_eq!(f.gate.verify_path(&path).await.unwrap(), VerifyResult::Ok);
        let rec = f.gate.record("model.bin").await.unwrap();
        assert_eq!(rec.status, ArtifactStatus::Ok);
        assert!(rec.last_verified_at.is_some());
        assert_eq!(
            f.ledger.query_by_kind("artifact_baselined").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_attested_policy_refuses_unknown() {
        let f = fixture(FirstUsePolicy::Attested);
        let path = f.models.join("model.bin");
        std::fs::write(&path, b"weights").unwrap();
        assert!(matches!(
            f.gate.verify_path(&path).await,
            Err(WardenError::Unattested(_))
        ));

        f.gate.attest("model.bin", Digest::of(b"weights")).await.unwrap();
        assert_eq!(f.gate.verify_path(&path).await.unwrap(), VerifyResult::Ok);
    }

    #[tokio::test]
    async fn test_attested_mismatch_quarantines() {
        let f = fixture(FirstUsePolicy::Attested);
        let path = f.models.join("model.bin");
        std::fs::write(&path, b"swapped").unwrap();
        f.gate.attest("model.bin", Digest::of(b"genuine")).await.unwrap();
        assert!(f.gate.verify_path(&path).await.unwrap().is_mismatch());
        assert_eq!(f.state.mode(), SystemMode::SafeMode);
    }

    #[tokio::test]
    async fn test_quarantined_record_is_sticky() {
        let f = fixture(FirstUsePolicy::Trust);
        let path = f.models.join("model.bin");
        std::fs::write(&path, b"h0").unwrap();
        f.gate.verify_path(&path).await.unwrap();
        std::fs::write(&path, b"h1").unwrap();
        assert!(f.gate.verify_path(&path).await.unwrap().is_mismatch());

        // Putting the original bytes back does not silently clear it.
        std::fs::write(&path, b"h0").unwrap();
        assert!(matches!(
            f.gate.verify_artifact("model.bin").await,
            Err(WardenError::ArtifactQuarantined(_))
        ));
        assert!(f.gate.attest("model.bin", Digest::of(b"h0")).await.is_err());

        // Release is refused while degraded.
        assert!(matches!(
            f.gate.release("model.bin").await,
            Err(WardenError::OperationRefused { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_after_recovery() {
        let f = fixture(FirstUsePolicy::Trust);
        let path = f.models.join("model.bin");
        std::fs::write(&path, b"h0").unwrap();
        f.gate.verify_path(&path).await.unwrap();
        std::fs::write(&path, b"h1").unwrap();
        f.gate.verify_path(&path).await.unwrap();

        f.state.transition(SystemMode::Normal, "operator reviewed").await.unwrap();
        std::fs::write(&path, b"h2").unwrap();
        let released = f.gate.release("model.bin").await.unwrap();
        assert_eq!(released, Digest::of(b"h2"));
        assert_eq!(f.gate.verify_artifact("model.bin").await.unwrap(), VerifyResult::Ok);
        assert_eq!(
            f.ledger.query_by_kind("artifact_released").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_checkpoint_directory_quarantined_whole() {
        let f = fixture(FirstUsePolicy::Trust);
        let ckpt = f.models.join("llm-ckpt");
        std::fs::create_dir_all(ckpt.join("shards")).unwrap();
        std::fs::write(ckpt.join("shards/0"), b"a").unwrap();
        f.gate.verify_path(&ckpt).await.unwrap();

        std::fs::write(ckpt.join("shards/1"), b"injected").unwrap();
        assert!(f.gate.verify_path(&ckpt).await.unwrap().is_mismatch());
        assert!(!ckpt.exists());
        let quarantined: Vec<_> = std::fs::read_dir(&f.quarantine).unwrap().collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_reports() {
        let f = fixture(FirstUsePolicy::Trust);
        std::fs::write(f.models.join("a.bin"), b"a").unwrap();
        std::fs::write(f.models.join("b.bin"), b"b").unwrap();
        std::fs::write(f.models.join(".hidden"), b"x").unwrap();

        let first = f.gate.scan(&f.models).await.unwrap();
        assert_eq!(first.new.len(), 2);

        std::fs::write(f.models.join("b.bin"), b"changed").unwrap();
        let second = f.gate.scan(&f.models).await.unwrap();
        assert_eq!(second.ok, vec!["a.bin".to_string()]);
        assert_eq!(second.mismatched, vec!["b.bin".to_string()]);

        let third = f.gate.scan(&f.models).await.unwrap();
        assert_eq!(third.skipped.len(), 1);
        assert_eq!(f.ledger.verify_chain().await.unwrap(), f.ledger.len().await as u64);
    }

    #[tokio::test]
    async fn test_store_failure_still_quarantines_and_escalates() {
        let f = fixture(FirstUsePolicy::Trust);
        let path = f.models.join("model.bin");
        std::fs::write(&path, b"h0").unwrap();
        f.gate.verify_path(&path).await.unwrap();

        // The store file becomes unwritable.
        let store_path = f._dir.path().join("integrity.json");
        std::fs::remove_file(&store_path).unwrap();
        std::fs::create_dir(&store_path).unwrap();

        std::fs::write(&path, b"tampered").unwrap();
        assert!(f.gate.verify_artifact("model.bin").await.is_err());
        assert_eq!(f.state.mode(), SystemMode::SafeMode);
        assert!(f.state.state().reason.contains("integrity store write failure"));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(&f.quarantine).unwrap().count(), 1);
        assert_eq!(
            f.ledger.query_by_kind("artifact_quarantined").await.unwrap().len(),
            1
        );
        // The in-memory record is still sticky.
        assert!(matches!(
            f.gate.verify_artifact("model.bin").await,
            Err(WardenError::ArtifactQuarantined(_))
        ));
    }
}
