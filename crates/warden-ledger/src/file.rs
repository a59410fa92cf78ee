use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use warden_security::RetryPolicy;
use warden_types::{Digest, LedgerEvent, Result, WardenError};

use crate::chain::{ChainVerifier, read_entries};
use crate::counter::MonotonicCounter;
use crate::entry::{EntryRef, LedgerEntry};
use crate::signer::LedgerSigner;
use crate::traits::Ledger;

#[derive(Debug, Clone, Copy)]
struct ChainHead {
    next_index: u64,
    last_hash: Digest,
    last_counter: u64,
    file_len: u64,
}

/// JSON Lines ledger on disk. The head mutex is the single append critical section.
pub struct FileLedger {
    path: PathBuf,
    signer: Arc<LedgerSigner>,
    counter: Arc<dyn MonotonicCounter>,
    retry: RetryPolicy,
    head: Mutex<ChainHead>,
}

impl FileLedger {
    /// Open (or create) the ledger at `path`, verifying the existing chain
    /// and checking it against the external counter.
    pub async fn open(
        path: impl Into<PathBuf>,
        signer: Arc<LedgerSigner>,
        counter: Arc<dyn MonotonicCounter>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = read_blocking(&path, &retry).await?;
        let key = signer.verifying_key();
        let mut verifier = ChainVerifier::new(&key);
        for entry in &entries {
            verifier.check(entry)?;
        }

        let last_counter = verifier.last_counter();
        let attested = counter.current()?;
        if attested > last_counter {
            error!(
                path = %path.display(),
                ledger = last_counter,
                attested,
                "Ledger counter is behind the attested counter"
            );
            return Err(WardenError::CounterRollback {
                ledger: last_counter,
                attested,
            });
        }
        if attested < last_counter {
            counter.advance_to(last_counter)?;
        }

        let file_len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            entries = verifier.verified(),
            "Ledger opened"
        );

        Ok(Self {
            head: Mutex::new(ChainHead {
                next_index: verifier.verified(),
                last_hash: verifier.head(),
                last_counter,
                file_len,
            }),
            path,
            signer,
            counter,
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn signer(&self) -> &Arc<LedgerSigner> {
        &self.signer
    }
}

async fn read_blocking(path: &Path, retry: &RetryPolicy) -> Result<Vec<LedgerEntry>> {
    let path = path.to_path_buf();
    retry
        .run_blocking("ledger read", move || read_entries(&path))
        .await
}

/// Write `bytes` at `offset`, discarding anything past it first. A retried
/// attempt rewrites the same bytes at the same place instead of duplicating them.
fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()
}

fn truncate_to(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()
}

#[async_trait]
impl Ledger for FileLedger {
    async fn append(&self, event: LedgerEvent) -> Result<EntryRef> {
        let mut head = self.head.lock().await;
        let counter = head.last_counter.max(self.counter.current()?) + 1;
        let kind = event.kind();
        let entry = LedgerEntry::seal(head.next_index, head.last_hash, event, counter, &self.signer)?;
        let line = entry.to_line()?;
        let line_len = line.len() as u64;
        let offset = head.file_len;

        // Every attempt has settled when this returns, so the truncate below
        // cannot race a late write.
        let path = self.path.clone();
        let written = self
            .retry
            .run_blocking("ledger append", move || {
                write_at(&path, offset, &line).map_err(WardenError::from)
            })
            .await;

        if let Err(e) = written {
            error!(index = entry.index, kind, error = %e, "Ledger append failed");
            let path = self.path.clone();
            let truncated = tokio::task::spawn_blocking(move || truncate_to(&path, offset)).await;
            if !matches!(truncated, Ok(Ok(()))) {
                warn!(offset, "Could not trim ledger tail after failed append");
            }
            return Err(WardenError::LedgerUnavailable(format!(
                "append of entry {} failed: {e}",
                entry.index
            )));
        }

        if let Err(e) = self.counter.advance_to(counter) {
            warn!(counter, error = %e, "Entry written but counter not advanced");
        }

        head.next_index += 1;
        head.last_hash = entry.current_hash;
        head.last_counter = counter;
        head.file_len = offset + line_len;
        debug!(index = entry.index, kind, "Ledger entry appended");
        Ok(entry.entry_ref())
    }

    async fn verify_chain(&self) -> Result<u64> {
        let head = self.head.lock().await;
        let entries = read_blocking(&self.path, &self.retry).await?;
        let key = self.signer.verifying_key();
        let mut verifier = ChainVerifier::new(&key);
        for entry in &entries {
            verifier.check(entry)?;
        }
        if verifier.verified() != head.next_index || verifier.head() != head.last_hash {
            return Err(WardenError::ChainDivergence {
                index: verifier.verified().min(head.next_index),
                reason: "ledger file truncated or rewritten since open".into(),
            });
        }
        let attested = self.counter.current()?;
        if attested > verifier.last_counter() {
            return Err(WardenError::CounterRollback {
                ledger: verifier.last_counter(),
                attested,
            });
        }
        Ok(verifier.verified())
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        read_blocking(&self.path, &self.retry).await
    }

    async fn latest(&self) -> Result<Option<EntryRef>> {
        let head = self.head.lock().await;
        if head.next_index == 0 {
            return Ok(None);
        }
        Ok(Some(EntryRef {
            index: head.next_index - 1,
            current_hash: head.last_hash,
            monotonic_counter: head.last_counter,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{FileCounter, InMemoryCounter};
    use warden_types::{AgentId, SystemMode};

    fn event(n: usize) -> LedgerEvent {
        LedgerEvent::AgentSpawned {
            agent: AgentId::from(format!("agent-{n}")),
            incarnation: uuid::Uuid::new_v4(),
        }
    }

    async fn open(path: &Path, signer: Arc<LedgerSigner>, counter: Arc<dyn MonotonicCounter>) -> Result<FileLedger> {
        FileLedger::open(path, signer, counter, RetryPolicy::default()).await
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, std::time::Duration::from_millis(500), std::time::Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let signer = Arc::new(LedgerSigner::generate());
        let counter: Arc<dyn MonotonicCounter> = Arc::new(InMemoryCounter::default());

        {
            let ledger = open(&path, signer.clone(), counter.clone()).await.unwrap();
            for i in 0..3 {
                ledger.append(event(i)).await.unwrap();
            }
            assert_eq!(ledger.verify_chain().await.unwrap(), 3);
        }

        let ledger = open(&path, signer.clone(), counter.clone()).await.unwrap();
        let next = ledger
            .append(LedgerEvent::StateTransition {
                from: SystemMode::Normal,
                to: SystemMode::SafeMode,
                reason: "reopened".into(),
            })
            .await
            .unwrap();
        assert_eq!(next.index, 3);
        assert_eq!(ledger.verify_chain().await.unwrap(), 4);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_restoring_old_ledger_is_a_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let signer = Arc::new(LedgerSigner::generate());
        let counter: Arc<dyn MonotonicCounter> =
            Arc::new(FileCounter::open(dir.path().join("ledger.counter")).unwrap());

        let ledger = open(&path, signer.clone(), counter.clone()).await.unwrap();
        ledger.append(event(0)).await.unwrap();
        let old_copy = std::fs::read(&path).unwrap();
        ledger.append(event(1)).await.unwrap();
        drop(ledger);

        std::fs::write(&path, old_copy).unwrap();
        let counter: Arc<dyn MonotonicCounter> =
            Arc::new(FileCounter::open(dir.path().join("ledger.counter")).unwrap());
        match open(&path, signer, counter).await {
            Err(WardenError::CounterRollback { ledger, attested }) => {
                assert_eq!(ledger, 1);
                assert_eq!(attested, 2);
            }
            Err(other) => panic!("expected rollback, got {other:?}"),
            Ok(_) => panic!("expected rollback, ledger opened"),
        }
    }

    #[tokio::test]
    async fn test_truncation_after_open_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let signer = Arc::new(LedgerSigner::generate());
        let ledger = open(&path, signer, Arc::new(InMemoryCounter::default()))
            .await
            .unwrap();
        for i in 0..3 {
            ledger.append(event(i)).await.unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let first_two: String = text.lines().take(2).map(|l| format!("{l}\n")).collect();
        std::fs::write(&path, first_two).unwrap();

        assert!(matches!(
            ledger.verify_chain().await,
            Err(WardenError::ChainDivergence { index: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_foreign_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = open(
            &path,
            Arc::new(LedgerSigner::generate()),
            Arc::new(InMemoryCounter::default()),
        )
        .await
        .unwrap();
        ledger.append(event(0)).await.unwrap();
        drop(ledger);

        let result = open(
            &path,
            Arc::new(LedgerSigner::generate()),
            Arc::new(InMemoryCounter::default()),
        )
        .await;
        assert!(matches!(result, Err(WardenError::ChainDivergence { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_latest_tracks_head() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(
            &dir.path().join("ledger.jsonl"),
            Arc::new(LedgerSigner::generate()),
            Arc::new(InMemoryCounter::default()),
        )
        .await
        .unwrap();
        assert!(ledger.latest().await.unwrap().is_none());
        let r = ledger.append(event(0)).await.unwrap();
        assert_eq!(ledger.latest().await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn test_failed_append_keeps_head_and_next_write_trims_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = FileLedger::open(
            &path,
            Arc::new(LedgerSigner::generate()),
            Arc::new(InMemoryCounter::default()),
            fast_retry(),
        )
        .await
        .unwrap();
        let first = ledger.append(event(0)).await.unwrap();
        let good = std::fs::read(&path).unwrap();

        // Every attempt fails while the ledger path is a directory.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        match ledger.append(event(1)).await {
            Err(WardenError::LedgerUnavailable(msg)) => assert!(msg.contains("entry 1")),
            other => panic!("expected ledger unavailable, got {other:?}"),
        }
        assert_eq!(ledger.latest().await.unwrap(), Some(first));

        // Put the file back with a torn partial line after the last good entry.
        std::fs::remove_dir(&path).unwrap();
        let mut torn = good;
        torn.extend_from_slice(b"{\"index\":1,\"prev");
        std::fs::write(&path, torn).unwrap();

        let second = ledger.append(event(2)).await.unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(ledger.verify_chain().await.unwrap(), 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
