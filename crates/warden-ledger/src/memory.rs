use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use warden_types::{Digest, LedgerEvent, Result, WardenError};

use crate::chain::verify_entries;
use crate::entry::{EntryRef, LedgerEntry};
use crate::signer::LedgerSigner;
use crate::traits::Ledger;

/// Ledger held in memory. Same sealing and verification as the file ledger.
#[derive(Clone)]
pub struct InMemoryLedger {
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
    signer: Arc<LedgerSigner>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLedger {
    pub fn new(signer: Arc<LedgerSigner>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            signer,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_generated_key() -> Self {
        Self::new(Arc::new(LedgerSigner::generate()))
    }

    /// Simulate backing storage going away. Appends fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn signer(&self) -> &Arc<LedgerSigner> {
        &self.signer
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("signer", &self.signer)
            .finish()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(&self, event: LedgerEvent) -> Result<EntryRef> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WardenError::LedgerUnavailable("storage unavailable".into()));
        }
        let mut entries = self.entries.write().await;
        let (index, prev_hash, counter) = match entries.last() {
            Some(last) => (last.index + 1, last.current_hash, last.monotonic_counter + 1),
            None => (0, Digest::ZERO, 1),
        };
        let entry = LedgerEntry::seal(index, prev_hash, event, counter, &self.signer)?;
        let entry_ref = entry.entry_ref();
        entries.push(entry);
        Ok(entry_ref)
    }

    async fn verify_chain(&self) -> Result<u64> {
        let entries = self.entries.read().await;
        verify_entries(&entries, &self.signer.verifying_key())
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.entries.read().await.clone())
    }

    async fn latest(&self) -> Result<Option<EntryRef>> {
        Ok(self.entries.read().await.last().map(LedgerEntry::entry_ref))
    }
}
