use async_trait::async_trait;

use warden_types::{LedgerEvent, Result};

use crate::entry::{EntryRef, LedgerEntry};

/// Append-only, hash-linked audit log. All implementations serialize appends.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Seal `event` into the next entry and persist it.
    async fn append(&self, event: LedgerEvent) -> Result<EntryRef>;

    /// Walk the whole chain. Returns the number of valid entries, or
    /// `ChainDivergence` naming the first bad index.
    async fn verify_chain(&self) -> Result<u64>;

    async fn entries(&self) -> Result<Vec<LedgerEntry>>;

    async fn latest(&self) -> Result<Option<EntryRef>>;

    /// Entries whose event carries the given `kind` tag.
    async fn query_by_kind(&self, kind: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.event.kind() == kind)
            .collect())
    }
}
