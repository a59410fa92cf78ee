use std::path::Path;

use ed25519_dalek::VerifyingKey;

use warden_security::verify_digest;
use warden_types::{Digest, Result, WardenError};

use crate::entry::LedgerEntry;

/// Incremental chain checker. Feed entries in file order.
pub struct ChainVerifier<'a> {
    key: &'a VerifyingKey,
    signer_hex: String,
    next_index: u64,
    prev_hash: Digest,
    prev_counter: u64,
}

impl<'a> ChainVerifier<'a> {
    pub fn new(key: &'a VerifyingKey) -> Self {
        Self {
            key,
            signer_hex: hex::encode(key.to_bytes()),
            next_index: 0,
            prev_hash: Digest::ZERO,
            prev_counter: 0,
        }
    }

    fn diverge(&self, reason: impl Into<String>) -> WardenError {
        WardenError::ChainDivergence {
            index: self.next_index,
            reason: reason.into(),
        }
    }

    pub fn check(&mut self, entry: &LedgerEntry) -> Result<()> {
        if entry.index != self.next_index {
            return Err(self.diverge(format!("index {} out of sequence", entry.index)));
        }
        if entry.prev_hash != self.prev_hash {
            return Err(self.diverge("prev_hash does not link to predecessor"));
        }
        if entry.monotonic_counter <= self.prev_counter {
            return Err(self.diverge(format!(
                "monotonic counter {} not above {}",
                entry.monotonic_counter, self.prev_counter
            )));
        }
        let computed = entry
            .compute_hash()
            .map_err(|e| self.diverge(format!("cannot hash entry: {e}")))?;
        if computed != entry.current_hash {
            return Err(self.diverge("stored hash does not match contents"));
        }
        if entry.signer != self.signer_hex {
            return Err(self.diverge("entry signed by an unexpected key"));
        }
        verify_digest(self.key, &entry.current_hash, &entry.signature)
            .map_err(|e| self.diverge(e.to_string()))?;

        self.next_index += 1;
        self.prev_hash = entry.current_hash;
        self.prev_counter = entry.monotonic_counter;
        Ok(())
    }

    pub fn verified(&self) -> u64 {
        self.next_index
    }

    pub fn head(&self) -> Digest {
        self.prev_hash
    }

    pub fn last_counter(&self) -> u64 {
        self.prev_counter
    }
}

/// Verify a full sequence of entries against `key`.
pub fn verify_entries(entries: &[LedgerEntry], key: &VerifyingKey) -> Result<u64> {
    let mut verifier = ChainVerifier::new(key);
    for entry in entries {
        verifier.check(entry)?;
    }
    Ok(verifier.verified())
}

/// Parse JSON Lines. A line that does not parse is a divergence at the entry
/// index it would have held; blank lines do not count.
pub fn parse_entries(text: &str) -> Result<Vec<LedgerEntry>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry =
            serde_json::from_str(line).map_err(|e| WardenError::ChainDivergence {
                index: entries.len() as u64,
                reason: format!("unparseable entry: {e}"),
            })?;
        entries.push(entry);
    }
    Ok(entries)
}

pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    parse_entries(&text)
}

/// Verify a ledger file without a running process.
pub fn verify_ledger_file(path: &Path, key: &VerifyingKey) -> Result<u64> {
    if !path.exists() {
        return Err(WardenError::LedgerUnavailable(format!(
            "{} does not exist",
            path.display()
        )));
    }
    verify_entries(&read_entries(path)?, key)
}
