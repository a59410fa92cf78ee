use std::path::Path;

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use warden_security::verify_digest;
use warden_types::fsutil::write_atomic;
use warden_types::{Digest, LedgerEvent, Result, WardenError};

use crate::chain::verify_entries;
use crate::entry::LedgerEntry;
use crate::merkle::merkle_root;
use crate::signer::LedgerSigner;
use crate::traits::Ledger;

pub const CHAINPACK_FORMAT: &str = "warden-chainpack/1";

/// Self-describing export of the whole ledger plus a signed Merkle root over its entry hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chainpack {
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub signer: String,
    pub entry_count: u64,
    pub head: Digest,
    pub merkle_root: Digest,
    pub signature: String,
    pub entries: Vec<LedgerEntry>,
}

/// Verify the live chain, write it to `dest` as a chainpack, and ledger the export.
pub async fn export_chainpack(
    ledger: &dyn Ledger,
    signer: &LedgerSigner,
    dest: &Path,
) -> Result<Chainpack> {
    let entry_count = ledger.verify_chain().await?;
    let entries = ledger.entries().await?;
    let hashes: Vec<Digest> = entries.iter().map(|e| e.current_hash).collect();
    let merkle_root = merkle_root(&hashes).unwrap_or(Digest::ZERO);
    let head = hashes.last().copied().unwrap_or(Digest::ZERO);

    let pack = Chainpack {
        format: CHAINPACK_FORMAT.to_string(),
        created_at: Utc::now(),
        signer: signer.public_hex().to_string(),
        entry_count,
        head,
        merkle_root,
        signature: signer.sign(&merkle_root),
        entries,
    };
    write_atomic(dest, &serde_json::to_vec_pretty(&pack)?)?;

    ledger
        .append(LedgerEvent::ChainpackExported {
            path: dest.display().to_string(),
            entry_count,
            head,
        })
        .await?;
    info!(path = %dest.display(), entries = entry_count, root = %merkle_root, "Chainpack exported");
    Ok(pack)
}

/// Check a chainpack file offline: chain, root and root signature.
pub fn verify_chainpack(path: &Path, key: &VerifyingKey) -> Result<u64> {
    let text = std::fs::read_to_string(path)?;
    let pack: Chainpack = serde_json::from_str(&text)?;
    if pack.format != CHAINPACK_FORMAT {
        return Err(WardenError::Serialization(format!(
            "unsupported chainpack format {}",
            pack.format
        )));
    }
    let count = verify_entries(&pack.entries, key)?;
    if count != pack.entry_count {
        return Err(WardenError::ChainDivergence {
            index: count,
            reason: format!("chainpack claims {} entries", pack.entry_count),
        });
    }
    let hashes: Vec<Digest> = pack.entries.iter().map(|e| e.current_hash).collect();
    let root = merkle_root(&hashes).unwrap_or(Digest::ZERO);
    if root != pack.merkle_root {
        return Err(WardenError::SignatureInvalid(
            "chainpack Merkle root does not match its entries".into(),
        ));
    }
    verify_digest(key, &root, &pack.signature)?;
    Ok(count)
}
