use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use warden_types::{Digest, LedgerEvent, Result, WardenError};

use crate::entry::EntryRef;
use crate::traits::Ledger;

/// Fold leaves pairwise into a root. Each parent is the SHA-256 of the two
/// children's hex strings concatenated; an odd node at any level is paired
/// with itself. Returns `None` for an empty set.
pub fn merkle_root(leaves: &[Digest]) -> Option<Digest> {
    if leaves.is_empty() {
        return None;
    }
    let mut level: Vec<Digest> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut joined = left.to_hex();
                joined.push_str(&right.to_hex());
                Digest::of(joined.as_bytes())
            })
            .collect();
    }
    level.first().copied()
}

/// Content digests of `paths` in sorted path order.
pub fn file_leaves(paths: &[PathBuf]) -> Result<Vec<Digest>> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .map(|p| Ok(Digest::of(&std::fs::read(p)?)))
        .collect()
}

/// Hash a file set, fold it, and record the root in the ledger.
pub async fn anchor_files(
    ledger: &dyn Ledger,
    label: &str,
    paths: &[PathBuf],
) -> Result<(Digest, EntryRef)> {
    let owned = paths.to_vec();
    let leaves = tokio::task::spawn_blocking(move || file_leaves(&owned))
        .await
        .map_err(|e| WardenError::Internal(format!("anchor hashing task: {e}")))??;
    let root = merkle_root(&leaves)
        .ok_or_else(|| WardenError::ArtifactNotFound(format!("{label}: no files to anchor")))?;
    let entry = ledger
        .append(LedgerEvent::MerkleRootRecorded {
            label: label.to_string(),
            root,
            leaf_count: leaves.len(),
        })
        .await?;
    info!(label, root = %root, leaves = leaves.len(), "Merkle root anchored");
    Ok((root, entry))
}

/// Every regular file under `dir`, recursively, sorted.
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| WardenError::Io(std::io::Error::other(e.to_string())))?;
        if entry.file_type().is_file() {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}
