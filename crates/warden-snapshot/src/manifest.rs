use std::collections::BTreeMap;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_ledger::{LedgerSigner, canonicalize, merkle_root};
use warden_security::verify_digest;
use warden_types::{Digest, Result, WardenError};

pub const MANIFEST_FORMAT: &str = "warden-snapshot/1";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIGNATURE_FILE: &str = "manifest.sig";
pub const BLOB_DIR: &str = "blobs";

/// Signed description of one snapshot version. Immutable once signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format: String,
    pub snapshot_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Relative path (`/`-separated) to plaintext content hash.
    pub files: BTreeMap<String, Digest>,
    pub merkle_root: Digest,
    pub signer: String,
    #[serde(default)]
    pub signature: String,
}

impl SnapshotManifest {
    pub fn new(snapshot_id: &str, version: u64, files: BTreeMap<String, Digest>) -> Self {
        let merkle_root = Self::root_of(&files);
        Self {
            format: MANIFEST_FORMAT.to_string(),
            snapshot_id: snapshot_id.to_string(),
            version,
            created_at: Utc::now(),
            files,
            merkle_root,
            signer: String::new(),
            signature: String::new(),
        }
    }

    /// Merkle root over the file hashes in path order. Empty snapshots fold to zero.
    pub fn root_of(files: &BTreeMap<String, Digest>) -> Digest {
        let leaves: Vec<Digest> = files.values().copied().collect();
        merkle_root(&leaves).unwrap_or(Digest::ZERO)
    }

    /// Digest over the canonical JSON of everything except the signature.
    pub fn signing_digest(&self) -> Result<Digest> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        Ok(Digest::of(&serde_json::to_vec(&canonicalize(value))?))
    }

    pub fn sign(&mut self, signer: &LedgerSigner) -> Result<()> {
        self.signer = signer.public_hex().to_string();
        self.signature = signer.sign(&self.signing_digest()?);
        Ok(())
    }

    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        if self.format != MANIFEST_FORMAT {
            return Err(WardenError::SnapshotVerification(format!(
                "unsupported manifest format {}",
                self.format
            )));
        }
        if self.signer != hex::encode(key.to_bytes()) {
            return Err(WardenError::SignatureInvalid(format!(
                "manifest signed by unknown key {}",
                self.signer
            )));
        }
        verify_digest(key, &self.signing_digest()?, &self.signature)
    }

    /// Blob file name for a relative path.
    pub fn blob_name(rel_path: &str) -> String {
        Digest::of(rel_path.as_bytes()).to_hex()
    }
}

/// Relative paths in a manifest must stay inside the restored directory.
pub fn validate_rel_path(rel_path: &str) -> Result<()> {
    let path = Path::new(rel_path);
    let ok = !rel_path.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(WardenError::SnapshotVerification(format!(
            "illegal path in manifest: {rel_path}"
        )));
    }
    Ok(())
}
