use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Ok,
    New,
    Mismatch,
    Quarantined,
}

/// Persisted baseline for one named artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub content_hash: Digest,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub status: ArtifactStatus,
    /// Baseline came from an operator attestation rather than first use.
    #[serde(default)]
    pub attested: bool,
}

impl ArtifactRecord {
    pub fn new(name: impl Into<String>, content_hash: Digest, attested: bool) -> Self {
        Self {
            name: name.into(),
            content_hash,
            last_verified_at: None,
            status: ArtifactStatus::New,
            attested,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.status == ArtifactStatus::Quarantined
    }
}

/// Outcome of comparing an artifact against its stored baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    New,
    Mismatch { expected: Digest, actual: Digest },
}

impl VerifyResult {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, VerifyResult::Mismatch { .. })
    }
}
