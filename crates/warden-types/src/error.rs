use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentId;
use crate::digest::Digest;
use crate::mode::SystemMode;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: SystemMode, to: SystemMode },

    #[error("Operation '{operation}' refused in {mode}")]
    OperationRefused { mode: SystemMode, operation: String },

    #[error("Ledger chain diverges at entry {index}: {reason}")]
    ChainDivergence { index: u64, reason: String },

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Monotonic counter rollback: ledger holds {ledger}, counter attests {attested}")]
    CounterRollback { ledger: u64, attested: u64 },

    #[error("Key material unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Integrity mismatch for {name}: expected {expected}, found {actual}")]
    IntegrityMismatch {
        name: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("Artifact {0} has no attested baseline")]
    Unattested(String),

    #[error("Artifact {0} is quarantined")]
    ArtifactQuarantined(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already registered: {0}")]
    AgentExists(AgentId),

    #[error("Agent {0} did not answer the health check in time")]
    HealthCheckTimeout(AgentId),

    #[error("Agent channel closed: {0}")]
    ChannelClosed(AgentId),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Snapshot not found: {id}@{version}")]
    SnapshotNotFound { id: String, version: u64 },

    #[error("Snapshot verification failed: {0}")]
    SnapshotVerification(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Second factor required for {0}")]
    SecondFactorRequired(String),

    #[error("Second factor rejected for {0}")]
    SecondFactorInvalid(String),

    #[error("Timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Errors that mean a trust artifact was tampered with or cannot be vouched for.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            WardenError::ChainDivergence { .. }
                | WardenError::CounterRollback { .. }
                | WardenError::SignatureInvalid(_)
                | WardenError::IntegrityMismatch { .. }
                | WardenError::Unattested(_)
                | WardenError::SnapshotVerification(_)
        )
    }

    /// Errors the process cannot continue past at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WardenError::KeyUnavailable(_)
                | WardenError::LedgerUnavailable(_)
                | WardenError::ChainDivergence { .. }
                | WardenError::CounterRollback { .. }
        )
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
