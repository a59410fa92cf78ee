use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::digest::Digest;
use crate::mode::SystemMode;

/// Payload of a ledger entry. Every security-relevant decision is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    StateTransition {
        from: SystemMode,
        to: SystemMode,
        reason: String,
    },
    CriticalError {
        source: String,
        message: String,
    },
    ArtifactBaselined {
        name: String,
        content_hash: Digest,
        attested: bool,
    },
    ArtifactQuarantined {
        name: String,
        expected: Digest,
        actual: Digest,
        quarantine_path: String,
    },
    ArtifactReleased {
        name: String,
        content_hash: Digest,
    },
    AgentSpawned {
        agent: AgentId,
        incarnation: Uuid,
    },
    AgentRestarted {
        agent: AgentId,
        incarnation: Uuid,
        attempts_in_window: usize,
        authorized: bool,
    },
    AgentQuarantined {
        agent: AgentId,
        reason: String,
    },
    AgentStopped {
        agent: AgentId,
        forced: bool,
    },
    ResourcePressure {
        cpu_percent: u32,
        ram_percent: u32,
        disk_percent: u32,
        shed: Vec<AgentId>,
    },
    MerkleRootRecorded {
        label: String,
        root: Digest,
        leaf_count: usize,
    },
    SnapshotCreated {
        snapshot_id: String,
        version: u64,
        merkle_root: Digest,
        file_count: usize,
    },
    SnapshotRestored {
        snapshot_id: String,
        version: u64,
        merkle_root: Digest,
    },
    SnapshotRestoreAborted {
        snapshot_id: String,
        version: u64,
        reason: String,
    },
    SnapshotPruned {
        snapshot_id: String,
        version: u64,
    },
    ChainpackExported {
        path: String,
        entry_count: u64,
        head: Digest,
    },
    CommandExecuted {
        command: String,
        authorized: bool,
        outcome: String,
    },
}

impl LedgerEvent {
    /// The serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::StateTransition { .. } => "state_transition",
            LedgerEvent::CriticalError { .. } => "critical_error",
            LedgerEvent::ArtifactBaselined { .. } => "artifact_baselined",
            LedgerEvent::ArtifactQuarantined { .. } => "artifact_quarantined",
            LedgerEvent::ArtifactReleased { .. } => "artifact_released",
            LedgerEvent::AgentSpawned { .. } => "agent_spawned",
            LedgerEvent::AgentRestarted { .. } => "agent_restarted",
            LedgerEvent::AgentQuarantined { .. } => "agent_quarantined",
            LedgerEvent::AgentStopped { .. } => "agent_stopped",
            LedgerEvent::ResourcePressure { .. } => "resource_pressure",
            LedgerEvent::MerkleRootRecorded { .. } => "merkle_root_recorded",
            LedgerEvent::SnapshotCreated { .. } => "snapshot_created",
            LedgerEvent::SnapshotRestored { .. } => "snapshot_restored",
            LedgerEvent::SnapshotRestoreAborted { .. } => "snapshot_restore_aborted",
            LedgerEvent::SnapshotPruned { .. } => "snapshot_pruned",
            LedgerEvent::ChainpackExported { .. } => "chainpack_exported",
            LedgerEvent::CommandExecuted { .. } => "command_executed",
        }
    }
}
