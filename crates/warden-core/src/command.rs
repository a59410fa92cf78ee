use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use warden_integrity::ScanReport;
use warden_ledger::export_chainpack;
use warden_security::Authorization;
use warden_snapshot::SnapshotManifest;
use warden_supervisor::AgentStatus;
use warden_types::{
    AgentId, AgentState, ArtifactRecord, Digest, LedgerEvent, Result, SystemMode, SystemState,
    WardenError,
};

use crate::context::Context;

/// Operator commands. Each maps to one core operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Lockdown { reason: String },
    Unlock { to: SystemMode, reason: String },
    /// Return from SAFE_MODE or FALLBACK to NORMAL.
    Resume { reason: String },
    Restart { agent: AgentId },
    VerifyLedger,
    SnapshotCreate { id: String },
    SnapshotRestore { id: String, version: u64 },
    SnapshotList { id: String },
    SnapshotVerify { id: String, version: u64 },
    Scan,
    Release { artifact: String },
    Attest { artifact: String, content_hash: Digest },
    ExportChainpack { dest: Option<PathBuf> },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Lockdown { .. } => "lockdown",
            Command::Unlock { .. } => "unlock",
            Command::Resume { .. } => "resume",
            Command::Restart { .. } => "restart",
            Command::VerifyLedger => "verify-ledger",
            Command::SnapshotCreate { .. } => "snapshot create",
            Command::SnapshotRestore { .. } => "snapshot restore",
            Command::SnapshotList { .. } => "snapshot list",
            Command::SnapshotVerify { .. } => "snapshot verify",
            Command::Scan => "scan",
            Command::Release { .. } => "release",
            Command::Attest { .. } => "attest",
            Command::ExportChainpack { .. } => "export-chainpack",
        }
    }

    /// Commands that change trust state or destroy live state.
    pub fn requires_second_factor(&self) -> bool {
        matches!(
            self,
            Command::Lockdown { .. }
                | Command::Unlock { .. }
                | Command::Resume { .. }
                | Command::Restart { .. }
                | Command::SnapshotRestore { .. }
                | Command::Release { .. }
                | Command::Attest { .. }
        )
    }

    /// Command line as recorded in the ledger.
    pub fn describe(&self) -> String {
        match self {
            Command::Lockdown { reason } | Command::Resume { reason } => {
                format!("{} ({reason})", self.name())
            }
            Command::Unlock { to, reason } => format!("unlock to {to} ({reason})"),
            Command::Restart { agent } => format!("restart {agent}"),
            Command::SnapshotCreate { id } | Command::SnapshotList { id } => {
                format!("{} {id}", self.name())
            }
            Command::SnapshotRestore { id, version } | Command::SnapshotVerify { id, version } => {
                format!("{} {id} {version}", self.name())
            }
            Command::Release { artifact } => format!("release {artifact}"),
            Command::Attest {
                artifact,
                content_hash,
            } => format!("attest {artifact} {content_hash}"),
            Command::ExportChainpack { dest: Some(dest) } => {
                format!("export-chainpack {}", dest.display())
            }
            _ => self.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: SystemState,
    pub agents: Vec<AgentStatus>,
    pub artifacts: Vec<ArtifactRecord>,
    pub ledger_entries: u64,
    pub ledger_head: Option<Digest>,
    pub exception_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutput {
    Status(StatusReport),
    Mode(SystemState),
    Restarted { agent: AgentId, state: AgentState },
    LedgerVerified { entries: u64 },
    Snapshot(SnapshotManifest),
    Versions { id: String, versions: Vec<u64> },
    Scan(ScanReport),
    Released { artifact: String, content_hash: Digest },
    Attested { artifact: String },
    ChainpackExported { path: PathBuf, entries: u64, head: Digest },
}

/// Single entry point for operator commands. Every call appends one
/// `CommandExecuted` entry, including refused ones.
pub struct CommandSurface {
    ctx: Arc<Context>,
}

impl CommandSurface {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub async fn execute(&self, command: Command, token: Option<&str>) -> Result<CommandOutput> {
        let line = command.describe();
        let authorization = if command.requires_second_factor() {
            match self
                .ctx
                .state
                .second_factor()
                .authorize(command.name(), token)
            {
                Ok(proof) => Some(proof),
                Err(e) => {
                    warn!(command = %line, error = %e, "Command refused");
                    self.record(&line, false, format!("refused: {e}")).await?;
                    return Err(e);
                }
            }
        } else {
            None
        };
        let authorized = authorization.is_some();

        let result = self.run(command, authorization.as_ref()).await;
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("error: {e}"),
        };
        let recorded = self.record(&line, authorized, outcome).await;
        let output = result?;
        recorded?;
        Ok(output)
    }

    async fn record(&self, command: &str, authorized: bool, outcome: String) -> Result<()> {
        info!(command, authorized, outcome = %outcome, "Command executed");
        self.ctx
            .state
            .audit(LedgerEvent::CommandExecuted {
                command: command.to_string(),
                authorized,
                outcome,
            })
            .await
            .map(|_| ())
    }

    async fn run(&self, command: Command, authorization: Option<&Authorization>) -> Result<CommandOutput> {
        let ctx = &self.ctx;
        match command {
            Command::Status => Ok(CommandOutput::Status(self.status().await?)),
            Command::Lockdown { reason } => {
                ctx.state.transition(SystemMode::Lockdown, &reason).await?;
                Ok(CommandOutput::Mode(ctx.state.state()))
            }
            Command::Unlock { to, reason } => {
                let proof = authorization
                    .ok_or_else(|| WardenError::SecondFactorRequired("unlock".to_string()))?;
                ctx.state.unlock(to, proof, &reason).await?;
                Ok(CommandOutput::Mode(ctx.state.state()))
            }
            Command::Resume { reason } => {
                ctx.state.transition(SystemMode::Normal, &reason).await?;
                Ok(CommandOutput::Mode(ctx.state.state()))
            }
            Command::Restart { agent } => {
                let state = ctx.supervisor.restart(&agent, true).await?;
                Ok(CommandOutput::Restarted { agent, state })
            }
            Command::VerifyLedger => match ctx.ledger.verify_chain().await {
                Ok(entries) => Ok(CommandOutput::LedgerVerified { entries }),
                Err(e) => {
                    error!(error = %e, "Ledger verification failed");
                    if e.is_integrity() {
                        ctx.state
                            .escalate(SystemMode::SafeMode, "ledger verification failed")
                            .await?;
                    }
                    Err(e)
                }
            },
            Command::SnapshotCreate { id } => {
                let source = ctx.options.agent_state_dir.join(&id);
                Ok(CommandOutput::Snapshot(ctx.snapshots.create(&id, &source).await?))
            }
            Command::SnapshotRestore { id, version } => {
                let live = ctx.options.agent_state_dir.join(&id);
                Ok(CommandOutput::Snapshot(
                    ctx.snapshots.restore(&id, version, &live).await?,
                ))
            }
            Command::SnapshotList { id } => {
                let versions = ctx.snapshots.list(&id)?;
                Ok(CommandOutput::Versions { id, versions })
            }
            Command::SnapshotVerify { id, version } => Ok(CommandOutput::Snapshot(
                ctx.snapshots.verify(&id, version).await?,
            )),
            Command::Scan => Ok(CommandOutput::Scan(
                ctx.gate.scan(&ctx.options.models_dir).await?,
            )),
            Command::Release { artifact } => {
                let content_hash = ctx.gate.release(&artifact).await?;
                Ok(CommandOutput::Released {
                    artifact,
                    content_hash,
                })
            }
            Command::Attest {
                artifact,
                content_hash,
            } => {
                ctx.gate.attest(&artifact, content_hash).await?;
                Ok(CommandOutput::Attested { artifact })
            }
            Command::ExportChainpack { dest } => {
                let path = dest.unwrap_or_else(|| {
                    ctx.options.chainpack_dir.join(format!(
                        "chainpack-{}.json",
                        Utc::now().format("%Y%m%dT%H%M%SZ")
                    ))
                });
                let pack = export_chainpack(ctx.ledger.as_ref(), &ctx.signer, &path).await?;
                Ok(CommandOutput::ChainpackExported {
                    path,
                    entries: pack.entry_count,
                    head: pack.head,
                })
            }
        }
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let latest = self.ctx.ledger.latest().await?;
        Ok(StatusReport {
            state: self.ctx.state.state(),
            agents: self.ctx.supervisor.status().await,
            artifacts: self.ctx.gate.records().await,
            ledger_entries: latest.map(|e| e.index + 1).unwrap_or(0),
            ledger_head: latest.map(|e| e.current_hash),
            exception_count: self.ctx.supervisor.exception_budget().count(),
        })
    }
}
