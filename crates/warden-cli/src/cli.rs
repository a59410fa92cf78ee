use std::path::PathBuf;

use clap::{Parser, Subcommand};

use warden_core::Command;
use warden_types::{AgentId, Digest, SystemMode};

#[derive(Parser)]
#[command(name = "warden", about = "Tamper-evident supervisor for local agent fleets")]
pub struct Cli {
    /// State directory (default: $WARDEN_STATE_DIR or ~/.warden)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
    /// Print command results as JSON
    #[arg(long, global = true)]
    pub json: bool,
    /// One-time code for privileged commands
    #[arg(long, global = true, env = "WARDEN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate signing and encryption keys
    Keygen {
        /// Replace existing keys
        #[arg(long)]
        force: bool,
    },
    /// Start the supervisor and background loops
    Run,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Verify a ledger file offline
    VerifyLedgerFile {
        /// Ledger file (default: the state directory's ledger)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Hex verifying key (default: the key store's public key)
        #[arg(long)]
        key: Option<String>,
    },
    /// Verify an exported chainpack offline
    VerifyChainpack {
        path: PathBuf,
        /// Hex verifying key (default: the key store's public key)
        #[arg(long)]
        key: Option<String>,
    },
    #[command(flatten)]
    Operator(OperatorCommand),
}

/// Commands that go through the ledgered command surface. Also accepted
/// line by line on the console of `warden run`.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Show system mode, agents and artifacts
    Status,
    /// Enter LOCKDOWN
    Lockdown {
        #[arg(long)]
        reason: String,
    },
    /// Leave LOCKDOWN (requires --token)
    Unlock {
        /// Target mode: normal, safe_mode or fallback
        #[arg(long, default_value = "normal")]
        to: SystemMode,
        #[arg(long)]
        reason: String,
    },
    /// Return from SAFE_MODE or FALLBACK to NORMAL
    Resume {
        #[arg(long)]
        reason: String,
    },
    /// Restart an agent, resetting its circuit breaker
    Restart { agent: String },
    /// Verify the live ledger chain
    VerifyLedger,
    /// Encrypted state snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Scan the models directory against the integrity store
    Scan,
    /// Release a quarantined artifact
    Release { artifact: String },
    /// Record the expected hash of an artifact
    Attest {
        artifact: String,
        /// Hex SHA-256 of the artifact contents
        content_hash: Digest,
    },
    /// Export the ledger as a signed chainpack
    ExportChainpack {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SnapshotAction {
    /// Snapshot one agent's state directory
    Create { id: String },
    /// Restore a version over the live state (requires --token)
    Restore { id: String, version: u64 },
    /// List stored versions
    List { id: String },
    /// Check a stored version without restoring it
    Verify { id: String, version: u64 },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default config file
    Init,
    /// Print the effective configuration
    Show,
}

impl From<OperatorCommand> for Command {
    fn from(cmd: OperatorCommand) -> Self {
        match cmd {
            OperatorCommand::Status => Command::Status,
            OperatorCommand::Lockdown { reason } => Command::Lockdown { reason },
            OperatorCommand::Unlock { to, reason } => Command::Unlock { to, reason },
            OperatorCommand::Resume { reason } => Command::Resume { reason },
            OperatorCommand::Restart { agent } => Command::Restart {
                agent: AgentId::new(agent),
            },
            OperatorCommand::VerifyLedger => Command::VerifyLedger,
            OperatorCommand::Snapshot { action } => match action {
                SnapshotAction::Create { id } => Command::SnapshotCreate { id },
                SnapshotAction::Restore { id, version } => Command::SnapshotRestore { id, version },
                SnapshotAction::List { id } => Command::SnapshotList { id },
                SnapshotAction::Verify { id, version } => Command::SnapshotVerify { id, version },
            },
            OperatorCommand::Scan => Command::Scan,
            OperatorCommand::Release { artifact } => Command::Release { artifact },
            OperatorCommand::Attest {
                artifact,
                content_hash,
            } => Command::Attest {
                artifact,
                content_hash,
            },
            OperatorCommand::ExportChainpack { out } => Command::ExportChainpack { dest: out },
        }
    }
}
