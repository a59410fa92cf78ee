use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use warden_integrity::{FirstUsePolicy, IntegrityStore, QuarantineGate};
use warden_ledger::{FileCounter, FileLedger, Ledger, LedgerSigner};
use warden_security::{MasterKey, RetryPolicy, SecondFactor};
use warden_snapshot::{SnapshotConfig, SnapshotManager};
use warden_state::{AlertSink, StateMachine};
use warden_supervisor::{ResourceGuard, ResourceProbe, ResourceThresholds, Supervisor, SupervisorConfig};
use warden_types::Result;

pub const LEDGER_FILE: &str = "ledger.jsonl";
pub const COUNTER_FILE: &str = "ledger.counter";
pub const INTEGRITY_FILE: &str = "integrity.json";

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub models_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub integrity_path: PathBuf,
    pub agent_state_dir: PathBuf,
    pub chainpack_dir: PathBuf,
    pub first_use: FirstUsePolicy,
    pub supervisor: SupervisorConfig,
    pub snapshot: SnapshotConfig,
    pub resource: ResourceThresholds,
    /// Bounds for integrity store writes and quarantine moves.
    pub retry: RetryPolicy,
}

impl ContextOptions {
    /// Default layout rooted at `state_dir`.
    pub fn under(state_dir: &Path) -> Self {
        Self {
            models_dir: state_dir.join("models"),
            quarantine_dir: state_dir.join("quarantine"),
            integrity_path: state_dir.join(INTEGRITY_FILE),
            agent_state_dir: state_dir.join("agents"),
            chainpack_dir: state_dir.join("chainpacks"),
            first_use: FirstUsePolicy::default(),
            supervisor: SupervisorConfig::default(),
            snapshot: SnapshotConfig::new(state_dir.join("snapshots")),
            resource: ResourceThresholds::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators supplied by the embedding process.
pub struct Services {
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<LedgerSigner>,
    pub master_key: MasterKey,
    pub second_factor: Arc<dyn SecondFactor>,
    pub alerts: Arc<dyn AlertSink>,
    pub probe: Arc<dyn ResourceProbe>,
}

/// Every core component, wired once and shared by the command surface and
/// the control loop.
pub struct Context {
    pub options: ContextOptions,
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<LedgerSigner>,
    pub state: Arc<StateMachine>,
    pub gate: Arc<QuarantineGate>,
    pub supervisor: Arc<Supervisor>,
    pub snapshots: Arc<SnapshotManager>,
    pub resources: Arc<ResourceGuard>,
}

impl Context {
    pub fn assemble(options: ContextOptions, services: Services) -> Result<Self> {
        let state = Arc::new(StateMachine::new(
            services.ledger.clone(),
            services.alerts,
            services.second_factor,
        ));
        let store = IntegrityStore::load(&options.integrity_path)?;
        let gate = Arc::new(
            QuarantineGate::new(store, state.clone(), &options.quarantine_dir, options.first_use)
                .with_retry(options.retry.clone()),
        );
        let supervisor = Arc::new(Supervisor::new(state.clone(), options.supervisor.clone()));
        let snapshots = Arc::new(SnapshotManager::new(
            options.snapshot.clone(),
            services.signer.clone(),
            services.master_key,
            state.clone(),
        ));
        let resources = Arc::new(ResourceGuard::new(services.probe, options.resource));
        Ok(Self {
            options,
            ledger: services.ledger,
            signer: services.signer,
            state,
            gate,
            supervisor,
            snapshots,
            resources,
        })
    }

    /// Open the on-disk ledger under `state_dir`, checked against its
    /// rollback counter.
    pub async fn open_ledger(
        state_dir: &Path,
        signer: Arc<LedgerSigner>,
        retry: RetryPolicy,
    ) -> Result<Arc<FileLedger>> {
        let counter = Arc::new(FileCounter::open(state_dir.join(COUNTER_FILE))?);
        let ledger = FileLedger::open(state_dir.join(LEDGER_FILE), signer, counter, retry).await?;
        info!(state_dir = %state_dir.display(), "Ledger ready");
        Ok(Arc::new(ledger))
    }
}
