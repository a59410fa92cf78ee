use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use warden_core::Context;
use warden_ledger::LedgerSigner;
use warden_security::{DenyAll, KeyStore, SecondFactor, TotpVerifier};
use warden_state::{AlertSink, LogAlertSink, WebhookAlertSink};
use warden_supervisor::ProcfsProbe;
use warden_types::WardenError;

use crate::config::WardenConfig;

pub fn key_store(state_dir: &Path) -> KeyStore {
    KeyStore::new(state_dir.join("keys"))
}

fn second_factor(config: &WardenConfig) -> Arc<dyn SecondFactor> {
    let sf = &config.second_factor;
    match TotpVerifier::from_env(&sf.secret_env, sf.step_secs, sf.skew) {
        Ok(verifier) => Arc::new(verifier),
        Err(e) => {
            warn!(error = %e, "No second factor configured; privileged commands will be refused");
            Arc::new(DenyAll)
        }
    }
}

fn alert_sink(config: &WardenConfig) -> Result<Arc<dyn AlertSink>> {
    match &config.alert.webhook_url {
        Some(url) => {
            let sink = WebhookAlertSink::new(url.clone(), Duration::from_secs(config.alert.timeout_secs))
                .context("Failed to build alert webhook client")?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogAlertSink)),
    }
}

/// Load keys, open the ledger and wire every component. The recorded mode
/// is re-adopted so a restart cannot leave LOCKDOWN.
pub async fn open_context(state_dir: &Path, config: &WardenConfig) -> Result<Arc<Context>> {
    let keys = key_store(state_dir);
    if !keys.exists() {
        return Err(WardenError::KeyUnavailable(format!(
            "no key material in {}; run `warden keygen` first",
            keys.dir().display()
        ))
        .into());
    }
    let signer = Arc::new(LedgerSigner::new(keys.load_signing_key()?));
    let master_key = keys.load_master_key()?;

    let ledger = Context::open_ledger(state_dir, signer.clone(), config.retry_policy()).await?;
    let options = config.context_options(state_dir);
    let services = warden_core::Services {
        ledger,
        signer,
        master_key,
        second_factor: second_factor(config),
        alerts: alert_sink(config)?,
        probe: Arc::new(ProcfsProbe::new(state_dir.to_path_buf())),
    };
    let ctx = Context::assemble(options, services)?;
    let mode = ctx.state.recover_from_ledger().await?;
    info!(state_dir = %state_dir.display(), %mode, "Warden context ready");
    Ok(Arc::new(ctx))
}

/// Default location of the on-disk ledger.
pub fn ledger_path(state_dir: &Path) -> PathBuf {
    state_dir.join(warden_core::LEDGER_FILE)
}
