use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{error, info, warn};

use warden_ledger::{EntryRef, Ledger};
use warden_security::{Authorization, SecondFactor};
use warden_types::{LedgerEvent, Result, SystemMode, SystemState, WardenError};

use crate::alert::{Alert, AlertSink};

pub const LEDGER_FAILURE_REASON: &str = "ledger write failure";

/// Notification fanned out to subscribers after a mode change.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeChange {
    pub from: SystemMode,
    pub to: SystemMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Mode changed and the change was ledgered.
    Applied(EntryRef),
    /// Mode changed but the ledger could not record it.
    AppliedUnaudited,
    /// Already in the requested mode, or already at least as severe.
    Unchanged,
}

/// Global operating mode. Every mutation goes through the transition lock
/// and produces one ledger entry; reads are lock-free.
pub struct StateMachine {
    mode: AtomicU8,
    state_tx: watch::Sender<SystemState>,
    changes: broadcast::Sender<ModeChange>,
    transition_lock: Mutex<()>,
    ledger: Arc<dyn Ledger>,
    alerts: Arc<dyn AlertSink>,
    second_factor: Arc<dyn SecondFactor>,
}

impl StateMachine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        alerts: Arc<dyn AlertSink>,
        second_factor: Arc<dyn SecondFactor>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SystemState::initial());
        let (changes, _) = broadcast::channel(64);
        Self {
            mode: AtomicU8::new(SystemMode::Normal.as_u8()),
            state_tx,
            changes,
            transition_lock: Mutex::new(()),
            ledger,
            alerts,
            second_factor,
        }
    }

    pub fn mode(&self) -> SystemMode {
        SystemMode::from_u8(self.mode.load(Ordering::Acquire)).unwrap_or(SystemMode::Lockdown)
    }

    pub fn state(&self) -> SystemState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SystemState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModeChange> {
        self.changes.subscribe()
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn second_factor(&self) -> &Arc<dyn SecondFactor> {
        &self.second_factor
    }

    /// Err(OperationRefused) in SAFE_MODE or any more severe mode.
    pub fn refuse_if_degraded(&self, operation: &str) -> Result<()> {
        let mode = self.mode();
        if mode.is_degraded() {
            return Err(WardenError::OperationRefused {
                mode,
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Err(OperationRefused) in LOCKDOWN.
    pub fn refuse_in_lockdown(&self, operation: &str) -> Result<()> {
        let mode = self.mode();
        if mode == SystemMode::Lockdown {
            return Err(WardenError::OperationRefused {
                mode,
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Move to `to`. LOCKDOWN can only be left through [`StateMachine::unlock`].
    pub async fn transition(&self, to: SystemMode, reason: &str) -> Result<TransitionOutcome> {
        let _guard = self.transition_lock.lock().await;
        let from = self.mode();
        if from == to {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, reason, "Transition rejected");
            return Err(WardenError::InvalidTransition { from, to });
        }
        self.apply(from, to, reason).await
    }

    /// Raise the mode to at least `min`. Never lowers it.
    pub async fn escalate(&self, min: SystemMode, reason: &str) -> Result<TransitionOutcome> {
        let _guard = self.transition_lock.lock().await;
        let from = self.mode();
        if from >= min {
            return Ok(TransitionOutcome::Unchanged);
        }
        self.apply(from, min, reason).await
    }

    /// Leave LOCKDOWN for `to`. Requires a second factor authorization issued for "unlock".
    pub async fn unlock(
        &self,
        to: SystemMode,
        authorization: &Authorization,
        reason: &str,
    ) -> Result<TransitionOutcome> {
        authorization.require("unlock")?;
        let _guard = self.transition_lock.lock().await;
        let from = self.mode();
        if from != SystemMode::Lockdown || to == SystemMode::Lockdown {
            return Err(WardenError::InvalidTransition { from, to });
        }
        self.apply(from, to, reason).await
    }

    /// Caller holds the transition lock.
    async fn apply(&self, from: SystemMode, to: SystemMode, reason: &str) -> Result<TransitionOutcome> {
        let event = LedgerEvent::StateTransition {
            from,
            to,
            reason: reason.to_string(),
        };
        match self.ledger.append(event).await {
            Ok(entry) => {
                self.publish(from, to, reason);
                Ok(TransitionOutcome::Applied(entry))
            }
            Err(e) if to > from => {
                // An escalation is never held back by the audit trail.
                error!(from = %from, to = %to, error = %e, "Escalating without ledger entry");
                let to = to.max(SystemMode::SafeMode);
                self.publish(from, to, &format!("{reason}; {LEDGER_FAILURE_REASON}"));
                Ok(TransitionOutcome::AppliedUnaudited)
            }
            Err(e) => {
                error!(from = %from, to = %to, error = %e, "Refusing unaudited de-escalation");
                Err(e)
            }
        }
    }

    fn publish(&self, from: SystemMode, to: SystemMode, reason: &str) {
        let now = Utc::now();
        self.mode.store(to.as_u8(), Ordering::Release);
        self.state_tx.send_replace(SystemState {
            mode: to,
            reason: reason.to_string(),
            since: now,
        });
        let _ = self.changes.send(ModeChange {
            from,
            to,
            reason: reason.to_string(),
            at: now,
        });

        if to.is_degraded() {
            warn!(from = %from, to = %to, reason, "System mode changed");
            self.alerts.notify(Alert {
                mode: to,
                reason: reason.to_string(),
                since: now,
            });
        } else {
            info!(from = %from, to = %to, reason, "System mode changed");
        }
    }

    /// Re-adopt the last mode recorded in the ledger, so a process restart
    /// cannot shed LOCKDOWN or a degraded mode. Writes no entry.
    pub async fn recover_from_ledger(&self) -> Result<SystemMode> {
        let _guard = self.transition_lock.lock().await;
        let last = self
            .ledger
            .query_by_kind("state_transition")
            .await?
            .into_iter()
            .rev()
            .find_map(|entry| match entry.event {
                LedgerEvent::StateTransition { to, reason, .. } => Some((to, reason)),
                _ => None,
            });
        let from = self.mode();
        if let Some((to, reason)) = last {
            if to != from {
                info!(mode = %to, "Recovered mode from ledger");
                self.publish(from, to, &format!("recovered: {reason}"));
            }
        }
        Ok(self.mode())
    }

    /// Funnel for audit writes. A failed append forces SAFE_MODE.
    pub async fn audit(&self, event: LedgerEvent) -> Result<EntryRef> {
        match self.ledger.append(event).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                self.on_ledger_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn on_ledger_failure(&self, err: &WardenError) {
        let _guard = self.transition_lock.lock().await;
        let from = self.mode();
        error!(error = %err, mode = %from, "Ledger write failed");
        if from < SystemMode::SafeMode {
            self.publish(from, SystemMode::SafeMode, LEDGER_FAILURE_REASON);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use warden_ledger::InMemoryLedger;
    use warden_security::TotpVerifier;

    struct Fixture {
        machine: StateMachine,
        ledger: Arc<InMemoryLedger>,
        alerts: Arc<MemoryAlertSink>,
        totp: Arc<TotpVerifier>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::with_generated_key());
        let alerts = Arc::new(MemoryAlertSink::new());
        let totp = Arc::new(TotpVerifier::new(b"unlock-secret".to_vec(), 30, 1));
        let machine = StateMachine::new(ledger.clone(), alerts.clone(), totp.clone());
        Fixture {
            machine,
            ledger,
            alerts,
            totp,
        }
    }

    #[tokio::test]
    async fn test_starts_normal() {
        let f = fixture();
        assert_eq!(f.machine.mode(), SystemMode::Normal);
        assert_eq!(f.machine.state().reason, "startup");
        assert!(f.machine.refuse_if_degraded("spawn").is_ok());
    }

    #[tokio::test]
    async fn test_transition_writes_one_entry_and_alerts() {
        let f = fixture();
        let outcome = f
            .machine
            .transition(SystemMode::SafeMode, "disk pressure")
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Applied(_)));
        assert_eq!(f.machine.mode(), SystemMode::SafeMode);
        assert_eq!(f.machine.state().reason, "disk pressure");
        assert_eq!(f.ledger.len().await, 1);
        assert_eq!(f.alerts.alerts().len(), 1);
        assert!(f.machine.refuse_if_degraded("spawn").is_err());
    }

    #[tokio::test]
    async fn test_same_state_is_noop() {
        let f = fixture();
        let outcome = f.machine.transition(SystemMode::Normal, "again").await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert!(f.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_lockdown_only_exits_through_unlock() {
        let f = fixture();
        f.machine.transition(SystemMode::Lockdown, "operator").await.unwrap();
        assert!(matches!(
            f.machine.transition(SystemMode::Normal, "auto recovery").await,
            Err(WardenError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.totp.authorize("unlock", None),
            Err(WardenError::SecondFactorRequired(_))
        ));
        assert!(matches!(
            f.totp.authorize("unlock", Some("abcdef")),
            Err(WardenError::SecondFactorInvalid(_))
        ));

        let code = f.totp.current_code();
        let restart_proof = f.totp.authorize("restart", Some(&code)).unwrap();
        assert!(matches!(
            f.machine.unlock(SystemMode::Normal, &restart_proof, "op").await,
            Err(WardenError::SecondFactorInvalid(_))
        ));
        assert_eq!(f.machine.mode(), SystemMode::Lockdown);

        let next = f.totp.code_at(chrono::Utc::now().timestamp() as u64 + 30);
        let proof = f.totp.authorize("unlock", Some(&next)).unwrap();
        f.machine
            .unlock(SystemMode::SafeMode, &proof, "operator unlock")
            .await
            .unwrap();
        assert_eq!(f.machine.mode(), SystemMode::SafeMode);
        assert_eq!(f.ledger.len().await, 2);
    }

    #[tokio::test]
    async fn test_recover_readopts_lockdown() {
        let f = fixture();
        f.machine.transition(SystemMode::Lockdown, "breach").await.unwrap();

        let restarted = StateMachine::new(f.ledger.clone(), f.alerts.clone(), f.totp.clone());
        assert_eq!(restarted.mode(), SystemMode::Normal);
        assert_eq!(restarted.recover_from_ledger().await.unwrap(), SystemMode::Lockdown);
        assert_eq!(restarted.state().reason, "recovered: breach");
        assert_eq!(f.ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_escalate_never_lowers() {
        let f = fixture();
        f.machine.transition(SystemMode::Fallback, "degraded").await.unwrap();
        let outcome = f
            .machine
            .escalate(SystemMode::SafeMode, "integrity")
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(f.machine.mode(), SystemMode::Fallback);
        assert_eq!(f.ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let f = fixture();
        let mut rx = f.machine.subscribe();
        let mut watch_rx = f.machine.watch();
        f.machine.transition(SystemMode::Fallback, "model offline").await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, SystemMode::Normal);
        assert_eq!(change.to, SystemMode::Fallback);
        watch_rx.changed().await.unwrap();
        assert_eq!(watch_rx.borrow().mode, SystemMode::Fallback);
    }

    #[tokio::test]
    async fn test_ledger_failure_forces_safe_mode() {
        let f = fixture();
        f.ledger.set_unavailable(true);
        let result = f
            .machine
            .audit(LedgerEvent::CriticalError {
                source: "test".into(),
                message: "x".into(),
            })
            .await;
        assert!(matches!(result, Err(WardenError::LedgerUnavailable(_))));
        assert_eq!(f.machine.mode(), SystemMode::SafeMode);
        assert_eq!(f.machine.state().reason, LEDGER_FAILURE_REASON);
        assert_eq!(f.alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_unaudited_deescalation_refused() {
        let f = fixture();
        f.machine.transition(SystemMode::SafeMode, "x").await.unwrap();
        f.ledger.set_unavailable(true);
        assert!(f.machine.transition(SystemMode::Normal, "recovered").await.is_err());
        assert_eq!(f.machine.mode(), SystemMode::SafeMode);

        let outcome = f.machine.transition(SystemMode::Lockdown, "panic").await.unwrap();
        assert_eq!(outcome, TransitionOutcome::AppliedUnaudited);
        assert_eq!(f.machine.mode(), SystemMode::Lockdown);
    }
}
