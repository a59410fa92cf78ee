use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use warden_security::{CircuitBreakerRegistry, CircuitBreakerState};
use warden_state::StateMachine;
use warden_types::{AgentId, AgentState, LedgerEvent, Result, SystemMode, WardenError};

use crate::budget::ExceptionBudget;
use crate::handle::{AgentHandle, AgentStatus, WorkerExit};
use crate::protocol::AgentReply;
use crate::worker::WorkerFactory;

pub const EXCEPTION_BUDGET_REASON: &str = "exception budget exhausted";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_timeout: Duration,
    pub task_timeout: Duration,
    pub restart_window: Duration,
    pub restart_threshold: usize,
    pub exception_threshold: u32,
    pub shutdown_grace: Duration,
    pub channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(3),
            task_timeout: Duration::from_secs(30),
            restart_window: Duration::from_secs(60),
            restart_threshold: 3,
            exception_threshold: 3,
            shutdown_grace: Duration::from_secs(5),
            channel_capacity: 32,
        }
    }
}

/// Owns every agent handle. All lifecycle changes go through here.
pub struct Supervisor {
    agents: DashMap<AgentId, Arc<Mutex<AgentHandle>>>,
    factories: DashMap<AgentId, Arc<dyn WorkerFactory>>,
    breakers: CircuitBreakerRegistry,
    budget: ExceptionBudget,
    state: Arc<StateMachine>,
    config: SupervisorConfig,
    nonce: AtomicU64,
}

impl Supervisor {
    pub fn new(state: Arc<StateMachine>, config: SupervisorConfig) -> Self {
        Self {
            agents: DashMap::new(),
            factories: DashMap::new(),
            breakers: CircuitBreakerRegistry::new(config.restart_threshold, config.restart_window),
            budget: ExceptionBudget::new(config.exception_threshold),
            state,
            config,
            nonce: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn exception_budget(&self) -> &ExceptionBudget {
        &self.budget
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn handle(&self, id: &AgentId) -> Result<Arc<Mutex<AgentHandle>>> {
        self.agents
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| WardenError::AgentNotFound(id.clone()))
    }

    fn factory(&self, id: &AgentId) -> Result<Arc<dyn WorkerFactory>> {
        self.factories
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| WardenError::AgentNotFound(id.clone()))
    }

    /// Start a new agent. Refused in SAFE_MODE or worse.
    pub async fn spawn(&self, id: AgentId, factory: Arc<dyn WorkerFactory>) -> Result<Uuid> {
        self.state.refuse_if_degraded("spawn agent")?;
        if let Ok(existing) = self.handle(&id) {
            if existing.lock().await.state != AgentState::Stopped {
                return Err(WardenError::AgentExists(id));
            }
        }
        let worker = factory.create(&id)?;
        let handle = AgentHandle::launch(id.clone(), worker, self.config.channel_capacity);
        let incarnation = handle.incarnation;
        self.factories.insert(id.clone(), factory);
        self.agents.insert(id.clone(), Arc::new(Mutex::new(handle)));
        self.breakers.reset(id.as_str());
        info!(agent = %id, %incarnation, "Agent spawned");
        self.state
            .audit(LedgerEvent::AgentSpawned {
                agent: id,
                incarnation,
            })
            .await?;
        Ok(incarnation)
    }

    /// Probe one agent. A missing or wrong reply within the health timeout
    /// marks it UNRESPONSIVE.
    pub async fn health_check(&self, id: &AgentId) -> Result<AgentState> {
        let handle = self.handle(id)?;
        let mut h = handle.lock().await;
        if matches!(h.state, AgentState::Quarantined | AgentState::Stopped) {
            return Ok(h.state);
        }

        if let Some(exit) = h.reap().await {
            h.error_count += 1;
            h.set_state(AgentState::Unresponsive);
            self.on_worker_exit(id, exit).await?;
            return Ok(h.state);
        }

        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        if h.probe(nonce, self.config.health_timeout).await {
            if h.state != AgentState::Running {
                info!(agent = %id, incarnation = %h.incarnation, "Agent healthy");
            }
            h.set_state(AgentState::Running);
            self.breakers.record_success(id.as_str());
        } else {
            h.error_count += 1;
            warn!(
                agent = %id,
                errors = h.error_count,
                timeout = ?self.config.health_timeout,
                "Health check failed"
            );
            h.set_state(AgentState::Unresponsive);
        }
        Ok(h.state)
    }

    async fn on_worker_exit(&self, id: &AgentId, exit: WorkerExit) -> Result<()> {
        match exit {
            WorkerExit::Clean => {
                warn!(agent = %id, "Worker exited without being asked");
                Ok(())
            }
            WorkerExit::Aborted => Ok(()),
            WorkerExit::Failed(e) => self.report_exception(id.as_str(), &e.to_string()).await,
            WorkerExit::Panicked(msg) => self.report_exception(id.as_str(), &msg).await,
        }
    }

    /// Health check followed by the automatic recovery it calls for.
    pub async fn check_and_recover(&self, id: &AgentId) -> Result<AgentState> {
        match self.health_check(id).await? {
            AgentState::Unresponsive => self.auto_restart(id, AgentState::Unresponsive).await,
            AgentState::Quarantined if self.breakers.check(id.as_str()).is_ok() => {
                info!(agent = %id, "Restart window elapsed, probing quarantined agent");
                self.auto_restart(id, AgentState::Quarantined).await
            }
            state => Ok(state),
        }
    }

    async fn auto_restart(&self, id: &AgentId, current: AgentState) -> Result<AgentState> {
        match self.restart(id, false).await {
            Err(WardenError::OperationRefused { mode, .. }) => {
                warn!(agent = %id, mode = %mode, "Automatic restart refused");
                Ok(current)
            }
            other => other,
        }
    }

    /// Check every agent once. Errors are logged per agent.
    pub async fn check_all(&self) -> Vec<(AgentId, AgentState)> {
        let mut out = Vec::new();
        for id in self.agent_ids() {
            match self.check_and_recover(&id).await {
                Ok(state) => out.push((id, state)),
                Err(e) => error!(agent = %id, error = %e, "Supervision pass failed"),
            }
        }
        out
    }

    /// Restart an agent under the circuit breaker. An operator-authorized
    /// restart clears the breaker first and is allowed in LOCKDOWN.
    pub async fn restart(&self, id: &AgentId, authorized: bool) -> Result<AgentState> {
        if !authorized {
            self.state.refuse_in_lockdown("automatic restart")?;
        }
        let factory = self.factory(id)?;
        let handle = self.handle(id)?;
        let mut h = handle.lock().await;

        if authorized {
            self.breakers.reset(id.as_str());
        }
        let outcome = self.breakers.record_attempt(id.as_str());
        if outcome.state == CircuitBreakerState::Open {
            let reason = format!(
                "{} restarts within {:?}",
                outcome.attempts_in_window, self.config.restart_window
            );
            return self.quarantine(&mut h, reason, outcome.tripped).await;
        }

        let worker = factory.create(id)?;
        let previous = h.incarnation;
        h.relaunch(worker, self.config.channel_capacity);
        info!(
            agent = %id,
            %previous,
            incarnation = %h.incarnation,
            attempts = outcome.attempts_in_window,
            authorized,
            "Agent restarted"
        );
        self.state
            .audit(LedgerEvent::AgentRestarted {
                agent: id.clone(),
                incarnation: h.incarnation,
                attempts_in_window: outcome.attempts_in_window,
                authorized,
            })
            .await?;
        Ok(h.state)
    }

    async fn quarantine(
        &self,
        h: &mut AgentHandle,
        reason: String,
        newly_tripped: bool,
    ) -> Result<AgentState> {
        h.abort();
        if matches!(h.state, AgentState::Starting | AgentState::Running) {
            h.set_state(AgentState::Unresponsive);
        }
        let changed = h.state != AgentState::Quarantined;
        h.set_state(AgentState::Quarantined);
        if changed || newly_tripped {
            error!(agent = %h.id, reason = %reason, "Agent quarantined");
            self.state
                .audit(LedgerEvent::AgentQuarantined {
                    agent: h.id.clone(),
                    reason,
                })
                .await?;
        }
        Ok(h.state)
    }

    /// Cooperative shutdown with a grace period, then forced termination.
    pub async fn stop(&self, id: &AgentId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut h = handle.lock().await;
        if h.state == AgentState::Stopped {
            return Ok(());
        }
        let forced = h.shutdown(self.config.shutdown_grace).await;
        h.set_state(AgentState::Stopped);
        if forced {
            warn!(agent = %id, grace = ?self.config.shutdown_grace, "Agent did not stop in time, terminated");
        } else {
            info!(agent = %id, "Agent stopped");
        }
        self.state
            .audit(LedgerEvent::AgentStopped {
                agent: id.clone(),
                forced,
            })
            .await?;
        Ok(())
    }

    pub async fn stop_all(&self) {
        for id in self.agent_ids() {
            if let Err(e) = self.stop(&id).await {
                warn!(agent = %id, error = %e, "Stop failed");
            }
        }
    }

    /// Run one task on a RUNNING agent. Refused in LOCKDOWN.
    pub async fn dispatch(&self, id: &AgentId, payload: Value) -> Result<Value> {
        self.state.refuse_in_lockdown("dispatch task")?;
        let handle = self.handle(id)?;
        let mut h = handle.lock().await;
        if !h.state.is_serving() {
            return Err(WardenError::OperationRefused {
                mode: self.state.mode(),
                operation: format!("dispatch to {} agent {id}", h.state),
            });
        }
        match h.request(Uuid::new_v4(), payload, self.config.task_timeout).await {
            Ok(AgentReply::Result { payload, .. }) => {
                h.last_used_at = Utc::now();
                Ok(payload)
            }
            Ok(AgentReply::Error { message, .. }) => {
                h.last_used_at = Utc::now();
                Err(WardenError::Internal(format!("agent {id} task failed: {message}")))
            }
            Ok(other) => Err(WardenError::Internal(format!(
                "agent {id} sent unexpected reply {other:?}"
            ))),
            Err(e) => {
                h.error_count += 1;
                h.set_state(AgentState::Unresponsive);
                warn!(agent = %id, error = %e, "Task failed");
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> Vec<AgentStatus> {
        let mut out = Vec::new();
        for id in self.agent_ids() {
            let Ok(handle) = self.handle(&id) else {
                continue;
            };
            let h = handle.lock().await;
            out.push(AgentStatus {
                id: h.id.clone(),
                incarnation: h.incarnation,
                state: h.state,
                started_at: h.started_at,
                last_used_at: h.last_used_at,
                error_count: h.error_count,
                restarts_in_window: self.breakers.attempts_in_window(id.as_str()),
                circuit: self.breakers.state(id.as_str()),
            });
        }
        out
    }

    /// Up to `n` RUNNING agents, least recently used first.
    pub async fn lru_candidates(&self, n: usize) -> Vec<AgentId> {
        let mut running: Vec<_> = self
            .status()
            .await
            .into_iter()
            .filter(|s| s.state.is_serving())
            .map(|s| (s.last_used_at, s.id))
            .collect();
        running.sort();
        running.into_iter().take(n).map(|(_, id)| id).collect()
    }

    /// Stop up to `n` least recently used agents. Returns those stopped.
    pub async fn shed_load(&self, n: usize) -> Vec<AgentId> {
        let mut shed = Vec::new();
        for id in self.lru_candidates(n).await {
            match self.stop(&id).await {
                Ok(()) => shed.push(id),
                Err(e) => warn!(agent = %id, error = %e, "Could not shed agent"),
            }
        }
        shed
    }

    /// Count an uncaught critical error against the process-wide budget.
    /// Spending the budget escalates to SAFE_MODE.
    pub async fn report_exception(&self, source: &str, message: &str) -> Result<()> {
        let (count, exhausted) = self.budget.record();
        error!(
            source,
            message,
            count,
            threshold = self.budget.threshold(),
            "Critical error"
        );
        let audit = self
            .state
            .audit(LedgerEvent::CriticalError {
                source: source.to_string(),
                message: message.to_string(),
            })
            .await;
        if exhausted {
            self.state
                .escalate(SystemMode::SafeMode, EXCEPTION_BUDGET_REASON)
                .await?;
        }
        audit.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use warden_ledger::InMemoryLedger;
    use warden_security::DenyAll;
    use warden_state::MemoryAlertSink;

    use crate::worker::{EchoHandler, HandlerFactory, TaskHandler};

    fn supervisor() -> (Supervisor, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::with_generated_key());
        let state = Arc::new(StateMachine::new(
            ledger.clone(),
            Arc::new(MemoryAlertSink::new()),
            Arc::new(DenyAll),
        ));
        let config = SupervisorConfig {
            health_timeout: Duration::from_millis(200),
            task_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(200),
            ..SupervisorConfig::default()
        };
        (Supervisor::new(state, config), ledger)
    }

    fn echo() -> Arc<dyn WorkerFactory> {
        Arc::new(HandlerFactory::new(|_: &AgentId| EchoHandler))
    }

    #[tokio::test]
    async fn test_spawn_check_dispatch() {
        let (sup, ledger) = supervisor();
        let id = AgentId::new("echo");
        sup.spawn(id.clone(), echo()).await.unwrap();
        assert_eq!(sup.health_check(&id).await.unwrap(), AgentState::Running);

        let out = sup.dispatch(&id, serde_json::json!("ping")).await.unwrap();
        assert_eq!(out, serde_json::json!("ping"));

        assert!(matches!(
            sup.spawn(id.clone(), echo()).await,
            Err(WardenError::AgentExists(_))
        ));
        sup.stop(&id).await.unwrap();
        let status = sup.status().await;
        assert_eq!(status[0].state, AgentState::Stopped);
        assert_eq!(ledger.len().await, 2);
    }

    #[tokio::test]
    async fn test_dispatch_requires_running() {
        let (sup, _) = supervisor();
        let id = AgentId::new("echo");
        sup.spawn(id.clone(), echo()).await.unwrap();
        assert!(matches!(
            sup.dispatch(&id, Value::Null).await,
            Err(WardenError::OperationRefused { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_refused_when_degraded() {
        let (sup, _) = supervisor();
        sup.state()
            .transition(SystemMode::SafeMode, "test")
            .await
            .unwrap();
        assert!(matches!(
            sup.spawn(AgentId::new("a"), echo()).await,
            Err(WardenError::OperationRefused { .. })
        ));
    }

    struct Panicky;

    #[async_trait]
    impl TaskHandler for Panicky {
        async fn handle(&mut self, _payload: Value) -> std::result::Result<Value, String> {
            panic!("agent bug");
        }
    }

    #[tokio::test]
    async fn test_exception_budget_escalates() {
        let (sup, _) = supervisor();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory: Arc<dyn WorkerFactory> = Arc::new(HandlerFactory::new(move |_: &AgentId| {
            counter.fetch_add(1, Ordering::SeqCst);
            Panicky
        }));
        for n in 0..3 {
            let id = AgentId::new(format!("p{n}"));
            sup.spawn(id.clone(), factory.clone()).await.unwrap();
            sup.health_check(&id).await.unwrap();
            let _ = sup.dispatch(&id, Value::Null).await;
            assert_eq!(sup.health_check(&id).await.unwrap(), AgentState::Unresponsive);
        }
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(sup.exception_budget().count(), 3);
        assert_eq!(sup.state().mode(), SystemMode::SafeMode);
        assert_eq!(sup.state().state().reason, EXCEPTION_BUDGET_REASON);
    }

    #[tokio::test]
    async fn test_lru_order() {
        let (sup, _) = supervisor();
        for name in ["a", "b", "c"] {
            let id = AgentId::new(name);
            sup.spawn(id.clone(), echo()).await.unwrap();
            sup.health_check(&id).await.unwrap();
        }
        sup.dispatch(&AgentId::new("a"), Value::Null).await.unwrap();
        let lru = sup.lru_candidates(2).await;
        assert_eq!(lru, vec![AgentId::new("b"), AgentId::new("c")]);

        let shed = sup.shed_load(1).await;
        assert_eq!(shed, vec![AgentId::new("b")]);
        assert_eq!(sup.lru_candidates(5).await.len(), 2);
    }
}
