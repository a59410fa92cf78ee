use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use warden_ledger::{InMemoryLedger, Ledger};
use warden_security::{CircuitBreakerState, DenyAll};
use warden_state::{MemoryAlertSink, StateMachine};
use warden_supervisor::{HandlerFactory, Supervisor, SupervisorConfig, TaskHandler, WorkerFactory};
use warden_types::{AgentId, AgentState, SystemMode};

/// Accepts the connection but never answers a probe.
struct Hung;

#[async_trait]
impl TaskHandler for Hung {
    async fn handle(&mut self, payload: Value) -> Result<Value, String> {
        Ok(payload)
    }

    async fn probe(&mut self) -> bool {
        std::future::pending::<()>().await;
        true
    }
}

struct Fixture {
    supervisor: Supervisor,
    ledger: Arc<InMemoryLedger>,
    created: Arc<AtomicUsize>,
    factory: Arc<dyn WorkerFactory>,
}

fn fixture() -> Fixture {
    let ledger = Arc::new(InMemoryLedger::with_generated_key());
    let state = Arc::new(StateMachine::new(
        ledger.clone(),
        Arc::new(MemoryAlertSink::new()),
        Arc::new(DenyAll),
    ));
    let config = SupervisorConfig {
        health_timeout: Duration::from_millis(50),
        restart_window: Duration::from_secs(60),
        restart_threshold: 3,
        ..SupervisorConfig::default()
    };
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let factory: Arc<dyn WorkerFactory> = Arc::new(HandlerFactory::new(move |_: &AgentId| {
        counter.fetch_add(1, Ordering::SeqCst);
        Hung
    }));
    Fixture {
        supervisor: Supervisor::new(state, config),
        ledger,
        created,
        factory,
    }
}

#[tokio::test(start_paused = true)]
async fn test_four_failed_checks_quarantine() {
    let f = fixture();
    let id = AgentId::new("flaky");
    f.supervisor.spawn(id.clone(), f.factory.clone()).await.unwrap();

    for _ in 0..3 {
        let state = f.supervisor.check_and_recover(&id).await.unwrap();
        assert_eq!(state, AgentState::Starting);
    }
    let state = f.supervisor.check_and_recover(&id).await.unwrap();
    assert_eq!(state, AgentState::Quarantined);
    assert_eq!(f.created.load(Ordering::SeqCst), 4);

    // Inside the window nothing restarts it.
    for _ in 0..3 {
        let state = f.supervisor.check_and_recover(&id).await.unwrap();
        assert_eq!(state, AgentState::Quarantined);
    }
    assert_eq!(f.created.load(Ordering::SeqCst), 4);

    let status = f.supervisor.status().await;
    assert_eq!(status[0].circuit, CircuitBreakerState::Open);
    assert_eq!(status[0].error_count, 4);

    let kinds: Vec<&str> = f
        .ledger
        .entries()
        .await
        .unwrap()
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "agent_spawned",
            "agent_restarted",
            "agent_restarted",
            "agent_restarted",
            "agent_quarantined",
        ]
    );
    assert_eq!(f.ledger.verify_chain().await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_one_probe_after_window_then_requarantine() {
    let f = fixture();
    let id = AgentId::new("flaky");
    f.supervisor.spawn(id.clone(), f.factory.clone()).await.unwrap();
    for _ in 0..4 {
        f.supervisor.check_and_recover(&id).await.unwrap();
    }
    assert_eq!(f.created.load(Ordering::SeqCst), 4);

    tokio::time::advance(Duration::from_secs(61)).await;
    let state = f.supervisor.check_and_recover(&id).await.unwrap();
    assert_eq!(state, AgentState::Starting);
    assert_eq!(f.created.load(Ordering::SeqCst), 5);

    let state = f.supervisor.check_and_recover(&id).await.unwrap();
    assert_eq!(state, AgentState::Quarantined);
    assert_eq!(f.created.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_lockdown_blocks_automatic_restart() {
    let f = fixture();
    let id = AgentId::new("flaky");
    f.supervisor.spawn(id.clone(), f.factory.clone()).await.unwrap();
    f.supervisor
        .state()
        .transition(SystemMode::Lockdown, "operator")
        .await
        .unwrap();

    let state = f.supervisor.check_and_recover(&id).await.unwrap();
    assert_eq!(state, AgentState::Unresponsive);
    assert_eq!(f.created.load(Ordering::SeqCst), 1);

    let state = f.supervisor.restart(&id, true).await.unwrap();
    assert_eq!(state, AgentState::Starting);
    assert_eq!(f.created.load(Ordering::SeqCst), 2);
}
