use std::sync::Arc;
use std::time::Duration;

use warden_ledger::{FileLedger, InMemoryCounter, Ledger, LedgerSigner};
use warden_security::{DenyAll, RetryPolicy};
use warden_state::{LEDGER_FAILURE_REASON, MemoryAlertSink, StateMachine};
use warden_types::{AgentId, LedgerEvent, SystemMode, WardenError};

fn stopped(name: &str) -> LedgerEvent {
    LedgerEvent::AgentStopped {
        agent: AgentId::from(name),
        forced: false,
    }
}

/// A ledger file that stops accepting writes exhausts its retries, reports
/// itself unavailable, and drops the system into SAFE_MODE.
#[tokio::test]
async fn test_unwritable_ledger_escalates_to_safe_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let ledger = Arc::new(
        FileLedger::open(
            &path,
            Arc::new(LedgerSigner::generate()),
            Arc::new(InMemoryCounter::default()),
            RetryPolicy::new(3, Duration::from_millis(500), Duration::from_millis(1)),
        )
        .await
        .unwrap(),
    );
    let alerts = Arc::new(MemoryAlertSink::new());
    let state = StateMachine::new(ledger.clone(), alerts.clone(), Arc::new(DenyAll));

    state.audit(stopped("planner")).await.unwrap();
    assert_eq!(state.mode(), SystemMode::Normal);

    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    match state.audit(stopped("critic")).await {
        Err(WardenError::LedgerUnavailable(msg)) => assert!(msg.contains("entry 1")),
        other => panic!("expected ledger unavailable, got {other:?}"),
    }
    assert_eq!(state.mode(), SystemMode::SafeMode);
    assert_eq!(state.state().reason, LEDGER_FAILURE_REASON);
    assert!(!alerts.alerts().is_empty());

    // Writes still fail, so leaving SAFE_MODE is refused.
    assert!(state.transition(SystemMode::Normal, "recovered").await.is_err());
    assert_eq!(state.mode(), SystemMode::SafeMode);
    assert_eq!(ledger.latest().await.unwrap().map(|r| r.index), Some(0));
}
