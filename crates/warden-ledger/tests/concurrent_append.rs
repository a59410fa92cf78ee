use std::collections::HashSet;
use std::sync::Arc;

use warden_ledger::*;
use warden_security::RetryPolicy;
use warden_types::{AgentId, Digest, LedgerEvent};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_form_one_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let signer = Arc::new(LedgerSigner::generate());
    let counter: Arc<dyn MonotonicCounter> =
        Arc::new(FileCounter::open(dir.path().join("ledger.counter")).unwrap());
    let ledger = Arc::new(
        FileLedger::open(&path, signer.clone(), counter, RetryPolicy::default())
            .await
            .unwrap(),
    );

    const N: usize = 64;
    let mut handles = Vec::new();
    for i in 0..N {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .append(LedgerEvent::AgentStopped {
                    agent: AgentId::from(format!("worker-{i}")),
                    forced: i % 2 == 0,
                })
                .await
                .unwrap()
        }));
    }

    let mut indices = HashSet::new();
    for handle in handles {
        let entry = handle.await.unwrap();
        assert!(indices.insert(entry.index), "duplicate index {}", entry.index);
    }
    assert_eq!(indices.len(), N);
    assert_eq!(ledger.verify_chain().await.unwrap(), N as u64);

    let entries = ledger.entries().await.unwrap();
    assert_eq!(entries[0].prev_hash, Digest::ZERO);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].current_hash);
        assert!(pair[1].monotonic_counter > pair[0].monotonic_counter);
    }

    assert_eq!(verify_ledger_file(&path, &signer.verifying_key()).unwrap(), N as u64);
}

#[tokio::test]
async fn test_in_memory_ledger_concurrent_appends() {
    let ledger = Arc::new(InMemoryLedger::with_generated_key());
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .append(LedgerEvent::CriticalError {
                        source: "stress".into(),
                        message: format!("n{i}"),
                    })
                    .await
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(ledger.verify_chain().await.unwrap(), 32);
}
