use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use warden_security::CircuitBreakerState;
use warden_types::{AgentId, AgentState, Result, WardenError};

use crate::protocol::{AgentReply, ControlMessage};
use crate::worker::AgentWorker;

/// How a worker task ended, observed when it is reaped.
#[derive(Debug)]
pub enum WorkerExit {
    Clean,
    Failed(WardenError),
    Panicked(String),
    Aborted,
}

impl WorkerExit {
    fn from_join(result: std::result::Result<Result<()>, JoinError>) -> Self {
        match result {
            Ok(Ok(())) => WorkerExit::Clean,
            Ok(Err(e)) => WorkerExit::Failed(e),
            Err(e) if e.is_panic() => WorkerExit::Panicked(e.to_string()),
            Err(_) => WorkerExit::Aborted,
        }
    }
}

const REAP_WAIT: Duration = Duration::from_secs(1);

type WorkerChannels = (
    mpsc::Sender<ControlMessage>,
    mpsc::Receiver<AgentReply>,
    JoinHandle<Result<()>>,
);

fn start_worker(worker: Box<dyn AgentWorker>, capacity: usize) -> WorkerChannels {
    let (control_tx, control_rx) = mpsc::channel(capacity.max(1));
    let (reply_tx, reply_rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(worker.run(control_rx, reply_tx));
    (control_tx, reply_rx, task)
}

/// Live record of one supervised agent and its current incarnation.
pub struct AgentHandle {
    pub id: AgentId,
    pub incarnation: Uuid,
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub error_count: u32,
    control_tx: mpsc::Sender<ControlMessage>,
    reply_rx: mpsc::Receiver<AgentReply>,
    task: Option<JoinHandle<Result<()>>>,
}

impl AgentHandle {
    pub fn launch(id: AgentId, worker: Box<dyn AgentWorker>, capacity: usize) -> Self {
        let (control_tx, reply_rx, task) = start_worker(worker, capacity);
        let now = Utc::now();
        Self {
            id,
            incarnation: Uuid::new_v4(),
            state: AgentState::Starting,
            started_at: now,
            last_used_at: now,
            error_count: 0,
            control_tx,
            reply_rx,
            task: Some(task),
        }
    }

    /// Replace the incarnation with a fresh worker. Error count and usage
    /// history carry over.
    pub fn relaunch(&mut self, worker: Box<dyn AgentWorker>, capacity: usize) {
        self.abort();
        if !self.state.can_transition_to(AgentState::Starting) {
            self.set_state(AgentState::Stopped);
        }
        let (control_tx, reply_rx, task) = start_worker(worker, capacity);
        self.incarnation = Uuid::new_v4();
        self.started_at = Utc::now();
        self.control_tx = control_tx;
        self.reply_rx = reply_rx;
        self.task = Some(task);
        self.set_state(AgentState::Starting);
    }

    /// Apply a lifecycle change. Returns false for a disallowed one.
    pub fn set_state(&mut self, to: AgentState) -> bool {
        if self.state == to {
            return true;
        }
        if !self.state.can_transition_to(to) {
            warn!(agent = %self.id, from = %self.state, to = %to, "Agent transition rejected");
            return false;
        }
        debug!(agent = %self.id, from = %self.state, to = %to, "Agent state changed");
        self.state = to;
        true
    }

    /// Collect the worker's exit status if its task has finished or is
    /// unwinding.
    pub async fn reap(&mut self) -> Option<WorkerExit> {
        let task = self.task.as_mut()?;
        if !task.is_finished() && !self.control_tx.is_closed() {
            return None;
        }
        let result = timeout(REAP_WAIT, task).await.ok()?;
        self.task = None;
        Some(WorkerExit::from_join(result))
    }

    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Send a health probe and wait for the matching answer. Late answers to
    /// earlier probes are discarded.
    pub async fn probe(&mut self, nonce: u64, deadline: Duration) -> bool {
        if self
            .control_tx
            .send_timeout(ControlMessage::HealthCheck { nonce }, deadline)
            .await
            .is_err()
        {
            return false;
        }
        let reply = self
            .await_reply(deadline, |r| matches!(r, AgentReply::HealthOk { nonce: n } if *n == nonce))
            .await;
        reply.is_some()
    }

    /// Run one task on the agent.
    pub async fn request(
        &mut self,
        request_id: Uuid,
        payload: serde_json::Value,
        deadline: Duration,
    ) -> Result<AgentReply> {
        self.control_tx
            .send_timeout(
                ControlMessage::Task {
                    request_id,
                    payload,
                },
                deadline,
            )
            .await
            .map_err(|_| WardenError::ChannelClosed(self.id.clone()))?;
        self.await_reply(deadline, |r| match r {
            AgentReply::Result { request_id: id, .. } => *id == request_id,
            AgentReply::Error { request_id: id, .. } => *id == Some(request_id),
            _ => false,
        })
        .await
        .ok_or_else(|| WardenError::Timeout(deadline, format!("task on agent {}", self.id)))
    }

    /// Ask the worker to exit, then force it after `grace`. Returns true if
    /// it had to be aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> bool {
        let _ = self
            .control_tx
            .send_timeout(ControlMessage::Shutdown, grace)
            .await;
        let Some(mut task) = self.task.take() else {
            return false;
        };
        match timeout(grace, &mut task).await {
            Ok(_) => false,
            Err(_) => {
                task.abort();
                true
            }
        }
    }

    async fn await_reply<F>(&mut self, deadline: Duration, mut wanted: F) -> Option<AgentReply>
    where
        F: FnMut(&AgentReply) -> bool,
    {
        let rx = &mut self.reply_rx;
        let id = &self.id;
        let wait = async {
            while let Some(reply) = rx.recv().await {
                if wanted(&reply) {
                    return Some(reply);
                }
                debug!(agent = %id, ?reply, "Discarding stale reply");
            }
            None
        };
        timeout(deadline, wait).await.ok().flatten()
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Point-in-time view of an agent for status output.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub id: AgentId,
    pub incarnation: Uuid,
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub error_count: u32,
    pub restarts_in_window: usize,
    pub circuit: CircuitBreakerState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{EchoHandler, TaskWorker};

    #[tokio::test]
    async fn test_probe_and_request() {
        let mut handle = AgentHandle::launch(
            AgentId::new("echo"),
            Box::new(TaskWorker::new(EchoHandler)),
            8,
        );
        assert_eq!(handle.state, AgentState::Starting);
        assert!(handle.probe(1, Duration::from_secs(1)).await);

        let id = Uuid::new_v4();
        let reply = handle
            .request(id, serde_json::json!(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            reply,
            AgentReply::Result {
                request_id: id,
                payload: serde_json::json!(5)
            }
        );
        assert!(!handle.shutdown(Duration::from_secs(1)).await);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_relaunch_changes_incarnation() {
        let mut handle = AgentHandle::launch(
            AgentId::new("echo"),
            Box::new(TaskWorker::new(EchoHandler)),
            8,
        );
        assert!(handle.set_state(AgentState::Running));
        let first = handle.incarnation;
        handle.relaunch(Box::new(TaskWorker::new(EchoHandler)), 8);
        assert_ne!(handle.incarnation, first);
        assert_eq!(handle.state, AgentState::Starting);
        assert!(handle.probe(2, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_disallowed_transition_is_rejected() {
        let mut handle = AgentHandle::launch(
            AgentId::new("echo"),
            Box::new(TaskWorker::new(EchoHandler)),
            8,
        );
        assert!(!handle.set_state(AgentState::Quarantined));
        assert_eq!(handle.state, AgentState::Starting);
    }
}
