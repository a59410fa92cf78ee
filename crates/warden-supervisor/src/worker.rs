use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use warden_types::{AgentId, Result};

use crate::protocol::{AgentReply, ControlMessage};

/// One agent incarnation. Runs until it receives `Shutdown`, its control
/// channel closes, or it fails.
#[async_trait]
pub trait AgentWorker: Send {
    async fn run(
        self: Box<Self>,
        control: mpsc::Receiver<ControlMessage>,
        replies: mpsc::Sender<AgentReply>,
    ) -> Result<()>;
}

/// Builds a fresh worker for every spawn and restart.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, id: &AgentId) -> Result<Box<dyn AgentWorker>>;
}

/// In-process agent logic.
#[async_trait]
pub trait TaskHandler: Send + 'static {
    async fn handle(&mut self, payload: Value) -> std::result::Result<Value, String>;

    /// Liveness probe. Returning false or never returning both fail the check.
    async fn probe(&mut self) -> bool {
        true
    }
}

/// Adapts a [`TaskHandler`] to the control protocol.
pub struct TaskWorker<H> {
    handler: H,
}

impl<H: TaskHandler> TaskWorker<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: TaskHandler> AgentWorker for TaskWorker<H> {
    async fn run(
        mut self: Box<Self>,
        mut control: mpsc::Receiver<ControlMessage>,
        replies: mpsc::Sender<AgentReply>,
    ) -> Result<()> {
        while let Some(msg) = control.recv().await {
            let reply = match msg {
                ControlMessage::HealthCheck { nonce } => {
                    if !self.handler.probe().await {
                        continue;
                    }
                    AgentReply::HealthOk { nonce }
                }
                ControlMessage::Task {
                    request_id,
                    payload,
                } => match self.handler.handle(payload).await {
                    Ok(payload) => AgentReply::Result {
                        request_id,
                        payload,
                    },
                    Err(message) => AgentReply::Error {
                        request_id: Some(request_id),
                        message,
                    },
                },
                ControlMessage::Shutdown => {
                    let _ = replies.send(AgentReply::Stopped).await;
                    return Ok(());
                }
            };
            if replies.send(reply).await.is_err() {
                break;
            }
        }
        debug!("Control channel closed, worker exiting");
        Ok(())
    }
}

/// Factory that builds a [`TaskWorker`] from a closure.
pub struct HandlerFactory<F> {
    make: F,
}

impl<F> HandlerFactory<F> {
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

impl<F, H> WorkerFactory for HandlerFactory<F>
where
    F: Fn(&AgentId) -> H + Send + Sync,
    H: TaskHandler,
{
    fn create(&self, id: &AgentId) -> Result<Box<dyn AgentWorker>> {
        Ok(Box::new(TaskWorker::new((self.make)(id))))
    }
}

/// Answers every task with its own payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&mut self, payload: Value) -> std::result::Result<Value, String> {
        Ok(payload)
    }
}
