use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Supervisor to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    HealthCheck { nonce: u64 },
    Shutdown,
    Task { request_id: Uuid, payload: Value },
}

/// Worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    HealthOk {
        nonce: u64,
    },
    Result {
        request_id: Uuid,
        payload: Value,
    },
    Error {
        #[serde(default)]
        request_id: Option<Uuid>,
        message: String,
    },
    Stopped,
}
