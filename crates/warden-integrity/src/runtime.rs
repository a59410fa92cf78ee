use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use warden_types::{Result, VerifyResult, WardenError};

use crate::artifact::ArtifactKind;
use crate::gate::QuarantineGate;

/// Opaque handle to a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub id: Uuid,
    pub artifact: String,
}

/// Model inference layer. Responses are never interpreted here.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn load(&self, artifact: &ArtifactKind) -> Result<WorkerHandle>;

    async fn infer(&self, handle: &WorkerHandle, request: Value) -> Result<Value>;
}

/// Wraps a runtime so nothing loads without passing the quarantine gate.
pub struct VerifiedRuntime {
    gate: Arc<QuarantineGate>,
    inner: Arc<dyn ModelRuntime>,
}

impl VerifiedRuntime {
    pub fn new(gate: Arc<QuarantineGate>, inner: Arc<dyn ModelRuntime>) -> Self {
        Self { gate, inner }
    }

    pub async fn load(&self, artifact_path: &Path) -> Result<WorkerHandle> {
        match self.gate.verify_path(artifact_path).await? {
            VerifyResult::Ok | VerifyResult::New => {}
            VerifyResult::Mismatch { expected, actual } => {
                return Err(WardenError::IntegrityMismatch {
                    name: artifact_path.display().to_string(),
                    expected,
                    actual,
                });
            }
        }
        let name = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = self
            .gate
            .kind(&name)
            .await
            .ok_or_else(|| WardenError::ArtifactNotFound(name.clone()))?;
        self.inner.load(&kind).await
    }

    pub async fn infer(&self, handle: &WorkerHandle, request: Value) -> Result<Value> {
        self.inner.infer(handle, request).await
    }
}
