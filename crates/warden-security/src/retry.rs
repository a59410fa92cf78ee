use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use warden_types::{Result, WardenError};

/// Bounded retry with a per-attempt timeout and linear backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_millis(2000),
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, timeout: Duration, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
            backoff,
        }
    }

    /// Whether an error is worth another attempt. Integrity failures never are.
    pub fn is_retryable(err: &WardenError) -> bool {
        matches!(
            err,
            WardenError::Io(_) | WardenError::Timeout(..) | WardenError::LedgerUnavailable(_)
        )
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = WardenError::Internal(format!("{label}: no attempts made"));
        for attempt in 1..=self.max_attempts.max(1) {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(WardenError::Timeout(self.timeout, label.to_string())),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !Self::is_retryable(&err) => return Err(err),
                Err(err) => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Attempt failed"
                    );
                    last_err = err;
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        Err(last_err)
    }

    /// Run blocking `op` on the blocking pool under the same bounds as [`run`](Self::run).
    ///
    /// An attempt that overruns its timeout is still awaited before the next
    /// attempt starts or the call returns, so no write lands behind the caller.
    /// If the late attempt succeeds its result is kept.
    pub async fn run_blocking<T, F>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let mut last_err = WardenError::Internal(format!("{label}: no attempts made"));
        for attempt in 1..=self.max_attempts.max(1) {
            let task_op = op.clone();
            let mut task = tokio::task::spawn_blocking(move || task_op());
            let outcome = match tokio::time::timeout(self.timeout, &mut task).await {
                Ok(joined) => flatten(label, joined),
                Err(_) => {
                    warn!(
                        operation = label,
                        attempt,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Attempt overran its timeout; waiting for it to settle"
                    );
                    match flatten(label, task.await) {
                        Ok(value) => Ok(value),
                        Err(err) if !Self::is_retryable(&err) => Err(err),
                        Err(_) => Err(WardenError::Timeout(self.timeout, label.to_string())),
                    }
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !Self::is_retryable(&err) => return Err(err),
                Err(err) => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Attempt failed"
                    );
                    last_err = err;
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        Err(last_err)
    }
}

fn flatten<T>(label: &str, joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(|e| WardenError::Internal(format!("{label}: blocking task failed: {e}")))?
}
