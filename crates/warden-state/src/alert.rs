use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use warden_types::{Result, SystemMode, WardenError};

/// Body posted to the alert sink on every degraded-mode transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub mode: SystemMode,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Outbound notification channel. `notify` must not block the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: Alert) {
        warn!(mode = %alert.mode, reason = %alert.reason, "ALERT");
    }
}

/// POSTs alerts as JSON to a webhook on a spawned task.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WardenError::Internal(format!("alert http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, alert: Alert) {
        warn!(mode = %alert.mode, reason = %alert.reason, "ALERT");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, webhook alert dropped");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            match client.post(&url).json(&alert).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, "Alert delivered");
                }
                Ok(resp) => {
                    warn!(url = %url, status = %resp.status(), "Alert webhook rejected alert");
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Alert delivery failed");
                }
            }
        });
    }
}

/// Keeps alerts in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AlertSink for MemoryAlertSink {
    fn notify(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}
