use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use warden_core::{ContextOptions, LoopIntervals};
use warden_integrity::FirstUsePolicy;
use warden_security::RetryPolicy;
use warden_supervisor::ResourceThresholds;

pub const STATE_DIR_ENV: &str = "WARDEN_STATE_DIR";

/// Top-level configuration, read from `<state_dir>/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub integrity: IntegritySection,
    #[serde(default)]
    pub snapshot: SnapshotSection,
    #[serde(default)]
    pub alert: AlertSection,
    #[serde(default)]
    pub resource: ResourceThresholds,
    #[serde(default)]
    pub second_factor: SecondFactorSection,
    /// External process agents started by `warden run`.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub io_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            io_timeout_ms: 2000,
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub restart_window_secs: u64,
    pub restart_threshold: usize,
    pub exception_threshold: u32,
    pub shutdown_grace_secs: u64,
    pub channel_capacity: usize,
    pub resource_interval_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            health_timeout_secs: 3,
            task_timeout_secs: 30,
            restart_window_secs: 60,
            restart_threshold: 3,
            exception_threshold: 3,
            shutdown_grace_secs: 5,
            channel_capacity: 32,
            resource_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegritySection {
    /// Defaults to `<state_dir>/models`.
    pub models_dir: Option<PathBuf>,
    /// Defaults to `<state_dir>/quarantine`.
    pub quarantine_dir: Option<PathBuf>,
    pub scan_interval_secs: u64,
    pub first_use: FirstUsePolicy,
}

impl Default for IntegritySection {
    fn default() -> Self {
        Self {
            models_dir: None,
            quarantine_dir: None,
            scan_interval_secs: 120,
            first_use: FirstUsePolicy::Trust,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    /// Defaults to `<state_dir>/agents`.
    pub agent_state_dir: Option<PathBuf>,
    /// Defaults to `<state_dir>/snapshots`.
    pub snapshot_dir: Option<PathBuf>,
    pub interval_secs: u64,
    pub retention: usize,
    pub io_timeout_secs: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            agent_state_dir: None,
            snapshot_dir: None,
            interval_secs: 3600,
            retention: 10,
            io_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSection {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondFactorSection {
    /// Environment variable holding the shared TOTP secret.
    pub secret_env: String,
    pub step_secs: u64,
    pub skew: u64,
}

impl Default for SecondFactorSection {
    fn default() -> Self {
        Self {
            secret_env: "WARDEN_OTP_SECRET".to_string(),
            step_secs: 30,
            skew: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// `--state-dir`, else `$WARDEN_STATE_DIR`, else `~/.warden`.
pub fn resolve_state_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("Cannot determine home directory; pass --state-dir")?;
    Ok(home.join(".warden"))
}

impl WardenConfig {
    /// Config file path within the state directory.
    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join("config.toml")
    }

    /// Load config from disk. Returns default if not found.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::config_path(state_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::config_path(state_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.ledger.max_attempts,
            Duration::from_millis(self.ledger.io_timeout_ms),
            Duration::from_millis(self.ledger.backoff_ms),
        )
    }

    pub fn context_options(&self, state_dir: &Path) -> ContextOptions {
        let mut options = ContextOptions::under(state_dir);
        if let Some(dir) = &self.integrity.models_dir {
            options.models_dir = dir.clone();
        }
        if let Some(dir) = &self.integrity.quarantine_dir {
            options.quarantine_dir = dir.clone();
        }
        if let Some(dir) = &self.snapshot.agent_state_dir {
            options.agent_state_dir = dir.clone();
        }
        if let Some(dir) = &self.snapshot.snapshot_dir {
            options.snapshot.snapshot_dir = dir.clone();
        }
        options.first_use = self.integrity.first_use;
        options.snapshot.retention = self.snapshot.retention;
        options.snapshot.io_timeout = Duration::from_secs(self.snapshot.io_timeout_secs);
        options.resource = self.resource;
        options.retry = self.retry_policy();

        let s = &self.supervisor;
        options.supervisor.health_timeout = Duration::from_secs(s.health_timeout_secs);
        options.supervisor.task_timeout = Duration::from_secs(s.task_timeout_secs);
        options.supervisor.restart_window = Duration::from_secs(s.restart_window_secs);
        options.supervisor.restart_threshold = s.restart_threshold;
        options.supervisor.exception_threshold = s.exception_threshold;
        options.supervisor.shutdown_grace = Duration::from_secs(s.shutdown_grace_secs);
        options.supervisor.channel_capacity = s.channel_capacity;
        options
    }

    pub fn intervals(&self) -> LoopIntervals {
        LoopIntervals {
            health: Duration::from_secs(self.supervisor.health_interval_secs.max(1)),
            scan: Duration::from_secs(self.integrity.scan_interval_secs.max(1)),
            resource: Duration::from_secs(self.supervisor.resource_interval_secs.max(1)),
            snapshot: Duration::from_secs(self.snapshot.interval_secs.max(1)),
        }
    }
}
