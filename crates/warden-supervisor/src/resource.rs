use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use warden_types::{LedgerEvent, Result, SystemMode, WardenError};

use crate::supervisor::Supervisor;

/// Utilization percentages, 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: u32,
    pub ram_percent: u32,
    pub disk_percent: u32,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceSample>;
}

/// Reads utilization from procfs and `df`.
#[derive(Debug)]
pub struct ProcfsProbe {
    proc_root: PathBuf,
    disk_path: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl ProcfsProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self::with_proc_root("/proc", disk_path)
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            disk_path: disk_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    fn cpu_percent(&self) -> Result<u32> {
        let stat = std::fs::read_to_string(self.proc_root.join("stat"))?;
        let now = parse_cpu_times(&stat)
            .ok_or_else(|| WardenError::Internal("no cpu line in /proc/stat".into()))?;
        let mut last = self
            .last_cpu
            .lock()
            .map_err(|_| WardenError::Internal("cpu sample lock poisoned".into()))?;
        let (busy, total) = match *last {
            Some(prev) if now.total > prev.total => {
                (now.busy.saturating_sub(prev.busy), now.total - prev.total)
            }
            _ => (now.busy, now.total),
        };
        *last = Some(now);
        Ok(percent(busy, total))
    }

    fn ram_percent(&self) -> Result<u32> {
        let meminfo = std::fs::read_to_string(self.proc_root.join("meminfo"))?;
        let (total, available) = parse_meminfo(&meminfo);
        if total == 0 {
            return Err(WardenError::Internal("MemTotal missing from /proc/meminfo".into()));
        }
        Ok(percent(total.saturating_sub(available), total))
    }
}

impl ResourceProbe for ProcfsProbe {
    fn sample(&self) -> Result<ResourceSample> {
        Ok(ResourceSample {
            cpu_percent: self.cpu_percent()?,
            ram_percent: self.ram_percent()?,
            disk_percent: disk_percent(&self.disk_path)?,
        })
    }
}

fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    ((part.min(whole) * 100) / whole) as u32
}

/// Aggregate `cpu` line: user nice system idle iowait irq softirq steal.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|s| s.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total - idle,
        total,
    })
}

/// Returns (MemTotal, MemAvailable) in kB.
fn parse_meminfo(content: &str) -> (u64, u64) {
    let field = |rest: &str| -> u64 {
        rest.split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };
    let mut total = 0;
    let mut available = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = field(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = field(rest);
        }
    }
    (total, available)
}

fn disk_percent(path: &Path) -> Result<u32> {
    let output = std::process::Command::new("df").arg("-P").arg(path).output()?;
    if !output.status.success() {
        return Err(WardenError::Internal(format!(
            "df failed for {}",
            path.display()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_capacity(&stdout)
        .ok_or_else(|| WardenError::Internal("unexpected df output".into()))
}

fn parse_df_capacity(output: &str) -> Option<u32> {
    let line = output.lines().nth(1)?;
    line.split_whitespace()
        .find_map(|col| col.strip_suffix('%'))
        .and_then(|n| n.parse().ok())
}

/// Fixed readings, for tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticProbe {
    sample: Mutex<ResourceSample>,
}

impl StaticProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        if let Ok(mut s) = self.sample.lock() {
            *s = sample;
        }
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> Result<ResourceSample> {
        self.sample
            .lock()
            .map(|s| *s)
            .map_err(|_| WardenError::Internal("probe lock poisoned".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_percent: u32,
    pub ram_percent: u32,
    pub disk_percent: u32,
    /// Consecutive breaching samples before escalation.
    pub window: u32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 95,
            ram_percent: 90,
            disk_percent: 95,
            window: 3,
        }
    }
}

impl ResourceThresholds {
    /// Names of the breached resources, empty when within limits.
    pub fn breaches(&self, sample: &ResourceSample) -> Vec<&'static str> {
        let mut out = Vec::new();
        if sample.cpu_percent >= self.cpu_percent {
            out.push("cpu");
        }
        if sample.ram_percent >= self.ram_percent {
            out.push("ram");
        }
        if sample.disk_percent >= self.disk_percent {
            out.push("disk");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceVerdict {
    Healthy,
    /// Over a threshold. LRU agents should be shed.
    Pressure {
        breaches: Vec<&'static str>,
        consecutive: u32,
    },
    /// Over a threshold for the whole window.
    Exhausted {
        breaches: Vec<&'static str>,
        consecutive: u32,
    },
}

pub struct ResourceGuard {
    probe: Arc<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    consecutive: AtomicU32,
    shed_per_breach: usize,
}

impl ResourceGuard {
    pub fn new(probe: Arc<dyn ResourceProbe>, thresholds: ResourceThresholds) -> Self {
        Self {
            probe,
            thresholds,
            consecutive: AtomicU32::new(0),
            shed_per_breach: 1,
        }
    }

    pub fn with_shed_per_breach(mut self, n: usize) -> Self {
        self.shed_per_breach = n;
        self
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    /// Classify a sample and update the consecutive-breach count.
    pub fn evaluate(&self, sample: &ResourceSample) -> ResourceVerdict {
        let breaches = self.thresholds.breaches(sample);
        if breaches.is_empty() {
            self.consecutive.store(0, Ordering::SeqCst);
            return ResourceVerdict::Healthy;
        }
        let consecutive = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive >= self.thresholds.window.max(1) {
            ResourceVerdict::Exhausted {
                breaches,
                consecutive,
            }
        } else {
            ResourceVerdict::Pressure {
                breaches,
                consecutive,
            }
        }
    }

    /// Take a sample and act on it: shed least recently used agents on any
    /// breach, escalate to SAFE_MODE on a sustained one.
    pub async fn check(&self, supervisor: &Supervisor) -> Result<ResourceVerdict> {
        let probe = self.probe.clone();
        let sample = tokio::task::spawn_blocking(move || probe.sample())
            .await
            .map_err(|e| WardenError::Internal(format!("resource probe task failed: {e}")))??;
        let verdict = self.evaluate(&sample);
        debug!(?sample, ?verdict, "Resource sample");

        let (breaches, exhausted) = match &verdict {
            ResourceVerdict::Healthy => return Ok(verdict),
            ResourceVerdict::Pressure { breaches, .. } => (breaches.join(","), false),
            ResourceVerdict::Exhausted { breaches, .. } => (breaches.join(","), true),
        };
        warn!(
            cpu = sample.cpu_percent,
            ram = sample.ram_percent,
            disk = sample.disk_percent,
            breaches = %breaches,
            "Resource pressure"
        );
        let shed = supervisor.shed_load(self.shed_per_breach).await;
        supervisor
            .state()
            .audit(LedgerEvent::ResourcePressure {
                cpu_percent: sample.cpu_percent,
                ram_percent: sample.ram_percent,
                disk_percent: sample.disk_percent,
                shed,
            })
            .await?;
        if exhausted {
            let reason = format!("resource exhaustion: {breaches}");
            error!(reason = %reason, "Escalating");
            supervisor
                .state()
                .escalate(SystemMode::SafeMode, &reason)
                .await?;
        }
        Ok(verdict)
    }
}
