use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::Context;

#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    pub health: Duration,
    pub scan: Duration,
    pub resource: Duration,
    pub snapshot: Duration,
}

impl Default for LoopIntervals {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(30),
            scan: Duration::from_secs(120),
            resource: Duration::from_secs(15),
            snapshot: Duration::from_secs(3600),
        }
    }
}

/// The supervising loop: periodic health checks, integrity scans and
/// resource sampling, plus the snapshot loop on its own task.
pub struct ControlLoop {
    ctx: Arc<Context>,
    intervals: LoopIntervals,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(ctx: Arc<Context>, intervals: LoopIntervals, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            intervals,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let snapshot_task = tokio::spawn(self.ctx.snapshots.clone().run(
            self.ctx.options.agent_state_dir.clone(),
            self.intervals.snapshot,
            self.shutdown_rx.clone(),
        ));
        let mut health = tokio::time::interval(self.intervals.health);
        let mut scan = tokio::time::interval(self.intervals.scan);
        let mut resource = tokio::time::interval(self.intervals.resource);
        let mut changes = self.ctx.state.subscribe();
        info!(intervals = ?self.intervals, "Control loop started");

        loop {
            tokio::select! {
                _ = health.tick() => {
                    let states = self.ctx.supervisor.check_all().await;
                    debug!(agents = states.len(), "Health pass complete");
                }
                _ = scan.tick() => {
                    match self.ctx.gate.scan(&self.ctx.options.models_dir).await {
                        Ok(report) if !report.mismatched.is_empty() => {
                            warn!(mismatched = ?report.mismatched, "Integrity scan found mismatches");
                        }
                        Ok(report) => debug!(ok = report.ok.len(), new = report.new.len(), "Integrity scan clean"),
                        Err(e) => error!(error = %e, "Integrity scan failed"),
                    }
                }
                _ = resource.tick() => {
                    if let Err(e) = self.ctx.resources.check(&self.ctx.supervisor).await {
                        warn!(error = %e, "Resource check failed");
                    }
                }
                Ok(change) = changes.recv() => {
                    info!(from = %change.from, to = %change.to, reason = %change.reason, "Mode change observed");
                }
                Ok(()) = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Control loop shutting down");
                        break;
                    }
                }
            }
        }

        self.ctx.supervisor.stop_all().await;
        if let Err(e) = snapshot_task.await {
            error!(error = %e, "Snapshot loop ended abnormally");
        }
    }
}
