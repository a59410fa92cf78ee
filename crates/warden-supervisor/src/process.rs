use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use warden_types::{AgentId, Result, WardenError};

use crate::protocol::{AgentReply, ControlMessage};
use crate::worker::{AgentWorker, WorkerFactory};

/// Agent running as a child process. Control messages go to its stdin and
/// replies come back on stdout, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessWorker {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentWorker for ProcessWorker {
    async fn run(
        self: Box<Self>,
        mut control: mpsc::Receiver<ControlMessage>,
        replies: mpsc::Sender<AgentReply>,
    ) -> Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WardenError::Internal("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WardenError::Internal("child stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        debug!(command = %self.command, pid = ?child.id(), "Worker process started");

        loop {
            tokio::select! {
                msg = control.recv() => match msg {
                    Some(msg) => {
                        let shutdown = matches!(msg, ControlMessage::Shutdown);
                        let mut line = serde_json::to_vec(&msg)?;
                        line.push(b'\n');
                        stdin.write_all(&line).await?;
                        stdin.flush().await?;
                        if shutdown {
                            let status = child.wait().await?;
                            debug!(command = %self.command, %status, "Worker process exited");
                            let _ = replies.send(AgentReply::Stopped).await;
                            return Ok(());
                        }
                    }
                    None => {
                        child.kill().await?;
                        return Ok(());
                    }
                },
                line = lines.next_line() => match line? {
                    Some(text) => match serde_json::from_str::<AgentReply>(&text) {
                        Ok(reply) => {
                            if replies.send(reply).await.is_err() {
                                child.kill().await?;
                                return Ok(());
                            }
                        }
                        Err(e) => debug!(error = %e, "Ignoring non-protocol output"),
                    },
                    None => {
                        let status = child.wait().await?;
                        warn!(command = %self.command, %status, "Worker process closed stdout");
                        return Err(WardenError::Internal(format!(
                            "worker process {} exited: {status}",
                            self.command
                        )));
                    }
                },
            }
        }
    }
}

impl WorkerFactory for ProcessWorker {
    fn create(&self, _id: &AgentId) -> Result<Box<dyn AgentWorker>> {
        Ok(Box::new(self.clone()))
    }
}
