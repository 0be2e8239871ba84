use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{AttemptTag, EventSink, ExecutorEventKind, JobDescriptor, TrainingExecutor};
use crate::jobs::DispatchError;

/// Runs each attempt as a child process.
///
/// The descriptor is written to the child's stdin as a single JSON line and
/// the child reports back with one JSON event per stdout line. A child that
/// exits without reporting a result counts as a failed attempt.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    max_processes: usize,
    /// One permit per live child, held until its supervisor exits
    slots: Arc<Semaphore>,
    running: Arc<DashMap<AttemptTag, oneshot::Sender<()>>>,
}

impl ProcessExecutor {
    pub fn new(
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
        max_processes: usize,
    ) -> Self {
        Self {
            command,
            args,
            working_dir,
            max_processes,
            slots: Arc::new(Semaphore::new(max_processes.min(Semaphore::MAX_PERMITS))),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn spawn_child(&self) -> Result<(Child, ChildStdout), DispatchError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            DispatchError::Rejected(format!("failed to spawn {}: {e}", self.command))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Rejected("stdout not available".to_string()))?;
        Ok((child, stdout))
    }
}

#[async_trait]
impl TrainingExecutor for ProcessExecutor {
    async fn start(
        &self,
        descriptor: JobDescriptor,
        events: EventSink,
    ) -> Result<(), DispatchError> {
        let tag = descriptor.tag();
        let slot = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            DispatchError::Unavailable(format!(
                "all {} training slots are busy",
                self.max_processes
            ))
        })?;

        let payload = serde_json::to_vec(&descriptor)
            .map_err(|e| DispatchError::Rejected(format!("failed to encode descriptor: {e}")))?;
        let (mut child, stdout) = self.spawn_child()?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(&payload).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                let _ = child.kill().await;
                return Err(DispatchError::Rejected(format!(
                    "failed to hand descriptor to training process: {e}"
                )));
            }
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.insert(tag, kill_tx);
        info!("Spawned training process for {tag}");

        tokio::spawn(supervise(
            child,
            stdout,
            tag,
            events,
            kill_rx,
            Arc::clone(&self.running),
            slot,
        ));
        Ok(())
    }

    async fn stop(&self, tag: AttemptTag) -> Result<(), DispatchError> {
        match self.running.remove(&tag) {
            Some((_, kill)) => {
                let _ = kill.send(());
                Ok(())
            }
            None => Err(DispatchError::Rejected(format!(
                "no training process running for {tag}"
            ))),
        }
    }
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    tag: AttemptTag,
    events: EventSink,
    mut kill: oneshot::Receiver<()>,
    running: Arc<DashMap<AttemptTag, oneshot::Sender<()>>>,
    _slot: OwnedSemaphorePermit,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut reported_result = false;

    loop {
        tokio::select! {
            _ = &mut kill => {
                debug!("Stopping training process for {tag}");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill training process for {tag}: {e}");
                }
                events.send(tag, ExecutorEventKind::Cancelled).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<ExecutorEventKind>(&line) {
                    Ok(kind) => {
                        let terminal = kind.is_terminal();
                        events.send(tag, kind).await;
                        if terminal {
                            reported_result = true;
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed line from training process {tag}: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Lost stdout of training process {tag}: {e}");
                    break;
                }
            }
        }
    }

    running.remove(&tag);
    let status = child.wait().await;
    if !reported_result {
        let message = match status {
            Ok(status) => format!("training process exited without a result ({status})"),
            Err(e) => format!("training process could not be awaited: {e}"),
        };
        events
            .send(tag, ExecutorEventKind::Failed { message })
            .await;
    }
}
