use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::Job;
use crate::error::EngineError;
use crate::protocol::*;

const EXIT_GRACE: Duration = Duration::from_millis(500);

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invoke the running executable with `args`.
    pub fn current_exe(args: Vec<String>) -> Result<Self, EngineError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, args))
    }
}

/// A live worker child process speaking JSON-RPC over its stdio.
///
/// Every call takes `&mut self`, so a worker can only ever have one request
/// in flight.
pub struct WorkerProcess {
    slot: usize,
    pid: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl WorkerProcess {
    /// Spawn a worker and wait until it reports that its model is loaded.
    pub async fn spawn(slot: usize, command: &WorkerCommand, start_timeout: Duration) -> Result<Self, EngineError> {
        tracing::info!(slot, program = %command.program.display(), "Spawning worker");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::WorkerSpawn(format!("{}: {}", command.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::WorkerSpawn("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::WorkerSpawn("worker stdout unavailable".into()))?;

        let mut worker = Self {
            slot,
            pid: child.id().unwrap_or_default(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        };

        match tokio::time::timeout(start_timeout, worker.await_ready()).await {
            Ok(Ok(ready)) => {
                worker.pid = ready.pid;
                tracing::info!(slot, pid = ready.pid, backend = %ready.backend, "Worker ready");
                Ok(worker)
            }
            Ok(Err(e)) => {
                worker.kill().await;
                Err(EngineError::WorkerSpawn(e.to_string()))
            }
            Err(_) => {
                worker.kill().await;
                Err(EngineError::WorkerSpawn(format!(
                    "worker {slot} not ready after {} s",
                    start_timeout.as_secs()
                )))
            }
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn await_ready(&mut self) -> Result<WorkerReady, EngineError> {
        loop {
            let msg = self.read_message().await?;
            if msg.method.as_deref() != Some(NOTIFY_READY) {
                tracing::debug!(slot = self.slot, "Ignoring message received before ready");
                continue;
            }
            let params = msg
                .params
                .ok_or_else(|| EngineError::Protocol("ready notification without params".into()))?;
            return Ok(serde_json::from_value(params)?);
        }
    }

    /// Execute one job on this worker and wait for its result.
    pub async fn call(&mut self, job: &Job) -> Result<GenerateOutput, EngineError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = match job {
            Job::Generate { prompt } => serde_json::to_string(&JsonRpcRequest::new(
                id,
                METHOD_GENERATE,
                GenerateParams {
                    prompt: prompt.clone(),
                },
            ))?,
        };
        line.push('\n');

        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            return Err(self.died(format!("write failed: {e}")).await);
        }
        if let Err(e) = self.stdin.flush().await {
            return Err(self.died(format!("flush failed: {e}")).await);
        }

        loop {
            let msg = self.read_message().await?;
            match msg.id {
                Some(resp_id) if resp_id == id => {}
                Some(other) => {
                    tracing::warn!(slot = self.slot, expected = id, got = other, "Discarding stale response");
                    continue;
                }
                None => continue,
            }

            if let Some(error) = msg.error {
                return Err(match error.code {
                    INFERENCE_ERROR => EngineError::Inference(error.message),
                    code => EngineError::Protocol(format!("worker error {code}: {}", error.message)),
                });
            }
            let result = msg
                .result
                .ok_or_else(|| EngineError::Protocol("response without result".into()))?;
            return serde_json::from_value(result)
                .map_err(|e| EngineError::Protocol(format!("malformed generate result: {e}")));
        }
    }

    async fn read_message(&mut self) -> Result<WorkerMessage, EngineError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = match self.stdout.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => return Err(self.died(format!("read failed: {e}")).await),
            };
            if read == 0 {
                return Err(self.died("output closed".to_string()).await);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerMessage>(trimmed) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    tracing::warn!(slot = self.slot, "Ignoring non-protocol output from worker: {}", e);
                }
            }
        }
    }

    /// Closed pipes usually precede the exit by a moment, so give the child
    /// a short grace period to be reaped before reporting its status.
    async fn died(&mut self, detail: String) -> EngineError {
        let status = match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("exit status unknown: {e}"),
            Err(_) => "still running".to_string(),
        };
        EngineError::WorkerDied {
            slot: self.slot,
            detail: format!("{detail} ({status})"),
        }
    }

    /// Kill the process immediately.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(slot = self.slot, "Kill failed (already exited?): {}", e);
        }
    }

    /// Close the worker's input so it exits on its own; kill it if it
    /// lingers.
    pub async fn terminate(self) {
        let Self {
            slot,
            mut child,
            stdin,
            ..
        } = self;
        drop(stdin);
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(slot, %status, "Worker exited"),
            Ok(Err(e)) => tracing::warn!(slot, "Failed to reap worker: {}", e),
            Err(_) => {
                tracing::warn!(slot, "Worker did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }
}
