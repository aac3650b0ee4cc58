//! Fixed-size pool of worker processes.
//!
//! Jobs go into one FIFO queue. Each slot is a task that owns exactly one
//! worker process and pulls the next job whenever its worker is idle, so a
//! worker never runs two jobs at once while separate workers run in parallel.

pub mod process;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use self::process::{WorkerCommand, WorkerProcess};
use crate::error::EngineError;
use crate::protocol::GenerateOutput;

pub type JobOutput = GenerateOutput;

// ── Jobs ──────────────────────────────────────────────────────────────────

/// Description of work that has not run yet. Only a worker process executes
/// it; building or submitting a `Job` never touches the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Generate { prompt: String },
}

impl Job {
    pub fn generate(prompt: impl Into<String>) -> Self {
        Self::Generate {
            prompt: prompt.into(),
        }
    }
}

/// Result of a submitted job. Dropping it cancels the job: a queued job is
/// skipped, an in-flight one finishes and its result is discarded.
pub struct PendingCall {
    id: Uuid,
    rx: oneshot::Receiver<Result<JobOutput, EngineError>>,
}

impl PendingCall {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingCall {
    type Output = Result<JobOutput, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(EngineError::PoolClosed)))
    }
}

struct Envelope {
    id: Uuid,
    job: Job,
    reply: oneshot::Sender<Result<JobOutput, EngineError>>,
    enqueued_at: Instant,
}

// ── Configuration ─────────────────────────────────────────────────────────

/// What happens to a slot after its worker process dies or times out.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Start a fresh worker (and model) in the same slot.
    #[default]
    Respawn,
    /// Retire the slot; the remaining slots keep serving.
    MarkDead,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub command: WorkerCommand,
    pub restart: RestartPolicy,
    /// `None` lets a call run forever.
    pub job_timeout: Option<Duration>,
    pub start_timeout: Duration,
}

impl PoolConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            size: 1,
            command,
            restart: RestartPolicy::Respawn,
            job_timeout: None,
            start_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub live_workers: usize,
    pub restarts: u64,
    pub completed: u64,
}

// ── Pool ──────────────────────────────────────────────────────────────────

struct Shared {
    config: PoolConfig,
    queue: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    live: AtomicUsize,
    restarts: AtomicU64,
    completed: AtomicU64,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
    slots: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn every worker and wait for all of them to load their model.
    pub async fn start(config: PoolConfig) -> Result<Self, EngineError> {
        if config.size == 0 {
            return Err(EngineError::WorkerSpawn("pool size must be at least 1".into()));
        }

        let spawns = (0..config.size)
            .map(|slot| WorkerProcess::spawn(slot, &config.command, config.start_timeout));
        let mut workers = Vec::with_capacity(config.size);
        for spawned in futures::future::join_all(spawns).await {
            workers.push(spawned?);
        }

        match config.job_timeout {
            Some(limit) => tracing::info!(timeout_s = limit.as_secs(), "Per-call timeout enabled"),
            None => tracing::warn!("No per-call timeout: a stuck inference call occupies its worker indefinitely"),
        }
        tracing::info!(workers = config.size, restart = ?config.restart, "Worker pool started");

        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            live: AtomicUsize::new(config.size),
            config,
            queue: Mutex::new(receiver),
            restarts: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let slots = workers
            .into_iter()
            .map(|worker| tokio::spawn(run_slot(worker, shared.clone())))
            .collect();

        Ok(Self {
            sender,
            shared,
            slots: Mutex::new(slots),
        })
    }

    /// Queue a job. Returns at once; the job runs when a worker is free.
    pub fn submit(&self, job: Job) -> Result<PendingCall, EngineError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(EngineError::PoolClosed);
        }
        if self.shared.live.load(Ordering::SeqCst) == 0 {
            return Err(EngineError::NoWorkers);
        }

        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            id,
            job,
            reply,
            enqueued_at: Instant::now(),
        };
        self.sender.send(envelope).map_err(|_| self.closed_error())?;
        tracing::debug!(job = %id, "Job queued");

        Ok(PendingCall { id, rx })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.shared.config.size,
            live_workers: self.shared.live.load(Ordering::SeqCst),
            restarts: self.shared.restarts.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
        }
    }

    /// Stop all workers. Queued calls fail with `PoolClosed`.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let slots = std::mem::take(&mut *self.slots.lock().await);
        for handle in slots {
            if let Err(e) = handle.await {
                tracing::error!("Worker slot task failed: {}", e);
            }
        }
        tracing::info!("Worker pool shut down");
    }

    fn closed_error(&self) -> EngineError {
        if self.shared.shutdown.is_cancelled() {
            EngineError::PoolClosed
        } else {
            EngineError::NoWorkers
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

// ── Slot task ─────────────────────────────────────────────────────────────

async fn next_envelope(shared: &Shared) -> Option<Envelope> {
    tokio::select! {
        biased;
        _ = shared.shutdown.cancelled() => None,
        envelope = async { shared.queue.lock().await.recv().await } => envelope,
    }
}

async fn execute(worker: &mut WorkerProcess, job: &Job, shared: &Shared) -> Result<JobOutput, EngineError> {
    let slot = worker.slot();
    let started = Instant::now();
    let call = async {
        match shared.config.job_timeout {
            Some(limit) => tokio::time::timeout(limit, worker.call(job))
                .await
                .unwrap_or_else(|_| {
                    Err(EngineError::WorkerTimeout {
                        slot,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }),
            None => worker.call(job).await,
        }
    };
    tokio::select! {
        biased;
        _ = shared.shutdown.cancelled() => Err(EngineError::PoolClosed),
        outcome = call => outcome,
    }
}

async fn run_slot(mut worker: WorkerProcess, shared: Arc<Shared>) {
    let slot = worker.slot();

    while let Some(envelope) = next_envelope(&shared).await {
        if envelope.reply.is_closed() {
            tracing::debug!(slot, job = %envelope.id, "Skipping cancelled job");
            continue;
        }

        tracing::debug!(
            slot,
            job = %envelope.id,
            waited_ms = envelope.enqueued_at.elapsed().as_millis() as u64,
            "Job started"
        );
        let outcome = execute(&mut worker, &envelope.job, &shared).await;

        let worker_lost = outcome.as_ref().err().is_some_and(EngineError::is_worker_fatal);
        match &outcome {
            Ok(_) => {
                shared.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => tracing::warn!(slot, job = %envelope.id, code = e.code(), "Job failed: {}", e),
        }
        if envelope.reply.send(outcome).is_err() {
            tracing::debug!(slot, job = %envelope.id, "Caller went away, result discarded");
        }

        if shared.shutdown.is_cancelled() {
            break;
        }
        if !worker_lost {
            continue;
        }

        worker.kill().await;
        if shared.config.restart == RestartPolicy::MarkDead {
            tracing::error!(slot, "Worker lost, slot marked dead");
            break;
        }
        // Dropping an unfinished spawn kills the half-started child.
        let respawned = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            respawned = WorkerProcess::spawn(slot, &shared.config.command, shared.config.start_timeout) => respawned,
        };
        match respawned {
            Ok(fresh) => {
                shared.restarts.fetch_add(1, Ordering::SeqCst);
                tracing::info!(slot, pid = fresh.pid(), "Worker respawned");
                worker = fresh;
            }
            Err(e) => {
                tracing::error!(slot, "Respawn failed, slot marked dead: {}", e);
                break;
            }
        }
    }

    worker.terminate().await;
    retire_slot(&shared).await;
}

/// The last slot to exit closes the queue and fails whatever is still in it.
async fn retire_slot(shared: &Shared) {
    if shared.live.fetch_sub(1, Ordering::SeqCst) != 1 {
        return;
    }

    let mut queue = shared.queue.lock().await;
    queue.close();
    let mut failed = 0usize;
    while let Ok(envelope) = queue.try_recv() {
        let err = if shared.shutdown.is_cancelled() {
            EngineError::PoolClosed
        } else {
            EngineError::NoWorkers
        };
        let _ = envelope.reply.send(Err(err));
        failed += 1;
    }
    if failed > 0 {
        tracing::warn!(failed, "Failed queued jobs, no workers left");
    }
}
