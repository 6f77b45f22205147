//! Dispatch of commit jobs to workers
//!
//! Dispatch is at-least-once: a job id may be delivered more than once
//! (re-enqueued after a restart, or by a client retrying). Duplicate
//! executions are prevented by the runner's `queued → running` claim, not
//! by the queue. A caller that has already won the claim hands the job over
//! with `dispatch_claimed`, and the worker executes it without claiming again.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::models::IngestJob;
use crate::services::job_runner::{JobRunner, StartOutcome};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand a job to a worker; the worker claims it before running
    async fn enqueue(&self, job_id: Uuid) -> Result<()>;

    /// Hand over a job the caller already moved to `running`
    async fn dispatch_claimed(&self, job: IngestJob) -> Result<()>;
}

#[derive(Debug)]
enum Task {
    Claim(Uuid),
    Claimed(IngestJob),
}

/// Fixed pool of tokio workers fed by an mpsc channel
pub struct WorkerQueue {
    tx: mpsc::UnboundedSender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerQueue {
    /// Spawn `worker_count` workers; they exit when `shutdown` is cancelled
    pub fn start(runner: Arc<JobRunner>, worker_count: usize, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let runner = runner.clone();
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "Commit worker started");
                    loop {
                        let next = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = shutdown.cancelled() => None,
                                task = rx.recv() => task,
                            }
                        };
                        match next {
                            Some(Task::Claim(job_id)) => dispatch(&runner, worker, job_id).await,
                            Some(Task::Claimed(job)) => execute(&runner, worker, job).await,
                            None => break,
                        }
                    }
                    debug!(worker, "Commit worker stopped");
                })
            })
            .collect();

        info!(workers = worker_count.max(1), "Commit worker pool started");
        Self { tx, workers }
    }

    /// Wait for all workers to exit (after shutdown is cancelled)
    pub async fn join(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl TaskQueue for WorkerQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        self.send(Task::Claim(job_id))?;
        debug!(job_id = %job_id, "Job enqueued");
        Ok(())
    }

    async fn dispatch_claimed(&self, job: IngestJob) -> Result<()> {
        let job_id = job.id;
        self.send(Task::Claimed(job))?;
        debug!(job_id = %job_id, "Claimed job handed to worker pool");
        Ok(())
    }
}

impl WorkerQueue {
    fn send(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| IngestError::Fatal("commit worker pool has shut down".to_string()))
    }
}

/// Runs each job to completion inside `enqueue` (CLI, tests)
pub struct InlineQueue {
    runner: Arc<JobRunner>,
}

impl InlineQueue {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskQueue for InlineQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        dispatch(&self.runner, 0, job_id).await;
        Ok(())
    }

    async fn dispatch_claimed(&self, job: IngestJob) -> Result<()> {
        execute(&self.runner, 0, job).await;
        Ok(())
    }
}

async fn dispatch(runner: &JobRunner, worker: usize, job_id: Uuid) {
    match runner.run(job_id).await {
        Ok(StartOutcome::Finished(job)) => {
            debug!(worker, job_id = %job_id, outcome = job.outcome(), "Dispatched job finished");
        }
        Ok(StartOutcome::AlreadyRunning) => {
            debug!(worker, job_id = %job_id, "Duplicate delivery ignored: job already running");
        }
        Err(IngestError::Precondition(reason)) => {
            debug!(worker, job_id = %job_id, reason = %reason, "Duplicate delivery ignored");
        }
        Err(e) => {
            warn!(worker, job_id = %job_id, error = %e, "Dispatched job failed to run");
        }
    }
}

async fn execute(runner: &JobRunner, worker: usize, job: IngestJob) {
    let job_id = job.id;
    match runner.execute_claimed(job).await {
        Ok(job) => {
            debug!(worker, job_id = %job_id, outcome = job.outcome(), "Claimed job finished");
        }
        Err(e) => {
            warn!(worker, job_id = %job_id, error = %e, "Claimed job failed to run");
        }
    }
}
