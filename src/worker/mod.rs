//! Out-of-process worker.
//!
//! A worker registers with the daemon, polls for pending jobs, runs each one
//! as a child process and reports its lifecycle back:
//!
//! 1. [`Worker::run`] registers and enters the poll loop
//! 2. an acquired job is started by [`JobExecutor::spawn`] and reported `running`
//! 3. while the child runs, the daemon is cross-checked every liveness tick;
//!    a job that vanished from the daemon was cancelled and its process is killed
//! 4. the exit code is reported and the worker goes idle again
//!
//! A worker that stays idle past its timeout, or receives a shutdown signal
//! while idle, deregisters and returns.

pub mod executor;

pub use executor::{ExecutionResult, JobExecutor, RunningJob};

use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::client::DaemonClient;
use crate::config::WorkerConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::{Job, JobPatch, WorkerPatch, WorkerRecord, WorkerStatus};

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    IdleTimeout,
    Shutdown,
}

enum Verdict {
    Healthy,
    Cancelled,
    Fault(BatchError),
}

pub struct Worker {
    id: u32,
    config: WorkerConfig,
    client: DaemonClient,
    executor: JobExecutor,
    status: WorkerStatus,
    started_at: DateTime<Utc>,
    idle_since: Instant,
}

impl Worker {
    /// Connect to the daemon. The worker is identified by this process's pid.
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        let client = DaemonClient::connect(config.daemon_addr.clone()).await?;
        Ok(Self {
            id: std::process::id(),
            config,
            client,
            executor: JobExecutor::new(),
            status: WorkerStatus::Idle,
            started_at: Utc::now(),
            idle_since: Instant::now(),
        })
    }

    /// Override the identity reported to the daemon.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.status
    }

    /// Register, then poll and execute until idle for too long or `shutdown`
    /// fires. Always attempts to deregister on the way out.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<WorkerExit> {
        self.started_at = Utc::now();
        self.client
            .register_worker(&WorkerRecord::new(self.id, self.started_at))
            .await?;
        self.idle_since = Instant::now();
        tracing::info!(worker_id = self.id, daemon = %self.client.addr(), "Worker started");

        let outcome = self.poll_loop(&shutdown).await;

        match self.client.deregister_worker(self.id).await {
            Ok(()) => {}
            Err(BatchError::WorkerNotFound(_)) => {
                tracing::debug!(worker_id = self.id, "Worker already removed by the daemon")
            }
            Err(e) => tracing::warn!(worker_id = self.id, error = %e, "Failed to deregister"),
        }

        match &outcome {
            Ok(exit) => tracing::info!(worker_id = self.id, reason = ?exit, "Worker stopped"),
            Err(e) => tracing::error!(worker_id = self.id, error = %e, "Worker stopped on error"),
        }
        outcome
    }

    async fn poll_loop(&mut self, shutdown: &CancellationToken) -> Result<WorkerExit> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(WorkerExit::Shutdown);
            }

            let ran_job = match self.poll_once().await {
                Ok(ran) => ran,
                Err(e) if e.is_unreachable() => return Err(e),
                Err(e) => {
                    tracing::warn!(worker_id = self.id, error = %e, "Poll failed");
                    false
                }
            };
            if ran_job {
                continue;
            }

            let idle_for = self.idle_since.elapsed();
            if idle_for >= self.config.idle_timeout {
                tracing::info!(
                    worker_id = self.id,
                    idle_secs = idle_for.as_secs(),
                    "Idle timeout reached"
                );
                return Ok(WorkerExit::IdleTimeout);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.cancelled() => return Ok(WorkerExit::Shutdown),
            }
        }
    }

    /// One poll cycle. Returns whether a job was taken.
    async fn poll_once(&mut self) -> Result<bool> {
        let pending = self.client.num_pending_jobs().await?;
        if pending == 0 {
            tracing::debug!(worker_id = self.id, "No pending jobs");
            return Ok(false);
        }

        let job = match self.client.acquire_job().await {
            Ok(job) => job,
            // Another worker won the race.
            Err(BatchError::EmptyQueue) => return Ok(false),
            Err(e) => return Err(e),
        };

        let job_id = job.id;
        if let Err(e) = self.execute(job).await {
            if e.is_unreachable() {
                return Err(e);
            }
            tracing::error!(worker_id = self.id, job_id = %job_id, error = %e, "Job abandoned");
        }

        self.go_idle().await?;
        Ok(true)
    }

    async fn go_idle(&mut self) -> Result<()> {
        self.status = WorkerStatus::Idle;
        self.idle_since = Instant::now();
        self.report_worker(&WorkerPatch::idle(Utc::now())).await
    }

    /// Send a worker status update. A daemon that no longer knows this worker
    /// (swept or killed from the registry) gets it registered again.
    async fn report_worker(&mut self, patch: &WorkerPatch) -> Result<()> {
        match self.client.update_worker_status(self.id, patch).await {
            Err(BatchError::WorkerNotFound(_)) => {
                tracing::warn!(worker_id = self.id, "Daemon lost this worker, registering again");
                self.client
                    .register_worker(&WorkerRecord::new(self.id, self.started_at))
                    .await?;
                self.client.update_worker_status(self.id, patch).await
            }
            other => other,
        }
    }

    /// Record an acquired job as failed without running it.
    async fn fail_unstarted(&mut self, job: &Job) {
        match self
            .client
            .update_job_status(&job.id, &JobPatch::exited(None, Utc::now()))
            .await
        {
            Ok(()) | Err(BatchError::JobNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to report unstarted job")
            }
        }
    }

    /// Run an acquired job to completion. Every path either runs the job or
    /// reports it failed, so nothing is left `submitted`.
    async fn execute(&mut self, job: Job) -> Result<()> {
        self.status = WorkerStatus::Busy;
        if let Err(e) = self.report_worker(&WorkerPatch::busy(job.id)).await {
            tracing::error!(worker_id = self.id, job_id = %job.id, error = %e, "Failed to mark worker busy");
            self.fail_unstarted(&job).await;
            return Err(e);
        }

        let mut running = match self.executor.spawn(&job) {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to start job");
                self.fail_unstarted(&job).await;
                return Ok(());
            }
        };

        let report = JobPatch::running(running.pid(), std::process::id(), Utc::now());
        match self.client.update_job_status(&job.id, &report).await {
            Ok(()) => {}
            Err(BatchError::JobNotFound(_)) => {
                tracing::info!(job_id = %job.id, "Job cancelled before it started");
                running.kill(self.config.kill_grace).await?;
                return Ok(());
            }
            Err(e) => {
                running.kill(self.config.kill_grace).await?;
                self.fail_unstarted(&job).await;
                return Err(e);
            }
        }

        self.supervise(&job, &mut running).await
    }

    /// Wait for the child while cross-checking with the daemon on every
    /// liveness tick.
    async fn supervise(&mut self, job: &Job, running: &mut RunningJob) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                exit = running.wait() => {
                    let exit_code = exit?;
                    let patch = JobPatch::exited(exit_code, Utc::now());
                    tracing::info!(job_id = %job.id, exit_code = ?exit_code, status = ?patch.status, "Job exited");
                    return match self.client.update_job_status(&job.id, &patch).await {
                        // Cancelled just as it finished.
                        Err(BatchError::JobNotFound(_)) => Ok(()),
                        other => other,
                    };
                }
                _ = ticker.tick() => {}
            }

            match self.verify(job, running).await? {
                Verdict::Healthy => {}
                Verdict::Cancelled => {
                    tracing::info!(job_id = %job.id, pid = running.pid(), "Job cancelled, stopping process");
                    running.kill(self.config.kill_grace).await?;
                    return Ok(());
                }
                Verdict::Fault(fault) => {
                    tracing::error!(job_id = %job.id, error = %fault, "Process consistency fault");
                    running.kill(self.config.kill_grace).await?;
                    return Err(fault);
                }
            }
        }
    }

    async fn verify(&mut self, job: &Job, running: &mut RunningJob) -> Result<Verdict> {
        let reported = match self.client.job_pid(&job.id).await {
            Ok(pid) => pid,
            Err(BatchError::JobNotFound(_)) => return Ok(Verdict::Cancelled),
            Err(e) => return Err(e),
        };

        let local_pid = running.pid();
        let fault = || BatchError::ProcessConsistencyFault {
            job_id: job.id,
            local_pid,
            reported,
        };

        if reported != Some(local_pid) {
            // An exit between ticks is reaped by the next wait.
            if running.try_wait()?.is_some() {
                return Ok(Verdict::Healthy);
            }
            return Ok(Verdict::Fault(fault()));
        }

        let alive = match self.client.check_alive(&job.id).await {
            Ok(alive) => alive,
            Err(BatchError::JobNotFound(_)) => return Ok(Verdict::Cancelled),
            Err(e) => return Err(e),
        };
        if !alive && running.try_wait()?.is_none() {
            return Ok(Verdict::Fault(fault()));
        }
        Ok(Verdict::Healthy)
    }
}
