use std::path::Path;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::error::{BatchError, Result};
use crate::process;
use crate::scheduler::{
    Job, JobPatch, JobQueue, JobSpec, JobStatus, WorkerPatch, WorkerRecord, WorkerRegistry,
};
use crate::wire::ListQuery;

/// Everything the daemon owns. Guarded by a single lock so dispatch and
/// registry updates never interleave.
#[derive(Debug, Default)]
pub struct DaemonState {
    pub queue: JobQueue,
    pub workers: WorkerRegistry,
}

/// Snapshot returned by [`Daemon::cluster_status`].
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub workers: Vec<WorkerRecord>,
    pub pending_jobs: usize,
    pub running_jobs: usize,
}

/// The scheduler: single source of truth for jobs and workers.
pub struct Daemon {
    config: DaemonConfig,
    state: RwLock<DaemonState>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_shutdown(config, CancellationToken::new())
    }

    /// Build a daemon whose `shutdown` operation cancels `token`.
    pub fn with_shutdown(config: DaemonConfig, token: CancellationToken) -> Self {
        Self {
            config,
            state: RwLock::new(DaemonState::default()),
            shutdown: token,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create a pending job from `spec` and queue it.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        let job = Job::from_spec(spec, &self.config.output_dir);
        let job_id = job.id;
        let priority = job.priority;
        let name = job.name.clone();

        self.state.write().await.queue.enqueue(job)?;
        tracing::info!(job_id = %job_id, name = %name, priority, "Job submitted");
        Ok(job_id)
    }

    /// Hand the best pending job to exactly one caller.
    pub async fn acquire_job(&self) -> Result<Job> {
        let job = self.state.write().await.queue.dequeue_highest_priority()?;
        tracing::info!(job_id = %job.id, priority = job.priority, "Job acquired");
        Ok(job)
    }

    pub async fn update_job_status(&self, job_id: &Uuid, patch: JobPatch) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .queue
            .get_job_mut(job_id)
            .ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))?;
        let previous = job.status;
        job.apply(&patch)?;

        if job.status != previous {
            tracing::info!(
                job_id = %job_id,
                from = %previous,
                to = %job.status,
                exit_code = ?job.exit_code,
                "Job status changed"
            );
        }
        Ok(())
    }

    pub async fn register_worker(&self, record: WorkerRecord) {
        self.state.write().await.workers.register(record);
    }

    pub async fn deregister_worker(&self, worker_id: u32) -> Result<()> {
        self.state.write().await.workers.deregister(worker_id)?;
        Ok(())
    }

    pub async fn update_worker_status(&self, worker_id: u32, patch: WorkerPatch) -> Result<()> {
        self.state.write().await.workers.apply(worker_id, &patch)?;
        tracing::debug!(worker_id, ?patch, "Worker status updated");
        Ok(())
    }

    /// Forget a worker and send it a termination signal.
    pub async fn kill_worker(&self, worker_id: u32) -> Result<()> {
        self.state.write().await.workers.deregister(worker_id)?;
        process::terminate(worker_id)?;
        tracing::info!(worker_id, "Sent SIGTERM to worker");
        Ok(())
    }

    /// Remove a job. A running job's process group is signalled first;
    /// signalling is best effort and never blocks removal.
    pub async fn cancel(&self, job_id: &Uuid) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .queue
            .get_job(job_id)
            .ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))?;

        if job.status == JobStatus::Running {
            let worker_id = state.workers.worker_for_job(job_id).map(|w| w.id);
            match job.kill() {
                Ok(()) => {
                    tracing::info!(job_id = %job_id, pid = ?job.pid, worker_id = ?worker_id, "Sent SIGTERM to job")
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, worker_id = ?worker_id, error = %e, "Could not signal job")
                }
            }
        }

        let removed = state.queue.remove(job_id)?;
        tracing::info!(job_id = %job_id, status = %removed.status, "Job cancelled");
        Ok(removed)
    }

    /// Copies of the jobs matching `query`. With `mine` set the owner filter
    /// becomes the caller's user name.
    pub async fn list_jobs(&self, user_name: &str, query: ListQuery) -> Vec<Job> {
        let mut filter = query.filter;
        if query.mine {
            filter.owner = Some(user_name.to_string());
        }
        self.state.read().await.queue.filtered_view(&filter)
    }

    /// Drop workers whose process is gone, then report what remains.
    pub async fn cluster_status(&self) -> ClusterStatus {
        let mut state = self.state.write().await;
        let removed = state.workers.sweep_dead(process::pid_exists);
        if !removed.is_empty() {
            tracing::info!(removed = ?removed, "Swept dead workers");
        }
        ClusterStatus {
            workers: state.workers.all_workers().into_iter().cloned().collect(),
            pending_jobs: state.queue.num_pending(),
            running_jobs: state.queue.num_running(),
        }
    }

    pub async fn check_alive(&self, job_id: &Uuid) -> Result<bool> {
        let job = self.get_job(job_id).await?;
        Ok(job.check_alive())
    }

    pub async fn job_pid(&self, job_id: &Uuid) -> Result<Option<u32>> {
        Ok(self.get_job(job_id).await?.pid)
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        self.state
            .read()
            .await
            .queue
            .get_job(job_id)
            .cloned()
            .ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))
    }

    pub async fn num_pending_jobs(&self) -> usize {
        self.state.read().await.queue.num_pending()
    }

    pub async fn num_running_jobs(&self) -> usize {
        self.state.read().await.queue.num_running()
    }

    /// Stop serving. Refused while work remains unless `force` is set.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        let (pending, running) = {
            let state = self.state.read().await;
            (state.queue.num_pending(), state.queue.num_running())
        };
        if !force && (pending > 0 || running > 0) {
            return Err(BatchError::ShutdownRefused { pending, running });
        }
        tracing::info!(force, pending, running, "Daemon shutdown requested");
        self.shutdown.cancel();
        Ok(())
    }
}
