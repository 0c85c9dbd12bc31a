//! Typed client for the daemon's RPC surface.

use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::proto::daemon_service_client::DaemonServiceClient;
use crate::proto::{
    AcquireJobRequest, CancelJobRequest, CheckAliveRequest, DeregisterWorkerRequest,
    GetClusterStatusRequest, GetJobPidRequest, GetNumPendingJobsRequest, GetNumRunningJobsRequest,
    KillWorkerRequest, ShutdownRequest, UpdateJobStatusRequest, UpdateWorkerStatusRequest,
};
use crate::scheduler::{Job, JobPatch, JobSpec, JobStatus, WorkerPatch, WorkerRecord};
use crate::wire::{self, JobSummary, ListQuery, WorkerSummary};

/// Cluster snapshot as seen by a client.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub workers: Vec<WorkerSummary>,
    pub pending_jobs: u32,
    pub running_jobs: u32,
}

/// Cheap to clone; clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    inner: DaemonServiceClient<Channel>,
    addr: String,
}

fn map_status(status: Status) -> BatchError {
    BatchError::from_status(status)
}

impl DaemonClient {
    /// Connect to a daemon at `addr` (`http://host:port` or bare `host:port`).
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let mut addr = addr.into();
        if !addr.starts_with("http://") && !addr.starts_with("https://") {
            addr = format!("http://{}", addr);
        }
        let endpoint = Endpoint::from_shared(addr.clone())
            .map_err(|e| BatchError::InvalidArgument(format!("invalid address {}: {}", addr, e)))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|_| BatchError::DaemonUnreachable(addr.clone()))?;
        Ok(Self {
            inner: DaemonServiceClient::new(channel),
            addr,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn submit(&mut self, spec: &JobSpec) -> Result<Uuid> {
        let resp = self
            .inner
            .submit_job(wire::spec_to_proto(spec))
            .await
            .map_err(map_status)?
            .into_inner();
        wire::parse_job_id(&resp.job_id)
    }

    pub async fn acquire_job(&mut self) -> Result<Job> {
        let resp = self
            .inner
            .acquire_job(AcquireJobRequest {})
            .await
            .map_err(map_status)?
            .into_inner();
        wire::decode_job(&resp.job)
    }

    pub async fn update_job_status(&mut self, job_id: &Uuid, patch: &JobPatch) -> Result<()> {
        self.inner
            .update_job_status(UpdateJobStatusRequest {
                job_id: job_id.to_string(),
                patch: Some(wire::job_patch_to_proto(patch)),
            })
            .await
            .map_err(map_status)?;
        Ok(())
    }

    /// Cancel a job, returning the status it had when removed.
    pub async fn cancel(&mut self, job_id: &Uuid) -> Result<JobStatus> {
        let resp = self
            .inner
            .cancel_job(CancelJobRequest {
                job_id: job_id.to_string(),
            })
            .await
            .map_err(map_status)?
            .into_inner();
        resp.previous_status.parse()
    }

    pub async fn register_worker(&mut self, record: &WorkerRecord) -> Result<()> {
        self.inner
            .register_worker(wire::register_to_proto(record))
            .await
            .map_err(map_status)?;
        Ok(())
    }

    pub async fn deregister_worker(&mut self, worker_id: u32) -> Result<()> {
        self.inner
            .deregister_worker(DeregisterWorkerRequest { worker_id })
            .await
            .map_err(map_status)?;
        Ok(())
    }

    pub async fn update_worker_status(&mut self, worker_id: u32, patch: &WorkerPatch) -> Result<()> {
        self.inner
            .update_worker_status(UpdateWorkerStatusRequest {
                worker_id,
                patch: Some(wire::worker_patch_to_proto(patch)),
            })
            .await
            .map_err(map_status)?;
        Ok(())
    }

    pub async fn kill_worker(&mut self, worker_id: u32) -> Result<()> {
        self.inner
            .kill_worker(KillWorkerRequest { worker_id })
            .await
            .map_err(map_status)?;
        Ok(())
    }

    pub async fn list_jobs(&mut self, user_name: &str, query: &ListQuery) -> Result<Vec<JobSummary>> {
        let resp = self
            .inner
            .list_jobs(wire::query_to_proto(user_name, query))
            .await
            .map_err(map_status)?
            .into_inner();
        resp.jobs.into_iter().map(wire::job_from_info).collect()
    }

    pub async fn cluster_status(&mut self) -> Result<ClusterSnapshot> {
        let resp = self
            .inner
            .get_cluster_status(GetClusterStatusRequest {})
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(ClusterSnapshot {
            workers: resp
                .workers
                .into_iter()
                .map(wire::worker_from_proto)
                .collect::<Result<_>>()?,
            pending_jobs: resp.pending_jobs,
            running_jobs: resp.running_jobs,
        })
    }

    pub async fn check_alive(&mut self, job_id: &Uuid) -> Result<bool> {
        let resp = self
            .inner
            .check_alive(CheckAliveRequest {
                job_id: job_id.to_string(),
            })
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(resp.alive)
    }

    pub async fn job_pid(&mut self, job_id: &Uuid) -> Result<Option<u32>> {
        let resp = self
            .inner
            .get_job_pid(GetJobPidRequest {
                job_id: job_id.to_string(),
            })
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(resp.pid)
    }

    pub async fn num_pending_jobs(&mut self) -> Result<u32> {
        let resp = self
            .inner
            .get_num_pending_jobs(GetNumPendingJobsRequest {})
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(resp.count)
    }

    pub async fn num_running_jobs(&mut self) -> Result<u32> {
        let resp = self
            .inner
            .get_num_running_jobs(GetNumRunningJobsRequest {})
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(resp.count)
    }

    pub async fn shutdown(&mut self, force: bool) -> Result<()> {
        self.inner
            .shutdown(ShutdownRequest { force })
            .await
            .map_err(map_status)?;
        Ok(())
    }
}
