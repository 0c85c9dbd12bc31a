use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::daemon::Daemon;
use crate::proto::daemon_service_server::DaemonService;
use crate::proto::{
    AcquireJobRequest, AcquireJobResponse, CancelJobRequest, CancelJobResponse, CheckAliveRequest,
    CheckAliveResponse, DeregisterWorkerRequest, DeregisterWorkerResponse, GetClusterStatusRequest,
    GetClusterStatusResponse, GetJobPidRequest, GetJobPidResponse, GetNumPendingJobsRequest,
    GetNumRunningJobsRequest, JobCountResponse, KillWorkerRequest, KillWorkerResponse,
    ListJobsRequest, ListJobsResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    ShutdownRequest, ShutdownResponse, SubmitJobRequest, SubmitJobResponse,
    UpdateJobStatusRequest, UpdateJobStatusResponse, UpdateWorkerStatusRequest,
    UpdateWorkerStatusResponse,
};
use crate::wire;

/// gRPC front of the [`Daemon`]. Every handler decodes, delegates and
/// encodes; domain errors become statuses on the way out.
pub struct BatchService {
    daemon: Arc<Daemon>,
}

impl BatchService {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn count(n: usize) -> Response<JobCountResponse> {
    Response::new(JobCountResponse {
        count: saturating_u32(n),
    })
}

#[tonic::async_trait]
impl DaemonService for BatchService {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let spec = wire::spec_from_proto(request.into_inner())?;
        let job_id = self.daemon.submit(spec).await?;
        Ok(Response::new(SubmitJobResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn acquire_job(
        &self,
        _request: Request<AcquireJobRequest>,
    ) -> Result<Response<AcquireJobResponse>, Status> {
        let job = self.daemon.acquire_job().await?;
        Ok(Response::new(AcquireJobResponse {
            job: wire::encode_job(&job)?,
        }))
    }

    async fn update_job_status(
        &self,
        request: Request<UpdateJobStatusRequest>,
    ) -> Result<Response<UpdateJobStatusResponse>, Status> {
        let req = request.into_inner();
        let job_id = wire::parse_job_id(&req.job_id)?;
        let patch = wire::job_patch_from_proto(req.patch.unwrap_or_default())?;
        self.daemon.update_job_status(&job_id, patch).await?;
        Ok(Response::new(UpdateJobStatusResponse {}))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let job_id = wire::parse_job_id(&request.into_inner().job_id)?;
        let removed = self.daemon.cancel(&job_id).await?;
        Ok(Response::new(CancelJobResponse {
            previous_status: removed.status.to_string(),
        }))
    }

    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let record = wire::register_from_proto(request.into_inner())?;
        self.daemon.register_worker(record).await;
        Ok(Response::new(RegisterWorkerResponse {}))
    }

    async fn deregister_worker(
        &self,
        request: Request<DeregisterWorkerRequest>,
    ) -> Result<Response<DeregisterWorkerResponse>, Status> {
        self.daemon
            .deregister_worker(request.into_inner().worker_id)
            .await?;
        Ok(Response::new(DeregisterWorkerResponse {}))
    }

    async fn update_worker_status(
        &self,
        request: Request<UpdateWorkerStatusRequest>,
    ) -> Result<Response<UpdateWorkerStatusResponse>, Status> {
        let req = request.into_inner();
        let patch = wire::worker_patch_from_proto(req.patch.unwrap_or_default())?;
        self.daemon.update_worker_status(req.worker_id, patch).await?;
        Ok(Response::new(UpdateWorkerStatusResponse {}))
    }

    async fn kill_worker(
        &self,
        request: Request<KillWorkerRequest>,
    ) -> Result<Response<KillWorkerResponse>, Status> {
        self.daemon.kill_worker(request.into_inner().worker_id).await?;
        Ok(Response::new(KillWorkerResponse {}))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let req = request.into_inner();
        let query = wire::query_from_proto(req.filter)?;
        let jobs = self.daemon.list_jobs(&req.user_name, query).await;
        Ok(Response::new(ListJobsResponse {
            jobs: jobs.iter().map(wire::job_to_info).collect(),
        }))
    }

    async fn get_cluster_status(
        &self,
        _request: Request<GetClusterStatusRequest>,
    ) -> Result<Response<GetClusterStatusResponse>, Status> {
        let status = self.daemon.cluster_status().await;
        Ok(Response::new(GetClusterStatusResponse {
            workers: status.workers.iter().map(wire::worker_to_proto).collect(),
            pending_jobs: saturating_u32(status.pending_jobs),
            running_jobs: saturating_u32(status.running_jobs),
        }))
    }

    async fn check_alive(
        &self,
        request: Request<CheckAliveRequest>,
    ) -> Result<Response<CheckAliveResponse>, Status> {
        let job_id = wire::parse_job_id(&request.into_inner().job_id)?;
        let alive = self.daemon.check_alive(&job_id).await?;
        Ok(Response::new(CheckAliveResponse { alive }))
    }

    async fn get_job_pid(
        &self,
        request: Request<GetJobPidRequest>,
    ) -> Result<Response<GetJobPidResponse>, Status> {
        let job_id = wire::parse_job_id(&request.into_inner().job_id)?;
        let pid = self.daemon.job_pid(&job_id).await?;
        Ok(Response::new(GetJobPidResponse { pid }))
    }

    async fn get_num_pending_jobs(
        &self,
        _request: Request<GetNumPendingJobsRequest>,
    ) -> Result<Response<JobCountResponse>, Status> {
        Ok(count(self.daemon.num_pending_jobs().await))
    }

    async fn get_num_running_jobs(
        &self,
        _request: Request<GetNumRunningJobsRequest>,
    ) -> Result<Response<JobCountResponse>, Status> {
        Ok(count(self.daemon.num_running_jobs().await))
    }

    async fn shutdown(
        &self,
        request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        self.daemon.shutdown(request.into_inner().force).await?;
        Ok(Response::new(ShutdownResponse {}))
    }
}
