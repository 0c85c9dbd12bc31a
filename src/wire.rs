//! Conversions between domain types and the protobuf messages.
//!
//! Jobs cross the transport as a JSON document tagged by `type`, encoded just
//! before sending and decoded right after receipt. Timestamps inside patches
//! and worker records travel as `YYYYMMDDTHH:MM:SS` strings in UTC.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::proto;
use crate::scheduler::{
    Job, JobFilter, JobPatch, JobSpec, JobStatus, WorkerPatch, WorkerRecord, WorkerStatus,
};

/// Fixed transport format for timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H:%M:%S";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| BatchError::InvalidArgument(format!("invalid timestamp '{}': {}", raw, e)))
}

fn parse_optional_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}

pub fn parse_job_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| BatchError::InvalidArgument(format!("invalid job ID '{}'", raw)))
}

pub fn encode_job(job: &Job) -> Result<String> {
    Ok(serde_json::to_string(job)?)
}

pub fn decode_job(blob: &str) -> Result<Job> {
    Ok(serde_json::from_str(blob)?)
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

pub fn spec_to_proto(spec: &JobSpec) -> proto::SubmitJobRequest {
    proto::SubmitJobRequest {
        command: spec.command.clone(),
        metadata: Some(proto::SubmitMetadata {
            owner: spec.owner.clone(),
            name: spec.name.clone(),
            priority: spec.priority,
            output_dir: spec
                .output_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            submitted_at: Some(format_timestamp(
                &spec.created_at.unwrap_or_else(Utc::now),
            )),
        }),
    }
}

pub fn spec_from_proto(req: proto::SubmitJobRequest) -> Result<JobSpec> {
    let metadata = req.metadata.unwrap_or_default();
    Ok(JobSpec {
        command: req.command,
        name: metadata.name,
        owner: metadata.owner,
        priority: metadata.priority,
        output_dir: metadata.output_dir.map(PathBuf::from),
        created_at: parse_optional_timestamp(metadata.submitted_at.as_deref())?,
    })
}

// ---------------------------------------------------------------------------
// Job patches
// ---------------------------------------------------------------------------

pub fn job_patch_to_proto(patch: &JobPatch) -> proto::JobPatch {
    proto::JobPatch {
        status: patch.status.map(|s| s.to_string()),
        pid: patch.pid,
        parent_pid: patch.parent_pid,
        start_time: patch.start_time.as_ref().map(format_timestamp),
        end_time: patch.end_time.as_ref().map(format_timestamp),
        exit_code: patch.exit_code,
    }
}

pub fn job_patch_from_proto(patch: proto::JobPatch) -> Result<JobPatch> {
    Ok(JobPatch {
        status: patch.status.as_deref().map(str::parse).transpose()?,
        pid: patch.pid,
        parent_pid: patch.parent_pid,
        start_time: parse_optional_timestamp(patch.start_time.as_deref())?,
        end_time: parse_optional_timestamp(patch.end_time.as_deref())?,
        exit_code: patch.exit_code,
    })
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

pub fn worker_patch_to_proto(patch: &WorkerPatch) -> proto::WorkerPatch {
    proto::WorkerPatch {
        status: patch.status.as_ref().map(|s| s.to_string()),
        current_job_id: patch
            .current_job_id
            .map(|current| current.map(|id| id.to_string()).unwrap_or_default()),
        idle_since: patch.idle_since.as_ref().map(format_timestamp),
    }
}

pub fn worker_patch_from_proto(patch: proto::WorkerPatch) -> Result<WorkerPatch> {
    let current_job_id = match patch.current_job_id.as_deref() {
        None => None,
        Some("") => Some(None),
        Some(raw) => Some(Some(parse_job_id(raw)?)),
    };
    Ok(WorkerPatch {
        status: patch.status.as_deref().map(parse_worker_status),
        current_job_id,
        idle_since: parse_optional_timestamp(patch.idle_since.as_deref())?,
    })
}

fn parse_worker_status(raw: &str) -> WorkerStatus {
    match raw.parse() {
        Ok(status) => status,
        Err(never) => match never {},
    }
}

pub fn register_to_proto(record: &WorkerRecord) -> proto::RegisterWorkerRequest {
    proto::RegisterWorkerRequest {
        worker_id: record.id,
        started_at: format_timestamp(&record.started_at),
        status: record.status.to_string(),
        current_job_id: record.current_job_id.map(|id| id.to_string()),
    }
}

pub fn register_from_proto(req: proto::RegisterWorkerRequest) -> Result<WorkerRecord> {
    let started_at = parse_timestamp(&req.started_at)?;
    let status = parse_worker_status(&req.status);
    Ok(WorkerRecord {
        id: req.worker_id,
        started_at,
        idle_since: (status == WorkerStatus::Idle).then_some(started_at),
        status,
        current_job_id: req
            .current_job_id
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(parse_job_id)
            .transpose()?,
    })
}

/// Snapshot row for a registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub status: String,
    pub current_job_id: Option<String>,
}

pub fn worker_to_proto(record: &WorkerRecord) -> proto::WorkerInfo {
    proto::WorkerInfo {
        worker_id: record.id,
        started_at: format_timestamp(&record.started_at),
        uptime_secs: record.uptime().num_seconds().max(0),
        status: record.status.to_string(),
        current_job_id: record.current_job_id.map(|id| id.to_string()),
    }
}

pub fn worker_from_proto(info: proto::WorkerInfo) -> Result<WorkerSummary> {
    Ok(WorkerSummary {
        worker_id: info.worker_id,
        started_at: parse_timestamp(&info.started_at)?,
        uptime_secs: info.uptime_secs,
        status: info.status,
        current_job_id: info.current_job_id,
    })
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// A filter as sent by a client: `mine` is resolved against the caller's
/// user name on the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub mine: bool,
    pub filter: JobFilter,
}

pub fn query_to_proto(user_name: &str, query: &ListQuery) -> proto::ListJobsRequest {
    let filter = &query.filter;
    proto::ListJobsRequest {
        user_name: user_name.to_string(),
        filter: Some(proto::JobFilter {
            mine: query.mine,
            job_id: filter.id.map(|id| id.to_string()),
            name: filter.name.clone(),
            owner: filter.owner.clone(),
            kind: filter.kind.clone(),
            status: filter.status.map(|s| s.to_string()),
            include_finished: filter.include_finished,
        }),
    }
}

pub fn query_from_proto(filter: Option<proto::JobFilter>) -> Result<ListQuery> {
    let filter = filter.unwrap_or_default();
    Ok(ListQuery {
        mine: filter.mine,
        filter: JobFilter {
            id: filter.job_id.as_deref().map(parse_job_id).transpose()?,
            name: filter.name,
            owner: filter.owner,
            kind: filter.kind,
            status: filter.status.as_deref().map(str::parse).transpose()?,
            include_finished: filter.include_finished,
        },
    })
}

/// Snapshot row for one job as returned by `list_jobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: Uuid,
    pub kind: String,
    pub name: String,
    pub status: JobStatus,
    pub owner: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub runtime_secs: Option<i64>,
    pub command: String,
}

pub fn job_to_info(job: &Job) -> proto::JobInfo {
    proto::JobInfo {
        job_id: job.id.to_string(),
        kind: job.kind.type_name().to_string(),
        name: job.name.clone(),
        status: job.status.to_string(),
        owner: job.owner.clone(),
        priority: job.priority,
        created_at: format_timestamp(&job.created_at),
        start_time: job.start_time.as_ref().map(format_timestamp),
        end_time: job.end_time.as_ref().map(format_timestamp),
        exit_code: job.exit_code,
        runtime_secs: job.runtime().map(|d| d.num_seconds().max(0)),
        command: job.kind.describe().to_string(),
    }
}

pub fn job_from_info(info: proto::JobInfo) -> Result<JobSummary> {
    Ok(JobSummary {
        id: parse_job_id(&info.job_id)?,
        kind: info.kind,
        name: info.name,
        status: info.status.parse()?,
        owner: info.owner,
        priority: info.priority,
        created_at: parse_timestamp(&info.created_at)?,
        start_time: parse_optional_timestamp(info.start_time.as_deref())?,
        end_time: parse_optional_timestamp(info.end_time.as_deref())?,
        exit_code: info.exit_code,
        runtime_secs: info.runtime_secs,
        command: info.command,
    })
}

/// Render a duration in seconds as `D-HH:MM:SS`.
pub fn format_runtime(secs: i64) -> String {
    let secs = secs.max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{}-{:02}:{:02}:{:02}", days, hours, minutes, seconds)
}
