use std::collections::BTreeMap;
use std::convert::Infallible;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BatchError, Result};

/// What a worker reports it is doing. Labels other than idle/busy are kept
/// as reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Other(String),
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Other(label) => write!(f, "{}", label),
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "idle" => WorkerStatus::Idle,
            "busy" => WorkerStatus::Busy,
            other => WorkerStatus::Other(other.to_string()),
        })
    }
}

/// Daemon-side record of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    /// Worker process id.
    pub id: u32,
    pub started_at: DateTime<Utc>,
    pub status: WorkerStatus,
    pub current_job_id: Option<Uuid>,
    pub idle_since: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(id: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            status: WorkerStatus::Idle,
            current_job_id: None,
            idle_since: Some(started_at),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn is_busy(&self) -> bool {
        self.status == WorkerStatus::Busy
    }
}

/// Partial update to a worker record. `current_job_id: Some(None)` clears the
/// current job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPatch {
    pub status: Option<WorkerStatus>,
    pub current_job_id: Option<Option<Uuid>>,
    pub idle_since: Option<DateTime<Utc>>,
}

impl WorkerPatch {
    pub fn status(status: WorkerStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn busy(job_id: Uuid) -> Self {
        Self {
            status: Some(WorkerStatus::Busy),
            current_job_id: Some(Some(job_id)),
            idle_since: None,
        }
    }

    pub fn idle(since: DateTime<Utc>) -> Self {
        Self {
            status: Some(WorkerStatus::Idle),
            current_job_id: Some(None),
            idle_since: Some(since),
        }
    }
}

/// Tracks registered workers, keyed by process id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<u32, WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any stale record under the same pid.
    pub fn register(&mut self, record: WorkerRecord) {
        let worker_id = record.id;
        if self.workers.insert(worker_id, record).is_some() {
            tracing::warn!(worker_id, "Worker re-registered, previous record replaced");
        } else {
            tracing::info!(worker_id, "Worker registered");
        }
    }

    /// Remove a worker. Unknown ids are an error, not a no-op.
    pub fn deregister(&mut self, worker_id: u32) -> Result<WorkerRecord> {
        let record = self
            .workers
            .remove(&worker_id)
            .ok_or(BatchError::WorkerNotFound(worker_id))?;
        tracing::info!(worker_id, "Worker deregistered");
        Ok(record)
    }

    pub fn apply(&mut self, worker_id: u32, patch: &WorkerPatch) -> Result<()> {
        let worker = self
            .workers
            .get_mut(&worker_id)
            .ok_or(BatchError::WorkerNotFound(worker_id))?;
        if let Some(status) = &patch.status {
            worker.status = status.clone();
        }
        if let Some(current) = patch.current_job_id {
            worker.current_job_id = current;
        }
        if let Some(since) = patch.idle_since {
            worker.idle_since = Some(since);
        }
        Ok(())
    }

    pub fn get(&self, worker_id: u32) -> Option<&WorkerRecord> {
        self.workers.get(&worker_id)
    }

    /// The worker whose current job is `job_id`, if any.
    pub fn worker_for_job(&self, job_id: &Uuid) -> Option<&WorkerRecord> {
        self.workers
            .values()
            .find(|w| w.current_job_id.as_ref() == Some(job_id))
    }

    /// Drop records whose process is gone. Returns the removed ids.
    pub fn sweep_dead<F>(&mut self, is_alive: F) -> Vec<u32>
    where
        F: Fn(u32) -> bool,
    {
        let dead: Vec<u32> = self
            .workers
            .keys()
            .copied()
            .filter(|&id| !is_alive(id))
            .collect();
        for worker_id in &dead {
            self.workers.remove(worker_id);
            tracing::info!(worker_id, "Removed dead worker from tracking");
        }
        dead
    }

    /// All workers ordered by pid.
    pub fn all_workers(&self) -> Vec<&WorkerRecord> {
        self.workers.values().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
