use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::scheduler::job::{Job, JobStatus};

/// Attribute filter for queue views. Unset fields match everything.
///
/// Terminal jobs are hidden unless `include_finished` is set or `status`
/// explicitly asks for a terminal status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub kind: Option<String>,
    pub status: Option<JobStatus>,
    pub include_finished: bool,
}

impl JobFilter {
    /// Everything, finished jobs included.
    pub fn all() -> Self {
        Self {
            include_finished: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.status.is_terminal()
            && !self.include_finished
            && self.status != Some(job.status)
        {
            return false;
        }
        self.id.map_or(true, |id| job.id == id)
            && self.name.as_ref().map_or(true, |name| &job.name == name)
            && self
                .owner
                .as_ref()
                .map_or(true, |owner| job.owner.as_ref() == Some(owner))
            && self
                .kind
                .as_ref()
                .map_or(true, |kind| job.kind.type_name() == kind)
            && self.status.map_or(true, |status| job.status == status)
    }
}

/// Every job the daemon knows about, in submission order.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pending job. Ids must be unique within the queue.
    pub fn enqueue(&mut self, job: Job) -> Result<()> {
        if job.status != JobStatus::Pending {
            return Err(BatchError::InvalidArgument(format!(
                "job {} must be pending to be queued, it is {}",
                job.id, job.status
            )));
        }
        if self.get_job(&job.id).is_some() {
            return Err(BatchError::DuplicateJob(job.id));
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Claim the pending job with the highest priority, earliest submission
    /// first among equals. The claimed job is marked submitted in place and a
    /// copy is returned.
    pub fn dequeue_highest_priority(&mut self) -> Result<Job> {
        let mut best: Option<usize> = None;
        for (idx, job) in self.jobs.iter().enumerate() {
            if job.status != JobStatus::Pending {
                continue;
            }
            match best {
                Some(b) if self.jobs[b].priority >= job.priority => {}
                _ => best = Some(idx),
            }
        }

        let idx = best.ok_or(BatchError::EmptyQueue)?;
        let job = &mut self.jobs[idx];
        job.status = JobStatus::Submitted;
        Ok(job.clone())
    }

    /// Remove a job by id.
    pub fn remove(&mut self, id: &Uuid) -> Result<Job> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.id == *id)
            .ok_or_else(|| BatchError::JobNotFound(id.to_string()))?;
        Ok(self.jobs.remove(idx))
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == *id)
    }

    pub fn get_job_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == *id)
    }

    /// Copies of the jobs matching `filter`, in queue order.
    pub fn filtered_view(&self, filter: &JobFilter) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect()
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<&Job> {
        self.jobs.iter().filter(|j| j.status == status).collect()
    }

    pub fn pending_jobs(&self) -> Vec<&Job> {
        self.jobs_with_status(JobStatus::Pending)
    }

    pub fn running_jobs(&self) -> Vec<&Job> {
        self.jobs_with_status(JobStatus::Running)
    }

    pub fn num_pending(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    pub fn num_running(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    /// All jobs in submission order.
    pub fn all_jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
