use std::fs::{self, File};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::process;
use crate::scheduler::{Job, JobKind, JobStatus};

/// Result of running a job to completion.
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

/// Exit code as reported to the daemon. Death by signal `n` reads as `-n`.
pub fn exit_code_of(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

/// A spawned job process, leader of its own process group.
#[derive(Debug)]
pub struct RunningJob {
    job_id: Uuid,
    pid: u32,
    child: Child,
}

impl RunningJob {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(exit_code_of(status))
    }

    /// Non-blocking exit check. `Some` once the process has exited.
    pub fn try_wait(&mut self) -> Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(exit_code_of))
    }

    /// SIGTERM the process group, then SIGKILL if it outlives `grace`.
    /// Returns the exit code once the process is reaped.
    pub async fn kill(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Some(code) = self.try_wait()? {
            return Ok(code);
        }

        process::terminate(self.pid)?;
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            return Ok(exit_code_of(status?));
        }

        tracing::warn!(job_id = %self.job_id, pid = self.pid, "Job ignored SIGTERM, sending SIGKILL");
        process::force_kill(self.pid)?;
        self.wait().await
    }
}

/// Runs jobs as local child processes with output captured to files.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor;

impl JobExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Start the job's command in its own process group, stdout and stderr
    /// redirected to the job's capture files.
    pub fn spawn(&self, job: &Job) -> Result<RunningJob> {
        let JobKind::Shell(shell) = &job.kind;

        for path in [&job.stdout_path, &job.stderr_path] {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
        }
        let stdout = File::create(&job.stdout_path)?;
        let stderr = File::create(&job.stderr_path)?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&shell.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| BatchError::Internal(format!("job {} exited before reporting a pid", job.id)))?;

        tracing::info!(job_id = %job.id, pid, command = %shell.command, "Job process started");
        Ok(RunningJob {
            job_id: job.id,
            pid,
            child,
        })
    }

    /// Spawn and wait for completion.
    pub async fn run(&self, job: &Job) -> Result<ExecutionResult> {
        let mut running = self.spawn(job)?;
        let exit_code = running.wait().await?;
        let status = if exit_code == Some(0) {
            JobStatus::Finished
        } else {
            JobStatus::Failed
        };

        tracing::info!(job_id = %job.id, status = %status, exit_code = ?exit_code, "Job completed");
        Ok(ExecutionResult {
            job_id: job.id,
            status,
            exit_code,
        })
    }
}
