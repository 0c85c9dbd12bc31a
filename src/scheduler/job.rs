use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_OUTPUT_DIR;
use crate::error::{BatchError, Result};
use crate::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Submitted,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Submitted => 1,
            JobStatus::Running => 2,
            JobStatus::Finished | JobStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Statuses only move forward; a terminal status is final.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == self || next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "submitted" => Ok(JobStatus::Submitted),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            other => Err(BatchError::InvalidArgument(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Job variants. The `type` tag is the wire discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    Shell(ShellJob),
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Shell(_) => "shell",
        }
    }

    /// Text shown to users for what the job runs.
    pub fn describe(&self) -> &str {
        match self {
            JobKind::Shell(shell) => &shell.command,
        }
    }
}

/// Runs a command line through `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellJob {
    pub command: String,
}

impl ShellJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Derive a display name from the command.
    ///
    /// The basename of the first token that looks like a file (`script.py`,
    /// `./run.sh`) wins; otherwise the basename of the first token starting
    /// with a letter; otherwise `job`.
    pub fn derive_name(&self) -> String {
        let tokens: Vec<&str> = self
            .command
            .split_whitespace()
            .map(|t| t.trim_matches(|c| c == '"' || c == '\''))
            .map(|t| t.rsplit('/').next().unwrap_or(t))
            .collect();

        let file_like = tokens.iter().find(|t| {
            let mut parts = t.splitn(2, '.');
            match (parts.next(), parts.next()) {
                (Some(stem), Some(ext)) => {
                    stem.starts_with(|c: char| c.is_ascii_alphabetic())
                        && ext.starts_with(|c: char| c.is_ascii_alphabetic())
                }
                _ => false,
            }
        });
        if let Some(token) = file_like {
            return sanitize_name(token);
        }

        tokens
            .iter()
            .find(|t| t.starts_with(|c: char| c.is_ascii_alphabetic()))
            .map(|t| sanitize_name(t))
            .unwrap_or_else(|| "job".to_string())
    }
}

fn sanitize_name(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// What a submitter asks for; the daemon turns it into a [`Job`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    pub command: String,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub priority: i32,
    pub output_dir: Option<PathBuf>,
    /// Submission time as seen by the client; the daemon stamps now if unset.
    pub created_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: JobKind,
    pub name: String,
    pub owner: Option<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub parent_pid: Option<u32>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl Job {
    /// A pending shell job with default naming and output locations.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::from_spec(JobSpec::shell(command), Path::new(DEFAULT_OUTPUT_DIR))
    }

    pub fn from_spec(spec: JobSpec, default_output_dir: &Path) -> Self {
        let shell = ShellJob::new(spec.command);
        let id = Uuid::new_v4();
        let name = spec
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| shell.derive_name());
        let output_dir = spec
            .output_dir
            .unwrap_or_else(|| default_output_dir.to_path_buf());
        let stem = match sanitize_name(&name) {
            s if s.is_empty() => "job".to_string(),
            s => s,
        };

        Self {
            id,
            stdout_path: output_dir.join(format!("{}_{}.out", stem, id)),
            stderr_path: output_dir.join(format!("{}_{}.err", stem, id)),
            kind: JobKind::Shell(shell),
            name,
            owner: spec.owner,
            priority: spec.priority,
            status: JobStatus::Pending,
            created_at: spec.created_at.unwrap_or_else(Utc::now),
            start_time: None,
            end_time: None,
            exit_code: None,
            pid: None,
            parent_pid: None,
        }
    }

    /// Wall-clock runtime: fixed once finished, growing while running.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        let start = self.start_time?;
        match self.end_time {
            Some(end) => Some(end - start),
            None if self.status == JobStatus::Running => Some(Utc::now() - start),
            None => None,
        }
    }

    /// Whether the job's recorded process still exists as a child of the
    /// recorded parent. A recycled pid under another parent reads as dead.
    pub fn check_alive(&self) -> bool {
        match &self.kind {
            JobKind::Shell(_) => match (self.pid, self.parent_pid) {
                (Some(pid), Some(parent_pid)) => process::is_child_of(pid, parent_pid),
                _ => false,
            },
        }
    }

    /// Send a termination signal to the job's process group.
    pub fn kill(&self) -> Result<()> {
        match &self.kind {
            JobKind::Shell(_) => match self.pid {
                Some(pid) => process::terminate(pid),
                None => Err(BatchError::InvalidArgument(format!(
                    "job {} has no process to kill",
                    self.id
                ))),
            },
        }
    }

    /// Apply a partial update. The patch is validated as a whole first; on
    /// error nothing is changed.
    pub fn apply(&mut self, patch: &JobPatch) -> Result<()> {
        if let Some(next) = patch.status {
            if !self.status.can_transition_to(next) {
                return Err(BatchError::InvalidTransition {
                    job_id: self.id,
                    from: self.status,
                    to: next.to_string(),
                });
            }
        }
        let entering_running =
            patch.status == Some(JobStatus::Running) && self.start_time.is_none();
        if patch.start_time.is_some() && !entering_running {
            return Err(BatchError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: "start_time outside the running transition".to_string(),
            });
        }
        let entering_terminal = patch.status.is_some_and(JobStatus::is_terminal);
        if (patch.end_time.is_some() || patch.exit_code.is_some()) && !entering_terminal {
            return Err(BatchError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: "end_time or exit_code without a terminal status".to_string(),
            });
        }

        let now = Utc::now();
        if let Some(next) = patch.status {
            if next == JobStatus::Running && self.start_time.is_none() {
                self.start_time = Some(patch.start_time.unwrap_or(now));
            }
            if next.is_terminal() && self.end_time.is_none() {
                self.end_time = Some(patch.end_time.unwrap_or(now));
            }
            self.status = next;
        }
        if let Some(pid) = patch.pid {
            self.pid = Some(pid);
        }
        if let Some(parent_pid) = patch.parent_pid {
            self.parent_pid = Some(parent_pid);
        }
        if let Some(exit_code) = patch.exit_code {
            self.exit_code = Some(exit_code);
        }
        Ok(())
    }
}

/// Partial update to a job record; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub pid: Option<u32>,
    pub parent_pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch sent once the job's child process exists.
    pub fn running(pid: u32, parent_pid: u32, start_time: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            pid: Some(pid),
            parent_pid: Some(parent_pid),
            start_time: Some(start_time),
            ..Default::default()
        }
    }

    /// Patch sent when the child exits; zero maps to finished, anything else
    /// (including death by signal) to failed.
    pub fn exited(exit_code: Option<i32>, end_time: DateTime<Utc>) -> Self {
        let status = if exit_code == Some(0) {
            JobStatus::Finished
        } else {
            JobStatus::Failed
        };
        Self {
            status: Some(status),
            exit_code,
            end_time: Some(end_time),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_derivation() {
        let cases = [
            ("echo hello", "echo"),
            ("python3 echo.py -a hell --last_letter o", "echo.py"),
            ("bash echo.sh", "echo.sh"),
            ("./echo.sh hello", "echo.sh"),
            ("/usr/bin/env sleep 1", "env"),
            ("123 456", "job"),
            ("", "job"),
        ];
        for (command, expected) in cases {
            assert_eq!(ShellJob::new(command).derive_name(), expected, "{command}");
        }
    }

    #[test]
    fn new_job_is_pending_with_derived_paths() {
        let job = Job::from_spec(
            JobSpec::shell("echo hello").with_priority(3),
            Path::new("/tmp/out"),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.name, "echo");
        assert_eq!(job.priority, 3);
        assert_eq!(
            job.stdout_path,
            PathBuf::from(format!("/tmp/out/echo_{}.out", job.id))
        );
        assert_eq!(
            job.stderr_path,
            PathBuf::from(format!("/tmp/out/echo_{}.err", job.id))
        );
    }

    #[test]
    fn explicit_name_and_output_dir_win() {
        let job = Job::from_spec(
            JobSpec::shell("echo hi")
                .with_name("greeting")
                .with_output_dir("/var/tmp/x"),
            Path::new("/ignored"),
        );
        assert_eq!(job.name, "greeting");
        assert!(job.stdout_path.starts_with("/var/tmp/x"));
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Running));
        assert!(Submitted.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));

        assert!(!Submitted.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Submitted));
        assert!(!Finished.can_transition_to(Pending));
        assert!(!Finished.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Finished));
    }

    #[test]
    fn running_patch_sets_start_time_once() {
        let mut job = Job::shell("sleep 1");
        job.apply(&JobPatch::running(100, 1, Utc::now())).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.pid, Some(100));
        let start = job.start_time.expect("start time set");

        let err = job
            .apply(&JobPatch {
                start_time: Some(Utc::now()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidTransition { .. }));
        assert_eq!(job.start_time, Some(start));
    }

    #[test]
    fn timestamps_only_travel_with_their_transition() {
        let mut job = Job::shell("sleep 1");
        let before = job.clone();

        let early_start = JobPatch {
            start_time: Some(Utc::now()),
            ..Default::default()
        };
        assert!(matches!(
            job.apply(&early_start),
            Err(BatchError::InvalidTransition { .. })
        ));
        let early_end = JobPatch {
            end_time: Some(Utc::now()),
            exit_code: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            job.apply(&early_end),
            Err(BatchError::InvalidTransition { .. })
        ));
        let exit_while_running = JobPatch {
            status: Some(JobStatus::Running),
            exit_code: Some(3),
            ..Default::default()
        };
        assert!(job.apply(&exit_while_running).is_err());
        assert_eq!(job, before);

        // The running transition still stamps its own start time.
        let start = Utc::now();
        job.apply(&JobPatch::running(100, 1, start)).unwrap();
        assert_eq!(job.start_time, Some(start));
        assert!(job.end_time.is_none());
        assert!(job.exit_code.is_none());
    }

    #[test]
    fn terminal_status_stamps_end_time() {
        let mut job = Job::shell("true");
        job.apply(&JobPatch::status(JobStatus::Running)).unwrap();
        assert!(job.start_time.is_some());
        job.apply(&JobPatch::status(JobStatus::Finished)).unwrap();
        assert!(job.end_time.is_some());
        assert!(job.runtime().is_some());
    }

    #[test]
    fn rejected_patch_changes_nothing() {
        let mut job = Job::shell("true");
        job.apply(&JobPatch::exited(Some(0), Utc::now())).unwrap();
        let before = job.clone();

        let err = job
            .apply(&JobPatch {
                status: Some(JobStatus::Pending),
                pid: Some(7),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidTransition { .. }));
        assert_eq!(job, before);
    }

    #[test]
    fn exit_code_maps_to_terminal_status() {
        assert_eq!(
            JobPatch::exited(Some(0), Utc::now()).status,
            Some(JobStatus::Finished)
        );
        assert_eq!(
            JobPatch::exited(Some(2), Utc::now()).status,
            Some(JobStatus::Failed)
        );
        assert_eq!(
            JobPatch::exited(None, Utc::now()).status,
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("stopped".parse::<JobStatus>().is_err());
    }

    #[test]
    fn job_without_process_is_not_alive() {
        let job = Job::shell("true");
        assert!(!job.check_alive());
        assert!(job.kill().is_err());
    }
}
