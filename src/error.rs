use std::net::SocketAddr;

use thiserror::Error;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Queue is empty: no pending jobs")]
    EmptyQueue,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(u32),

    #[error("Job already queued: {0}")]
    DuplicateJob(Uuid),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A daemon is already running on {0}")]
    AlreadyBound(SocketAddr),

    #[error(
        "Process consistency fault for job {job_id}: worker tracks pid {local_pid}, daemon reports {reported:?}"
    )]
    ProcessConsistencyFault {
        job_id: Uuid,
        local_pid: u32,
        reported: Option<u32>,
    },

    #[error("Refusing to shut down: {running} running and {pending} pending jobs (use force)")]
    ShutdownRefused { pending: usize, running: usize },

    #[error("Daemon not running at {0}")]
    DaemonUnreachable(String),

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Grpc(Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BatchError>;

impl BatchError {
    /// Rebuild a typed error from a status returned by the daemon.
    pub fn from_status(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::OutOfRange => BatchError::EmptyQueue,
            Code::NotFound => match message.strip_prefix("Worker not found: ") {
                Some(id) => id
                    .parse()
                    .map(BatchError::WorkerNotFound)
                    .unwrap_or(BatchError::JobNotFound(message)),
                None => BatchError::JobNotFound(
                    message
                        .strip_prefix("Job not found: ")
                        .map(str::to_string)
                        .unwrap_or(message),
                ),
            },
            Code::InvalidArgument => BatchError::InvalidArgument(message),
            Code::FailedPrecondition => {
                let (running, pending) = parse_shutdown_counts(&message);
                BatchError::ShutdownRefused { pending, running }
            }
            Code::Unavailable => BatchError::DaemonUnreachable(message),
            _ => BatchError::Grpc(status),
        }
    }

    /// True for failures that mean the daemon cannot be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            BatchError::DaemonUnreachable(_) | BatchError::Transport(_)
        )
    }
}

fn parse_shutdown_counts(message: &str) -> (usize, usize) {
    let numbers: Vec<usize> = message
        .split_whitespace()
        .filter_map(|word| word.parse().ok())
        .collect();
    match numbers.as_slice() {
        [running, pending, ..] => (*running, *pending),
        _ => (0, 0),
    }
}

impl From<BatchError> for Status {
    fn from(err: BatchError) -> Self {
        let message = err.to_string();
        match err {
            BatchError::EmptyQueue => Status::out_of_range(message),
            BatchError::JobNotFound(_) | BatchError::WorkerNotFound(_) => {
                Status::not_found(message)
            }
            BatchError::DuplicateJob(_) => Status::already_exists(message),
            BatchError::InvalidTransition { .. } | BatchError::InvalidArgument(_) => {
                Status::invalid_argument(message)
            }
            BatchError::ShutdownRefused { .. } => Status::failed_precondition(message),
            BatchError::Grpc(status) => status,
            _ => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_round_trips_through_status() {
        let status: Status = BatchError::EmptyQueue.into();
        assert_eq!(status.code(), Code::OutOfRange);
        assert!(matches!(
            BatchError::from_status(status),
            BatchError::EmptyQueue
        ));
    }

    #[test]
    fn not_found_keeps_the_identifier() {
        let status: Status = BatchError::JobNotFound("abc".to_string()).into();
        match BatchError::from_status(status) {
            BatchError::JobNotFound(id) => assert_eq!(id, "abc"),
            other => panic!("unexpected error: {other:?}"),
        }

        let status: Status = BatchError::WorkerNotFound(42).into();
        assert!(matches!(
            BatchError::from_status(status),
            BatchError::WorkerNotFound(42)
        ));
    }

    #[test]
    fn shutdown_refusal_keeps_counts() {
        let status: Status = BatchError::ShutdownRefused {
            pending: 3,
            running: 1,
        }
        .into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        match BatchError::from_status(status) {
            BatchError::ShutdownRefused { pending, running } => {
                assert_eq!(pending, 3);
                assert_eq!(running, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unavailable_means_unreachable() {
        let err = BatchError::from_status(Status::unavailable("connection refused"));
        assert!(err.is_unreachable());
    }
}
