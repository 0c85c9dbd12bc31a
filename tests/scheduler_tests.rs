use std::path::Path;
use std::sync::Arc;

use batchd::config::DaemonConfig;
use batchd::daemon::Daemon;
use batchd::error::BatchError;
use batchd::scheduler::{
    Job, JobFilter, JobPatch, JobQueue, JobSpec, JobStatus, WorkerPatch, WorkerRecord,
    WorkerRegistry, WorkerStatus,
};
use batchd::wire::ListQuery;
use chrono::Utc;
use uuid::Uuid;

fn job_with_priority(command: &str, priority: i32) -> Job {
    Job::from_spec(
        JobSpec::shell(command).with_priority(priority),
        Path::new("/tmp/batchd-tests"),
    )
}

#[test]
fn test_job_creation() {
    let job = Job::shell("echo hello");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.kind.describe(), "echo hello");
    assert_eq!(job.kind.type_name(), "shell");
    assert!(job.pid.is_none());
    assert!(job.start_time.is_none());
}

#[test]
fn test_job_queue_operations() {
    let mut queue = JobQueue::new();

    let job1 = Job::shell("echo 1");
    let job2 = Job::shell("echo 2");
    let id1 = job1.id;

    queue.enqueue(job1).unwrap();
    queue.enqueue(job2).unwrap();

    assert_eq!(queue.all_jobs().len(), 2);
    assert_eq!(queue.pending_jobs().len(), 2);

    let retrieved = queue.get_job(&id1).unwrap();
    assert_eq!(retrieved.kind.describe(), "echo 1");

    queue
        .get_job_mut(&id1)
        .unwrap()
        .apply(&JobPatch::running(10, 1, Utc::now()))
        .unwrap();
    assert_eq!(queue.pending_jobs().len(), 1);
    assert_eq!(queue.running_jobs().len(), 1);
}

#[test]
fn test_priority_order_with_fifo_ties() {
    let mut queue = JobQueue::new();
    let low = job_with_priority("echo low", 0);
    let first_high = job_with_priority("echo first", 5);
    let second_high = job_with_priority("echo second", 5);
    let mid = job_with_priority("echo mid", 2);
    let ids = [first_high.id, second_high.id, mid.id, low.id];

    for job in [low, first_high, second_high, mid] {
        queue.enqueue(job).unwrap();
    }

    let order: Vec<Uuid> = (0..4)
        .map(|_| queue.dequeue_highest_priority().unwrap().id)
        .collect();
    assert_eq!(order, ids);
    assert!(matches!(
        queue.dequeue_highest_priority(),
        Err(BatchError::EmptyQueue)
    ));
}

#[test]
fn test_dequeue_marks_submitted_in_place() {
    let mut queue = JobQueue::new();
    let job = Job::shell("true");
    let id = job.id;
    queue.enqueue(job).unwrap();

    let claimed = queue.dequeue_highest_priority().unwrap();
    assert_eq!(claimed.status, JobStatus::Submitted);
    assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Submitted);
    assert_eq!(queue.num_pending(), 0);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_duplicate_job_rejected() {
    let mut queue = JobQueue::new();
    let job = Job::shell("echo dup");
    queue.enqueue(job.clone()).unwrap();
    assert!(matches!(
        queue.enqueue(job),
        Err(BatchError::DuplicateJob(_))
    ));
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_only_pending_jobs_can_be_queued() {
    let mut queue = JobQueue::new();
    let mut job = Job::shell("echo");
    job.status = JobStatus::Running;
    assert!(matches!(
        queue.enqueue(job),
        Err(BatchError::InvalidArgument(_))
    ));
}

#[test]
fn test_remove_missing_job_is_not_found() {
    let mut queue = JobQueue::new();
    assert!(matches!(
        queue.remove(&Uuid::new_v4()),
        Err(BatchError::JobNotFound(_))
    ));
}

#[test]
fn test_filtered_view_hides_finished_by_default() {
    let mut queue = JobQueue::new();
    let done = Job::shell("echo done");
    let done_id = done.id;
    queue.enqueue(done).unwrap();
    queue.enqueue(Job::shell("echo waiting")).unwrap();
    queue
        .get_job_mut(&done_id)
        .unwrap()
        .apply(&JobPatch::exited(Some(0), Utc::now()))
        .unwrap();

    assert_eq!(queue.filtered_view(&JobFilter::default()).len(), 1);
    assert_eq!(queue.filtered_view(&JobFilter::all()).len(), 2);

    let finished_only = JobFilter {
        status: Some(JobStatus::Finished),
        ..Default::default()
    };
    let view = queue.filtered_view(&finished_only);
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, done_id);

    // Views are copies.
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_filter_by_attributes() {
    let mut queue = JobQueue::new();
    queue
        .enqueue(Job::from_spec(
            JobSpec::shell("python3 train.py").with_owner("alice"),
            Path::new("/tmp"),
        ))
        .unwrap();
    queue
        .enqueue(Job::from_spec(
            JobSpec::shell("echo hi").with_owner("bob"),
            Path::new("/tmp"),
        ))
        .unwrap();

    let by_name = JobFilter {
        name: Some("train.py".to_string()),
        ..Default::default()
    };
    assert_eq!(queue.filtered_view(&by_name).len(), 1);

    let by_owner = JobFilter {
        owner: Some("bob".to_string()),
        ..Default::default()
    };
    let view = queue.filtered_view(&by_owner);
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].name, "echo");

    let by_type = JobFilter {
        kind: Some("shell".to_string()),
        ..Default::default()
    };
    assert_eq!(queue.filtered_view(&by_type).len(), 2);
}

#[test]
fn test_status_cannot_move_backwards() {
    let mut job = Job::shell("sleep 1");
    job.apply(&JobPatch::status(JobStatus::Submitted)).unwrap();
    job.apply(&JobPatch::running(42, 1, Utc::now())).unwrap();

    for status in [JobStatus::Pending, JobStatus::Submitted] {
        assert!(matches!(
            job.apply(&JobPatch::status(status)),
            Err(BatchError::InvalidTransition { .. })
        ));
    }
    assert_eq!(job.status, JobStatus::Running);

    job.apply(&JobPatch::exited(Some(3), Utc::now())).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, Some(3));
    assert!(job.apply(&JobPatch::status(JobStatus::Running)).is_err());
}

#[test]
fn test_registry_deregister_unknown_fails() {
    let mut registry = WorkerRegistry::new();
    registry.register(WorkerRecord::new(1, Utc::now()));
    assert!(matches!(
        registry.deregister(2),
        Err(BatchError::WorkerNotFound(2))
    ));
    assert!(registry.deregister(1).is_ok());
    assert!(registry.is_empty());
}

#[test]
fn test_registry_update_unknown_fails() {
    let mut registry = WorkerRegistry::new();
    assert!(matches!(
        registry.apply(7, &WorkerPatch::status(WorkerStatus::Busy)),
        Err(BatchError::WorkerNotFound(7))
    ));
}

// -----------------------------------------------------------------------------
// Daemon-level scenarios
// -----------------------------------------------------------------------------

fn test_daemon() -> Daemon {
    Daemon::new(DaemonConfig::default().with_output_dir("/tmp/batchd-tests"))
}

#[tokio::test]
async fn test_scenario_priority_dispatch() {
    let daemon = test_daemon();
    let _p0 = daemon.submit(JobSpec::shell("echo 0")).await.unwrap();
    let p1 = daemon
        .submit(JobSpec::shell("echo 1").with_priority(1))
        .await
        .unwrap();
    let p2 = daemon
        .submit(JobSpec::shell("echo 2").with_priority(2))
        .await
        .unwrap();

    assert_eq!(daemon.acquire_job().await.unwrap().id, p2);
    assert_eq!(daemon.acquire_job().await.unwrap().id, p1);
    // The priority-0 job is still pending.
    assert_eq!(daemon.num_pending_jobs().await, 1);
    daemon.acquire_job().await.unwrap();
    assert!(matches!(
        daemon.acquire_job().await,
        Err(BatchError::EmptyQueue)
    ));
}

#[tokio::test]
async fn test_scenario_worker_status_label() {
    let daemon = test_daemon();
    let pid = std::process::id();
    daemon
        .register_worker(WorkerRecord::new(pid, Utc::now()))
        .await;
    daemon
        .update_worker_status(pid, WorkerPatch::status("running".parse().unwrap()))
        .await
        .unwrap();

    let status = daemon.cluster_status().await;
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].id, pid);
    assert_eq!(status.workers[0].status.to_string(), "running");
}

#[tokio::test]
async fn test_scenario_cancel_pending_job() {
    let daemon = test_daemon();
    let id = daemon.submit(JobSpec::shell("sleep 100")).await.unwrap();
    daemon.cancel(&id).await.unwrap();

    let everything = ListQuery {
        mine: false,
        filter: JobFilter::all(),
    };
    let jobs = daemon.list_jobs("anyone", everything).await;
    assert!(jobs.iter().all(|j| j.id != id));
}

#[tokio::test]
async fn test_deregister_unknown_worker_via_daemon() {
    let daemon = test_daemon();
    assert!(matches!(
        daemon.deregister_worker(12345).await,
        Err(BatchError::WorkerNotFound(12345))
    ));
}

#[tokio::test]
async fn test_update_rejects_backward_transition() {
    let daemon = test_daemon();
    let id = daemon.submit(JobSpec::shell("true")).await.unwrap();
    daemon.acquire_job().await.unwrap();

    let err = daemon
        .update_job_status(&id, JobPatch::status(JobStatus::Pending))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InvalidTransition { .. }));
    assert_eq!(
        daemon.get_job(&id).await.unwrap().status,
        JobStatus::Submitted
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_hands_out_each_job_once() {
    let daemon = Arc::new(test_daemon());
    let mut submitted = Vec::new();
    for i in 0..50 {
        submitted.push(
            daemon
                .submit(JobSpec::shell(format!("echo {}", i)).with_priority(i % 3))
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let daemon = daemon.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Ok(job) = daemon.acquire_job().await {
                got.push(job.id);
            }
            got
        }));
    }

    let mut acquired = Vec::new();
    for handle in handles {
        acquired.extend(handle.await.unwrap());
    }

    acquired.sort();
    let before_dedup = acquired.len();
    acquired.dedup();
    assert_eq!(before_dedup, acquired.len(), "a job was handed out twice");

    submitted.sort();
    assert_eq!(acquired, submitted);
}
