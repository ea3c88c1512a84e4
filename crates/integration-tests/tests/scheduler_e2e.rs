//! End-to-end scheduler scenarios
//!
//! Real `sh` subprocesses, the JSON snapshot store and the supervised loop.

mod common;

use std::time::Duration;

use common::{start_queue, QueueOptions};
use gpuqueue_core::application::{CancelOutcome, ConfigureRequest, SubmitRequest};
use gpuqueue_core::domain::{FailureReason, JobStatus};
use gpuqueue_core::AppError;

const LIMIT: Duration = Duration::from_secs(15);

/// One device: jobs run one at a time in submission order
#[tokio::test]
async fn test_single_device_runs_jobs_sequentially() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(queue.submit_sh("sleep 0.2").await);
    }

    let mut summaries = Vec::new();
    for id in &ids {
        summaries.push(queue.wait_terminal(id, LIMIT).await);
    }

    for summary in &summaries {
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.exit_code, Some(0));
    }
    for pair in summaries.windows(2) {
        let earlier_finish = pair[0].finished_at.unwrap();
        let later_start = pair[1].started_at.unwrap();
        assert!(
            later_start >= earlier_finish,
            "jobs overlapped: {} started at {} before {} finished at {}",
            pair[1].id,
            later_start,
            pair[0].id,
            earlier_finish
        );
    }

    queue.stop().await;
    println!("✅ Three jobs ran sequentially on one device");
}

#[tokio::test]
async fn test_two_devices_run_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(
        dir.path(),
        QueueOptions {
            devices: vec!["0", "1"],
            max_concurrent: 2,
            ..Default::default()
        },
    )
    .await;

    let a = queue.submit_sh("sleep 1").await;
    let b = queue.submit_sh("sleep 1").await;

    let a = queue.wait_running(&a, LIMIT).await;
    let b = queue.wait_running(&b, LIMIT).await;
    assert_ne!(a.assigned_device, b.assigned_device);
    assert_eq!(queue.pool.held_count().unwrap(), 2);

    queue.wait_terminal(&a.id, LIMIT).await;
    queue.wait_terminal(&b.id, LIMIT).await;
    queue.wait_idle(LIMIT).await;
    assert_eq!(queue.pool.held_count().unwrap(), 0);

    queue.stop().await;
}

#[tokio::test]
async fn test_nonzero_exit_marks_failed() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let id = queue.submit_sh("echo boom >&2; exit 7").await;
    let summary = queue.wait_terminal(&id, LIMIT).await;

    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(summary.exit_code, Some(7));
    assert_eq!(summary.failure, Some(FailureReason::ExitCode(7)));
    assert!(summary.log_excerpt.iter().any(|line| line.contains("boom")));
    assert_eq!(summary.assigned_device, None);

    queue.stop().await;
}

#[tokio::test]
async fn test_device_env_and_log_tail() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(
        dir.path(),
        QueueOptions {
            devices: vec!["3"],
            ..Default::default()
        },
    )
    .await;

    let id = queue
        .submit_sh("echo device=$CUDA_VISIBLE_DEVICES; for i in 1 2 3; do echo line$i; done")
        .await;
    queue.wait_terminal(&id, LIMIT).await;

    let tail = queue.service.log(&id, Some(2)).await.unwrap();
    assert_eq!(tail.lines, vec!["line2".to_string(), "line3".to_string()]);

    let full = queue.service.log(&id, None).await.unwrap();
    assert!(full.lines[0].starts_with("# job "));
    assert!(full.lines.contains(&"device=3".to_string()));

    queue.stop().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let id = queue.submit_sh("sleep 30").await;
    queue.wait_running(&id, LIMIT).await;

    let outcome = queue.service.cancel(&id).await.unwrap();
    let summary = queue.wait_terminal(&id, LIMIT).await;

    assert_eq!(outcome, CancelOutcome::CancelRequested);
    assert_eq!(summary.status, JobStatus::Cancelled);
    queue.wait_idle(LIMIT).await;
    assert_eq!(queue.pool.held_count().unwrap(), 0);

    queue.stop().await;
}

#[tokio::test]
async fn test_cancel_completed_job_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let id = queue.submit_sh("echo done").await;
    let done = queue.wait_terminal(&id, LIMIT).await;
    queue.wait_idle(LIMIT).await;
    assert_eq!(done.status, JobStatus::Completed);
    let before = queue.service.status(&id).await.unwrap();

    for _ in 0..2 {
        assert_eq!(
            queue.service.cancel(&id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    let after = queue.service.status(&id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.exit_code, Some(0));
    assert_eq!(after.finished_at, done.finished_at);
    assert_eq!(queue.pool.held_count().unwrap(), 0);

    queue.stop().await;
}

#[tokio::test]
async fn test_cancelled_pending_job_never_runs() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;
    let marker = dir.path().join("ran");

    let blocker = queue.submit_sh("sleep 0.5").await;
    let victim = queue
        .submit_sh(&format!("touch {}", marker.display()))
        .await;
    let follower = queue.submit_sh("true").await;

    assert_eq!(
        queue.service.cancel(&victim).await.unwrap(),
        CancelOutcome::Cancelled
    );
    queue.wait_terminal(&blocker, LIMIT).await;
    let follower = queue.wait_terminal(&follower, LIMIT).await;

    let victim = queue.service.status(&victim).await.unwrap();
    assert_eq!(victim.status, JobStatus::Cancelled);
    assert_eq!(victim.started_at, None);
    assert_eq!(follower.status, JobStatus::Completed);
    assert!(!marker.exists());

    queue.stop().await;
}

#[tokio::test]
async fn test_launch_failure_frees_device() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let bad = queue
        .service
        .submit(SubmitRequest::new("/definitely/not/a/program"))
        .await
        .unwrap();
    let good = queue.submit_sh("true").await;

    let bad = queue.wait_terminal(&bad, LIMIT).await;
    let good = queue.wait_terminal(&good, LIMIT).await;

    assert_eq!(bad.status, JobStatus::Failed);
    assert!(matches!(bad.failure, Some(FailureReason::LaunchFailure(_))));
    let log = std::fs::read_to_string(bad.log_path.unwrap()).unwrap();
    assert!(log.contains("# launch failed:"));
    assert_eq!(good.status, JobStatus::Completed);

    queue.stop().await;
}

#[tokio::test]
async fn test_max_runtime_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(
        dir.path(),
        QueueOptions {
            max_runtime: Some(Duration::from_millis(300)),
            ..Default::default()
        },
    )
    .await;

    let id = queue.submit_sh("sleep 30").await;
    let summary = queue.wait_terminal(&id, LIMIT).await;

    assert_eq!(summary.status, JobStatus::Failed);
    assert!(matches!(summary.failure, Some(FailureReason::Timeout { .. })));

    queue.stop().await;
}

#[tokio::test]
async fn test_configure_rejected_while_busy() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let id = queue.submit_sh("sleep 1").await;
    queue.wait_running(&id, LIMIT).await;

    let result = queue
        .service
        .configure(ConfigureRequest {
            devices: Some(vec!["0".into(), "1".into()]),
            max_concurrent: Some(2),
        })
        .await;
    assert!(matches!(result, Err(AppError::PoolBusy(_))));

    queue.wait_idle(LIMIT).await;
    let snapshot = queue
        .service
        .configure(ConfigureRequest {
            devices: Some(vec!["0".into(), "1".into()]),
            max_concurrent: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(snapshot.devices.len(), 2);

    queue.stop().await;
}

#[tokio::test]
async fn test_queue_becomes_idle() {
    let dir = tempfile::tempdir().unwrap();
    let queue = start_queue(dir.path(), QueueOptions::default()).await;

    let id = queue.submit_sh("true").await;
    queue.wait_terminal(&id, LIMIT).await;
    queue.wait_idle(LIMIT).await;

    let status = queue.service.queue_status().await.unwrap();
    assert!(status.idle);
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.queue_length, 0);

    queue.stop().await;
}
