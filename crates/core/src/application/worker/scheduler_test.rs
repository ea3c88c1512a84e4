//! Scheduler loop tests against the in-memory store and scripted processes

use super::*;
use crate::application::queue::{CancelOutcome, QueueService, SubmitRequest};
use crate::domain::Job;
use crate::port::id_provider::mocks::SequentialIdProvider;
use crate::port::job_store::mocks::InMemoryJobStore;
use crate::port::process_runner::mocks::MockProcessRunner;
use crate::port::time_provider::mocks::ManualTimeProvider;
use crate::port::StaticDevices;

struct Harness {
    service: QueueService,
    scheduler: SchedulerLoop,
    store: Arc<InMemoryJobStore>,
    pool: Arc<DevicePool>,
    runner: MockProcessRunner,
    clock: Arc<ManualTimeProvider>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(devices: &[&str], max_concurrent: usize, max_runtime: Option<Duration>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let pool = Arc::new(DevicePool::new(
            devices.iter().map(|d| DeviceId::new(*d)).collect(),
            max_concurrent,
        ));
        let runner = MockProcessRunner::new();
        let clock = Arc::new(ManualTimeProvider::new(1_000));

        let service = QueueService::new(
            store.clone(),
            pool.clone(),
            Arc::new(StaticDevices::new(vec![])),
            Arc::new(SequentialIdProvider::default()),
            clock.clone(),
        );
        let config = SchedulerConfig::new(dir.path().join("logs")).with_max_runtime(max_runtime);
        let scheduler = service.scheduler(Arc::new(runner.clone()), config);

        Self {
            service,
            scheduler,
            store,
            pool,
            runner,
            clock,
            _dir: dir,
        }
    }

    async fn submit(&self, program: &str, args: &[&str]) -> JobId {
        self.service
            .submit(SubmitRequest::new(program).args(args.iter().copied()))
            .await
            .unwrap()
    }

    async fn job(&self, id: &JobId) -> Job {
        self.store.get(id).await.unwrap()
    }

    /// Tick until nothing is Pending or Running, advancing the clock each time
    async fn run_to_idle(&mut self) {
        for _ in 0..100 {
            self.clock.advance(10);
            let report = self.scheduler.tick().await.unwrap();
            if !report.busy {
                return;
            }
        }
        panic!("scheduler did not go idle");
    }
}

#[tokio::test]
async fn test_jobs_run_one_at_a_time_in_submission_order() {
    let mut h = Harness::new(&["0"], 1, None);
    let a = h.submit("exit", &["0", "2"]).await;
    let b = h.submit("exit", &["0", "2"]).await;
    let c = h.submit("exit", &["0", "2"]).await;

    h.run_to_idle().await;

    let launched: Vec<JobId> = h.runner.launches().into_iter().map(|(id, _)| id).collect();
    assert_eq!(launched, vec![a.clone(), b.clone(), c.clone()]);
    assert_eq!(h.runner.max_concurrency(), 1);

    let (ja, jb, jc) = (h.job(&a).await, h.job(&b).await, h.job(&c).await);
    for job in [&ja, &jb, &jc] {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.assigned_device, None);
    }
    assert!(ja.started_at < jb.started_at && jb.started_at < jc.started_at);
    assert!(ja.finished_at.unwrap() <= jb.started_at.unwrap());
    assert!(jb.finished_at.unwrap() <= jc.started_at.unwrap());
    assert_eq!(h.pool.held_count().unwrap(), 0);
}

#[tokio::test]
async fn test_running_count_never_exceeds_capacity() {
    let mut h = Harness::new(&["0", "1", "2"], 2, None);
    for _ in 0..6 {
        h.submit("exit", &["0", "3"]).await;
    }

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, 2);
    let snapshot = h.pool.snapshot().unwrap();
    assert_eq!(snapshot.held_count(), 2);
    assert_eq!(
        h.store.count_by_status(JobStatus::Running).await.unwrap(),
        2
    );

    h.run_to_idle().await;
    assert_eq!(h.runner.max_concurrency(), 2);
    assert_eq!(h.runner.launches().len(), 6);
}

#[tokio::test]
async fn test_running_job_holds_exactly_its_device() {
    let mut h = Harness::new(&["0", "1"], 2, None);
    let a = h.submit("hang", &[]).await;
    let b = h.submit("hang", &[]).await;

    h.scheduler.tick().await.unwrap();

    let snapshot = h.pool.snapshot().unwrap();
    let ja = h.job(&a).await;
    let jb = h.job(&b).await;
    assert_eq!(snapshot.holder_of(&a), ja.assigned_device.as_ref());
    assert_eq!(snapshot.holder_of(&b), jb.assigned_device.as_ref());
    assert_ne!(ja.assigned_device, jb.assigned_device);
    assert!(ja.pid.is_some());
    assert!(ja.log_path.unwrap().ends_with(&format!("{}.log", a)));
}

#[tokio::test]
async fn test_nonzero_exit_fails_and_device_is_reused() {
    let mut h = Harness::new(&["0"], 1, None);
    let bad = h.submit("exit", &["7"]).await;
    let next = h.submit("exit", &["0"]).await;

    h.run_to_idle().await;

    let failed = h.job(&bad).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.exit_code, Some(7));
    assert_eq!(failed.failure, Some(FailureReason::ExitCode(7)));
    assert_eq!(failed.pid, None);

    assert_eq!(h.job(&next).await.status, JobStatus::Completed);
    let devices: Vec<DeviceId> = h.runner.launches().into_iter().map(|(_, d)| d).collect();
    assert_eq!(devices, vec![DeviceId::new("0"), DeviceId::new("0")]);
}

#[tokio::test]
async fn test_cancel_running_job_terminates_and_releases() {
    let mut h = Harness::new(&["0"], 1, None);
    let id = h.submit("hang", &[]).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.job(&id).await.status, JobStatus::Running);

    assert_eq!(
        h.service.cancel(&id).await.unwrap(),
        CancelOutcome::CancelRequested
    );
    // Still Running until the loop reaps it
    assert_eq!(h.job(&id).await.status, JobStatus::Running);

    h.run_to_idle().await;

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.exit_code, None);
    assert_eq!(h.runner.terminations(), vec![id.clone()]);
    assert_eq!(h.pool.held_count().unwrap(), 0);
    assert_eq!(h.service.cancel(&id).await.unwrap(), CancelOutcome::AlreadyTerminal);
}

#[tokio::test]
async fn test_cancelled_pending_job_is_never_launched() {
    let mut h = Harness::new(&["0"], 1, None);
    let first = h.submit("exit", &["0", "1"]).await;
    let second = h.submit("exit", &["0"]).await;
    h.service.cancel(&second).await.unwrap();

    h.run_to_idle().await;

    let launched: Vec<JobId> = h.runner.launches().into_iter().map(|(id, _)| id).collect();
    assert_eq!(launched, vec![first]);
    let job = h.job(&second).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.started_at, None);
}

#[tokio::test]
async fn test_launch_failure_marks_failed_and_frees_device() {
    let mut h = Harness::new(&["0"], 1, None);
    let broken = h.submit("missing", &[]).await;
    let next = h.submit("exit", &["0"]).await;

    h.run_to_idle().await;

    let job = h.job(&broken).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, None);
    assert!(matches!(job.failure, Some(FailureReason::LaunchFailure(ref msg)) if msg.contains("No such file")));
    assert_eq!(h.job(&next).await.status, JobStatus::Completed);
    assert_eq!(h.pool.held_count().unwrap(), 0);
}

#[tokio::test]
async fn test_max_runtime_exceeded_fails_with_timeout() {
    let mut h = Harness::new(&["0"], 1, Some(Duration::from_secs(1)));
    let id = h.submit("hang", &[]).await;
    h.scheduler.tick().await.unwrap();

    h.clock.advance(500);
    h.scheduler.tick().await.unwrap();
    assert!(h.runner.terminations().is_empty());

    h.clock.advance(1_000);
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.runner.terminations(), vec![id.clone()]);

    h.run_to_idle().await;
    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure, Some(FailureReason::Timeout { limit_ms: 1_000 }));
}

#[tokio::test]
async fn test_signal_death_is_failure_without_exit_code() {
    let mut h = Harness::new(&["0"], 1, None);
    let id = h.submit("killed", &[]).await;

    h.run_to_idle().await;

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure, Some(FailureReason::Signal));
    assert_eq!(job.exit_code, None);
}

#[tokio::test]
async fn test_housekeeping_purges_only_expired_terminal_jobs() {
    let mut h = Harness::new(&["0"], 1, None);
    let old = h.submit("exit", &["0"]).await;
    h.run_to_idle().await;

    h.clock.advance(TERMINAL_JOB_RETENTION.as_millis() as i64 + 1);
    let fresh = h.submit("hang", &[]).await;
    let report = h.scheduler.tick().await.unwrap();

    assert_eq!(report.purged, 1);
    assert!(h.store.get(&old).await.is_err());
    assert_eq!(h.job(&fresh).await.status, JobStatus::Running);

    // Not due again until the interval elapses
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.purged, 0);
}

#[tokio::test]
async fn test_busy_flag_follows_queue_contents() {
    let mut h = Harness::new(&["0"], 1, None);
    assert!(!h.scheduler.tick().await.unwrap().busy);

    h.submit("exit", &["0", "1"]).await;
    assert!(h.scheduler.tick().await.unwrap().busy);

    h.run_to_idle().await;
    assert!(!h.scheduler.tick().await.unwrap().busy);
}

#[tokio::test]
async fn test_reset_after_fault_fails_running_jobs_and_frees_pool() {
    let mut h = Harness::new(&["0", "1"], 2, None);
    let a = h.submit("hang", &[]).await;
    let b = h.submit("hang", &[]).await;
    let queued = h.submit("hang", &[]).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.tracked_count(), 2);

    let failed = h.scheduler.reset_after_fault().await;

    assert_eq!(failed, 2);
    assert_eq!(h.scheduler.tracked_count(), 0);
    assert_eq!(h.pool.held_count().unwrap(), 0);
    assert_eq!(h.runner.live_count(), 0);
    for id in [&a, &b] {
        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure, Some(FailureReason::SchedulerRestart));
    }
    assert_eq!(h.job(&queued).await.status, JobStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_gives_up_after_repeated_faults() {
    let h = Harness::new(&["0"], 1, None);
    h.store.set_broken(true);
    let (_tx, token) = shutdown_channel();

    let result = run_supervised(h.scheduler, token).await;

    assert!(matches!(result, Err(crate::AppError::StoreFault(_))));
    assert_eq!(h.pool.held_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_tracked_processes() {
    let h = Harness::new(&["0"], 1, None);
    let id = h.submit("hang", &[]).await;
    let (tx, token) = shutdown_channel();

    let task = tokio::spawn(run_supervised(h.scheduler, token));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.runner.launches().len(), 1);

    tx.shutdown();
    task.await.unwrap().unwrap();

    assert_eq!(h.runner.terminations(), vec![id.clone()]);
    assert_eq!(h.runner.live_count(), 0);
    // Left Running for restart recovery to reclassify
    assert_eq!(h.store.get(&id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_submit_wakes_idle_loop() {
    let h = Harness::new(&["0"], 1, None);
    let (tx, token) = shutdown_channel();
    let runner = h.runner.clone();

    let task = tokio::spawn(run_supervised(h.scheduler, token));
    // Let the loop settle into its 5s idle sleep
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.service
        .submit(SubmitRequest::new("hang"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(runner.launches().len(), 1);
    tx.shutdown();
    task.await.unwrap().unwrap();
}
