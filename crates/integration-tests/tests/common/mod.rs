//! Shared harness: a real JSON store, real `sh` subprocesses and a running
//! supervised scheduler loop.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gpuqueue_core::application::{
    run_supervised, shutdown_channel, JobSummary, QueueService, SchedulerConfig, ShutdownSender,
    SubmitRequest,
};
use gpuqueue_core::domain::{DeviceId, DevicePool, JobId};
use gpuqueue_core::port::{StaticDevices, SystemTimeProvider, UuidProvider};
use gpuqueue_core::Result;
use gpuqueue_infra_json::JsonJobStore;
use gpuqueue_infra_system::{SubprocessRunner, DEFAULT_DEVICE_ENV};
use tokio::task::JoinHandle;

pub struct RunningQueue {
    pub service: Arc<QueueService>,
    pub pool: Arc<DevicePool>,
    pub store: Arc<JsonJobStore>,
    shutdown: ShutdownSender,
    handle: JoinHandle<Result<()>>,
}

pub struct QueueOptions {
    pub devices: Vec<&'static str>,
    pub max_concurrent: usize,
    pub max_runtime: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            devices: vec!["0"],
            max_concurrent: 1,
            max_runtime: None,
        }
    }
}

pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("queue_state.json")
}

pub async fn build_service(
    dir: &Path,
    options: &QueueOptions,
) -> (Arc<QueueService>, Arc<DevicePool>, Arc<JsonJobStore>) {
    let time_provider = Arc::new(SystemTimeProvider);
    let store = Arc::new(
        JsonJobStore::open(snapshot_path(dir), time_provider.as_ref())
            .await
            .unwrap(),
    );
    let devices: Vec<DeviceId> = options.devices.iter().map(|d| DeviceId::new(*d)).collect();
    let pool = Arc::new(DevicePool::new(devices.clone(), options.max_concurrent));

    let service = QueueService::new(
        store.clone(),
        Arc::clone(&pool),
        Arc::new(StaticDevices::new(devices)),
        Arc::new(UuidProvider),
        time_provider,
    );
    (Arc::new(service), pool, store)
}

pub async fn start_queue(dir: &Path, options: QueueOptions) -> RunningQueue {
    let (service, pool, store) = build_service(dir, &options).await;

    let mut config = SchedulerConfig::new(dir.join("logs")).with_max_runtime(options.max_runtime);
    config.busy_interval = Duration::from_millis(20);
    config.idle_interval = Duration::from_millis(50);

    let runner = Arc::new(SubprocessRunner::new(
        DEFAULT_DEVICE_ENV,
        Duration::from_millis(500),
    ));
    let scheduler = service.scheduler(runner, config);
    let (shutdown, token) = shutdown_channel();
    let handle = tokio::spawn(run_supervised(scheduler, token));

    RunningQueue {
        service,
        pool,
        store,
        shutdown,
        handle,
    }
}

impl RunningQueue {
    pub async fn submit_sh(&self, script: &str) -> JobId {
        self.service
            .submit(SubmitRequest::new("sh").args(["-c", script]))
            .await
            .unwrap()
    }

    /// Poll until the job is terminal or `limit` passes
    pub async fn wait_terminal(&self, id: &JobId, limit: Duration) -> JobSummary {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let summary = self.service.status(id).await.unwrap();
            if summary.status.is_terminal() {
                return summary;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} still {:?} after {:?}",
                id,
                summary.status,
                limit
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_running(&self, id: &JobId, limit: Duration) -> JobSummary {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let summary = self.service.status(id).await.unwrap();
            if summary.status == gpuqueue_core::domain::JobStatus::Running {
                return summary;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} never started",
                id
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until nothing is Pending or Running and every device is free.
    /// Devices are released just after the terminal status is recorded.
    pub async fn wait_idle(&self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.service.queue_status().await.unwrap().idle {
            assert!(tokio::time::Instant::now() < deadline, "queue never went idle");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(self) {
        self.shutdown.shutdown();
        self.handle.await.unwrap().unwrap();
        self.store.flush().await.unwrap();
    }
}
