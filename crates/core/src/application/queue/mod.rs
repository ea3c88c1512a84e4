// Queue Service - the facade callers use to talk to the scheduler

pub mod submit;

pub use submit::SubmitRequest;

use crate::application::log_tail;
use crate::application::worker::constants::{DEFAULT_LOG_TAIL_LINES, MAX_LOG_TAIL_LINES};
use crate::application::worker::{SchedulerConfig, SchedulerLoop};
use crate::domain::{
    DeviceId, DevicePool, DomainError, FailureReason, Job, JobCommand, JobId, JobStatus,
    PoolSnapshot,
};
use crate::error::{AppError, Result};
use crate::port::{DeviceDiscovery, IdProvider, JobStore, ProcessRunner, TimeProvider};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Caller-facing view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub job_name: String,
    pub status: JobStatus,
    pub command: JobCommand,
    pub assigned_device: Option<DeviceId>,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub log_path: Option<String>,
    pub cancel_requested: bool,
    pub failure: Option<FailureReason>,
    pub log_excerpt: Vec<String>,
    /// 1-based position among Pending jobs, 0 while Running, absent once terminal
    pub queue_position: Option<usize>,
}

impl JobSummary {
    fn from_job(job: Job, queue_position: Option<usize>) -> Self {
        let duration_ms = job.duration_ms();
        Self {
            id: job.id,
            job_name: job.job_name,
            status: job.status,
            command: job.command,
            assigned_device: job.assigned_device,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms,
            exit_code: job.exit_code,
            log_path: job.log_path,
            cancel_requested: job.cancel_requested,
            failure: job.failure,
            log_excerpt: job.log_excerpt,
            queue_position,
        }
    }
}

/// Result of a cancel call. Cancelling a finished job is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    /// Pending job cancelled on the spot
    Cancelled,
    /// Running job will be terminated by the scheduler
    CancelRequested,
    AlreadyTerminal,
}

/// Last lines of a job's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTail {
    pub job_id: JobId,
    pub log_path: Option<String>,
    pub lines: Vec<String>,
}

impl LogTail {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Device set replacement; `devices: None` re-runs discovery and
/// `max_concurrent: None` keeps the current limit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureRequest {
    #[serde(default)]
    pub devices: Option<Vec<String>>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Whole-queue overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub counts: StatusCounts,
    pub queue_length: usize,
    pub pool: PoolSnapshot,
    /// Nothing Pending or Running and every device free
    pub idle: bool,
}

/// Queue Service
///
/// Cheap to share behind an `Arc`; every call goes straight to the store or
/// the pool and never waits on a subprocess.
pub struct QueueService {
    store: Arc<dyn JobStore>,
    pool: Arc<DevicePool>,
    discovery: Arc<dyn DeviceDiscovery>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    wake: Arc<Notify>,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<DevicePool>,
        discovery: Arc<dyn DeviceDiscovery>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            pool,
            discovery,
            id_provider,
            time_provider,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Build the scheduler loop sharing this service's store, pool and wake-up signal
    pub fn scheduler(&self, runner: Arc<dyn ProcessRunner>, config: SchedulerConfig) -> SchedulerLoop {
        SchedulerLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            runner,
            Arc::clone(&self.time_provider),
            Arc::clone(&self.wake),
            config,
        )
    }

    /// Submit a new job
    pub async fn submit(&self, req: SubmitRequest) -> Result<JobId> {
        let job_id = submit::execute(
            self.store.as_ref(),
            self.id_provider.as_ref(),
            self.time_provider.as_ref(),
            req,
        )
        .await?;
        self.wake.notify_one();
        Ok(job_id)
    }

    pub async fn status(&self, id: &JobId) -> Result<JobSummary> {
        let job = self.store.get(id).await?;
        let position = match job.status {
            JobStatus::Pending => self
                .store
                .list(Some(JobStatus::Pending))
                .await?
                .iter()
                .position(|pending| pending.id == job.id)
                .map(|idx| idx + 1),
            JobStatus::Running => Some(0),
            _ => None,
        };
        Ok(JobSummary::from_job(job, position))
    }

    /// Tail of the job's log; `None` asks for the default line count
    pub async fn log(&self, id: &JobId, tail_lines: Option<usize>) -> Result<LogTail> {
        let job = self.store.get(id).await?;
        let wanted = tail_lines
            .unwrap_or(DEFAULT_LOG_TAIL_LINES)
            .min(MAX_LOG_TAIL_LINES);

        let lines = match &job.log_path {
            Some(path) => log_tail::tail_lines(Path::new(path), wanted).await?,
            None => Vec::new(),
        };

        Ok(LogTail {
            job_id: job.id,
            log_path: job.log_path,
            lines,
        })
    }

    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let current = self.store.get(id).await?;
        if current.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        let now = self.time_provider.now_millis();
        let result = self
            .store
            .update(
                id,
                Box::new(move |job| match job.status {
                    JobStatus::Pending => job.cancel(None, now),
                    _ => job.request_cancel(),
                }),
            )
            .await;

        let outcome = match result {
            Ok(job) if job.status == JobStatus::Cancelled => CancelOutcome::Cancelled,
            Ok(_) => CancelOutcome::CancelRequested,
            // Finished between the read and the update
            Err(AppError::Domain(DomainError::InvalidStateTransition { .. })) => {
                CancelOutcome::AlreadyTerminal
            }
            Err(e) => return Err(e),
        };

        info!(job_id = %id, outcome = ?outcome, "Cancel handled");
        if outcome != CancelOutcome::AlreadyTerminal {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Jobs in submission order
    pub async fn list(&self, status_filter: Option<JobStatus>) -> Result<Vec<JobSummary>> {
        let jobs = self.store.list(status_filter).await?;
        let mut pending_seen = 0;

        Ok(jobs
            .into_iter()
            .map(|job| {
                let position = match job.status {
                    JobStatus::Pending => {
                        pending_seen += 1;
                        Some(pending_seen)
                    }
                    JobStatus::Running => Some(0),
                    _ => None,
                };
                JobSummary::from_job(job, position)
            })
            .collect())
    }

    /// Replace the device pool. Rejected with `PoolBusy` while any job holds a device.
    pub async fn configure(&self, req: ConfigureRequest) -> Result<PoolSnapshot> {
        let max_concurrent = match req.max_concurrent {
            Some(0) => {
                return Err(AppError::Validation(
                    "max_concurrent must be at least 1".to_string(),
                ))
            }
            Some(n) => n,
            None => self.pool.capacity()?,
        };

        let devices = match req.devices {
            Some(list) => list
                .iter()
                .map(|d| d.trim())
                .filter(|d| !d.is_empty())
                .map(DeviceId::new)
                .collect(),
            None => self.discovery.discover().await,
        };

        let snapshot = self.pool.reconfigure(devices, max_concurrent)?;
        self.wake.notify_one();
        Ok(snapshot)
    }

    /// Current device pool
    pub async fn resources(&self) -> Result<PoolSnapshot> {
        Ok(self.pool.snapshot()?)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let mut counts = StatusCounts::default();
        for status in JobStatus::ALL {
            let n = self.store.count_by_status(status).await?;
            match status {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
                JobStatus::Cancelled => counts.cancelled = n,
            }
        }

        let pool = self.pool.snapshot()?;
        let idle = counts.pending == 0 && counts.running == 0 && pool.held_count() == 0;

        Ok(QueueStatus {
            queue_length: counts.pending,
            counts,
            pool,
            idle,
        })
    }
}
