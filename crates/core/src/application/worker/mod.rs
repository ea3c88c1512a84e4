// Scheduler Loop - reap, dispatch, sleep, housekeeping

pub mod constants;
mod shutdown;
mod supervisor;

#[cfg(test)]
mod scheduler_test;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use supervisor::run_supervised;

use crate::application::log_tail;
use crate::domain::{DeviceId, DevicePool, FailureReason, JobId, JobStatus};
use crate::error::Result;
use crate::port::{JobStore, ProcessHandle, ProcessRunner, ProcessState, TimeProvider};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Timing and limits for the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory receiving `<job_id>.log` files
    pub log_dir: PathBuf,
    pub busy_interval: Duration,
    pub idle_interval: Duration,
    pub housekeeping_interval: Duration,
    pub retention: Duration,
    /// Wall-clock limit per job; `None` means unlimited
    pub max_runtime: Option<Duration>,
}

impl SchedulerConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            busy_interval: BUSY_POLL_INTERVAL,
            idle_interval: IDLE_POLL_INTERVAL,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
            retention: TERMINAL_JOB_RETENTION,
            max_runtime: None,
        }
    }

    pub fn with_max_runtime(mut self, max_runtime: Option<Duration>) -> Self {
        self.max_runtime = max_runtime;
        self
    }
}

/// Outcome of one loop iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub dispatched: usize,
    pub purged: usize,
    /// Something is Pending or Running, so the next sleep is short
    pub busy: bool,
}

struct TrackedProcess {
    handle: Box<dyn ProcessHandle>,
    device: DeviceId,
    log_path: PathBuf,
    started_at: i64,
    terminating: bool,
    timed_out: bool,
}

/// The single background task that moves jobs through their lifecycle.
///
/// Only this loop acquires devices and only it (or its supervisor) releases
/// them, so the pool and the store cannot drift apart while it runs.
pub struct SchedulerLoop {
    store: Arc<dyn JobStore>,
    pool: Arc<DevicePool>,
    runner: Arc<dyn ProcessRunner>,
    time_provider: Arc<dyn TimeProvider>,
    wake: Arc<Notify>,
    config: SchedulerConfig,
    tracked: BTreeMap<JobId, TrackedProcess>,
    last_housekeeping: Option<i64>,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<DevicePool>,
        runner: Arc<dyn ProcessRunner>,
        time_provider: Arc<dyn TimeProvider>,
        wake: Arc<Notify>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pool,
            runner,
            time_provider,
            wake,
            config,
            tracked: BTreeMap::new(),
            last_housekeeping: None,
        }
    }

    /// Number of subprocesses currently supervised
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Run until shutdown. Returns an error only for faults that invalidate
    /// the loop's state; the supervisor decides what happens next.
    pub async fn run(&mut self, shutdown: &mut ShutdownToken) -> Result<()> {
        info!(
            log_dir = %self.config.log_dir.display(),
            max_runtime_secs = ?self.config.max_runtime.map(|d| d.as_secs()),
            "Scheduler loop started"
        );
        let wake = Arc::clone(&self.wake);

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let report = self.tick().await?;
            let pause = if report.busy {
                self.config.busy_interval
            } else {
                self.config.idle_interval
            };

            tokio::select! {
                _ = sleep(pause) => {},
                _ = wake.notified() => {
                    debug!("Scheduler woken early");
                },
                _ = shutdown.wait() => {
                    info!("Scheduler interrupted during sleep");
                    break;
                }
            }
        }

        let drained = self.drain().await;
        info!(
            terminated = drained.len(),
            "Scheduler loop stopped, running jobs left for restart recovery"
        );
        Ok(())
    }

    /// One iteration without the sleep
    pub async fn tick(&mut self) -> Result<TickReport> {
        let reaped = self.reap().await?;
        let dispatched = self.dispatch().await?;
        let purged = self.housekeeping().await?;
        let busy = !self.tracked.is_empty()
            || self.store.count_by_status(JobStatus::Pending).await? > 0;

        Ok(TickReport {
            reaped,
            dispatched,
            purged,
            busy,
        })
    }

    /// Poll every tracked process, finalize the ones that exited
    async fn reap(&mut self) -> Result<usize> {
        let now = self.time_provider.now_millis();
        let job_ids: Vec<JobId> = self.tracked.keys().cloned().collect();
        let mut reaped = 0;

        for job_id in job_ids {
            let state = match self.tracked.get_mut(&job_id) {
                Some(tracked) => tracked.handle.poll(),
                None => continue,
            };

            match state {
                ProcessState::Running => self.supervise_running(&job_id, now).await?,
                ProcessState::Exited(exit_code) => {
                    if let Some(tracked) = self.tracked.remove(&job_id) {
                        self.finalize(&job_id, tracked, exit_code).await?;
                        reaped += 1;
                    }
                }
            }
        }

        Ok(reaped)
    }

    /// Act on cancel requests and runtime limits for a live process
    async fn supervise_running(&mut self, job_id: &JobId, now: i64) -> Result<()> {
        let cancel_requested = match self.store.get(job_id).await {
            Ok(job) => job.cancel_requested,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Tracked job missing from store");
                false
            }
        };
        let max_runtime = self.config.max_runtime;

        let tracked = match self.tracked.get_mut(job_id) {
            Some(tracked) if !tracked.terminating => tracked,
            _ => return Ok(()),
        };

        if cancel_requested {
            info!(job_id = %job_id, pid = tracked.handle.pid(), "Cancel requested, terminating process");
            tracked.handle.terminate();
            tracked.terminating = true;
        } else if let Some(limit) = max_runtime {
            let elapsed_ms = now - tracked.started_at;
            if elapsed_ms > limit.as_millis() as i64 {
                warn!(
                    job_id = %job_id,
                    pid = tracked.handle.pid(),
                    elapsed_ms,
                    limit_secs = limit.as_secs(),
                    "Job exceeded maximum runtime, terminating"
                );
                tracked.handle.terminate();
                tracked.terminating = true;
                tracked.timed_out = true;
            }
        }

        Ok(())
    }

    /// Record the terminal state of an exited process and free its device
    async fn finalize(
        &mut self,
        job_id: &JobId,
        tracked: TrackedProcess,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let now = self.time_provider.now_millis();
        let timed_out = tracked.timed_out;
        let limit_ms = self
            .config
            .max_runtime
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        let excerpt = if exit_code == Some(0) && !timed_out {
            Vec::new()
        } else {
            read_excerpt(&tracked.log_path).await
        };

        let result = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    job.clear_pid();
                    if job.cancel_requested {
                        return job.cancel(exit_code, now);
                    }
                    if timed_out {
                        return job.fail(FailureReason::Timeout { limit_ms }, exit_code, excerpt, now);
                    }
                    match exit_code {
                        Some(0) => job.complete(0, now),
                        Some(code) => job.fail(FailureReason::ExitCode(code), Some(code), excerpt, now),
                        None => job.fail(FailureReason::Signal, None, excerpt, now),
                    }
                }),
            )
            .await;

        self.pool.release(&tracked.device)?;

        match result {
            Ok(job) => info!(
                job_id = %job_id,
                status = %job.status,
                exit_code = ?job.exit_code,
                device = %tracked.device,
                duration_ms = ?job.duration_ms(),
                "Job finished"
            ),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to record job completion"),
        }
        Ok(())
    }

    /// Start Pending jobs in submission order while devices are available
    async fn dispatch(&mut self) -> Result<usize> {
        let mut dispatched = 0;

        loop {
            let job = match self.store.next_pending().await? {
                Some(job) => job,
                None => break,
            };
            let device = match self.pool.acquire(&job.id)? {
                Some(device) => device,
                None => break,
            };

            let now = self.time_provider.now_millis();
            let log_path = self.config.log_dir.join(format!("{}.log", job.id));
            let start_device = device.clone();
            let start_log = log_path.to_string_lossy().into_owned();

            let started = self
                .store
                .update(
                    &job.id,
                    Box::new(move |job| job.start(start_device, start_log, now)),
                )
                .await;

            let job = match started {
                Ok(job) => job,
                Err(e) => {
                    self.pool.release(&device)?;
                    if e.is_fatal() {
                        return Err(e);
                    }
                    // Cancelled between selection and transition
                    debug!(job_id = %job.id, error = %e, "Job left Pending before start");
                    continue;
                }
            };

            match self
                .runner
                .start(&job.id, &job.command, &device, &log_path)
                .await
            {
                Ok(handle) => {
                    let pid = handle.pid();
                    info!(
                        job_id = %job.id,
                        job_name = %job.job_name,
                        device = %device,
                        pid,
                        command = %job.command.display_line(),
                        "Job started"
                    );
                    self.tracked.insert(
                        job.id.clone(),
                        TrackedProcess {
                            handle,
                            device,
                            log_path,
                            started_at: job.started_at.unwrap_or(now),
                            terminating: false,
                            timed_out: false,
                        },
                    );

                    let attached = self
                        .store
                        .update(
                            &job.id,
                            Box::new(move |job| {
                                job.attach_pid(pid);
                                Ok(())
                            }),
                        )
                        .await;
                    if let Err(e) = attached {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(job_id = %job.id, error = %e, "Failed to record pid");
                    }
                    dispatched += 1;
                }
                Err(launch_error) => {
                    error!(
                        job_id = %job.id,
                        device = %device,
                        error = %launch_error,
                        "Job failed to launch"
                    );
                    let reason = FailureReason::LaunchFailure(launch_error.to_string());
                    let excerpt = read_excerpt(&log_path).await;
                    let failed = self
                        .store
                        .update(
                            &job.id,
                            Box::new(move |job| job.fail(reason, None, excerpt, now)),
                        )
                        .await;

                    self.pool.release(&device)?;
                    if let Err(e) = failed {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(job_id = %job.id, error = %e, "Failed to record launch failure");
                    }
                }
            }
        }

        Ok(dispatched)
    }

    /// Purge expired terminal jobs once per housekeeping interval
    async fn housekeeping(&mut self) -> Result<usize> {
        let now = self.time_provider.now_millis();
        let interval_ms = self.config.housekeeping_interval.as_millis() as i64;
        if self
            .last_housekeeping
            .is_some_and(|last| now - last < interval_ms)
        {
            return Ok(0);
        }
        self.last_housekeeping = Some(now);

        let purged = self
            .store
            .purge_older_than(self.config.retention, now)
            .await?;
        if purged > 0 {
            info!(purged, retention_secs = self.config.retention.as_secs(), "Purged expired jobs");
        }
        Ok(purged)
    }

    /// Terminate every tracked process and wait for the group to exit.
    /// Devices are released; job records are left untouched.
    async fn drain(&mut self) -> Vec<JobId> {
        if self.tracked.is_empty() {
            return Vec::new();
        }

        for (job_id, tracked) in self.tracked.iter_mut() {
            if !tracked.terminating {
                info!(job_id = %job_id, pid = tracked.handle.pid(), "Terminating process");
                tracked.handle.terminate();
                tracked.terminating = true;
            }
        }

        let mut drained = Vec::with_capacity(self.tracked.len());
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let exited: Vec<JobId> = self
                .tracked
                .iter_mut()
                .filter_map(|(job_id, tracked)| {
                    (tracked.handle.poll() != ProcessState::Running).then(|| job_id.clone())
                })
                .collect();
            for job_id in exited {
                if let Some(tracked) = self.tracked.remove(&job_id) {
                    self.release_quietly(&tracked.device);
                    drained.push(job_id);
                }
            }
            if self.tracked.is_empty() || Instant::now() >= deadline {
                break;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }

        for (job_id, tracked) in std::mem::take(&mut self.tracked) {
            error!(job_id = %job_id, pid = tracked.handle.pid(), "Process did not exit after termination");
            self.release_quietly(&tracked.device);
            drained.push(job_id);
        }
        drained
    }

    fn release_quietly(&self, device: &DeviceId) {
        if let Err(e) = self.pool.release(device) {
            warn!(device = %device, error = %e, "Failed to release device");
        }
    }

    /// Put the loop back into a clean state after a fatal fault: every
    /// process it started is stopped, every Running job is marked
    /// `Failed{SchedulerRestart}` and every device is freed.
    pub async fn reset_after_fault(&mut self) -> usize {
        self.drain().await;
        let now = self.time_provider.now_millis();
        let mut failed = 0;

        match self.store.list(Some(JobStatus::Running)).await {
            Ok(running) => {
                for job in running {
                    let excerpt = match &job.log_path {
                        Some(path) => read_excerpt(Path::new(path)).await,
                        None => Vec::new(),
                    };
                    let result = self
                        .store
                        .update(
                            &job.id,
                            Box::new(move |job| {
                                job.clear_pid();
                                job.fail(FailureReason::SchedulerRestart, None, excerpt, now)
                            }),
                        )
                        .await;
                    match result {
                        Ok(_) => failed += 1,
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "Failed to mark job after scheduler fault")
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "Store unavailable during scheduler reset"),
        }

        let freed = self.pool.reset();
        warn!(failed_jobs = failed, freed_devices = freed, "Scheduler state reset after fault");
        failed
    }
}

/// Last lines of a log for a failed job; unreadable logs give no excerpt
async fn read_excerpt(log_path: &Path) -> Vec<String> {
    match log_tail::tail_lines(log_path, LOG_EXCERPT_LINES).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(log_path = %log_path.display(), error = %e, "Failed to read log excerpt");
            Vec::new()
        }
    }
}
