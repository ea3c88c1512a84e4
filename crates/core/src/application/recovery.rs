// Restart recovery - orphaned subprocesses of interrupted jobs
use crate::domain::{FailureReason, JobStatus};
use crate::error::Result;
use crate::port::{JobStore, ProcessRunner};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Recovery service
///
/// The store has already reclassified every job that was Running when the
/// previous daemon died as `Failed{Interrupted}`, keeping its pid. This
/// service makes sure none of those processes are still burning a device.
pub struct RecoveryService {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn ProcessRunner>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { store, runner }
    }

    /// Kill surviving subprocesses of interrupted jobs and forget their pids.
    ///
    /// A pid is only killed when the runner confirms it still belongs to the
    /// job, so a recycled pid is left alone.
    ///
    /// # Returns
    /// Number of processes killed
    pub async fn reap_orphans(&self) -> Result<usize> {
        let failed = self.store.list(Some(JobStatus::Failed)).await?;
        let mut killed = 0;

        for job in failed {
            if job.failure != Some(FailureReason::Interrupted) {
                continue;
            }
            let pid = match job.pid {
                Some(pid) => pid,
                None => continue,
            };

            if self.runner.is_job_process(pid, &job.id).await {
                warn!(job_id = %job.id, pid, "Orphaned subprocess still alive, killing");
                match self.runner.kill_orphan(pid).await {
                    Ok(()) => killed += 1,
                    Err(e) => {
                        error!(job_id = %job.id, pid, error = %e, "Failed to kill orphaned process")
                    }
                }
            }

            self.store
                .update(
                    &job.id,
                    Box::new(|job| {
                        job.clear_pid();
                        Ok(())
                    }),
                )
                .await?;
        }

        info!(killed, "Orphan recovery complete");
        Ok(killed)
    }
}
