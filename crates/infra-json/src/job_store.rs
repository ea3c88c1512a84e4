// JSON snapshot JobStore Implementation

use crate::snapshot;
use async_trait::async_trait;
use gpuqueue_core::domain::{Job, JobId, JobStatus, JobTable};
use gpuqueue_core::error::{AppError, Result};
use gpuqueue_core::port::{JobMutation, JobStore, TimeProvider};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Committed table tagged with its commit generation
type Committed = (u64, Arc<Vec<Job>>);

/// Outcome of the flusher's most recent write
#[derive(Debug, Clone, Default)]
struct Flushed {
    generation: u64,
    error: Option<String>,
}

struct Flusher {
    committed: watch::Sender<Committed>,
    flushed: watch::Receiver<Flushed>,
}

struct State {
    table: JobTable,
    generation: u64,
}

/// Job store holding the table in memory and mirroring committed mutations
/// to a JSON snapshot file.
///
/// The in-memory table is authoritative. A mutation commits under the table
/// lock and hands the new table to a single background flusher, so callers
/// never wait on the disk. The flusher always writes the latest committed
/// table; intermediate tables may be skipped but never written out of order.
pub struct JsonJobStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
    flusher: Option<Flusher>,
}

impl JsonJobStore {
    /// Open (or create) the store at `path`.
    ///
    /// Jobs that were Running when the previous process stopped are
    /// reclassified as `Failed{Interrupted}` and the result is written back
    /// before the store is handed out. Must be called within a tokio runtime.
    pub async fn open(path: impl Into<PathBuf>, time_provider: &dyn TimeProvider) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || snapshot::load(&load_path))
            .await
            .map_err(|e| AppError::Internal(format!("snapshot load task failed: {}", e)))??;

        let mut table = match loaded {
            Some(jobs) => JobTable::from_jobs(jobs),
            None => {
                info!(path = %path.display(), "No job snapshot found, starting empty");
                JobTable::new()
            }
        };

        let interrupted = reconcile(&mut table, time_provider.now_millis());
        info!(
            path = %path.display(),
            jobs = table.len(),
            interrupted,
            "Job store opened"
        );

        if interrupted > 0 {
            write_snapshot(path.clone(), Arc::new(table.to_vec())).await?;
        }

        let (committed_tx, committed_rx) = watch::channel((0, Arc::new(Vec::new())));
        let (flushed_tx, flushed_rx) = watch::channel(Flushed::default());
        tokio::spawn(run_flusher(path.clone(), committed_rx, flushed_tx));

        Ok(Self {
            path: Some(path),
            state: Mutex::new(State { table, generation: 0 }),
            flusher: Some(Flusher {
                committed: committed_tx,
                flushed: flushed_rx,
            }),
        })
    }

    /// Store without a backing file (tests, dry runs)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State {
                table: JobTable::new(),
                generation: 0,
            }),
            flusher: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Wait until every mutation committed so far is on disk.
    ///
    /// Returns the error of the last write attempt if it failed.
    pub async fn flush(&self) -> Result<()> {
        let flusher = match &self.flusher {
            Some(flusher) => flusher,
            None => return Ok(()),
        };
        let target = self.lock_state()?.generation;

        let mut flushed = flusher.flushed.clone();
        let outcome = flushed
            .wait_for(|flushed| flushed.generation >= target)
            .await
            .map_err(|_| AppError::StoreFault("snapshot flusher stopped".to_string()))?
            .clone();

        match outcome.error {
            Some(e) => Err(AppError::StoreFault(format!("snapshot write failed: {}", e))),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AppError::StoreFault("job table lock poisoned".to_string()))
    }

    /// Record a committed mutation. Runs under the table lock so the flusher
    /// sees tables in commit order.
    fn commit(&self, state: &mut State) {
        state.generation += 1;
        if let Some(flusher) = &self.flusher {
            flusher
                .committed
                .send_replace((state.generation, Arc::new(state.table.to_vec())));
        }
    }
}

async fn write_snapshot(path: PathBuf, jobs: Arc<Vec<Job>>) -> Result<()> {
    tokio::task::spawn_blocking(move || snapshot::write_atomic(&path, &jobs))
        .await
        .map_err(|e| AppError::Internal(format!("snapshot write task failed: {}", e)))?
}

/// Write the latest committed table until the store is dropped.
///
/// A failed write is logged and made good by the next one, which carries the
/// full table.
async fn run_flusher(
    path: PathBuf,
    mut committed: watch::Receiver<Committed>,
    flushed: watch::Sender<Flushed>,
) {
    while committed.changed().await.is_ok() {
        let (generation, jobs) = committed.borrow_and_update().clone();

        let error = match write_snapshot(path.clone(), jobs).await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    path = %path.display(),
                    generation,
                    error = %e,
                    "Failed to write job snapshot, will retry on next change"
                );
                Some(e.to_string())
            }
        };
        flushed.send_replace(Flushed { generation, error });
    }
    debug!(path = %path.display(), "Snapshot flusher stopped");
}

/// Running jobs cannot survive their supervising process
fn reconcile(table: &mut JobTable, now_millis: i64) -> usize {
    let mut interrupted = 0;
    for job in table.iter_mut() {
        if job.status != JobStatus::Running {
            continue;
        }
        match job.interrupt(now_millis) {
            Ok(()) => {
                warn!(
                    job_id = %job.id,
                    pid = ?job.pid,
                    "Job was running at last shutdown, marked interrupted"
                );
                interrupted += 1;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to reconcile job"),
        }
    }
    interrupted
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        let mut state = self.lock_state()?;
        let created = state.table.insert(job)?;
        self.commit(&mut state);
        Ok(created)
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.lock_state()?
            .table
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))
    }

    async fn update(&self, id: &JobId, mutate: JobMutation) -> Result<Job> {
        let mut state = self.lock_state()?;
        let current = state
            .table
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;

        let mut draft = current.clone();
        mutate(&mut draft)?;
        if &draft == current {
            return Ok(draft);
        }
        state.table.replace(draft.clone());
        self.commit(&mut state);
        Ok(draft)
    }

    async fn list(&self, filter: Option<JobStatus>) -> Result<Vec<Job>> {
        let state = self.lock_state()?;
        Ok(state
            .table
            .iter()
            .filter(|job| filter.map_or(true, |status| job.status == status))
            .cloned()
            .collect())
    }

    async fn next_pending(&self) -> Result<Option<Job>> {
        Ok(self.lock_state()?.table.next_pending().cloned())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<usize> {
        Ok(self.lock_state()?.table.count(status))
    }

    async fn purge_older_than(&self, retention: Duration, now_millis: i64) -> Result<usize> {
        let cutoff = now_millis - retention.as_millis() as i64;
        let mut state = self.lock_state()?;
        let purged = state.table.purge_finished_before(cutoff);
        if purged > 0 {
            self.commit(&mut state);
        }
        Ok(purged)
    }
}
