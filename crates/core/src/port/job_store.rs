// Job Store Port (Interface)

use crate::domain::{Job, JobId, JobStatus};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Read-modify-write step applied atomically by [`JobStore::update`].
/// If it returns an error the stored job is left untouched.
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> crate::domain::error::Result<()> + Send>;

/// Exclusive owner of Job records.
///
/// Every read and write goes through the store, which serializes access
/// internally; callers only hold job ids and copies.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly submitted job; the store assigns its submission sequence
    async fn create(&self, job: Job) -> Result<Job>;

    /// Find job by ID (`AppError::NotFound` if unknown)
    async fn get(&self, id: &JobId) -> Result<Job>;

    /// Atomic read-modify-write, returns the committed job
    async fn update(&self, id: &JobId, mutate: JobMutation) -> Result<Job>;

    /// Jobs in submission order, optionally filtered by status
    async fn list(&self, filter: Option<JobStatus>) -> Result<Vec<Job>>;

    /// Earliest-submitted Pending job (FIFO head)
    async fn next_pending(&self) -> Result<Option<Job>>;

    /// Count jobs by status
    async fn count_by_status(&self, status: JobStatus) -> Result<usize>;

    /// Forget terminal jobs that finished more than `retention` before `now_millis`
    async fn purge_older_than(&self, retention: Duration, now_millis: i64) -> Result<usize>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::JobTable;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory store without persistence. Can be switched into a broken
    /// state to exercise fault handling.
    #[derive(Default)]
    pub struct InMemoryJobStore {
        table: Mutex<JobTable>,
        broken: AtomicBool,
    }

    impl InMemoryJobStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent call fail with `StoreFault`
        pub fn set_broken(&self, broken: bool) {
            self.broken.store(broken, Ordering::SeqCst);
        }

        fn with_table<T>(&self, f: impl FnOnce(&mut JobTable) -> Result<T>) -> Result<T> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(AppError::StoreFault("mock store is broken".to_string()));
            }
            let mut table = self.table.lock().unwrap();
            f(&mut table)
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn create(&self, job: Job) -> Result<Job> {
            self.with_table(|table| Ok(table.insert(job)?))
        }

        async fn get(&self, id: &JobId) -> Result<Job> {
            self.with_table(|table| {
                table
                    .get(id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))
            })
        }

        async fn update(&self, id: &JobId, mutate: JobMutation) -> Result<Job> {
            self.with_table(|table| {
                let mut draft = table
                    .get(id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
                mutate(&mut draft)?;
                table.replace(draft.clone());
                Ok(draft)
            })
        }

        async fn list(&self, filter: Option<JobStatus>) -> Result<Vec<Job>> {
            self.with_table(|table| {
                Ok(table
                    .iter()
                    .filter(|job| filter.map_or(true, |status| job.status == status))
                    .cloned()
                    .collect())
            })
        }

        async fn next_pending(&self) -> Result<Option<Job>> {
            self.with_table(|table| Ok(table.next_pending().cloned()))
        }

        async fn count_by_status(&self, status: JobStatus) -> Result<usize> {
            self.with_table(|table| Ok(table.count(status)))
        }

        async fn purge_older_than(&self, retention: Duration, now_millis: i64) -> Result<usize> {
            let cutoff = now_millis - retention.as_millis() as i64;
            self.with_table(|table| Ok(table.purge_finished_before(cutoff)))
        }
    }
}
