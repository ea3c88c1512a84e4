// Job table - submission-ordered in-memory index shared by store adapters

use std::collections::{BTreeMap, HashMap};

use crate::domain::error::{DomainError, Result};
use crate::domain::job::{Job, JobId, JobStatus};

/// Jobs keyed by submission sequence, with an id index on the side.
/// Iteration order is submission order.
#[derive(Debug, Default, Clone)]
pub struct JobTable {
    jobs: BTreeMap<u64, Job>,
    index: HashMap<JobId, u64>,
    next_seq: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted jobs, keeping their sequence numbers
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        let mut table = Self::new();
        for job in jobs {
            table.next_seq = table.next_seq.max(job.seq + 1);
            table.index.insert(job.id.clone(), job.seq);
            table.jobs.insert(job.seq, job);
        }
        table
    }

    /// Insert a new job, assigning the next sequence number
    pub fn insert(&mut self, mut job: Job) -> Result<Job> {
        if self.index.contains_key(&job.id) {
            return Err(DomainError::ValidationError(format!(
                "duplicate job id {}",
                job.id
            )));
        }
        job.seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(job.id.clone(), job.seq);
        self.jobs.insert(job.seq, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.index.get(id).and_then(|seq| self.jobs.get(seq))
    }

    /// Swap in a new version of an existing job. Returns false if unknown.
    pub fn replace(&mut self, job: Job) -> bool {
        match self.index.get(&job.id) {
            Some(seq) => {
                let seq = *seq;
                let mut job = job;
                job.seq = seq;
                self.jobs.insert(seq, job);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    /// Earliest-submitted Pending job
    pub fn next_pending(&self) -> Option<&Job> {
        self.iter().find(|job| job.status == JobStatus::Pending)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.iter().filter(|job| job.status == status).count()
    }

    /// Drop terminal jobs that finished before `cutoff_millis`
    pub fn purge_finished_before(&mut self, cutoff_millis: i64) -> usize {
        let expired: Vec<(u64, JobId)> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.is_terminal() && job.finished_at.is_some_and(|at| at < cutoff_millis)
            })
            .map(|(seq, job)| (*seq, job.id.clone()))
            .collect();

        for (seq, id) in &expired {
            self.jobs.remove(seq);
            self.index.remove(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Job> {
        self.jobs.values().cloned().collect()
    }
}
