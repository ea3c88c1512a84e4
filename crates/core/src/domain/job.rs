// Job Domain Model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::device::DeviceId;
use crate::domain::error::{DomainError, Result};

/// Job ID (UUID v4)
pub type JobId = String;

/// Job status. Transitions are restricted by [`JobStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        match self {
            JobStatus::Pending | JobStatus::Running => false,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => true,
        }
    }

    /// Transition table: Pending -> Running -> {Completed, Failed, Cancelled},
    /// plus Pending -> Cancelled. Nothing ever moves backward.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Pending, Pending) | (Pending, Completed) | (Pending, Failed) => false,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Running, Pending) | (Running, Running) => false,
            (Completed, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Fully-resolved external invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl JobCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program and arguments on one line, for logs
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    ExitCode(i32),
    Signal,
    LaunchFailure(String),
    Interrupted,
    Timeout { limit_ms: i64 },
    SchedulerRestart,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ExitCode(code) => write!(f, "process exited with code {}", code),
            FailureReason::Signal => write!(f, "process was killed by a signal"),
            FailureReason::LaunchFailure(msg) => write!(f, "launch failed: {}", msg),
            FailureReason::Interrupted => write!(f, "interrupted by restart"),
            FailureReason::Timeout { limit_ms } => {
                write!(f, "exceeded maximum runtime of {}s", limit_ms / 1000)
            }
            FailureReason::SchedulerRestart => {
                write!(f, "scheduler restarted while the job was running")
            }
        }
    }
}

/// Job Entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Submission order, assigned by the store
    pub seq: u64,
    pub job_name: String,
    pub status: JobStatus,
    pub command: JobCommand,
    pub assigned_device: Option<DeviceId>,

    pub submitted_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,

    pub exit_code: Option<i32>,
    pub log_path: Option<String>,
    pub pid: Option<u32>,

    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub log_excerpt: Vec<String>,
}

impl Job {
    /// Create a Pending job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `submitted_at` - Submission timestamp in epoch ms (injected, not system time)
    /// * `command` - Resolved invocation
    /// * `job_name` - Label; `job_<id prefix>` when absent
    pub fn new(
        id: impl Into<String>,
        submitted_at: i64,
        command: JobCommand,
        job_name: Option<String>,
    ) -> Self {
        let id = id.into();
        let job_name = job_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("job_{}", id.chars().take(8).collect::<String>()));

        Self {
            id,
            seq: 0,
            job_name,
            status: JobStatus::Pending,
            command,
            assigned_device: None,
            submitted_at,
            started_at: None,
            finished_at: None,
            exit_code: None,
            log_path: None,
            pid: None,
            cancel_requested: false,
            failure: None,
            log_excerpt: Vec::new(),
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Timestamps never run backwards relative to earlier lifecycle stamps
    fn clamp_finish(&self, now_millis: i64) -> i64 {
        now_millis.max(self.started_at.unwrap_or(self.submitted_at))
    }

    fn finish(&mut self, next: JobStatus, now_millis: i64) -> Result<()> {
        self.transition(next)?;
        self.finished_at = Some(self.clamp_finish(now_millis));
        self.assigned_device = None;
        Ok(())
    }

    /// Pending -> Running on `device`, logging to `log_path`
    pub fn start(&mut self, device: DeviceId, log_path: String, now_millis: i64) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now_millis.max(self.submitted_at));
        self.assigned_device = Some(device);
        self.log_path = Some(log_path);
        Ok(())
    }

    pub fn attach_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    pub fn clear_pid(&mut self) {
        self.pid = None;
    }

    /// Ask a Running job to stop; the scheduler finalizes it as Cancelled
    pub fn request_cancel(&mut self) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: "CANCEL_REQUESTED".to_string(),
            });
        }
        self.cancel_requested = true;
        Ok(())
    }

    /// Pending or Running -> Cancelled
    pub fn cancel(&mut self, exit_code: Option<i32>, now_millis: i64) -> Result<()> {
        self.finish(JobStatus::Cancelled, now_millis)?;
        self.exit_code = exit_code;
        Ok(())
    }

    /// Running -> Completed
    pub fn complete(&mut self, exit_code: i32, now_millis: i64) -> Result<()> {
        self.finish(JobStatus::Completed, now_millis)?;
        self.exit_code = Some(exit_code);
        Ok(())
    }

    /// Running -> Failed with a diagnosis
    pub fn fail(
        &mut self,
        reason: FailureReason,
        exit_code: Option<i32>,
        log_excerpt: Vec<String>,
        now_millis: i64,
    ) -> Result<()> {
        self.finish(JobStatus::Failed, now_millis)?;
        self.failure = Some(reason);
        self.exit_code = exit_code;
        self.log_excerpt = log_excerpt;
        Ok(())
    }

    /// Reclassify a job that was Running when the previous process died.
    /// The pid is kept so recovery can look for an orphaned subprocess.
    pub fn interrupt(&mut self, now_millis: i64) -> Result<()> {
        self.fail(FailureReason::Interrupted, None, Vec::new(), now_millis)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time spent Running, once finished
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}
