// Submit Use Case

use crate::application::worker::constants::MAX_JOB_NAME_LEN;
use crate::domain::{Job, JobCommand, JobId};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, JobStore, TimeProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Submit request: a fully-resolved command plus an optional label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub job_name: Option<String>,
}

impl SubmitRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            job_name: None,
        }
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

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    fn into_command(self) -> (JobCommand, Option<String>) {
        let command = JobCommand {
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
        };
        (command, self.job_name)
    }
}

pub(crate) fn validate_request(req: &SubmitRequest) -> Result<()> {
    if req.program.trim().is_empty() {
        return Err(AppError::Validation("program cannot be empty".to_string()));
    }
    if let Some(name) = &req.job_name {
        if name.chars().count() > MAX_JOB_NAME_LEN {
            return Err(AppError::Validation(format!(
                "job name too long (max {} characters)",
                MAX_JOB_NAME_LEN
            )));
        }
    }
    if req.env.keys().any(|key| key.is_empty() || key.contains('=')) {
        return Err(AppError::Validation(
            "environment variable names must be non-empty and contain no '='".to_string(),
        ));
    }
    Ok(())
}

/// Execute submit use case
///
/// # Arguments
///
/// * `store` - Job store
/// * `id_provider` - ID generator (injected for determinism)
/// * `time_provider` - Time provider (injected for determinism)
/// * `req` - Submit request
pub async fn execute(
    store: &dyn JobStore,
    id_provider: &dyn IdProvider,
    time_provider: &dyn TimeProvider,
    req: SubmitRequest,
) -> Result<JobId> {
    validate_request(&req)?;

    let job_id = id_provider.generate_id();
    let submitted_at = time_provider.now_millis();
    let (command, job_name) = req.into_command();

    let job = store
        .create(Job::new(job_id, submitted_at, command, job_name))
        .await?;

    info!(
        job_id = %job.id,
        job_name = %job.job_name,
        seq = job.seq,
        command = %job.command.display_line(),
        "Job submitted"
    );
    Ok(job.id)
}
