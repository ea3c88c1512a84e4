//! RPC Request/Response Types
//!
//! Method parameters and results. Results that already have a caller-facing
//! shape in the core crate (`JobSummary`, `LogTail`, `PoolSnapshot`,
//! `QueueStatus`) are returned as-is. `queue.resources.v1` and
//! `queue.overview.v1` take no parameters.

use gpuqueue_core::application::CancelOutcome;
use gpuqueue_core::domain::{JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// queue.submit.v1 - Submit a command
#[derive(Debug, Deserialize)]
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// queue.status.v1 - Describe one job
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub job_id: JobId,
}

/// queue.log.v1 - Tail a job's log
#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub lines: Option<usize>,
}

/// queue.cancel.v1 - Cancel a job
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: CancelOutcome,
}

/// queue.list.v1 - List jobs, optionally by status
#[derive(Debug, Default, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub status: Option<JobStatus>,
}

/// queue.configure.v1 - Replace the device set
#[derive(Debug, Default, Deserialize)]
pub struct ConfigureRequest {
    #[serde(default)]
    pub devices: Option<Vec<String>>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_defaults() {
        let req: SubmitRequest =
            serde_json::from_value(serde_json::json!({"program": "python"})).unwrap();

        assert_eq!(req.program, "python");
        assert!(req.args.is_empty());
        assert!(req.env.is_empty());
        assert!(req.job_name.is_none());
    }

    #[test]
    fn test_list_status_filter() {
        let req: ListRequest =
            serde_json::from_value(serde_json::json!({"status": "RUNNING"})).unwrap();

        assert_eq!(req.status, Some(JobStatus::Running));
    }

    #[test]
    fn test_cancel_response_shape() {
        let resp = CancelResponse {
            job_id: "j1".into(),
            outcome: CancelOutcome::CancelRequested,
        };

        assert_eq!(
            serde_json::to_value(resp).unwrap(),
            serde_json::json!({"job_id": "j1", "outcome": "CANCEL_REQUESTED"})
        );
    }
}
