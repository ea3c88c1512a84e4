//! RPC Method Handlers
//!
//! Each method parses its parameters, calls the queue service and maps
//! `AppError` to a JSON-RPC error object.

use crate::error::to_rpc_error;
use crate::types::{
    CancelRequest, CancelResponse, ConfigureRequest, ListRequest, LogRequest, StatusRequest,
    SubmitRequest, SubmitResponse,
};
use gpuqueue_core::application::{self, JobSummary, LogTail, QueueService, QueueStatus};
use gpuqueue_core::domain::{JobStatus, PoolSnapshot};
use jsonrpsee::types::ErrorObjectOwned;
use std::sync::Arc;
use tracing::debug;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    service: Arc<QueueService>,
}

impl RpcHandler {
    pub fn new(service: Arc<QueueService>) -> Self {
        Self { service }
    }

    /// queue.submit.v1
    pub async fn submit(&self, params: SubmitRequest) -> Result<SubmitResponse, ErrorObjectOwned> {
        let req = application::SubmitRequest {
            program: params.program,
            args: params.args,
            env: params.env,
            working_dir: params.working_dir,
            job_name: params.job_name,
        };

        let job_id = self.service.submit(req).await.map_err(to_rpc_error)?;
        debug!(job_id = %job_id, "Submitted via RPC");

        Ok(SubmitResponse {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// queue.status.v1
    pub async fn status(&self, params: StatusRequest) -> Result<JobSummary, ErrorObjectOwned> {
        self.service
            .status(&params.job_id)
            .await
            .map_err(to_rpc_error)
    }

    /// queue.log.v1
    pub async fn log(&self, params: LogRequest) -> Result<LogTail, ErrorObjectOwned> {
        self.service
            .log(&params.job_id, params.lines)
            .await
            .map_err(to_rpc_error)
    }

    /// queue.cancel.v1
    pub async fn cancel(&self, params: CancelRequest) -> Result<CancelResponse, ErrorObjectOwned> {
        let outcome = self
            .service
            .cancel(&params.job_id)
            .await
            .map_err(to_rpc_error)?;

        Ok(CancelResponse {
            job_id: params.job_id,
            outcome,
        })
    }

    /// queue.list.v1
    pub async fn list(&self, params: ListRequest) -> Result<Vec<JobSummary>, ErrorObjectOwned> {
        self.service
            .list(params.status)
            .await
            .map_err(to_rpc_error)
    }

    /// queue.configure.v1
    pub async fn configure(
        &self,
        params: ConfigureRequest,
    ) -> Result<PoolSnapshot, ErrorObjectOwned> {
        let req = application::ConfigureRequest {
            devices: params.devices,
            max_concurrent: params.max_concurrent,
        };
        self.service.configure(req).await.map_err(to_rpc_error)
    }

    /// queue.resources.v1
    pub async fn resources(&self) -> Result<PoolSnapshot, ErrorObjectOwned> {
        self.service.resources().await.map_err(to_rpc_error)
    }

    /// queue.overview.v1
    pub async fn overview(&self) -> Result<QueueStatus, ErrorObjectOwned> {
        self.service.queue_status().await.map_err(to_rpc_error)
    }
}
