// Domain Layer - Pure business logic and entities

pub mod device;
pub mod error;
pub mod job;
pub mod job_table;

// Re-exports
pub use device::{DeviceId, DevicePool, DeviceSlot, DeviceState, PoolError, PoolSnapshot};
pub use error::DomainError;
pub use job::{FailureReason, Job, JobCommand, JobId, JobStatus};
pub use job_table::JobTable;
