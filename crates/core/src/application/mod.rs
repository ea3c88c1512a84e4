// Application Layer - Use Cases and Business Logic

pub mod log_tail;
pub mod queue;
pub mod recovery;
pub mod worker;

// Re-exports
pub use queue::{
    CancelOutcome, ConfigureRequest, JobSummary, LogTail, QueueService, QueueStatus,
    StatusCounts, SubmitRequest,
};
pub use recovery::RecoveryService;
pub use worker::{
    run_supervised, shutdown_channel, SchedulerConfig, SchedulerLoop, ShutdownSender,
    ShutdownToken, TickReport,
};
