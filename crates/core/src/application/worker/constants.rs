// Scheduler constants (ADR: No magic values)
use std::time::Duration;

/// Loop sleep while any job is Pending or Running (500ms)
pub const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Loop sleep when the queue is empty (5s)
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How often terminal jobs are purged (60s)
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Terminal jobs stay queryable this long after finishing (24h)
pub const TERMINAL_JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Grace period between SIGTERM and SIGKILL (5s)
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence while draining processes on shutdown or reset
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Give up waiting for terminated processes after this long (grace + margin)
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Sleep after a fatal loop fault before the loop is restarted (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Consecutive fatal faults before the supervisor gives up
pub const MAX_CONSECUTIVE_LOOP_FAULTS: u32 = 5;

/// A loop run that survived this long resets the fault counter
pub const FAULT_WINDOW: Duration = Duration::from_secs(60);

/// Lines returned by `log` when the caller does not ask for a count
pub const DEFAULT_LOG_TAIL_LINES: usize = 50;

/// Upper bound on requested tail length
pub const MAX_LOG_TAIL_LINES: usize = 10_000;

/// Lines of output captured on a failed job
pub const LOG_EXCERPT_LINES: usize = 20;

/// Block size for reading log files backwards
pub const LOG_TAIL_BLOCK_SIZE: u64 = 8 * 1024;

/// Maximum job name length (characters)
pub const MAX_JOB_NAME_LEN: usize = 128;
