// Loop Supervisor - restarts the scheduler loop after fatal faults

use super::constants::{ERROR_RECOVERY_SLEEP_DURATION, FAULT_WINDOW, MAX_CONSECUTIVE_LOOP_FAULTS};
use super::{SchedulerLoop, ShutdownToken};
use crate::error::Result;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Drive `scheduler` until shutdown.
///
/// A faulted run is followed by a state reset, a short pause and a fresh
/// run. After `MAX_CONSECUTIVE_LOOP_FAULTS` faults in a row the last error is
/// returned so the process can exit and be restarted from outside. A run
/// that lasted longer than `FAULT_WINDOW` starts the count over.
pub async fn run_supervised(mut scheduler: SchedulerLoop, mut shutdown: ShutdownToken) -> Result<()> {
    let mut consecutive_faults = 0u32;

    loop {
        let started = Instant::now();
        let err = match scheduler.run(&mut shutdown).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if started.elapsed() >= FAULT_WINDOW {
            consecutive_faults = 0;
        }
        consecutive_faults += 1;
        error!(
            error = %err,
            consecutive_faults,
            max_faults = MAX_CONSECUTIVE_LOOP_FAULTS,
            "Scheduler loop fault"
        );

        scheduler.reset_after_fault().await;

        if consecutive_faults >= MAX_CONSECUTIVE_LOOP_FAULTS {
            error!("Scheduler loop keeps faulting, giving up");
            return Err(err);
        }

        tokio::select! {
            _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {
                warn!("Restarting scheduler loop");
            },
            _ = shutdown.wait() => {
                info!("Shutdown requested during fault recovery");
                return Ok(());
            }
        }
    }
}
