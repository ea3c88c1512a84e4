// Subprocess runner implementation
// reason: tokio::process for non-blocking child supervision, nix for process-group signals
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use gpuqueue_core::application::worker::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use gpuqueue_core::domain::{DeviceId, JobCommand, JobId};
use gpuqueue_core::port::{ExecutionError, ProcessHandle, ProcessRunner, ProcessState};

/// Environment variable naming the accelerator a job may use
pub const DEFAULT_DEVICE_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Every job process carries its job id, so a pid can be matched back to
/// its job after a restart
pub const JOB_ID_ENV: &str = "GPUQUEUE_JOB_ID";

/// Poll cadence while waiting for an orphan to die
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Subprocess runner
/// Spawns each job in its own process group with stdout and stderr appended
/// to the job's log file
pub struct SubprocessRunner {
    device_env: String,
    grace_period: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ENV, GRACEFUL_SHUTDOWN_TIMEOUT)
    }
}

impl SubprocessRunner {
    /// Create a new subprocess runner
    ///
    /// # Arguments
    /// * `device_env` - Variable used to expose the assigned device to the child
    /// * `grace_period` - Time between SIGTERM and SIGKILL
    pub fn new(device_env: impl Into<String>, grace_period: Duration) -> Self {
        Self {
            device_env: device_env.into(),
            grace_period,
        }
    }

    fn open_log(log_path: &Path) -> Result<File, ExecutionError> {
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| ExecutionError::LogFile(format!("{}: {}", dir.display(), e)))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| ExecutionError::LogFile(format!("{}: {}", log_path.display(), e)))
    }

    fn build_command(
        &self,
        job_id: &JobId,
        command: &JobCommand,
        device: &DeviceId,
        log: &File,
    ) -> Result<Command, ExecutionError> {
        let stdout = log
            .try_clone()
            .map_err(|e| ExecutionError::LogFile(e.to_string()))?;
        let stderr = log
            .try_clone()
            .map_err(|e| ExecutionError::LogFile(e.to_string()))?;
        let device_value = if device.is_cpu() { "" } else { device.as_str() };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .env(&self.device_env, device_value)
            .env(JOB_ID_ENV, job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }
}

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn start(
        &self,
        job_id: &JobId,
        command: &JobCommand,
        device: &DeviceId,
        log_path: &Path,
    ) -> Result<Box<dyn ProcessHandle>, ExecutionError> {
        let mut log = Self::open_log(log_path)?;
        writeln!(
            log,
            "# job {} on device {}: {}",
            job_id,
            device,
            command.display_line()
        )
        .map_err(|e| ExecutionError::LogFile(e.to_string()))?;

        let mut cmd = self.build_command(job_id, command, device, &log)?;
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = writeln!(log, "# launch failed: {}", e);
                return Err(ExecutionError::SpawnFailed(format!("{}: {}", command.program, e)));
            }
        };

        let pid = child.id().ok_or_else(|| {
            ExecutionError::SpawnFailed("process exited before its pid was read".to_string())
        })?;
        debug!(job_id = %job_id, pid, log_path = %log_path.display(), "Subprocess spawned");

        Ok(Box::new(SubprocessHandle {
            job_id: job_id.clone(),
            child,
            pid,
            grace_period: self.grace_period,
            kill_deadline: None,
            killed: false,
        }))
    }

    async fn is_job_process(&self, pid: u32, job_id: &JobId) -> bool {
        if !is_alive(pid) {
            return false;
        }
        // Linux exposes the environment of our own processes; elsewhere a
        // live pid is the best evidence available
        match tokio::fs::read(format!("/proc/{}/environ", pid)).await {
            Ok(environ) => {
                let marker = format!("{}={}", JOB_ID_ENV, job_id);
                environ
                    .split(|b| *b == 0)
                    .any(|entry| entry == marker.as_bytes())
            }
            Err(_) => true,
        }
    }

    async fn kill_orphan(&self, pid: u32) -> Result<(), ExecutionError> {
        signal_group(pid, GroupSignal::Terminate)
            .map_err(|e| ExecutionError::Killed(format!("SIGTERM failed: {}", e)))?;

        let deadline = Instant::now() + self.grace_period;
        while Instant::now() < deadline {
            tokio::time::sleep(ORPHAN_POLL_INTERVAL).await;
            if !is_alive(pid) {
                info!(pid, "Orphaned process exited after SIGTERM");
                return Ok(());
            }
        }

        warn!(pid, "Orphaned process ignored SIGTERM, sending SIGKILL");
        signal_group(pid, GroupSignal::Kill)
            .map_err(|e| ExecutionError::Killed(format!("SIGKILL failed: {}", e)))
    }
}

/// Live child of a [`SubprocessRunner`]
struct SubprocessHandle {
    job_id: JobId,
    child: Child,
    pid: u32,
    grace_period: Duration,
    kill_deadline: Option<Instant>,
    killed: bool,
}

impl ProcessHandle for SubprocessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll(&mut self) -> ProcessState {
        match self.child.try_wait() {
            Ok(Some(status)) => ProcessState::Exited(status.code()),
            Ok(None) => {
                if !self.killed && self.kill_deadline.is_some_and(|at| Instant::now() >= at) {
                    warn!(job_id = %self.job_id, pid = self.pid, "Grace period over, sending SIGKILL");
                    if let Err(e) = signal_group(self.pid, GroupSignal::Kill) {
                        warn!(job_id = %self.job_id, pid = self.pid, error = %e, "SIGKILL failed");
                    }
                    self.killed = true;
                }
                ProcessState::Running
            }
            Err(e) => {
                warn!(job_id = %self.job_id, pid = self.pid, error = %e, "Lost track of process");
                ProcessState::Exited(None)
            }
        }
    }

    fn terminate(&mut self) {
        if self.kill_deadline.is_some() {
            return;
        }
        info!(job_id = %self.job_id, pid = self.pid, "Sending SIGTERM to process group");
        if let Err(e) = signal_group(self.pid, GroupSignal::Terminate) {
            warn!(job_id = %self.job_id, pid = self.pid, error = %e, "SIGTERM failed");
        }
        self.kill_deadline = Some(Instant::now() + self.grace_period);
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`. A group that is already gone is
/// not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(windows)]
fn signal_group(pid: u32, _signal: GroupSignal) -> Result<(), String> {
    // Windows: taskkill /T takes the whole tree down
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 checks if process exists without actually sending a signal
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(windows)]
fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
