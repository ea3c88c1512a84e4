// Process Runner Port
// Launches one job's command on one device and supervises the child

use crate::domain::{DeviceId, JobCommand, JobId};
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Observed state of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code, or `None` when the process was ended by a signal
    Exited(Option<i32>),
}

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Log file error: {0}")]
    LogFile(String),

    #[error("Process killed: {0}")]
    Killed(String),
}

/// Handle to one launched job process.
///
/// `poll` never blocks. `terminate` sends a graceful stop request to the
/// whole process group; if the group is still alive once the grace period
/// has elapsed, the next `poll` escalates to a forced kill.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    fn poll(&mut self) -> ProcessState;

    fn terminate(&mut self);
}

/// Process Runner trait
///
/// Implementations:
/// - SubprocessRunner: real child processes with the device exported via env
/// - MockProcessRunner: scripted processes for scheduler tests
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Launch `command` bound to `device`, stdout and stderr appended to `log_path`
    ///
    /// # Errors
    /// - ExecutionError::LogFile if the log file cannot be created
    /// - ExecutionError::SpawnFailed if the program cannot be started
    async fn start(
        &self,
        job_id: &JobId,
        command: &JobCommand,
        device: &DeviceId,
        log_path: &Path,
    ) -> Result<Box<dyn ProcessHandle>, ExecutionError>;

    /// Whether `pid` is alive and still belongs to `job_id`
    async fn is_job_process(&self, pid: u32, job_id: &JobId) -> bool;

    /// Kill a process group left behind by a previous scheduler instance
    async fn kill_orphan(&self, pid: u32) -> Result<(), ExecutionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        launches: Vec<(JobId, DeviceId)>,
        terminations: Vec<JobId>,
        live: usize,
        max_live: usize,
        next_pid: u32,
        job_pids: HashSet<(u32, JobId)>,
        killed_orphans: Vec<u32>,
    }

    /// Scripted behaviour is chosen by the command's program:
    ///
    /// - `exit <code> [polls]`: exits with `code` after `polls` polls (default 0)
    /// - `hang`: runs until terminated, then reports a signal death
    /// - `killed`: dies from a signal on the first poll
    /// - `missing`: fails to launch
    /// - anything else exits 0 on the first poll
    #[derive(Clone, Default)]
    pub struct MockProcessRunner {
        state: Arc<Mutex<MockState>>,
    }

    impl MockProcessRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Pretend `pid` is a surviving process of `job_id`
        pub fn with_orphan(self, pid: u32, job_id: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .job_pids
                .insert((pid, job_id.to_string()));
            self
        }

        pub fn launches(&self) -> Vec<(JobId, DeviceId)> {
            self.state.lock().unwrap().launches.clone()
        }

        pub fn terminations(&self) -> Vec<JobId> {
            self.state.lock().unwrap().terminations.clone()
        }

        pub fn live_count(&self) -> usize {
            self.state.lock().unwrap().live
        }

        /// Highest number of simultaneously live processes observed
        pub fn max_concurrency(&self) -> usize {
            self.state.lock().unwrap().max_live
        }

        pub fn killed_orphans(&self) -> Vec<u32> {
            self.state.lock().unwrap().killed_orphans.clone()
        }
    }

    enum Script {
        ExitAfter { code: i32, polls: usize },
        Hang,
        Killed,
    }

    struct MockHandle {
        job_id: JobId,
        pid: u32,
        script: Script,
        terminated: bool,
        finished: Option<ProcessState>,
        state: Arc<Mutex<MockState>>,
    }

    impl MockHandle {
        fn finish(&mut self, exit: ProcessState) -> ProcessState {
            if self.finished.is_none() {
                self.finished = Some(exit);
                self.state.lock().unwrap().live -= 1;
            }
            exit
        }
    }

    impl ProcessHandle for MockHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn poll(&mut self) -> ProcessState {
            if let Some(done) = self.finished {
                return done;
            }
            if self.terminated {
                return self.finish(ProcessState::Exited(None));
            }
            let exit = match &mut self.script {
                Script::ExitAfter { code, polls: 0 } => Some(*code),
                Script::ExitAfter { polls, .. } => {
                    *polls -= 1;
                    return ProcessState::Running;
                }
                Script::Hang => return ProcessState::Running,
                Script::Killed => None,
            };
            self.finish(ProcessState::Exited(exit))
        }

        fn terminate(&mut self) {
            if !self.terminated {
                self.terminated = true;
                self.state
                    .lock()
                    .unwrap()
                    .terminations
                    .push(self.job_id.clone());
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for MockProcessRunner {
        async fn start(
            &self,
            job_id: &JobId,
            command: &JobCommand,
            device: &DeviceId,
            _log_path: &Path,
        ) -> Result<Box<dyn ProcessHandle>, ExecutionError> {
            let script = match command.program.as_str() {
                "missing" => {
                    return Err(ExecutionError::SpawnFailed(format!(
                        "{}: No such file or directory",
                        command.program
                    )))
                }
                "hang" => Script::Hang,
                "killed" => Script::Killed,
                "exit" => Script::ExitAfter {
                    code: command
                        .args
                        .first()
                        .and_then(|a| a.parse().ok())
                        .unwrap_or(0),
                    polls: command
                        .args
                        .get(1)
                        .and_then(|a| a.parse().ok())
                        .unwrap_or(0),
                },
                _ => Script::ExitAfter { code: 0, polls: 0 },
            };

            let mut state = self.state.lock().unwrap();
            state.launches.push((job_id.clone(), device.clone()));
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
            state.next_pid += 1;
            let pid = 10_000 + state.next_pid;

            Ok(Box::new(MockHandle {
                job_id: job_id.clone(),
                pid,
                script,
                terminated: false,
                finished: None,
                state: self.state.clone(),
            }))
        }

        async fn is_job_process(&self, pid: u32, job_id: &JobId) -> bool {
            self.state
                .lock()
                .unwrap()
                .job_pids
                .contains(&(pid, job_id.clone()))
        }

        async fn kill_orphan(&self, pid: u32) -> Result<(), ExecutionError> {
            let mut state = self.state.lock().unwrap();
            state.job_pids.retain(|(p, _)| *p != pid);
            state.killed_orphans.push(pid);
            Ok(())
        }
    }
}
