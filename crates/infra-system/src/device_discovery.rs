// Device discovery via an external query command (nvidia-smi by default)
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use gpuqueue_core::domain::DeviceId;
use gpuqueue_core::port::DeviceDiscovery;

/// Lists one GPU index per line
pub const DEFAULT_DISCOVERY_COMMAND: &str = "nvidia-smi --query-gpu=index --format=csv,noheader";

/// Upper bound on how long the query may take
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a command and treats each non-empty output line as a device id.
/// Any failure (missing binary, non-zero exit, timeout) yields no devices.
pub struct CommandDeviceDiscovery {
    command: String,
    timeout: Duration,
}

impl Default for CommandDeviceDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_COMMAND)
    }
}

impl CommandDeviceDiscovery {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query(&self) -> Result<String, String> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| "empty discovery command".to_string())?;

        let output = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, output)
            .await
            .map_err(|_| format!("timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| e.to_string())?;

        if !output.status.success() {
            return Err(format!(
                "exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_devices(stdout: &str) -> Vec<DeviceId> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(DeviceId::new)
        .collect()
}

#[async_trait]
impl DeviceDiscovery for CommandDeviceDiscovery {
    async fn discover(&self) -> Vec<DeviceId> {
        match self.query().await {
            Ok(stdout) => {
                let devices = parse_devices(&stdout);
                info!(
                    command = %self.command,
                    devices = ?devices.iter().map(DeviceId::as_str).collect::<Vec<_>>(),
                    "Devices discovered"
                );
                devices
            }
            Err(e) => {
                warn!(command = %self.command, error = %e, "Device discovery failed");
                Vec::new()
            }
        }
    }
}
