//! Daemon configuration read from `GPUQUEUE_*` environment variables

use anyhow::{bail, Context, Result};
use gpuqueue_infra_system::{DEFAULT_DEVICE_ENV, DEFAULT_DISCOVERY_COMMAND};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STATE_DIR: &str = "~/.gpuqueue";
const DEFAULT_MAX_CONCURRENT: usize = 1;
const DEFAULT_RPC_PORT: u16 = 9531;

const SNAPSHOT_FILE: &str = "queue_state.json";
const JOB_LOG_DIR: &str = "logs";
pub const DAEMON_LOG_FILE: &str = "daemon.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub state_dir: PathBuf,
    /// Explicit device list; `None` means run discovery
    pub devices: Option<Vec<String>>,
    pub discovery_command: String,
    pub max_concurrent: usize,
    pub max_runtime: Option<Duration>,
    pub device_env: String,
    pub rpc_port: u16,
    pub log_format: LogFormat,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let state_dir = var("GPUQUEUE_STATE_DIR").unwrap_or_else(|| DEFAULT_STATE_DIR.to_string());
        let state_dir = PathBuf::from(shellexpand::tilde(&state_dir).into_owned());

        let devices = var("GPUQUEUE_DEVICES").map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect()
        });

        let max_concurrent = match var("GPUQUEUE_MAX_CONCURRENT") {
            Some(raw) => parse_number::<usize>("GPUQUEUE_MAX_CONCURRENT", &raw)?,
            None => DEFAULT_MAX_CONCURRENT,
        };
        if max_concurrent == 0 {
            bail!("GPUQUEUE_MAX_CONCURRENT must be at least 1");
        }

        let max_runtime = match var("GPUQUEUE_MAX_RUNTIME_SECS") {
            Some(raw) => {
                let secs = parse_number::<u64>("GPUQUEUE_MAX_RUNTIME_SECS", &raw)?;
                if secs == 0 {
                    bail!("GPUQUEUE_MAX_RUNTIME_SECS must be at least 1");
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let rpc_port = match var("GPUQUEUE_RPC_PORT") {
            Some(raw) => parse_number::<u16>("GPUQUEUE_RPC_PORT", &raw)?,
            None => DEFAULT_RPC_PORT,
        };

        let log_format = match var("GPUQUEUE_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            state_dir,
            devices,
            discovery_command: var("GPUQUEUE_DISCOVERY_COMMAND")
                .unwrap_or_else(|| DEFAULT_DISCOVERY_COMMAND.to_string()),
            max_concurrent,
            max_runtime,
            device_env: var("GPUQUEUE_DEVICE_ENV").unwrap_or_else(|| DEFAULT_DEVICE_ENV.to_string()),
            rpc_port,
            log_format,
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    pub fn job_log_dir(&self) -> PathBuf {
        self.state_dir.join(JOB_LOG_DIR)
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{} has invalid value {:?}", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<DaemonConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert!(config.state_dir.ends_with(".gpuqueue"));
        assert!(!config.state_dir.starts_with("~"));
        assert_eq!(config.devices, None);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_runtime, None);
        assert_eq!(config.device_env, "CUDA_VISIBLE_DEVICES");
        assert_eq!(config.rpc_port, 9531);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.discovery_command, DEFAULT_DISCOVERY_COMMAND);
    }

    #[test]
    fn test_explicit_values() {
        let config = config_from(&[
            ("GPUQUEUE_STATE_DIR", "/var/lib/gpuqueue"),
            ("GPUQUEUE_DEVICES", "0, 1,,3"),
            ("GPUQUEUE_MAX_CONCURRENT", "2"),
            ("GPUQUEUE_MAX_RUNTIME_SECS", "3600"),
            ("GPUQUEUE_DEVICE_ENV", "HIP_VISIBLE_DEVICES"),
            ("GPUQUEUE_RPC_PORT", "9000"),
            ("GPUQUEUE_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/var/lib/gpuqueue/queue_state.json")
        );
        assert_eq!(config.job_log_dir(), PathBuf::from("/var/lib/gpuqueue/logs"));
        assert_eq!(
            config.devices,
            Some(vec!["0".to_string(), "1".to_string(), "3".to_string()])
        );
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.max_runtime, Some(Duration::from_secs(3600)));
        assert_eq!(config.device_env, "HIP_VISIBLE_DEVICES");
        assert_eq!(config.rpc_port, 9000);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        assert!(config_from(&[("GPUQUEUE_MAX_CONCURRENT", "two")]).is_err());
        assert!(config_from(&[("GPUQUEUE_MAX_CONCURRENT", "0")]).is_err());
        assert!(config_from(&[("GPUQUEUE_RPC_PORT", "70000")]).is_err());
        assert!(config_from(&[("GPUQUEUE_MAX_RUNTIME_SECS", "-5")]).is_err());
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = config_from(&[("GPUQUEUE_DEVICES", "  "), ("GPUQUEUE_RPC_PORT", "")]).unwrap();

        assert_eq!(config.devices, None);
        assert_eq!(config.rpc_port, 9531);
    }
}
