// gpuqueue Infrastructure - System Adapters
// Implements: ProcessRunner, DeviceDiscovery

pub mod device_discovery;
pub mod subprocess_runner;

pub use device_discovery::{CommandDeviceDiscovery, DEFAULT_DISCOVERY_COMMAND};
pub use subprocess_runner::{SubprocessRunner, DEFAULT_DEVICE_ENV, JOB_ID_ENV};
