// Port Layer - Interfaces for external dependencies

pub mod device_discovery;
pub mod id_provider; // For deterministic testing
pub mod job_store;
pub mod process_runner;
pub mod time_provider;

// Re-exports
pub use device_discovery::{DeviceDiscovery, StaticDevices};
pub use id_provider::{IdProvider, UuidProvider};
pub use job_store::{JobMutation, JobStore};
pub use process_runner::{ExecutionError, ProcessHandle, ProcessRunner, ProcessState};
pub use time_provider::{SystemTimeProvider, TimeProvider};
