// gpuqueue Core - Domain Logic, Ports & Scheduler
// NO adapter dependencies: stores, process spawning and RPC live in infra crates

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
