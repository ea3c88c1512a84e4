// gpuqueue Infrastructure - JSON Snapshot Adapter
// Implements: JobStore

mod job_store;
mod snapshot;

pub use job_store::JsonJobStore;
pub use snapshot::{SnapshotFile, SNAPSHOT_VERSION};
