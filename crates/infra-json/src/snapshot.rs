// Snapshot file format and atomic replacement

use gpuqueue_core::domain::Job;
use gpuqueue_core::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk layout: `{ "version": 1, "jobs": [...] }`
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub jobs: Vec<Job>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    jobs: &'a [Job],
}

/// Load the snapshot at `path`. `Ok(None)` when no snapshot exists yet;
/// a file that cannot be parsed is a configuration error.
pub(crate) fn load(path: &Path) -> Result<Option<Vec<Job>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file: SnapshotFile = serde_json::from_slice(&bytes).map_err(|e| {
        AppError::Config(format!("unreadable job snapshot {}: {}", path.display(), e))
    })?;
    if file.version != SNAPSHOT_VERSION {
        return Err(AppError::Config(format!(
            "job snapshot {} has version {}, expected {}",
            path.display(),
            file.version,
            SNAPSHOT_VERSION
        )));
    }
    Ok(Some(file.jobs))
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `jobs` to `<path>.tmp`, fsync it, then rename over `path`.
/// Readers see either the old or the new snapshot, never a torn one.
pub(crate) fn write_atomic(path: &Path, jobs: &[Job]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&SnapshotRef {
        version: SNAPSHOT_VERSION,
        jobs,
    })?;

    let tmp = temp_path(path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;

    // Make the rename itself durable
    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
