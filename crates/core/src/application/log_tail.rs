// Log tail - last N lines of a job log, read backwards in fixed-size blocks

use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::application::worker::constants::LOG_TAIL_BLOCK_SIZE;
use crate::error::Result;

/// Read the last `lines` lines of `path`.
///
/// A missing file yields no lines. Only as many blocks as needed are read,
/// so tailing a multi-gigabyte log costs roughly the size of the tail.
pub async fn tail_lines(path: &Path, lines: usize) -> Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut pos = file.metadata().await?.len();
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    // One newline more than requested guarantees the oldest kept line is whole
    while pos > 0 && newlines <= lines {
        let block = LOG_TAIL_BLOCK_SIZE.min(pos);
        pos -= block;

        file.seek(SeekFrom::Start(pos)).await?;
        let mut chunk = vec![0u8; block as usize];
        file.read_exact(&mut chunk).await?;

        newlines += chunk.iter().filter(|b| **b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|line| line.to_string()).collect())
}
