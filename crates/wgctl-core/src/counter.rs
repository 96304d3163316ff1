//! Address counter
//!
//! Last issued address suffix, one decimal number in a plain file.
//! Increments hold an exclusive `flock`, so they serialize with the
//! shell `flock` used by [`crate::PeerProvisioner`] on the same file.

use crate::lock::{self, LockError};
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

/// Increment the counter at `path` and return the new value.
///
/// A missing or empty file counts as 0.
pub async fn increment_counter(path: &Path, lock_timeout: Duration) -> Result<u32, CounterError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let guard = lock::lock_exclusive(&file, lock_timeout).await?;
    let mut file = guard.file();

    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let current = match content.trim() {
        "" => 0,
        value => value
            .parse::<u32>()
            .map_err(|_| CounterError::Malformed(value.to_string()))?,
    };
    let next = current.checked_add(1).ok_or(CounterError::Overflow)?;

    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    writeln!(file, "{next}")?;
    file.sync_data()?;
    Ok(next)
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("Counter file I/O: {0}")]
    Io(#[from] io::Error),

    #[error("Counter lock: {0}")]
    Lock(#[from] LockError),

    #[error("Counter file holds '{0}', expected a number")]
    Malformed(String),

    #[error("Counter exhausted")]
    Overflow,
}
