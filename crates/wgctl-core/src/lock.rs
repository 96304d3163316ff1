//! Advisory file locks
//!
//! `flock(2)` based exclusive locks shared with any other process that
//! locks the same file (including `flock(1)` in shell scripts). Attempts
//! are non-blocking and polled on the async runtime until a deadline.

use std::fs::File;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delay between two lock attempts
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct FileLock<'a> {
    file: &'a File,
}

impl FileLock<'_> {
    /// Locked file
    pub fn file(&self) -> &File {
        self.file
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = unlock(self.file) {
            warn!("Failed to release file lock: {}", e);
        }
    }
}

/// Acquire an exclusive lock on `file`, waiting at most `timeout`.
pub async fn lock_exclusive(file: &File, timeout: Duration) -> Result<FileLock<'_>, LockError> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if try_flock_exclusive(file)? {
            if attempts > 1 {
                debug!(attempts, "File lock acquired after contention");
            }
            return Ok(FileLock { file });
        }
        if Instant::now() >= deadline {
            return Err(LockError::Timeout(timeout));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Returns `Ok(false)` if another open file description holds the lock.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the fd is owned by `file` and stays valid for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: see `try_flock_exclusive`.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("I/O error while locking: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out after {0:?} waiting for file lock")]
    Timeout(Duration),
}
