//! Advisory directory locks backed by `flock(2)`.
//!
//! One writer per seed directory; the hub uses the same lock to claim its
//! state directory. Locks are released when the guard drops or the process
//! dies, so a crashed writer never leaves a stale lock behind.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{DevacError, DevacResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default wait for a contended seed lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Block until the lock at `path` is held or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> DevacResult<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(DevacError::Lock(format!(
                    "timed out after {:?} waiting for {}",
                    timeout,
                    path.display()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Take the lock if free; `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> DevacResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if lock_exclusive(&file)? {
            debug!(path = %path.display(), "acquired directory lock");
            Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> DevacResult<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let errno = std::io::Error::last_os_error();
    if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(DevacError::Lock(format!("flock() failed: {errno}")))
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> DevacResult<bool> {
    Ok(true)
}

impl Drop for DirLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            if result != 0 {
                warn!(
                    "Failed to release lock at {}: {}",
                    self.path.display(),
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed/.lock");

        let first = DirLock::try_acquire(&path).unwrap().unwrap();
        assert!(DirLock::try_acquire(&path).unwrap().is_none());
        assert!(matches!(
            DirLock::acquire(&path, Duration::from_millis(30)),
            Err(DevacError::Lock(_))
        ));

        drop(first);
        assert!(DirLock::try_acquire(&path).unwrap().is_some());
    }
}
