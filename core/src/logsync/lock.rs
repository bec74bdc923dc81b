//! Advisory file locks.
//!
//! Two monitor processes pointed at the same logs root must not interleave
//! appends. Each machine directory has a `.lock` file; writers hold an
//! exclusive `flock` on it while appending.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::SyncError;

/// Lock guard that releases the lock on drop. The lock file stays; removing
/// it would let a waiter lock an orphaned inode.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock, polling until `timeout` passes.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<FileLock, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| SyncError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let fd = file.as_raw_fd();
        let deadline = Instant::now() + timeout;
        loop {
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                return Ok(FileLock {
                    file,
                    path: path.to_path_buf(),
                });
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Lock {
                    path: path.to_path_buf(),
                    reason: format!("still held after {}ms", timeout.as_millis()),
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otter").join(".lock");
        let first = FileLock::acquire(&path, Duration::from_millis(100)).unwrap();
        let second = FileLock::acquire(&path, Duration::from_millis(60));
        assert!(matches!(second, Err(SyncError::Lock { .. })));
        drop(first);
        let third = FileLock::acquire(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(third.path(), path.as_path());
    }

    #[test]
    fn lock_file_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        drop(FileLock::acquire(&path, Duration::from_millis(100)).unwrap());
        assert!(path.exists());
    }
}
