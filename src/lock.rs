//! Cross-process advisory file locking.
//!
//! Data directories and binary cache entries may be contended by independent
//! test processes, so ownership is enforced with `flock(2)` rather than an
//! in-process mutex. Acquisition never blocks: a lock held elsewhere is
//! reported as `None`. On non-Unix platforms locking is a no-op.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{File, OpenOptions};
use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Guard that holds an exclusive file lock until released or dropped.
#[derive(Debug)]
pub(crate) struct FileLock {
    path: Utf8PathBuf,
    file: File,
}

impl FileLock {
    /// Opens (creating when needed) `path` and tries to take an exclusive lock.
    ///
    /// Returns `Ok(None)` when another open file description already holds the
    /// lock, whether in this process or another one.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or `flock` fails for
    /// a reason other than contention.
    #[cfg(unix)]
    pub(crate) fn try_acquire(path: &Utf8Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(path)?;

        // SAFETY: The file descriptor obtained from `file.as_raw_fd()` is valid
        // because `file` was opened via `OpenOptions::open` and remains owned by
        // this scope until after the `flock` call completes. No other code moves
        // or closes the descriptor while this block runs.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
        }))
    }

    /// Lock acquisition always succeeds on non-Unix platforms.
    #[cfg(not(unix))]
    pub(crate) fn try_acquire(path: &Utf8Path) -> io::Result<Option<Self>> {
        // Cross-process locking not supported; concurrent runs may race here.
        let file = open_lock_file(path)?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
        }))
    }

    /// Returns the path of the locked file.
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Releases the lock and closes the handle.
    ///
    /// Closing the descriptor drops the `flock`; an explicit unlock is issued
    /// first so the release is observable even if the handle was duplicated.
    pub(crate) fn release(self) {
        #[cfg(unix)]
        {
            // SAFETY: `self.file` is still open and owned here; unlocking a
            // descriptor we locked has no memory-safety implications.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        drop(self.file);
    }
}

fn open_lock_file(path: &Utf8Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lock_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("epg-lock")).expect("utf8 path")
    }

    #[test]
    fn try_acquire_creates_lock_file() {
        let temp = tempdir().expect("tempdir");
        let path = lock_path(&temp);
        let lock = FileLock::try_acquire(&path).expect("acquire lock");

        assert!(lock.is_some(), "uncontended lock should be granted");
        assert!(path.exists(), "lock file should be created");
    }

    #[test]
    fn second_holder_is_refused_until_release() {
        let temp = tempdir().expect("tempdir");
        let path = lock_path(&temp);

        let first = FileLock::try_acquire(&path)
            .expect("acquire lock")
            .expect("first lock granted");
        let second = FileLock::try_acquire(&path).expect("second attempt");
        assert!(second.is_none(), "contended lock must not be granted");

        first.release();
        let third = FileLock::try_acquire(&path).expect("third attempt");
        assert!(third.is_some(), "released lock should be available again");
    }
}
