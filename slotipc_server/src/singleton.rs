//! Advisory singleton lock.
//!
//! An `flock`-held lock file guarantees at most one server per host. The
//! kernel releases the lock on process exit, so a crashed server never
//! wedges the next start; the file itself is unlinked on clean shutdown.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a well-known path, held for the owner's
/// lifetime.
#[derive(Debug)]
pub struct SingletonLock {
    // Field order matters: the path is unlinked before the fd closes,
    // mirroring unlink-then-close on the C side. Kept as a File so the
    // lock lives exactly as long as this value.
    _file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// Opens (creating if needed) and locks `path` without blocking.
    ///
    /// Fails with `EWOULDBLOCK` when another process holds the lock.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// True when `err` means the lock is held elsewhere.
    pub fn is_contended(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::EWOULDBLOCK)
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("slotipc_lock_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let path = unique_path("held");
        let first = SingletonLock::acquire(&path).unwrap();

        let err = SingletonLock::acquire(&path).unwrap_err();
        assert!(SingletonLock::is_contended(&err));

        drop(first);
        let _reacquired = SingletonLock::acquire(&path).unwrap();
    }

    #[test]
    fn drop_removes_the_lock_file() {
        let path = unique_path("rm");
        {
            let _lock = SingletonLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
