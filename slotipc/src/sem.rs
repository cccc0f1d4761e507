//! Named POSIX semaphores.
//!
//! nix has no wrapper for the named-semaphore API (`sem_open` and friends),
//! so this module goes through libc directly. The server creates every
//! semaphore and unlinks it on drop; clients open existing ones and only
//! close. A binary semaphore with initial value 1 doubles as the
//! cross-process mutex.

use std::ffi::CString;
use std::io;
use std::time::Duration;

/// A named semaphore shared between processes.
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
    is_owner: bool,
}

// SAFETY: sem_t operations are thread-safe by POSIX; the handle is only
// invalidated by Drop, which takes &mut self.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates a semaphore with the given initial value.
    ///
    /// A leftover semaphore from a crashed server is unlinked and the
    /// creation retried once, so a restart always starts from `initial`.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let cname = sem_cstring(name)?;

        let mut sem = unsafe { sem_open_excl(&cname, initial) };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
            unsafe { libc::sem_unlink(cname.as_ptr()) };
            sem = unsafe { sem_open_excl(&cname, initial) };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self {
            sem,
            name: cname,
            is_owner: true,
        })
    }

    /// Opens an existing semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = sem_cstring(name)?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: cname,
            is_owner: false,
        })
    }

    /// Increments the semaphore, waking one waiter.
    pub fn post(&self) -> io::Result<()> {
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Decrements the semaphore, blocking until it is positive.
    /// Retries on signal interruption.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    /// Like [`wait`](Self::wait) with an absolute deadline `timeout` from
    /// now. Returns `Ok(false)` on timeout, retrying on interruption
    /// without extending the deadline.
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = absolute_deadline(timeout)?;
        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.is_owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

unsafe fn sem_open_excl(name: &CString, initial: u32) -> *mut libc::sem_t {
    unsafe {
        libc::sem_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL,
            0o666 as libc::mode_t as libc::c_uint,
            initial,
        )
    }
}

fn absolute_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    // SAFETY: zeroed timespec is a valid out-param for clock_gettime.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

fn sem_cstring(name: &str) -> io::Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!("/slotipc_sem_{}_{}", tag, std::process::id())
    }

    #[test]
    fn post_then_wait() {
        let sem = NamedSemaphore::create(&unique_name("pw"), 0).unwrap();
        sem.post().unwrap();
        sem.wait().unwrap();
    }

    #[test]
    fn initial_value_is_respected() {
        let sem = NamedSemaphore::create(&unique_name("init"), 2).unwrap();
        assert!(sem.timed_wait(Duration::from_millis(50)).unwrap());
        assert!(sem.timed_wait(Duration::from_millis(50)).unwrap());
        assert!(!sem.timed_wait(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn timed_wait_times_out_then_succeeds_after_post() {
        let name = unique_name("timeout");
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        assert!(!sem.timed_wait(Duration::from_millis(50)).unwrap());

        let opened = NamedSemaphore::open(&name).unwrap();
        let waiter = thread::spawn(move || opened.timed_wait(Duration::from_secs(5)).unwrap());
        sem.post().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn create_resets_a_stale_semaphore() {
        let name = unique_name("stale");
        let first = NamedSemaphore::create(&name, 0).unwrap();
        first.post().unwrap();
        first.post().unwrap();
        // Simulate a crashed owner: the name still exists.
        std::mem::forget(first);

        let second = NamedSemaphore::create(&name, 0).unwrap();
        assert!(!second.timed_wait(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn open_missing_fails() {
        let err = NamedSemaphore::open(&unique_name("missing")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
