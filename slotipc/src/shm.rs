//! Shared memory mapping over `/dev/shm`.
//!
//! The server creates and owns the region (unlinking it on drop); clients
//! open an existing region and never unlink. Object identity — the
//! `(device, inode)` pair of the backing object — is exposed so clients can
//! detect that a restarted server replaced the object behind the same name.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, IntoRawFd, RawFd};
use std::ptr::NonNull;

/// `(device, inode)` of a shared memory object; changes when the server
/// unlinks and re-creates the object.
pub type ShmIdentity = (u64, u64);

/// A mapped POSIX shared memory object.
#[derive(Debug)]
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

// SAFETY: the mapping is plain memory; all concurrent access is arbitrated
// by the callers (shared mutex protocol).
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Creates a new shared memory object of `size` bytes and maps it.
    ///
    /// Fails with `EEXIST` if the object already exists; the server unlinks
    /// stale objects first via [`SharedMemory::unlink`]. The returned value
    /// owns the object and unlinks it on drop.
    ///
    /// # Safety
    /// The caller must ensure no other live process still relies on a
    /// previous object of the same name.
    pub unsafe fn create(name: &str, size: usize) -> io::Result<Self> {
        let name = shm_cstring(name)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(errno_to_io)?;

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = shm_unlink(name.as_c_str());
            return Err(errno_to_io(e));
        }

        let ptr = match unsafe { map_fd(&fd, size) } {
            Ok(p) => p,
            Err(e) => {
                let _ = shm_unlink(name.as_c_str());
                return Err(e);
            }
        };

        Ok(Self {
            ptr,
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: true,
        })
    }

    /// Opens and maps an existing shared memory object.
    ///
    /// # Safety
    /// The caller must ensure the object was created with at least `size`
    /// bytes and carries the layout the caller will interpret it with.
    pub unsafe fn open(name: &str, size: usize) -> io::Result<Self> {
        let name = shm_cstring(name)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(errno_to_io)?;
        let ptr = unsafe { map_fd(&fd, size)? };

        Ok(Self {
            ptr,
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: false,
        })
    }

    /// Removes the name from the namespace, ignoring a missing object.
    /// Existing mappings stay valid until the last one is dropped.
    pub fn unlink(name: &str) -> io::Result<()> {
        let name = shm_cstring(name)?;
        match shm_unlink(name.as_c_str()) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(errno_to_io(e)),
        }
    }

    /// Pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Identity of the object this mapping was opened from.
    pub fn identity(&self) -> io::Result<ShmIdentity> {
        fstat_identity(self.fd)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            let _ = close(self.fd);

            if self.is_owner {
                let _ = shm_unlink(self.name.as_c_str());
            }
        }
    }
}

/// Identity of the object currently behind `name`, or `None` when no such
/// object exists (server gone, nothing re-created yet).
pub fn live_identity(name: &str) -> io::Result<Option<ShmIdentity>> {
    let name = shm_cstring(name)?;
    // Probe with a throwaway fd; raw libc because the fd never outlives
    // this function.
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o666) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(None),
            _ => Err(err),
        };
    }
    let identity = fstat_identity(fd);
    unsafe { libc::close(fd) };
    identity.map(Some)
}

fn fstat_identity(fd: RawFd) -> io::Result<ShmIdentity> {
    // SAFETY: zeroed stat is a valid out-param for fstat.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((st.st_dev, st.st_ino))
}

unsafe fn map_fd<F: AsFd>(fd: &F, size: usize) -> io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(errno_to_io)?;
    Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) })
}

fn shm_cstring(name: &str) -> io::Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/slotipc_shm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique_name("rw");
        unsafe {
            let owner = SharedMemory::create(&name, 4096).unwrap();
            assert_eq!(owner.size(), 4096);
            std::ptr::write_volatile(owner.as_ptr(), 0xA5u8);

            let viewer = SharedMemory::open(&name, 4096).unwrap();
            assert_eq!(std::ptr::read_volatile(viewer.as_ptr()), 0xA5u8);
        }
    }

    #[test]
    fn create_refuses_existing_object() {
        let name = unique_name("excl");
        unsafe {
            let _owner = SharedMemory::create(&name, 4096).unwrap();
            let err = SharedMemory::create(&name, 4096).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        }
    }

    #[test]
    fn identity_changes_when_object_is_replaced() {
        let name = unique_name("ident");
        unsafe {
            let first = SharedMemory::create(&name, 4096).unwrap();
            let before = first.identity().unwrap();
            assert_eq!(live_identity(&name).unwrap(), Some(before));

            SharedMemory::unlink(&name).unwrap();
            assert_eq!(live_identity(&name).unwrap(), None);

            let _second = SharedMemory::create(&name, 4096).unwrap();
            let after = live_identity(&name).unwrap().unwrap();
            // The stale mapping still reports the old identity.
            assert_eq!(first.identity().unwrap(), before);
            assert_ne!(before, after);
        }
    }

    #[test]
    fn owner_unlinks_on_drop() {
        let name = unique_name("drop");
        unsafe {
            {
                let _owner = SharedMemory::create(&name, 4096).unwrap();
            }
            let err = SharedMemory::open(&name, 4096).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        }
    }
}
