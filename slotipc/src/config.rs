//! Names of the shared objects both sides agree on.

use std::path::PathBuf;

/// Default shared memory object name.
pub const DEFAULT_SHM_NAME: &str = "/ipc_shm";
/// Default mutex semaphore name.
pub const DEFAULT_MUTEX_NAME: &str = "/ipc_mutex";
/// Default server-notify semaphore name.
pub const DEFAULT_NOTIFY_NAME: &str = "/ipc_server_notify";
/// Default per-slot semaphore name prefix; the slot index is appended.
pub const DEFAULT_SLOT_SEM_PREFIX: &str = "/ipc_slot_";
/// Default singleton lock file path.
pub const DEFAULT_LOCK_PATH: &str = "/tmp/ipc_server.lock";
/// Default generation counter file path.
pub const DEFAULT_GENERATION_PATH: &str = "/tmp/ipc_server.generation";

/// Names of every shared object the transport uses.
///
/// `Default` yields the well-known production names. Tests derive a unique
/// set per test via [`IpcConfig::with_prefix`] so concurrently running
/// tests do not collide on host-global objects.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// POSIX shared memory object name (leading `/`).
    pub shm_name: String,
    /// Binary mutex semaphore name, initial value 1.
    pub mutex_name: String,
    /// Counting server-notify semaphore name, initial value 0.
    pub notify_name: String,
    /// Prefix for the per-slot semaphores, initial value 0 each.
    pub slot_sem_prefix: String,
    /// Advisory lock file guaranteeing a single server per host.
    pub lock_path: PathBuf,
    /// File holding the last server generation as a little-endian u64.
    pub generation_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            shm_name: DEFAULT_SHM_NAME.to_string(),
            mutex_name: DEFAULT_MUTEX_NAME.to_string(),
            notify_name: DEFAULT_NOTIFY_NAME.to_string(),
            slot_sem_prefix: DEFAULT_SLOT_SEM_PREFIX.to_string(),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            generation_path: PathBuf::from(DEFAULT_GENERATION_PATH),
        }
    }
}

impl IpcConfig {
    /// Derives a full set of object names from `prefix`.
    ///
    /// Lock and generation files land in the system temp directory.
    pub fn with_prefix(prefix: &str) -> Self {
        let tmp = std::env::temp_dir();
        Self {
            shm_name: format!("/{prefix}_shm"),
            mutex_name: format!("/{prefix}_mutex"),
            notify_name: format!("/{prefix}_notify"),
            slot_sem_prefix: format!("/{prefix}_slot_"),
            lock_path: tmp.join(format!("{prefix}.lock")),
            generation_path: tmp.join(format!("{prefix}.generation")),
        }
    }

    /// Name of the per-slot semaphore for `index`.
    pub fn slot_sem_name(&self, index: usize) -> String {
        format!("{}{}", self.slot_sem_prefix, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_are_the_wire_contract() {
        let cfg = IpcConfig::default();
        assert_eq!(cfg.shm_name, "/ipc_shm");
        assert_eq!(cfg.mutex_name, "/ipc_mutex");
        assert_eq!(cfg.notify_name, "/ipc_server_notify");
        assert_eq!(cfg.slot_sem_name(0), "/ipc_slot_0");
        assert_eq!(cfg.slot_sem_name(15), "/ipc_slot_15");
        assert_eq!(cfg.lock_path, PathBuf::from("/tmp/ipc_server.lock"));
        assert_eq!(cfg.generation_path, PathBuf::from("/tmp/ipc_server.generation"));
    }

    #[test]
    fn prefixed_names_stay_disjoint() {
        let a = IpcConfig::with_prefix("test_a");
        let b = IpcConfig::with_prefix("test_b");
        assert_ne!(a.shm_name, b.shm_name);
        assert_ne!(a.slot_sem_name(3), b.slot_sem_name(3));
        assert_ne!(a.lock_path, b.lock_path);
    }
}
