//! Server generation counter.
//!
//! A small file holds the last generation as a little-endian u64. Every
//! server start locks the file, reads, increments, and writes back, so
//! generations are strictly increasing across restarts even when starts
//! race. Clients compare the region header's generation against the value
//! they cached at connect time to detect restarts.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Returns the next server generation.
///
/// When the counter file is unusable (permissions, disk trouble) startup
/// still proceeds: the UNIX timestamp stands in as a generation that is
/// almost surely different from whatever clients cached.
pub fn next_generation(path: &Path) -> u64 {
    match bump(path) {
        Ok(generation) => generation,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "generation file unusable, using timestamp");
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(1, |d| d.as_secs())
        }
    }
}

fn bump(path: &Path) -> io::Result<u64> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // A short or missing payload (first start, torn write) restarts the
    // counter from zero.
    let mut buf = [0u8; 8];
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..])? {
            0 => break,
            n => read += n,
        }
    }
    let previous = if read == buf.len() {
        u64::from_le_bytes(buf)
    } else {
        0
    };

    let generation = previous.wrapping_add(1);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&generation.to_le_bytes())?;
    file.set_len(8)?;

    // Lock releases when the file closes on return.
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unique_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("slotipc_gen_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn counts_up_from_one() {
        let path = unique_path("count");
        let _ = std::fs::remove_file(&path);
        assert_eq!(next_generation(&path), 1);
        assert_eq!(next_generation(&path), 2);
        assert_eq!(next_generation(&path), 3);
    }

    #[test]
    fn payload_is_a_little_endian_u64() {
        let path = unique_path("le");
        let _ = std::fs::remove_file(&path);
        next_generation(&path);
        next_generation(&path);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 2);
    }

    #[test]
    fn short_payload_restarts_the_counter() {
        let path = unique_path("short");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        assert_eq!(next_generation(&path), 1);
    }
}
