use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Exclusive advisory lock held by the daemon for as long as it runs.
///
/// The kernel drops the lock when the process exits, however it exits, so a crashed daemon
/// never blocks the next one. The file itself stays behind and only records the last holder.
pub struct LockedFile {
    /// Path to the lock file.
    lock_path: String,
    file: File,
}

impl LockedFile {
    /// The lock guarding `path`, i.e. `<path>.lock`.
    pub fn for_path(path: &str) -> Result<Self, EngineError> {
        Self::acquire(&format!("{}.lock", path))
    }

    pub fn acquire(lock_path: &str) -> Result<Self, EngineError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(EngineError::AlreadyLocked(lock_path.to_string()));
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        debug!(lock = lock_path, "Acquired instance lock.");
        Ok(Self {
            lock_path: lock_path.to_string(),
            file,
        })
    }

    pub fn path(&self) -> &str {
        &self.lock_path
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release lock {}: {}", self.lock_path, e);
        }
    }
}
