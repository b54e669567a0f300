//! One daemon per segment path.
//!
//! An advisory `flock` on a lock file beside the segment. The lock belongs
//! to the open file, so it is released when the holder exits for any reason
//! and a crashed daemon never blocks its successor.

use crate::error::ContextError;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Takes the lock at `path` without waiting and records our pid in it.
    ///
    /// # Errors
    /// - `AlreadyRunning` if another process holds it
    /// - `Io` if the lock file cannot be opened or written
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        try_lock_exclusive(&file).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                ContextError::AlreadyRunning {
                    path: path.display().to_string(),
                }
            } else {
                ContextError::Io(e)
            }
        })?;

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.refresh_pid()?;
        info!(path = %path.display(), "instance lock acquired");
        Ok(lock)
    }

    /// Rewrites the recorded pid; the lock itself survives `fork`, the pid
    /// in the file does not.
    pub fn refresh_pid(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY: fd is owned by `file` and open for the duration of the call
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}
