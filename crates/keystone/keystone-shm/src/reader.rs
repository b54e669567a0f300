//! Client side of the reader-state segment: a read-only mapping.
//!
//! Any number of processes may attach. Nothing here ever waits on the writer:
//! a snapshot that keeps racing the writer is given up after a fixed number
//! of attempts and reported as `TornRead`, which the caller retries on its
//! next poll.

use crate::error::ShmError;
use crate::shm_layout::{ReaderSlotCell, SegmentHeader, slot_ptr};
use crate::slot_table::SlotSnapshot;
use keystone_mmap::MmapFile;
use keystone_state::SlotIndex;
use std::io;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::debug;

/// How many times a snapshot is retried before giving up for this poll.
pub const READ_ATTEMPTS: usize = 64;

pub struct SegmentReader {
    /// `None` once detached.
    mm: Option<MmapFile>,
    path: PathBuf,
    max_readers: usize,
}

impl SegmentReader {
    /// Maps the segment published at `path` read-only.
    ///
    /// Only the header is read; no slot is touched unless the header matches
    /// this build's protocol revision and slot size.
    ///
    /// # Errors
    /// - `NotFound` if nothing is published at `path` yet
    /// - `VersionMismatch` if the header is foreign, truncated, or from
    ///   another protocol revision
    /// - `Io` for any other failure
    pub fn attach_read_only<P: AsRef<Path>>(path: P) -> Result<Self, ShmError> {
        let path = path.as_ref();
        let mm = MmapFile::open_ro(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ShmError::NotFound {
                path: path.display().to_string(),
            },
            _ => ShmError::Io(e),
        })?;

        let mismatch = |reason| ShmError::VersionMismatch {
            path: path.display().to_string(),
            reason,
        };

        if mm.len() < size_of::<SegmentHeader>() {
            return Err(mismatch("segment shorter than its header"));
        }
        // SAFETY: the mapping holds at least a full header
        let header = unsafe { &*(mm.as_ptr() as *const SegmentHeader) };
        header.validate(mm.len()).map_err(mismatch)?;
        let max_readers = header.max_readers as usize;

        debug!(path = %path.display(), max_readers, "segment attached read-only");

        Ok(Self {
            mm: Some(mm),
            path: path.to_path_buf(),
            max_readers,
        })
    }

    /// Unmaps the segment. Calling it again is a no-op.
    pub fn detach(&mut self) {
        if self.mm.take().is_some() {
            debug!(path = %self.path.display(), "segment detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.mm.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    fn base(&self) -> Result<*const u8, ShmError> {
        self.mm.as_ref().map(|m| m.as_ptr()).ok_or(ShmError::Detached)
    }

    fn header(&self) -> Result<&SegmentHeader, ShmError> {
        // SAFETY: validated in attach_read_only; the mapping lives as long as self.mm
        Ok(unsafe { &*(self.base()? as *const SegmentHeader) })
    }

    fn slot(&self, index: SlotIndex) -> Result<&ReaderSlotCell, ShmError> {
        let i = index.as_usize();
        if i >= self.max_readers {
            return Err(ShmError::InvalidSlot(index));
        }
        // SAFETY: index checked against the validated slot count
        Ok(unsafe { &*slot_ptr(self.base()?, i) })
    }

    pub fn version_stamp(&self) -> Result<u64, ShmError> {
        Ok(self.header()?.version_stamp.load(Ordering::Acquire))
    }

    pub fn event_counter(&self, index: SlotIndex) -> Result<u64, ShmError> {
        Ok(self.slot(index)?.event_counter())
    }

    pub fn generation(&self, index: SlotIndex) -> Result<u64, ShmError> {
        Ok(self.slot(index)?.generation())
    }

    /// Value copy of a slot, taken without ever blocking the writer.
    pub fn read_slot(&self, index: SlotIndex) -> Result<SlotSnapshot, ShmError> {
        self.slot(index)?
            .read_bounded(READ_ATTEMPTS)
            .map(|c| SlotSnapshot::from_committed(index, c))
            .ok_or(ShmError::TornRead(index))
    }

    /// The writer shut down; this mapping will never change again.
    pub fn is_retired(&self) -> Result<bool, ShmError> {
        Ok(self.header()?.is_retired())
    }

    /// Whether this mapping no longer is the segment clients should follow:
    /// the writer retired it, or a newer segment replaced it at `path`.
    pub fn is_stale(&self) -> Result<bool, ShmError> {
        if self.is_retired()? {
            return Ok(true);
        }
        let mm = self.mm.as_ref().ok_or(ShmError::Detached)?;
        let mapped = mm.metadata()?;
        match std::fs::metadata(&self.path) {
            Ok(current) => Ok(!same_file(&mapped, &current)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}
