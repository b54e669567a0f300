//! Daemon side of the reader-state segment: the single writer.
//!
//! `SegmentWriter` owns the read-write mapping and is the only thing allowed
//! to change it. It is `Sync` so reader workers can share it behind an `Arc`;
//! every write to a slot happens under that slot's mutex, which also guards
//! the daemon-local bookkeeping for the slot.
//!
//! # Publication order
//!
//! For every change to slot `i`:
//! 1. the record is written inside the slot's seqlock window,
//! 2. the slot's event counter is stored after the record,
//! 3. for attach/detach only, the header's version stamp is bumped after (2),
//! 4. the touched byte ranges are flushed to the backing file.

use crate::error::ShmError;
use crate::seqlock::CounterUpdate;
use crate::shm_layout::{
    MAX_READERS_LIMIT, ReaderSlotCell, SLOTS_OFFSET, SegmentHeader, bytes_for_segment, slot_ptr,
    slot_range,
};
use crate::slot_table::{Occupancy, SlotBook, SlotSnapshot};
use keystone_mmap::{MmapFileMut, create_truncated, publish_path, set_public_mode};
use keystone_state::{ReaderState, ReaderStatus, SlotIndex};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Parameters for a new segment.
#[derive(Debug, Copy, Clone)]
pub struct SegmentConfig {
    /// Number of reader slots, `1..=MAX_READERS_LIMIT`.
    pub max_readers: usize,
    /// Flush the slot to the backing file after every in-place publish, not
    /// only after attach/detach.
    pub sync_on_publish: bool,
}

impl SegmentConfig {
    pub fn new(max_readers: usize) -> Self {
        Self {
            max_readers,
            sync_on_publish: true,
        }
    }

    pub fn sync_on_publish(mut self, enabled: bool) -> Self {
        self.sync_on_publish = enabled;
        self
    }
}

pub struct SegmentWriter {
    mm: MmapFileMut,
    /// Start of the mapped region (header location).
    base: *mut u8,
    path: PathBuf,
    max_readers: usize,
    sync_on_publish: bool,
    /// Per-slot lock and bookkeeping. Lock order: one slot at a time.
    books: Box<[Mutex<SlotBook>]>,
    /// Source of occupancy generations; never reused within this writer.
    next_generation: AtomicU64,
}

// SAFETY: the raw base pointer stays valid for as long as `mm` lives, and
// every mutation of slot memory is serialized by the slot's mutex.
unsafe impl Send for SegmentWriter {}
unsafe impl Sync for SegmentWriter {}

impl SegmentWriter {
    /// Creates the segment and publishes it at `path`.
    ///
    /// The segment is built and flushed in a sibling staging file and then
    /// renamed onto `path`, so no client can ever map a half-written header.
    /// A stale segment already at `path` is replaced.
    ///
    /// # Errors
    /// - `InvalidCapacity` if `max_readers` is out of range
    /// - `ResourceExhausted` if the backing file cannot be sized or mapped
    /// - `Io` for any other file operation failure
    pub fn create<P: AsRef<Path>>(path: P, cfg: SegmentConfig) -> Result<Self, ShmError> {
        let path = path.as_ref();
        if cfg.max_readers == 0 || cfg.max_readers > MAX_READERS_LIMIT {
            return Err(ShmError::InvalidCapacity {
                requested: cfg.max_readers,
                limit: MAX_READERS_LIMIT,
            });
        }

        let bytes = bytes_for_segment(cfg.max_readers);
        let staged = staging_path(path);
        let file = create_truncated(&staged)?;
        let mut mm = match MmapFileMut::map_sized(file, bytes as u64) {
            Ok(mm) => mm,
            Err(source) => {
                let _ = std::fs::remove_file(&staged);
                return Err(ShmError::ResourceExhausted {
                    path: path.display().to_string(),
                    bytes,
                    source,
                });
            }
        };
        let base = mm.as_mut_ptr();

        // SAFETY: the staging file is private to us until it is renamed, and
        // the mapping was sized for the header plus `max_readers` slots.
        unsafe {
            ptr::write(base as *mut SegmentHeader, SegmentHeader::new(cfg.max_readers));
            for i in 0..cfg.max_readers {
                (*slot_ptr(base, i)).init(ReaderState::default());
            }
        }

        // Header and empty slots must reach the file before the path exists.
        let published = mm
            .flush()
            .and_then(|_| set_public_mode(&staged))
            .and_then(|_| publish_path(&staged, path));
        if let Err(e) = published {
            let _ = std::fs::remove_file(&staged);
            return Err(e.into());
        }

        info!(
            path = %path.display(),
            max_readers = cfg.max_readers,
            bytes,
            "reader-state segment published"
        );

        Ok(Self {
            mm,
            base,
            path: path.to_path_buf(),
            max_readers: cfg.max_readers,
            sync_on_publish: cfg.sync_on_publish,
            books: (0..cfg.max_readers)
                .map(|_| Mutex::new(SlotBook::default()))
                .collect(),
            next_generation: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: base points to the header we initialised in `create`
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    #[inline(always)]
    fn slot(&self, i: usize) -> &ReaderSlotCell {
        // SAFETY: callers pass an index checked against max_readers
        unsafe { &*slot_ptr(self.base, i) }
    }

    fn check(&self, index: SlotIndex) -> Result<usize, ShmError> {
        let i = index.as_usize();
        if i < self.max_readers {
            Ok(i)
        } else {
            Err(ShmError::InvalidSlot(index))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    pub fn version_stamp(&self) -> u64 {
        self.header().version_stamp.load(Ordering::Acquire)
    }

    /// Gives the lowest reusable slot to a new reader named `name`.
    ///
    /// A slot is reusable when it was never used, or when its previous reader
    /// was released and no daemon-side reference to it remains. The slot's
    /// event counter restarts at 0 and the version stamp is bumped.
    pub fn allocate_slot(&self, name: &str) -> Result<SlotIndex, ShmError> {
        for (i, book) in self.books.iter().enumerate() {
            let mut book = book.lock();
            if !book.is_reusable() {
                continue;
            }

            let index = SlotIndex(i as u16);
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
            book.occupancy = Occupancy::Live;
            book.references = 0;

            // SAFETY: we hold the slot lock and are the segment's only writer
            unsafe {
                self.slot(i)
                    .write(ReaderState::attached(name), CounterUpdate::Reset { generation })
            };
            let stamp = self.bump_version_stamp();
            self.sync(i, true);

            info!(slot = %index, reader = name, version_stamp = stamp, "reader attached");
            return Ok(index);
        }

        Err(ShmError::CapacityExceeded {
            max_readers: self.max_readers,
        })
    }

    /// Marks a live slot reader-removed.
    ///
    /// The last published record stays in place with `REMOVED` set; the slot
    /// becomes reusable only once its references are gone.
    pub fn release_slot(&self, index: SlotIndex) -> Result<(), ShmError> {
        let i = self.check(index)?;
        let mut book = self.books[i].lock();
        book.require_live(index)?;
        book.occupancy = Occupancy::Removed;

        let slot = self.slot(i);
        // SAFETY: slot lock held; single writer
        let counter = unsafe {
            let mut state = slot.writer_view();
            state.status_mut().insert(ReaderStatus::REMOVED);
            slot.write(state, CounterUpdate::Bump)
        };
        let stamp = self.bump_version_stamp();
        self.sync(i, true);

        info!(
            slot = %index,
            event_counter = counter,
            version_stamp = stamp,
            references = book.references,
            "reader removed"
        );
        Ok(())
    }

    /// Publishes an in-place change to a live slot as one batch.
    ///
    /// `f` edits a copy of the current record; the copy is written back and
    /// the event counter bumped. The version stamp does not move. Occupancy
    /// is owned by `allocate_slot`/`release_slot`, so `f` cannot set
    /// `REMOVED` or clear every status bit.
    ///
    /// Returns the new event counter.
    pub fn publish<F>(&self, index: SlotIndex, f: F) -> Result<u64, ShmError>
    where
        F: FnOnce(&mut ReaderState),
    {
        let i = self.check(index)?;
        let book = self.books[i].lock();
        book.require_live(index)?;
        Ok(self.commit(i, &book, f))
    }

    /// Takes a daemon-side reference on a live slot and publishes the new
    /// handle count together with whatever `f` changes.
    pub fn acquire_handle<F>(&self, index: SlotIndex, f: F) -> Result<u32, ShmError>
    where
        F: FnOnce(&mut ReaderState),
    {
        let i = self.check(index)?;
        let mut book = self.books[i].lock();
        let refs = book.acquire(index)?;
        self.commit(i, &book, f);
        Ok(refs)
    }

    /// Drops a daemon-side reference. Works on removed slots too; dropping the
    /// last reference of a removed slot makes it reusable.
    pub fn release_handle<F>(&self, index: SlotIndex, f: F) -> Result<u32, ShmError>
    where
        F: FnOnce(&mut ReaderState),
    {
        let i = self.check(index)?;
        let mut book = self.books[i].lock();
        let refs = book.release(index)?;
        self.commit(i, &book, f);
        if refs == 0 && book.occupancy == Occupancy::Removed {
            debug!(slot = %index, "removed slot released its last reference");
        }
        Ok(refs)
    }

    /// The reference-clearing step: forgets every daemon-side reference to
    /// the slot's occupant. Returns how many were dropped.
    pub fn clear_references(&self, index: SlotIndex) -> Result<u32, ShmError> {
        let i = self.check(index)?;
        let mut book = self.books[i].lock();
        let dropped = book.clear_references();
        if dropped > 0 {
            self.commit(i, &book, |state| {
                state.status_mut().remove(ReaderStatus::ACCESS_MASK)
            });
            debug!(slot = %index, dropped, "references cleared");
        }
        Ok(dropped)
    }

    /// Value copy of a slot.
    pub fn read_slot(&self, index: SlotIndex) -> Result<SlotSnapshot, ShmError> {
        let i = self.check(index)?;
        let _book = self.books[i].lock();
        // With the slot lock held no write can be in flight, so one attempt
        // always succeeds.
        self.slot(i)
            .read_bounded(1)
            .map(|c| SlotSnapshot::from_committed(index, c))
            .ok_or(ShmError::TornRead(index))
    }

    pub fn event_counter(&self, index: SlotIndex) -> Result<u64, ShmError> {
        let i = self.check(index)?;
        Ok(self.slot(i).event_counter())
    }

    pub fn occupancy(&self, index: SlotIndex) -> Result<Occupancy, ShmError> {
        let i = self.check(index)?;
        Ok(self.books[i].lock().occupancy)
    }

    pub fn references(&self, index: SlotIndex) -> Result<u32, ShmError> {
        let i = self.check(index)?;
        Ok(self.books[i].lock().references)
    }

    /// Slots currently holding a live reader, lowest index first.
    pub fn live_slots(&self) -> Vec<SlotIndex> {
        self.books
            .iter()
            .enumerate()
            .filter(|(_, b)| b.lock().occupancy == Occupancy::Live)
            .map(|(i, _)| SlotIndex(i as u16))
            .collect()
    }

    /// Tells clients that this mapping will never change again.
    pub fn retire(&self) {
        if self.header().retired.swap(1, Ordering::AcqRel) == 0 {
            if let Err(e) = self.mm.flush_range(0, SLOTS_OFFSET) {
                warn!(error = %e, "failed to flush retired header");
            }
            info!(path = %self.path.display(), "reader-state segment retired");
        }
    }

    /// Retires the segment and removes it from its well-known path.
    pub fn unlink(&self) -> io::Result<()> {
        self.retire();
        std::fs::remove_file(&self.path)
    }

    /// Writes a new version of slot `i` built from its current record.
    /// Caller holds the slot lock and has validated occupancy.
    fn commit<F>(&self, i: usize, book: &SlotBook, f: F) -> u64
    where
        F: FnOnce(&mut ReaderState),
    {
        let slot = self.slot(i);
        // SAFETY: slot lock held; single writer
        let mut state = unsafe { slot.writer_view() };
        f(&mut state);
        state.set_handle_count(book.references);
        state
            .status_mut()
            .set(ReaderStatus::REMOVED, book.occupancy == Occupancy::Removed);
        if book.occupancy == Occupancy::Live && state.status().is_empty() {
            state.status_mut().insert(ReaderStatus::ABSENT);
        }

        // SAFETY: as above
        let counter = unsafe { slot.write(state, CounterUpdate::Bump) };
        self.sync(i, false);

        debug!(
            slot = i,
            event_counter = counter,
            status = %state.status(),
            handles = book.references,
            "slot published"
        );
        counter
    }

    fn bump_version_stamp(&self) -> u64 {
        // Release: the slot write that caused this bump is visible to any
        // reader that observes the new stamp.
        self.header().version_stamp.fetch_add(1, Ordering::Release) + 1
    }

    /// Flushes slot `i`, plus the header for structural changes.
    ///
    /// The mapping is shared, so other processes already see the bytes; a
    /// failed flush only affects the backing file and is logged, not returned.
    fn sync(&self, i: usize, structural: bool) {
        if !structural && !self.sync_on_publish {
            return;
        }
        let (offset, len) = slot_range(i);
        let mut res = self.mm.flush_range(offset, len);
        if structural {
            res = res.and_then(|_| self.mm.flush_range(0, SLOTS_OFFSET));
        }
        if let Err(e) = res {
            warn!(slot = i, error = %e, "segment flush failed");
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.retire();
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(format!(".{}.tmp", std::process::id()));
    PathBuf::from(s)
}
