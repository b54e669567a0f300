//! Shared memory layout of the reader-state segment.
//!
//! The segment is a fixed-size file mapped by the daemon (read-write) and by
//! any number of clients (read-only). Its layout is stable for a given
//! `SEGMENT_VERSION`; anything that changes the bytes below must bump it.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     SegmentHeader (64B)                        │
//! │  ┌───────┬─────────┬─────────────┬───────────┬──────────────┐  │
//! │  │ magic │ version │ max_readers │ slot_size │ segment_size │  │
//! │  ├───────┴─────────┴─────────────┴───────────┴──────────────┤  │
//! │  │  version_stamp (atomic)  │  retired (atomic)  │  pad     │  │
//! │  └──────────────────────────┴────────────────────┴──────────┘  │
//! ├────────────────────────────────────────────────────────────────┤
//! │  SeqlockSlot<ReaderState>[0]                                   │
//! │  ┌──────┬───────────────┬────────────┬──────────────────────┐  │
//! │  │ seq  │ event_counter │ generation │  ReaderState (100B)  │  │
//! │  └──────┴───────────────┴────────────┴──────────────────────┘  │
//! ├────────────────────────────────────────────────────────────────┤
//! │                          ...                                   │
//! ├────────────────────────────────────────────────────────────────┤
//! │  SeqlockSlot<ReaderState>[max_readers-1]                       │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use crate::seqlock::SeqlockSlot;
use keystone_state::ReaderState;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic number identifying a reader-state segment.
///
/// ASCII encoding of "KEYSTONE": `0x4B45_5953_544F_4E45`.
pub const SEGMENT_MAGIC: u64 = 0x4B45_5953_544F_4E45;

/// Publication protocol revision. Clients refuse any other value.
pub const SEGMENT_VERSION: u64 = 1;

/// Compile-time upper bound on `max_readers`.
pub const MAX_READERS_LIMIT: usize = 256;

/// One slot as stored in the segment.
pub type ReaderSlotCell = SeqlockSlot<ReaderState>;

/// Header at offset 0 of every segment.
///
/// Aligned to 64 bytes so the slot array that follows it starts on a cache
/// line, which `SeqlockSlot` requires.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Must equal `SEGMENT_MAGIC`.
    pub magic: u64,

    /// Must equal `SEGMENT_VERSION`.
    pub version: u64,

    /// Number of reader slots following the header.
    pub max_readers: u64,

    /// `size_of::<ReaderSlotCell>()` as compiled into the writer.
    pub slot_size: u64,

    /// Total bytes of the segment, header included.
    pub segment_size: u64,

    /// Bumped on every attach and every detach, never on in-place updates.
    pub version_stamp: AtomicU64,

    /// Set to non-zero once the writer has shut down; the mapping will never
    /// change again.
    pub retired: AtomicU64,
}

impl SegmentHeader {
    pub fn new(max_readers: usize) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            max_readers: max_readers as u64,
            slot_size: size_of::<ReaderSlotCell>() as u64,
            segment_size: bytes_for_segment(max_readers) as u64,
            version_stamp: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    /// Validates a mapped header against what this build expects.
    ///
    /// `mapped_len` is the length of the mapping the header was read from; a
    /// header claiming more bytes than are mapped is rejected.
    pub fn validate(&self, mapped_len: usize) -> Result<(), &'static str> {
        if self.magic != SEGMENT_MAGIC {
            return Err("bad magic");
        }
        if self.version != SEGMENT_VERSION {
            return Err("wrong protocol version");
        }
        if self.slot_size as usize != size_of::<ReaderSlotCell>() {
            return Err("slot size mismatch");
        }
        let max_readers = self.max_readers as usize;
        if max_readers == 0 || max_readers > MAX_READERS_LIMIT {
            return Err("reader count out of range");
        }
        if self.segment_size as usize != bytes_for_segment(max_readers) {
            return Err("segment size disagrees with reader count");
        }
        if self.segment_size as usize > mapped_len {
            return Err("segment truncated");
        }
        Ok(())
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire) != 0
    }
}

/// Byte offset of slot 0.
pub const SLOTS_OFFSET: usize = size_of::<SegmentHeader>();

/// Total bytes for a segment holding `max_readers` slots.
pub fn bytes_for_segment(max_readers: usize) -> usize {
    SLOTS_OFFSET + max_readers * size_of::<ReaderSlotCell>()
}

/// Byte range `(offset, len)` of slot `index`, used to flush one slot.
#[inline]
pub fn slot_range(index: usize) -> (usize, usize) {
    let len = size_of::<ReaderSlotCell>();
    (SLOTS_OFFSET + index * len, len)
}

/// Pointer to slot `index` of the segment starting at `base`.
///
/// # Safety
/// `base` must point to a validated segment with more than `index` slots.
#[inline(always)]
pub unsafe fn slot_ptr(base: *const u8, index: usize) -> *const ReaderSlotCell {
    unsafe { (base.add(SLOTS_OFFSET) as *const ReaderSlotCell).add(index) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::align_of;

    #[test]
    fn header_fills_one_cache_line() {
        assert_eq!(size_of::<SegmentHeader>(), 64);
        assert_eq!(align_of::<SegmentHeader>(), 64);
        assert_eq!(SLOTS_OFFSET % align_of::<ReaderSlotCell>(), 0);
    }

    #[test]
    fn slot_is_two_cache_lines() {
        assert_eq!(size_of::<ReaderSlotCell>(), 128);
        assert_eq!(bytes_for_segment(2), 64 + 2 * 128);
        assert_eq!(slot_range(1), (64 + 128, 128));
    }

    #[test]
    fn fresh_header_validates() {
        let h = SegmentHeader::new(4);
        assert_eq!(h.validate(bytes_for_segment(4)), Ok(()));
        assert!(!h.is_retired());
    }

    #[test]
    fn validate_rejects_foreign_or_stale_headers() {
        let len = bytes_for_segment(4);

        let mut h = SegmentHeader::new(4);
        h.magic = 0;
        assert_eq!(h.validate(len), Err("bad magic"));

        let mut h = SegmentHeader::new(4);
        h.version = SEGMENT_VERSION + 1;
        assert_eq!(h.validate(len), Err("wrong protocol version"));

        let mut h = SegmentHeader::new(4);
        h.slot_size = 64;
        assert_eq!(h.validate(len), Err("slot size mismatch"));

        let mut h = SegmentHeader::new(4);
        h.max_readers = 0;
        assert_eq!(h.validate(len), Err("reader count out of range"));

        let h = SegmentHeader::new(4);
        assert_eq!(h.validate(len - 1), Err("segment truncated"));
    }
}
