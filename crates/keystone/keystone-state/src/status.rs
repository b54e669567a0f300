#![forbid(unsafe_code)]

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Reader/card status bit-set as published in a slot.
    ///
    /// Stored as a raw `u32` so any bit pattern read back from the segment is
    /// a valid value; unknown bits are kept, never interpreted.
    #[repr(transparent)]
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReaderStatus: u32 {
        const PRESENT = 1 << 0;
        const ABSENT = 1 << 1;
        /// Card inserted but not answering reset (mute).
        const UNRESPONSIVE = 1 << 2;
        const POWERED = 1 << 3;
        /// A transmission protocol has been negotiated.
        const SPECIFIC = 1 << 4;
        const EXCLUSIVE = 1 << 5;
        const SHARED = 1 << 6;
        const UNAVAILABLE = 1 << 7;
        const REMOVED = 1 << 8;
    }
}

impl ReaderStatus {
    /// Bits describing the card itself, cleared together on insert/remove.
    pub const CARD_MASK: Self = Self::PRESENT
        .union(Self::ABSENT)
        .union(Self::UNRESPONSIVE)
        .union(Self::POWERED)
        .union(Self::SPECIFIC);

    /// Bits describing client access to the reader.
    pub const ACCESS_MASK: Self = Self::EXCLUSIVE.union(Self::SHARED);
}

impl Default for ReaderStatus {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReaderStatus({self})")
    }
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("EMPTY");
        }
        bitflags::parser::to_writer(self, f)
    }
}
