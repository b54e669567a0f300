// Daemon-local bookkeeping for each reader slot.
//
// The segment only says what clients may see. Whether a slot index can be
// handed to a new reader is decided here, from state that never leaves the
// daemon: a removed slot stays unusable while anything inside the daemon
// still references its old occupant.

use crate::error::ShmError;
use crate::seqlock::Committed;
use keystone_state::{ReaderState, SlotIndex};

/// Value copy of one slot, as returned by `read_slot` on either side.
#[derive(Clone, Copy, Debug)]
pub struct SlotSnapshot {
    pub index: SlotIndex,
    pub event_counter: u64,
    /// Occupancy the snapshot belongs to; changes when the index is reused.
    pub generation: u64,
    pub state: ReaderState,
}

impl SlotSnapshot {
    pub(crate) fn from_committed(index: SlotIndex, c: Committed<ReaderState>) -> Self {
        Self {
            index,
            event_counter: c.event_counter,
            generation: c.generation,
            state: c.value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Occupancy {
    /// Never used, or cleared.
    #[default]
    Free,
    /// A reader is attached.
    Live,
    /// Reader detached; the slot still shows its last state as REMOVED.
    Removed,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SlotBook {
    pub occupancy: Occupancy,
    /// Handles held inside the daemon on the current (or removed) occupant.
    pub references: u32,
}

impl SlotBook {
    /// A slot may be given to a new reader once it is free, or removed with
    /// every reference to the old occupant cleared.
    #[inline]
    pub fn is_reusable(&self) -> bool {
        match self.occupancy {
            Occupancy::Free => true,
            Occupancy::Removed => self.references == 0,
            Occupancy::Live => false,
        }
    }

    pub fn require_live(&self, index: SlotIndex) -> Result<(), ShmError> {
        if self.occupancy == Occupancy::Live {
            Ok(())
        } else {
            Err(ShmError::SlotNotLive(index))
        }
    }

    pub fn acquire(&mut self, index: SlotIndex) -> Result<u32, ShmError> {
        self.require_live(index)?;
        self.references += 1;
        Ok(self.references)
    }

    /// Drops one reference; allowed on removed slots so that sessions can
    /// let go of a reader that has already detached.
    pub fn release(&mut self, index: SlotIndex) -> Result<u32, ShmError> {
        if self.occupancy == Occupancy::Free || self.references == 0 {
            return Err(ShmError::NoHandles(index));
        }
        self.references -= 1;
        Ok(self.references)
    }

    /// Forgets every reference at once; returns how many there were.
    pub fn clear_references(&mut self) -> u32 {
        std::mem::take(&mut self.references)
    }
}
