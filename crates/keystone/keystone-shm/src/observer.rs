//! Counter-gated change detection over a `SegmentReader`.
//!
//! Each poll round:
//! 1. Load the segment version stamp. If it moved, rescan every slot and
//!    report attach/detach (and changes of slots that stayed attached).
//! 2. For every tracked slot, load its event counter. If it moved, take a
//!    snapshot and report the change.
//!
//! The observer does not promise to report every intermediate state, only
//! that after a round it has reported the latest committed state of each
//! slot it could read. Slots whose snapshot raced the writer keep their old
//! last-seen values and are retried next round.

use crate::error::ShmError;
use crate::reader::SegmentReader;
use crate::slot_table::SlotSnapshot;
use keystone_state::SlotIndex;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Notification handed to the session layer.
#[derive(Clone, Copy, Debug)]
pub enum SlotEvent {
    /// A reader appeared in this slot.
    Attached(SlotSnapshot),
    /// The reader tracked in this slot detached, or the slot was reused by a
    /// different reader (an `Attached` for the new one follows).
    Removed(SlotIndex),
    /// The tracked reader's record changed in place; always a live record.
    Changed(SlotSnapshot),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Seen {
    generation: u64,
    event_counter: u64,
}

pub struct Observer {
    reader: SegmentReader,
    last_version: Option<u64>,
    tracked: BTreeMap<SlotIndex, Seen>,
}

impl Observer {
    /// Starts observing. The first poll reports every live reader as attached.
    pub fn new(reader: SegmentReader) -> Self {
        Self {
            reader,
            last_version: None,
            tracked: BTreeMap::new(),
        }
    }

    pub fn reader(&self) -> &SegmentReader {
        &self.reader
    }

    pub fn into_reader(self) -> SegmentReader {
        self.reader
    }

    /// Slots currently believed to hold a live reader.
    pub fn tracked(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        self.tracked.keys().copied()
    }

    pub fn last_version(&self) -> Option<u64> {
        self.last_version
    }

    /// Runs one poll round, handing each event to `sink`.
    ///
    /// Returns the number of events dispatched.
    ///
    /// # Errors
    /// - `VersionMismatch` once the writer has retired the segment
    /// - transient errors (`TornRead`, `Io`) leave the observer consistent;
    ///   the next call picks up where this one stopped
    pub fn poll<F>(&mut self, mut sink: F) -> Result<usize, ShmError>
    where
        F: FnMut(SlotEvent),
    {
        if self.reader.is_retired()? {
            return Err(ShmError::VersionMismatch {
                path: self.reader.path().display().to_string(),
                reason: "segment retired by its writer",
            });
        }

        let mut dispatched = 0;
        let version = self.reader.version_stamp()?;
        if self.last_version != Some(version) {
            dispatched += self.rescan(version, &mut sink)?;
        }

        for (&index, seen) in self.tracked.iter_mut() {
            let counter = self.reader.event_counter(index)?;
            if counter == seen.event_counter {
                continue;
            }
            let snap = match self.reader.read_slot(index) {
                Ok(snap) => snap,
                Err(ShmError::TornRead(_)) => {
                    trace!(slot = %index, "snapshot raced the writer, retrying next poll");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if snap.generation != seen.generation || !snap.state.is_live() {
                // Detached or reused after this round's stamp was loaded. The
                // stamp moves right after the counter, so the next round
                // rescans and reports the remove (and any attach).
                continue;
            }
            debug_assert!(snap.event_counter >= seen.event_counter);
            seen.event_counter = snap.event_counter;
            sink(SlotEvent::Changed(snap));
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Compares every slot against the tracked set. `last_version` is only
    /// advanced once every slot was read, so a failed rescan is redone.
    fn rescan<F>(&mut self, version: u64, sink: &mut F) -> Result<usize, ShmError>
    where
        F: FnMut(SlotEvent),
    {
        let mut dispatched = 0;
        for i in 0..self.reader.max_readers() {
            let index = SlotIndex(i as u16);
            let snap = self.reader.read_slot(index)?;
            let live = snap.state.is_live();
            let now = Seen {
                generation: snap.generation,
                event_counter: snap.event_counter,
            };

            match (self.tracked.get(&index).copied(), live) {
                (None, true) => {
                    self.tracked.insert(index, now);
                    sink(SlotEvent::Attached(snap));
                    dispatched += 1;
                }
                (Some(_), false) => {
                    self.tracked.remove(&index);
                    sink(SlotEvent::Removed(index));
                    dispatched += 1;
                }
                (Some(seen), true) if seen.generation != now.generation => {
                    self.tracked.insert(index, now);
                    sink(SlotEvent::Removed(index));
                    sink(SlotEvent::Attached(snap));
                    dispatched += 2;
                }
                (Some(seen), true) if seen.event_counter != now.event_counter => {
                    self.tracked.insert(index, now);
                    sink(SlotEvent::Changed(snap));
                    dispatched += 1;
                }
                _ => {}
            }
        }

        debug!(
            version_stamp = version,
            tracked = self.tracked.len(),
            "occupancy rescanned"
        );
        self.last_version = Some(version);
        Ok(dispatched)
    }
}
