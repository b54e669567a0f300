//! Seqlock slot carrying one reader record plus its published counters.
//!
//! A seqlock lets one writer and any number of readers share a record without
//! blocking each other. The writer makes the sequence odd, writes, then makes
//! it even again; a reader that sees the same even sequence before and after
//! copying the record knows the copy is not torn.
//!
//! On top of the raw sequence each slot publishes two cheap-to-poll values:
//!
//! - **event counter**: starts at 0 for each occupancy and is bumped once per
//!   committed write. It is stored after the record bytes, so a reader that
//!   observes a new counter and then takes a snapshot gets content at least as
//!   new as that counter.
//! - **generation**: identifies the occupancy. It changes when the slot is
//!   reused for a different reader, which is also the only time the event
//!   counter goes backwards.
//!
//! The raw sequence never goes backwards, including across reuse, so a reset
//! counter can never let a reader accept a torn copy.
//!
//! # Protocol
//!
//! **Writer** (single writer per slot, enforced by the caller):
//! 1. `seq += 1` (odd), release fence
//! 2. Write record
//! 3. Store counter (and generation on reuse) with Release
//! 4. `seq += 1` (even) with Release
//!
//! **Reader:**
//! 1. Load `seq` with Acquire; odd means a write is in progress
//! 2. Copy counter, generation and record
//! 3. Acquire fence, load `seq` again; if it changed the copy is discarded

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// What a write does to the slot's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterUpdate {
    /// In-place change: event counter + 1.
    Bump,
    /// New occupancy: event counter back to 0, generation replaced.
    Reset { generation: u64 },
}

/// A consistent copy taken out of a slot.
#[derive(Clone, Copy, Debug)]
pub struct Committed<T: Copy> {
    pub event_counter: u64,
    pub generation: u64,
    pub value: T,
}

/// A record protected by a sequence lock.
///
/// # Sequence Number Semantics
///
/// - **Even**: Data is stable, safe to read
/// - **Odd**: Write in progress, readers must retry
#[repr(C, align(64))]
pub struct SeqlockSlot<T: Copy> {
    seq: AtomicU64,
    event_counter: AtomicU64,
    generation: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: writes to `data` are serialized by the caller of `write` and readers
// only ever take volatile copies validated by the sequence number.
unsafe impl<T: Copy + Send> Sync for SeqlockSlot<T> {}

impl<T: Copy> SeqlockSlot<T> {
    /// Puts the slot in its initial state: sequence 0, counters 0, `value`.
    ///
    /// # Safety
    /// No other process or thread may access the slot yet.
    pub unsafe fn init(&self, value: T) {
        self.seq.store(0, Ordering::Relaxed);
        self.event_counter.store(0, Ordering::Relaxed);
        self.generation.store(0, Ordering::Relaxed);
        unsafe { (*self.data.get()).as_mut_ptr().write(value) };
    }

    /// Copy of the record as the writer last left it.
    ///
    /// # Safety
    /// Only the slot's single writer may call this; it skips the consistency
    /// check because nothing else can be writing.
    #[inline]
    pub unsafe fn writer_view(&self) -> T {
        unsafe { ptr::read_volatile((*self.data.get()).as_ptr()) }
    }

    /// Replaces the record with `value` and updates the counters.
    ///
    /// Returns the event counter value that was published.
    ///
    /// # Safety
    /// Callers must guarantee a single writer for this slot at a time, both
    /// within the process and across processes.
    pub unsafe fn write(&self, value: T, update: CounterUpdate) -> u64 {
        let s0 = self.seq.load(Ordering::Relaxed);
        // Mark write-in-progress (odd sequence number)
        self.seq.store(s0.wrapping_add(1), Ordering::Relaxed);
        // Keeps the record writes below from being observed before the odd sequence
        fence(Ordering::Release);

        unsafe { ptr::write_volatile((*self.data.get()).as_mut_ptr(), value) };

        let counter = match update {
            CounterUpdate::Bump => {
                let c = self.event_counter.load(Ordering::Relaxed).wrapping_add(1);
                self.event_counter.store(c, Ordering::Release);
                c
            }
            CounterUpdate::Reset { generation } => {
                self.generation.store(generation, Ordering::Release);
                self.event_counter.store(0, Ordering::Release);
                0
            }
        };

        // Mark write-complete (even sequence number)
        self.seq.store(s0.wrapping_add(2), Ordering::Release);
        counter
    }

    /// Current event counter, without touching the record.
    #[inline(always)]
    pub fn event_counter(&self) -> u64 {
        self.event_counter.load(Ordering::Acquire)
    }

    /// Current occupancy generation, without touching the record.
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Makes a single attempt at a consistent copy.
    ///
    /// Returns `None` if a write was in progress or overlapped the copy.
    #[inline]
    pub fn try_read(&self) -> Option<Committed<T>> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 & 1 == 1 {
            return None;
        }

        let event_counter = self.event_counter.load(Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Relaxed);
        // SAFETY: the slot was initialised by the writer before it became
        // reachable; a copy that raced a write is thrown away below.
        let value = unsafe { ptr::read_volatile((*self.data.get()).as_ptr()) };

        fence(Ordering::Acquire);
        let s2 = self.seq.load(Ordering::Relaxed);
        if s1 == s2 {
            Some(Committed {
                event_counter,
                generation,
                value,
            })
        } else {
            None
        }
    }

    /// Retries `try_read` up to `attempts` times, spinning in between.
    ///
    /// Never waits for the writer beyond that budget.
    #[inline]
    pub fn read_bounded(&self, attempts: usize) -> Option<Committed<T>> {
        for _ in 0..attempts {
            if let Some(c) = self.try_read() {
                return Some(c);
            }
            std::hint::spin_loop();
        }
        None
    }
}
