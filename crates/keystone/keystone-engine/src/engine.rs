//! Daemon-side reader manager.
//!
//! Applies `ReaderEvent`s to the segment through the writer's publication
//! protocol, and arbitrates reader access between client contexts: any
//! number of shared handles, or a single exclusive one.

use crate::error::EngineError;
use crate::event::{AccessMode, ReaderEvent};
use keystone_context::TokenMinter;
use keystone_shm::SegmentWriter;
use keystone_state::{ContextToken, ReaderStatus, SlotIndex};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What an applied event produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Attached(SlotIndex),
    Detached(SlotIndex),
    /// In-place update committed under this event counter.
    Published { slot: SlotIndex, event_counter: u64 },
    Opened(ContextToken),
    /// Context closed; how many handles it still held.
    Closed { token: ContextToken, released: usize },
    /// Handles now held on the reader.
    Handles { slot: SlotIndex, count: u32 },
}

#[derive(Clone, Copy, Debug)]
struct Handle {
    token: ContextToken,
    mode: AccessMode,
}

pub struct DaemonEngine {
    writer: Arc<SegmentWriter>,
    minter: TokenMinter,
    handles: HashMap<SlotIndex, Vec<Handle>>,
}

impl DaemonEngine {
    pub fn new(writer: Arc<SegmentWriter>, minter: TokenMinter) -> Self {
        Self {
            writer,
            minter,
            handles: HashMap::new(),
        }
    }

    pub fn writer(&self) -> &Arc<SegmentWriter> {
        &self.writer
    }

    pub fn apply(&mut self, event: ReaderEvent) -> Result<Outcome, EngineError> {
        match event {
            ReaderEvent::Attach { name } => Ok(Outcome::Attached(self.writer.allocate_slot(&name)?)),
            ReaderEvent::Detach { slot } => self.detach(slot),
            ReaderEvent::Insert {
                slot,
                atr,
                protocol,
            } => self.publish(slot, |s| s.insert_card(&atr, protocol)),
            ReaderEvent::Remove { slot } => self.publish(slot, |s| s.remove_card()),
            ReaderEvent::Mute { slot } => self.publish(slot, |s| s.mark_unresponsive()),
            ReaderEvent::Unavailable { slot } => {
                self.publish(slot, |s| s.status_mut().insert(ReaderStatus::UNAVAILABLE))
            }
            ReaderEvent::Open => {
                let token = self.minter.mint()?;
                info!(%token, "context opened");
                Ok(Outcome::Opened(token))
            }
            ReaderEvent::Close { token } => self.close(token),
            ReaderEvent::Connect { slot, token, mode } => self.connect(slot, token, mode),
            ReaderEvent::Disconnect { slot, token } => self.disconnect(slot, token),
        }
    }

    /// Applies one command line. Blank lines and `#` comments are skipped;
    /// a command that fails is logged.
    ///
    /// Returns whether a command was applied.
    pub fn apply_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return false;
        }
        match ReaderEvent::parse(line).and_then(|ev| self.apply(ev)) {
            Ok(outcome) => {
                debug!(?outcome, "command applied");
                true
            }
            Err(e) => {
                warn!(command = line, error = %e, "command failed");
                false
            }
        }
    }

    /// Applies lines from `lines` until `stop` is set or the source
    /// disconnects. `stop` is checked at least once per `tick`.
    ///
    /// Returns how many commands were applied successfully.
    pub fn serve(&mut self, lines: &Receiver<String>, stop: &AtomicBool, tick: Duration) -> usize {
        let mut applied = 0;
        while !stop.load(Ordering::SeqCst) {
            match lines.recv_timeout(tick) {
                Ok(line) => {
                    if self.apply_line(&line) {
                        applied += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("event source closed");
                    break;
                }
            }
        }
        applied
    }

    /// Retires the segment and unlinks it from its path.
    pub fn shutdown(self) -> io::Result<()> {
        self.writer.unlink()
    }

    fn publish<F>(&self, slot: SlotIndex, f: F) -> Result<Outcome, EngineError>
    where
        F: FnOnce(&mut keystone_state::ReaderState),
    {
        let event_counter = self.writer.publish(slot, f)?;
        Ok(Outcome::Published {
            slot,
            event_counter,
        })
    }

    /// Removes the reader, then drops every session handle on it so the slot
    /// can be given to the next reader.
    fn detach(&mut self, slot: SlotIndex) -> Result<Outcome, EngineError> {
        self.writer.release_slot(slot)?;
        let orphaned = self.handles.remove(&slot).map_or(0, |h| h.len());
        let cleared = self.writer.clear_references(slot)?;
        debug_assert_eq!(orphaned, cleared as usize);
        if orphaned > 0 {
            info!(%slot, orphaned, "handles on detached reader dropped");
        }
        Ok(Outcome::Detached(slot))
    }

    /// Releases every handle `token` holds, then retires it. A failed
    /// release leaves the context live so the close can be retried.
    fn close(&mut self, token: ContextToken) -> Result<Outcome, EngineError> {
        if !self.minter.is_live(token) {
            return Err(EngineError::UnknownContext(token));
        }

        let mut released = 0;
        let held: Vec<SlotIndex> = self
            .handles
            .iter()
            .filter(|(_, hs)| hs.iter().any(|h| h.token == token))
            .map(|(&slot, _)| slot)
            .collect();
        for slot in held {
            while self.take_handle(slot, token).is_some() {
                self.release_handle(slot)?;
                released += 1;
            }
        }
        self.minter.retire(token);

        info!(%token, released, "context closed");
        Ok(Outcome::Closed { token, released })
    }

    fn connect(
        &mut self,
        slot: SlotIndex,
        token: ContextToken,
        mode: AccessMode,
    ) -> Result<Outcome, EngineError> {
        if !self.minter.is_live(token) {
            return Err(EngineError::UnknownContext(token));
        }

        let held = self.handles.get(&slot).map(Vec::as_slice).unwrap_or_default();
        if held.iter().any(|h| h.mode == AccessMode::Exclusive) {
            return Err(EngineError::SharingViolation {
                slot,
                held: "exclusive",
            });
        }
        if mode == AccessMode::Exclusive && !held.is_empty() {
            return Err(EngineError::SharingViolation {
                slot,
                held: "shared",
            });
        }

        let bit = match mode {
            AccessMode::Shared => ReaderStatus::SHARED,
            AccessMode::Exclusive => ReaderStatus::EXCLUSIVE,
        };
        let count = self.writer.acquire_handle(slot, |s| {
            s.status_mut().remove(ReaderStatus::ACCESS_MASK);
            s.status_mut().insert(bit);
        })?;
        self.handles.entry(slot).or_default().push(Handle { token, mode });

        debug!(%slot, %token, ?mode, handles = count, "reader connected");
        Ok(Outcome::Handles { slot, count })
    }

    fn disconnect(&mut self, slot: SlotIndex, token: ContextToken) -> Result<Outcome, EngineError> {
        if self.take_handle(slot, token).is_none() {
            return Err(EngineError::NotHeld { slot, token });
        }
        let count = self.release_handle(slot)?;
        debug!(%slot, %token, handles = count, "reader disconnected");
        Ok(Outcome::Handles { slot, count })
    }

    /// Forgets one handle of `token` on `slot` in the session table.
    fn take_handle(&mut self, slot: SlotIndex, token: ContextToken) -> Option<Handle> {
        let hs = self.handles.get_mut(&slot)?;
        let pos = hs.iter().position(|h| h.token == token)?;
        let handle = hs.remove(pos);
        if hs.is_empty() {
            self.handles.remove(&slot);
        }
        Some(handle)
    }

    /// Publishes the drop of one handle with access bits matching what is
    /// left. Only shared handles can remain once one is gone.
    fn release_handle(&self, slot: SlotIndex) -> Result<u32, EngineError> {
        let remaining = self.handles.get(&slot).is_some_and(|hs| !hs.is_empty());
        let count = self.writer.release_handle(slot, |s| {
            s.status_mut().remove(ReaderStatus::ACCESS_MASK);
            if remaining {
                s.status_mut().insert(ReaderStatus::SHARED);
            }
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::spawn_line_source;
    use keystone_shm::{Occupancy, SegmentConfig, SegmentReader, ShmError};
    use keystone_state::CardProtocol;

    fn engine(max_readers: usize) -> (tempfile::TempDir, DaemonEngine, SegmentReader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader_state");
        let writer = SegmentWriter::create(&path, SegmentConfig::new(max_readers)).unwrap();
        let reader = SegmentReader::attach_read_only(&path).unwrap();
        let engine = DaemonEngine::new(Arc::new(writer), TokenMinter::new().unwrap());
        (dir, engine, reader)
    }

    fn cmd(e: &mut DaemonEngine, line: &str) -> Result<Outcome, EngineError> {
        e.apply(ReaderEvent::parse(line).unwrap())
    }

    fn open(e: &mut DaemonEngine) -> ContextToken {
        match cmd(e, "open").unwrap() {
            Outcome::Opened(t) => t,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn card_events_are_published_in_place() {
        let (_dir, mut e, r) = engine(2);
        assert_eq!(cmd(&mut e, "attach R1").unwrap(), Outcome::Attached(SlotIndex(0)));
        assert_eq!(
            cmd(&mut e, "insert 0 3B9F t0").unwrap(),
            Outcome::Published {
                slot: SlotIndex(0),
                event_counter: 1
            }
        );
        let snap = r.read_slot(SlotIndex(0)).unwrap();
        assert_eq!(snap.state.atr(), &[0x3B, 0x9F]);
        assert_eq!(snap.state.protocol(), CardProtocol::T0);

        cmd(&mut e, "mute 0").unwrap();
        cmd(&mut e, "unavailable 0").unwrap();
        let status = r.read_slot(SlotIndex(0)).unwrap().state.status();
        assert!(status.contains(ReaderStatus::UNRESPONSIVE | ReaderStatus::UNAVAILABLE));

        cmd(&mut e, "remove 0").unwrap();
        assert!(!r.read_slot(SlotIndex(0)).unwrap().state.card_present());
        assert_eq!(r.version_stamp().unwrap(), 1);
    }

    #[test]
    fn exclusive_excludes_everyone_else() {
        let (_dir, mut e, r) = engine(1);
        cmd(&mut e, "attach R1").unwrap();
        let a = open(&mut e);
        let b = open(&mut e);

        cmd(&mut e, &format!("connect 0 {a} exclusive")).unwrap();
        let snap = r.read_slot(SlotIndex(0)).unwrap();
        assert_eq!(snap.state.handle_count(), 1);
        assert!(snap.state.status().contains(ReaderStatus::EXCLUSIVE));

        for mode in ["shared", "exclusive"] {
            assert!(matches!(
                cmd(&mut e, &format!("connect 0 {b} {mode}")),
                Err(EngineError::SharingViolation {
                    held: "exclusive",
                    ..
                })
            ));
        }

        cmd(&mut e, &format!("disconnect 0 {a}")).unwrap();
        let snap = r.read_slot(SlotIndex(0)).unwrap();
        assert_eq!(snap.state.handle_count(), 0);
        assert!(!snap.state.status().intersects(ReaderStatus::ACCESS_MASK));
        cmd(&mut e, &format!("connect 0 {b} exclusive")).unwrap();
    }

    #[test]
    fn shared_handles_stack_and_block_exclusive() {
        let (_dir, mut e, r) = engine(1);
        cmd(&mut e, "attach R1").unwrap();
        let a = open(&mut e);
        let b = open(&mut e);

        cmd(&mut e, &format!("connect 0 {a} shared")).unwrap();
        assert_eq!(
            cmd(&mut e, &format!("connect 0 {b} shared")).unwrap(),
            Outcome::Handles {
                slot: SlotIndex(0),
                count: 2
            }
        );
        assert!(matches!(
            cmd(&mut e, &format!("connect 0 {a} exclusive")),
            Err(EngineError::SharingViolation { held: "shared", .. })
        ));

        cmd(&mut e, &format!("disconnect 0 {a}")).unwrap();
        let snap = r.read_slot(SlotIndex(0)).unwrap();
        assert_eq!(snap.state.handle_count(), 1);
        assert!(snap.state.status().contains(ReaderStatus::SHARED));

        assert!(matches!(
            cmd(&mut e, &format!("disconnect 0 {a}")),
            Err(EngineError::NotHeld { .. })
        ));
    }

    #[test]
    fn closing_a_context_releases_its_handles() {
        let (_dir, mut e, r) = engine(2);
        cmd(&mut e, "attach R1").unwrap();
        cmd(&mut e, "attach R2").unwrap();
        let a = open(&mut e);
        cmd(&mut e, &format!("connect 0 {a} shared")).unwrap();
        cmd(&mut e, &format!("connect 1 {a} shared")).unwrap();

        assert_eq!(
            cmd(&mut e, &format!("close {a}")).unwrap(),
            Outcome::Closed {
                token: a,
                released: 2
            }
        );
        for i in 0..2 {
            assert_eq!(r.read_slot(SlotIndex(i)).unwrap().state.handle_count(), 0);
        }
        assert!(matches!(
            cmd(&mut e, &format!("close {a}")),
            Err(EngineError::UnknownContext(_))
        ));
        assert!(matches!(
            cmd(&mut e, &format!("connect 0 {a} shared")),
            Err(EngineError::UnknownContext(_))
        ));
    }

    #[test]
    fn failed_release_keeps_the_context_open() {
        let (_dir, mut e, _r) = engine(1);
        cmd(&mut e, "attach R1").unwrap();
        let a = open(&mut e);
        cmd(&mut e, &format!("connect 0 {a} shared")).unwrap();

        // Segment bookkeeping no longer matches the session table.
        assert_eq!(e.writer().clear_references(SlotIndex(0)).unwrap(), 1);
        assert!(matches!(
            cmd(&mut e, &format!("close {a}")),
            Err(EngineError::Shm(ShmError::NoHandles(_)))
        ));
        assert!(e.minter.is_live(a));
        assert_eq!(
            cmd(&mut e, &format!("close {a}")).unwrap(),
            Outcome::Closed {
                token: a,
                released: 0
            }
        );
        assert!(!e.minter.is_live(a));
    }

    #[test]
    fn detach_drops_handles_and_frees_the_slot() {
        let (_dir, mut e, r) = engine(1);
        cmd(&mut e, "attach R1").unwrap();
        let a = open(&mut e);
        cmd(&mut e, &format!("connect 0 {a} exclusive")).unwrap();

        assert_eq!(cmd(&mut e, "detach 0").unwrap(), Outcome::Detached(SlotIndex(0)));
        assert_eq!(r.version_stamp().unwrap(), 2);
        let snap = r.read_slot(SlotIndex(0)).unwrap();
        assert!(snap.state.is_removed());
        assert_eq!(snap.state.handle_count(), 0);
        assert_eq!(e.writer().occupancy(SlotIndex(0)).unwrap(), Occupancy::Removed);

        assert!(matches!(
            cmd(&mut e, "insert 0 3B"),
            Err(EngineError::Shm(ShmError::SlotNotLive(_)))
        ));
        assert!(matches!(
            cmd(&mut e, &format!("disconnect 0 {a}")),
            Err(EngineError::NotHeld { .. })
        ));

        assert_eq!(cmd(&mut e, "attach R2").unwrap(), Outcome::Attached(SlotIndex(0)));
        assert_eq!(r.version_stamp().unwrap(), 3);
    }

    #[test]
    fn serve_skips_comments_and_survives_bad_lines() {
        let (_dir, mut e, r) = engine(2);
        let script = "\
# boot
attach Gemalto PC Twin Reader 00 00

insert 0 3B8F8001804F0CA000000306030001000000006A t1
insert 5 3B
bogus
remove 0
";
        let lines = spawn_line_source("script", script.as_bytes()).unwrap();
        let stop = AtomicBool::new(false);
        assert_eq!(e.serve(&lines, &stop, Duration::from_millis(50)), 3);
        assert_eq!(r.event_counter(SlotIndex(0)).unwrap(), 2);
        assert_eq!(
            r.read_slot(SlotIndex(0)).unwrap().state.name(),
            "Gemalto PC Twin Reader 00 00"
        );
    }

    #[test]
    fn serve_stops_on_request_while_the_source_stays_open() {
        let (_dir, mut e, r) = engine(1);
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = AtomicBool::new(false);

        let applied = std::thread::scope(|s| {
            s.spawn(|| {
                tx.send("attach R1".to_string()).unwrap();
                while r.version_stamp().unwrap() == 0 {
                    std::thread::yield_now();
                }
                stop.store(true, Ordering::SeqCst);
            });
            e.serve(&rx, &stop, Duration::from_millis(10))
        });

        assert_eq!(applied, 1);
        drop(tx);
        e.shutdown().unwrap();
        assert!(r.is_retired().unwrap());
    }

    #[test]
    fn shutdown_unlinks_the_segment() {
        let (_dir, e, r) = engine(1);
        let path = e.writer().path().to_path_buf();
        e.shutdown().unwrap();
        assert!(!path.exists());
        assert!(r.is_retired().unwrap());
    }
}
