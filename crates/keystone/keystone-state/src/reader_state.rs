#![forbid(unsafe_code)]

use crate::status::ReaderStatus;
use std::fmt;
use std::str::FromStr;

/// Longest reader name a slot can hold, in bytes.
pub const MAX_READER_NAME: usize = 52;

/// Longest Answer-To-Reset a card can present (ISO 7816-3).
pub const MAX_ATR_SIZE: usize = 33;

// Index of a reader slot inside the segment, stable for the life of one occupancy.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SlotIndex(pub u16);

impl SlotIndex {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque per-session identifier handed to a client when it opens a context.
///
/// Zero is never minted, so it can stand for "no context".
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContextToken(pub u32);

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for ContextToken {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches("0x");
        u32::from_str_radix(s, 16).map(ContextToken)
    }
}

/// Transmission protocol negotiated with the inserted card.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CardProtocol {
    #[default]
    Undefined = 0,
    T0 = 1,
    T1 = 2,
    Raw = 4,
}

impl CardProtocol {
    /// Decode the raw byte stored in a slot; unknown values read as `Undefined`.
    #[inline]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::T0,
            2 => Self::T1,
            4 => Self::Raw,
            _ => Self::Undefined,
        }
    }
}

impl FromStr for CardProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "t0" => Ok(Self::T0),
            "t1" => Ok(Self::T1),
            "raw" => Ok(Self::Raw),
            "undefined" => Ok(Self::Undefined),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

// One reader's status record, exactly as laid out in shared memory.
// POD -> fixed size, no pointers, every bit pattern of every field is valid.
// The protocol is kept as a raw byte for that reason.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ReaderState {
    name: [u8; MAX_READER_NAME],
    name_len: u8,
    atr_len: u8,
    protocol: u8,
    _reserved: u8,
    atr: [u8; MAX_ATR_SIZE],
    _reserved2: [u8; 3],
    status: ReaderStatus,
    handle_count: u32,
}

impl Default for ReaderState {
    fn default() -> Self {
        Self {
            name: [0; MAX_READER_NAME],
            name_len: 0,
            atr_len: 0,
            protocol: CardProtocol::Undefined as u8,
            _reserved: 0,
            atr: [0; MAX_ATR_SIZE],
            _reserved2: [0; 3],
            status: ReaderStatus::empty(),
            handle_count: 0,
        }
    }
}

impl ReaderState {
    /// A freshly attached reader: named, no card, no handles.
    pub fn attached(name: &str) -> Self {
        let mut state = Self::default();
        state.set_name(name);
        state.status = ReaderStatus::ABSENT;
        state
    }

    /// Stores `name`, truncated to `MAX_READER_NAME` bytes on a char boundary.
    pub fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(MAX_READER_NAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name = [0; MAX_READER_NAME];
        self.name[..end].copy_from_slice(&name.as_bytes()[..end]);
        self.name_len = end as u8;
    }

    pub fn name(&self) -> &str {
        let len = (self.name_len as usize).min(MAX_READER_NAME);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Card identity bytes; empty when no card is inserted.
    pub fn atr(&self) -> &[u8] {
        let len = (self.atr_len as usize).min(MAX_ATR_SIZE);
        &self.atr[..len]
    }

    pub fn protocol(&self) -> CardProtocol {
        CardProtocol::from_raw(self.protocol)
    }

    #[inline]
    pub fn status(&self) -> ReaderStatus {
        self.status
    }

    #[inline]
    pub fn status_mut(&mut self) -> &mut ReaderStatus {
        &mut self.status
    }

    #[inline]
    pub fn handle_count(&self) -> u32 {
        self.handle_count
    }

    #[inline]
    pub fn set_handle_count(&mut self, count: u32) {
        self.handle_count = count;
    }

    /// Records an inserted, powered card. An ATR longer than `MAX_ATR_SIZE`
    /// is truncated.
    pub fn insert_card(&mut self, atr: &[u8], protocol: CardProtocol) {
        let len = atr.len().min(MAX_ATR_SIZE);
        self.atr = [0; MAX_ATR_SIZE];
        self.atr[..len].copy_from_slice(&atr[..len]);
        self.atr_len = len as u8;
        self.protocol = protocol as u8;

        self.status.remove(ReaderStatus::CARD_MASK);
        self.status.insert(ReaderStatus::PRESENT | ReaderStatus::POWERED);
        if protocol != CardProtocol::Undefined {
            self.status.insert(ReaderStatus::SPECIFIC);
        }
    }

    /// Forgets the card; access bits are left to the caller.
    pub fn remove_card(&mut self) {
        self.atr = [0; MAX_ATR_SIZE];
        self.atr_len = 0;
        self.protocol = CardProtocol::Undefined as u8;
        self.status.remove(ReaderStatus::CARD_MASK);
        self.status.insert(ReaderStatus::ABSENT);
    }

    /// Card is in the reader but did not answer reset.
    pub fn mark_unresponsive(&mut self) {
        self.status.remove(ReaderStatus::POWERED | ReaderStatus::SPECIFIC);
        self.status
            .insert(ReaderStatus::PRESENT | ReaderStatus::UNRESPONSIVE);
    }

    /// Slot holds an attached reader (not free, not removed).
    #[inline]
    pub fn is_live(&self) -> bool {
        !self.status.is_empty() && !self.is_removed()
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.status.contains(ReaderStatus::REMOVED)
    }

    #[inline]
    pub fn card_present(&self) -> bool {
        self.status.contains(ReaderStatus::PRESENT)
    }
}

impl fmt::Debug for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderState")
            .field("name", &self.name())
            .field("atr", &HexBytes(self.atr()))
            .field("protocol", &self.protocol())
            .field("status", &self.status)
            .field("handle_count", &self.handle_count)
            .finish()
    }
}

struct HexBytes<'a>(&'a [u8]);

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    /// The record is copied bytewise in and out of the segment, so its layout
    /// is part of the publication protocol revision. A change here must bump
    /// the segment version.
    #[test]
    fn reader_state_layout_is_stable() {
        assert_eq!(size_of::<ReaderState>(), 100, "ReaderState layout changed");
        assert_eq!(align_of::<ReaderState>(), 4);
    }

    #[test]
    fn newtypes_are_pod() {
        assert_eq!(size_of::<SlotIndex>(), 2);
        assert_eq!(size_of::<ContextToken>(), 4);
        assert_eq!(size_of::<ReaderStatus>(), 4);
    }

    #[test]
    fn attached_reader_has_no_card() {
        let s = ReaderState::attached("Gemalto PC Twin Reader 00 00");
        assert_eq!(s.name(), "Gemalto PC Twin Reader 00 00");
        assert!(s.atr().is_empty());
        assert_eq!(s.status(), ReaderStatus::ABSENT);
        assert_eq!(s.handle_count(), 0);
        assert!(s.is_live());
        assert!(!ReaderState::default().is_live());
    }

    #[test]
    fn long_names_are_cut_on_a_char_boundary() {
        let name = "é".repeat(40); // 80 bytes
        let s = ReaderState::attached(&name);
        assert!(s.name().len() <= MAX_READER_NAME);
        assert_eq!(s.name().len() % 2, 0);
        assert!(name.starts_with(s.name()));
    }

    #[test]
    fn insert_and_remove_card() {
        let mut s = ReaderState::attached("R1");
        let atr = [0x3B, 0x8F, 0x80, 0x01];
        s.insert_card(&atr, CardProtocol::T1);
        assert_eq!(s.atr(), &atr);
        assert_eq!(s.protocol(), CardProtocol::T1);
        assert!(s.status().contains(
            ReaderStatus::PRESENT | ReaderStatus::POWERED | ReaderStatus::SPECIFIC
        ));
        assert!(!s.status().contains(ReaderStatus::ABSENT));

        s.remove_card();
        assert!(s.atr().is_empty());
        assert_eq!(s.protocol(), CardProtocol::Undefined);
        assert_eq!(s.status(), ReaderStatus::ABSENT);
    }

    #[test]
    fn oversized_atr_is_truncated() {
        let mut s = ReaderState::default();
        s.insert_card(&[0xAA; 40], CardProtocol::T0);
        assert_eq!(s.atr().len(), MAX_ATR_SIZE);
    }

    #[test]
    fn corrupt_lengths_are_clamped() {
        let mut s = ReaderState::default();
        s.name_len = 200;
        s.atr_len = 200;
        assert_eq!(s.atr().len(), MAX_ATR_SIZE);
        assert_eq!(s.name().len(), MAX_READER_NAME);
        assert_eq!(CardProtocol::from_raw(9), CardProtocol::Undefined);
    }

    #[test]
    fn context_token_hex_round_trip() {
        let t = ContextToken(0x00c0_ffee);
        assert_eq!(t.to_string(), "00c0ffee");
        assert_eq!("00c0ffee".parse::<ContextToken>().unwrap(), t);
        assert_eq!("0xc0ffee".parse::<ContextToken>().unwrap(), t);
    }
}
