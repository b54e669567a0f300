use keystone_state::SlotIndex;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The backing file could not be sized or mapped.
    #[error("could not map a {bytes}-byte segment at '{path}'")]
    ResourceExhausted {
        path: String,
        bytes: usize,
        #[source]
        source: io::Error,
    },

    /// The mapped header belongs to another protocol revision, or the writer
    /// has retired the segment.
    #[error("segment at '{path}' is incompatible: {reason}")]
    VersionMismatch { path: String, reason: &'static str },

    #[error("no segment published at '{path}'")]
    NotFound { path: String },

    #[error("all {max_readers} reader slots are occupied")]
    CapacityExceeded { max_readers: usize },

    #[error("max_readers {requested} is outside 1..={limit}")]
    InvalidCapacity { requested: usize, limit: usize },

    #[error("slot {0} is outside the segment")]
    InvalidSlot(SlotIndex),

    #[error("slot {0} holds no live reader")]
    SlotNotLive(SlotIndex),

    #[error("slot {0} has no outstanding handles")]
    NoHandles(SlotIndex),

    /// A snapshot kept racing the writer; the next poll will try again.
    #[error("slot {0} changed during every read attempt")]
    TornRead(SlotIndex),

    #[error("segment handle is detached")]
    Detached,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShmError {
    /// Whether a client may simply retry on its next poll cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShmError::NotFound { .. } | ShmError::TornRead(_) | ShmError::Io(_)
        )
    }
}
