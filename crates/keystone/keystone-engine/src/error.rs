use keystone_context::ContextError;
use keystone_shm::ShmError;
use keystone_state::{ContextToken, SlotIndex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("unknown context {0}")]
    UnknownContext(ContextToken),

    #[error("reader {slot} is already in {held} use")]
    SharingViolation { slot: SlotIndex, held: &'static str },

    #[error("context {token} holds no handle on reader {slot}")]
    NotHeld { slot: SlotIndex, token: ContextToken },

    #[error("bad command '{line}': {reason}")]
    Parse { line: String, reason: String },
}
