pub mod reader_state;
pub mod status;

pub use reader_state::{
    CardProtocol, ContextToken, MAX_ATR_SIZE, MAX_READER_NAME, ReaderState, SlotIndex,
};
pub use status::ReaderStatus;
