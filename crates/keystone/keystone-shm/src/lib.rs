mod error;
mod observer;
mod reader;
mod seqlock;
mod shm_layout;
mod slot_table;
mod writer;

pub use error::ShmError;
pub use observer::{Observer, SlotEvent};
pub use reader::{READ_ATTEMPTS, SegmentReader};
pub use shm_layout::{MAX_READERS_LIMIT, SEGMENT_MAGIC, SEGMENT_VERSION, bytes_for_segment};
pub use slot_table::{Occupancy, SlotSnapshot};
pub use writer::{SegmentConfig, SegmentWriter};
