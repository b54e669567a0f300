mod engine;
mod error;
mod event;
mod source;

pub use engine::{DaemonEngine, Outcome};
pub use error::EngineError;
pub use event::{AccessMode, ReaderEvent};
pub use source::spawn_line_source;
