mod daemon;
mod error;
mod instance_lock;
mod shutdown;
mod token;

pub use daemon::{daemonize, open_event_fifo};
pub use error::ContextError;
pub use instance_lock::InstanceLock;
pub use shutdown::ShutdownSignal;
pub use token::{MINT_ATTEMPTS, RESEED_INTERVAL, TokenMinter};
