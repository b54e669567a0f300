use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("time source unusable for seeding")]
    SeedUnavailable(#[from] std::time::SystemTimeError),

    #[error("no free context token after {attempts} attempts ({live} live)")]
    TokenSpaceExhausted { attempts: usize, live: usize },

    #[error("another daemon holds '{path}'")]
    AlreadyRunning { path: String },

    #[error("failed to daemonize at {stage}")]
    Daemonize {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to install {signal} handler")]
    SignalHandler {
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' exists and is not a named pipe")]
    EventSource { path: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
