mod config;

pub use config::{ConfigError, DaemonConfig, WatchConfig};
