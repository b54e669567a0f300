use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// `keystoned` settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "defaults::segment_path")]
    pub segment_path: String,
    /// Defaults to `<segment_path>.lock`.
    #[serde(default)]
    pub lock_path: Option<String>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::max_readers")]
    pub max_readers: usize,
    #[serde(default = "defaults::run_foreground")]
    pub run_foreground: bool,
    #[serde(default = "defaults::sync_on_publish")]
    pub sync_on_publish: bool,
    /// Readers attached at startup, in slot order.
    #[serde(default)]
    pub readers: Vec<String>,
    /// Named pipe reader events are read from; stdin when unset. Required
    /// when detached.
    #[serde(default)]
    pub event_fifo: Option<String>,
    /// Log destination; stderr when unset. Required when detached.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Upper bound on how long a shutdown signal waits to be noticed.
    #[serde(default = "defaults::signal_poll_ms")]
    pub signal_poll_ms: u64,
}

/// `keystone-watch` settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    #[serde(default = "defaults::segment_path")]
    pub segment_path: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::attach_retry_ms")]
    pub attach_retry_ms: u64,
    #[serde(default = "defaults::attach_timeout_ms")]
    pub attach_timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

mod defaults {
    pub fn segment_path() -> String {
        "/tmp/keystone_reader_state".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn max_readers() -> usize {
        16
    }

    pub fn run_foreground() -> bool {
        true
    }

    pub fn sync_on_publish() -> bool {
        true
    }

    pub fn signal_poll_ms() -> u64 {
        100
    }

    pub fn poll_interval_ms() -> u64 {
        200
    }

    pub fn attach_retry_ms() -> u64 {
        500
    }

    pub fn attach_timeout_ms() -> u64 {
        10_000
    }
}

fn read(path: impl AsRef<Path> + ToString) -> Result<String, ConfigError> {
    std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let daemon_config: DaemonConfig = toml::from_str(&read(path)?)?;
        daemon_config.validate()?;
        Ok(daemon_config)
    }

    /// A detached daemon has no terminal: it needs somewhere to read events
    /// from and somewhere to log to.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.run_foreground {
            if self.event_fifo.is_none() {
                return Err(ConfigError::Invalid(
                    "run_foreground = false requires event_fifo",
                ));
            }
            if self.log_file.is_none() {
                return Err(ConfigError::Invalid("run_foreground = false requires log_file"));
            }
        }
        Ok(())
    }

    pub fn signal_poll(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms)
    }

    pub fn lock_path(&self) -> String {
        self.lock_path
            .clone()
            .unwrap_or_else(|| format!("{}.lock", self.segment_path))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            segment_path: defaults::segment_path(),
            lock_path: None,
            log_level: defaults::log_level(),
            max_readers: defaults::max_readers(),
            run_foreground: defaults::run_foreground(),
            sync_on_publish: defaults::sync_on_publish(),
            readers: Vec::new(),
            event_fifo: None,
            log_file: None,
            signal_poll_ms: defaults::signal_poll_ms(),
        }
    }
}

impl WatchConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let watch_config: WatchConfig = toml::from_str(&read(path)?)?;
        Ok(watch_config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn attach_retry(&self) -> Duration {
        Duration::from_millis(self.attach_retry_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            segment_path: defaults::segment_path(),
            log_level: defaults::log_level(),
            poll_interval_ms: defaults::poll_interval_ms(),
            attach_retry_ms: defaults::attach_retry_ms(),
            attach_timeout_ms: defaults::attach_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let d: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(d.segment_path, "/tmp/keystone_reader_state");
        assert_eq!(d.lock_path(), "/tmp/keystone_reader_state.lock");
        assert_eq!(d.max_readers, 16);
        assert!(d.run_foreground && d.sync_on_publish);
        assert!(d.readers.is_empty());

        let w: WatchConfig = toml::from_str("").unwrap();
        assert_eq!(w.poll_interval(), Duration::from_millis(200));
        assert_eq!(w.attach_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn daemon_config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystoned.toml");
        std::fs::write(
            &path,
            r#"
segment_path = "/run/keystone/state"
lock_path = "/run/keystone/keystoned.pid"
max_readers = 4
run_foreground = false
event_fifo = "/run/keystone/events"
log_file = "/var/log/keystoned.log"
readers = ["Gemalto PC Twin Reader 00 00", "SCM SCR 3310 01 00"]
"#,
        )
        .unwrap();

        let d = DaemonConfig::load(path.display().to_string()).unwrap();
        assert_eq!(d.segment_path, "/run/keystone/state");
        assert_eq!(d.lock_path(), "/run/keystone/keystoned.pid");
        assert_eq!(d.max_readers, 4);
        assert!(!d.run_foreground);
        assert_eq!(d.log_level, "info");
        assert_eq!(d.readers.len(), 2);
        assert_eq!(d.event_fifo.as_deref(), Some("/run/keystone/events"));
        assert_eq!(d.signal_poll(), Duration::from_millis(100));
    }

    #[test]
    fn detached_daemon_needs_an_event_source_and_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystoned.toml");
        std::fs::write(&path, "run_foreground = false\nlog_file = \"/tmp/k.log\"\n").unwrap();
        assert!(matches!(
            DaemonConfig::load(path.display().to_string()),
            Err(ConfigError::Invalid(msg)) if msg.contains("event_fifo")
        ));

        let d: DaemonConfig =
            toml::from_str("run_foreground = false\nevent_fifo = \"/tmp/k.events\"").unwrap();
        assert!(matches!(d.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("log_file")));

        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_and_bad_toml_are_distinct_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        match WatchConfig::load(missing.display().to_string()) {
            Err(ConfigError::Read { path, .. }) => assert!(path.ends_with("nope.toml")),
            other => panic!("expected Read error, got {other:?}"),
        }

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "poll_interval_ms = \"soon\"").unwrap();
        assert!(matches!(
            WatchConfig::load(bad.display().to_string()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<DaemonConfig>("max_reader = 3").is_err());
    }
}
