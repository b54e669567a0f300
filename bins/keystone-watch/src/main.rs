use anyhow::{Context, Result};
use keystone_config::WatchConfig;
use keystone_shm::{Observer, SegmentReader, ShmError, SlotEvent};
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Nothing was published at the segment path before the attach timeout.
const EXIT_NOT_STARTED: i32 = 2;
/// The published segment speaks another protocol revision.
const EXIT_UPGRADE_REQUIRED: i32 = 3;

fn main() -> Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            WatchConfig::load(path.clone()).with_context(|| format!("loading config {path}"))?
        }
        None => WatchConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    loop {
        let reader = match attach(&cfg) {
            Ok(reader) => reader,
            Err(ShmError::NotFound { path }) => {
                error!(%path, "reader-state service not started");
                std::process::exit(EXIT_NOT_STARTED);
            }
            Err(e @ ShmError::VersionMismatch { .. }) => {
                error!(error = %e, "upgrade required");
                std::process::exit(EXIT_UPGRADE_REQUIRED);
            }
            Err(e) => return Err(e).context("attaching to reader-state segment"),
        };
        watch(reader, &cfg)?;
    }
}

/// Attaches read-only, retrying while the daemon has not published a live
/// segment yet.
fn attach(cfg: &WatchConfig) -> Result<SegmentReader, ShmError> {
    let deadline = Instant::now() + cfg.attach_timeout();
    loop {
        let res = SegmentReader::attach_read_only(&cfg.segment_path).and_then(|r| {
            // A retired segment left on disk is as good as none.
            if r.is_retired()? {
                Err(ShmError::NotFound {
                    path: cfg.segment_path.clone(),
                })
            } else {
                Ok(r)
            }
        });
        match res {
            Err(ShmError::NotFound { .. }) if Instant::now() < deadline => {
                debug!(path = %cfg.segment_path, "segment not published yet");
                std::thread::sleep(cfg.attach_retry());
            }
            other => return other,
        }
    }
}

/// Polls until the segment is retired or replaced.
fn watch(reader: SegmentReader, cfg: &WatchConfig) -> Result<()> {
    info!(
        path = %reader.path().display(),
        max_readers = reader.max_readers(),
        "watching reader state"
    );
    let mut observer = Observer::new(reader);

    loop {
        match observer.poll(log_event) {
            Ok(_) => {}
            Err(ShmError::VersionMismatch { reason, .. }) => {
                info!(reason, "segment retired, reattaching");
                return Ok(());
            }
            Err(e) if e.is_transient() => debug!(error = %e, "poll incomplete, retrying"),
            Err(e) => return Err(e).context("polling reader state"),
        }

        if observer.reader().is_stale()? {
            info!("segment replaced, reattaching");
            return Ok(());
        }
        std::thread::sleep(cfg.poll_interval());
    }
}

fn log_event(event: SlotEvent) {
    match event {
        SlotEvent::Attached(s) => info!(
            slot = %s.index,
            reader = s.state.name(),
            status = %s.state.status(),
            "reader attached"
        ),
        SlotEvent::Removed(slot) => info!(%slot, "reader removed"),
        SlotEvent::Changed(s) => info!(
            slot = %s.index,
            reader = s.state.name(),
            event_counter = s.event_counter,
            status = %s.state.status(),
            atr = %hex::encode_upper(s.state.atr()),
            protocol = ?s.state.protocol(),
            handles = s.state.handle_count(),
            "reader changed"
        ),
    }
}
