use anyhow::{Context, Result};
use keystone_config::DaemonConfig;
use keystone_context::{InstanceLock, ShutdownSignal, TokenMinter, daemonize, open_event_fifo};
use keystone_engine::{DaemonEngine, Outcome, ReaderEvent, spawn_line_source};
use keystone_shm::{SegmentConfig, SegmentWriter};
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            DaemonConfig::load(path.clone()).with_context(|| format!("loading config {path}"))?
        }
        None => DaemonConfig::default(),
    };

    // Taken before detaching so a second daemon fails where it can be seen.
    let lock_path = cfg.lock_path();
    let mut lock = InstanceLock::acquire(&lock_path)
        .with_context(|| format!("taking instance lock {lock_path}"))?;

    // Everything path-based is resolved or opened while still attached to
    // the launch directory and terminal.
    let segment_path = std::path::absolute(&cfg.segment_path)
        .with_context(|| format!("resolving segment path {}", cfg.segment_path))?;
    let log_file = cfg
        .log_file
        .as_deref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))
        })
        .transpose()?;
    let event_fifo = cfg
        .event_fifo
        .as_deref()
        .map(|path| open_event_fifo(path).with_context(|| format!("opening event fifo {path}")))
        .transpose()?;

    // No threads and no subscriber yet: fork must happen first.
    daemonize(cfg.run_foreground).context("detaching from the terminal")?;
    lock.refresh_pid().context("recording daemon pid")?;

    init_tracing(&cfg.log_level, log_file);

    if let Err(e) = serve(&cfg, segment_path, event_fifo) {
        error!(error = %format!("{e:#}"), "keystoned stopped on error");
        return Err(e);
    }
    drop(lock);
    Ok(())
}

fn init_tracing(log_level: &str, log_file: Option<File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn serve(cfg: &DaemonConfig, segment_path: PathBuf, event_fifo: Option<File>) -> Result<()> {
    let shutdown = ShutdownSignal::install().context("installing signal handlers")?;

    let writer = SegmentWriter::create(
        &segment_path,
        SegmentConfig::new(cfg.max_readers).sync_on_publish(cfg.sync_on_publish),
    )
    .with_context(|| format!("creating reader-state segment {}", segment_path.display()))?;
    let minter = TokenMinter::new().context("seeding context tokens")?;
    let mut engine = DaemonEngine::new(Arc::new(writer), minter);

    for name in &cfg.readers {
        match engine.apply(ReaderEvent::Attach { name: name.clone() }) {
            Ok(Outcome::Attached(slot)) => info!(%slot, reader = %name, "configured reader attached"),
            Ok(_) => {}
            Err(e) => warn!(reader = %name, error = %e, "configured reader not attached"),
        }
    }

    let lines = match event_fifo {
        Some(fifo) => spawn_line_source("fifo", BufReader::new(fifo)),
        None => spawn_line_source("stdin", BufReader::new(std::io::stdin())),
    }
    .context("starting event source")?;

    info!(
        segment = %segment_path.display(),
        max_readers = cfg.max_readers,
        foreground = cfg.run_foreground,
        "keystoned running"
    );

    let applied = engine.serve(&lines, shutdown.flag(), cfg.signal_poll());
    info!(applied, signalled = shutdown.requested(), "shutting down");

    engine.shutdown().context("removing reader-state segment")?;
    Ok(())
}
