//! Detached `keystoned` lifecycle, driven from outside the process:
//!
//! ```text
//! [test] --spawn--> [keystoned] --fork--> [daemon] --create segment--.
//!   |                  exits 0                |                      |
//!   |----- "insert 0 3B9F" via event fifo --->|--publish------------>|
//!   |----- SIGTERM -------------------------->|--retire + unlink---->x
//! ```
//!
//! ```bash
//! cargo test -p keystoned --test shutdown -- --nocapture
//! ```

#![cfg(unix)]

use keystone_shm::SegmentReader;
use keystone_state::SlotIndex;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for<T>(what: &str, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(v) = f() {
            return v;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn read_pid(lock: &Path) -> Option<libc::pid_t> {
    fs::read_to_string(lock).ok()?.trim().parse().ok()
}

#[test]
fn sigterm_retires_and_unlinks_the_segment() {
    let dir = tempfile::tempdir().unwrap();
    let segment = dir.path().join("reader_state");
    let lock = dir.path().join("keystoned.lock");
    let fifo = dir.path().join("keystoned.events");
    let log = dir.path().join("keystoned.log");
    let config = dir.path().join("keystoned.toml");
    fs::write(
        &config,
        format!(
            r#"
segment_path = "{}"
lock_path = "{}"
event_fifo = "{}"
log_file = "{}"
log_level = "debug"
run_foreground = false
sync_on_publish = false
max_readers = 2
readers = ["R1"]
"#,
            segment.display(),
            lock.display(),
            fifo.display(),
            log.display(),
        ),
    )
    .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_keystoned"))
        .arg(&config)
        .status()
        .unwrap();
    assert!(status.success(), "launcher exited with {status}");

    let reader = wait_for("segment", || {
        let r = SegmentReader::attach_read_only(&segment).ok()?;
        (r.version_stamp().ok()? == 1).then_some(r)
    });
    let pid = read_pid(&lock).expect("daemon pid in lock file");
    assert_ne!(pid as u32, std::process::id());

    let mut events = fs::OpenOptions::new().write(true).open(&fifo).unwrap();
    writeln!(events, "insert 0 3B9F t1").unwrap();
    drop(events);
    wait_for("published insert", || {
        (reader.event_counter(SlotIndex(0)).ok()? == 1).then_some(())
    });
    assert_eq!(
        reader.read_slot(SlotIndex(0)).unwrap().state.atr(),
        &[0x3B, 0x9F]
    );

    // SAFETY: pid belongs to the daemon started above
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);

    wait_for("retirement", || reader.is_retired().ok()?.then_some(()));
    wait_for("unlink", || (!segment.exists()).then_some(()));
    assert!(reader.is_stale().unwrap());

    let logged = wait_for("shutdown log", || {
        let text = fs::read_to_string(&log).ok()?;
        text.contains("shutting down").then_some(text)
    });
    assert!(logged.contains("keystoned running"));
    assert!(logged.contains("signalled=true"));
}
