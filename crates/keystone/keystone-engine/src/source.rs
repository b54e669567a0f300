//! Event sources feeding the engine: any line-oriented reader drained on
//! its own thread into a bounded channel.

use crossbeam_channel::{Receiver, bounded};
use std::io::{self, BufRead};
use std::thread;
use tracing::{debug, warn};

/// Lines buffered ahead of the engine before the source thread blocks.
const LINE_BACKLOG: usize = 256;

/// Spawns a thread reading `input` line by line. The channel disconnects
/// once `input` reaches end-of-file or fails.
pub fn spawn_line_source<R>(name: &str, input: R) -> io::Result<Receiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = bounded(LINE_BACKLOG);
    let source = name.to_string();
    thread::Builder::new()
        .name(format!("keystone-src-{name}"))
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(source = %source, error = %e, "event source failed");
                        return;
                    }
                };
                if tx.send(line).is_err() {
                    return;
                }
            }
            debug!(source = %source, "event source reached end of input");
        })?;
    Ok(rx)
}
