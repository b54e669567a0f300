use crate::error::ContextError;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::info;

/// Detaches the process from its controlling terminal unless
/// `run_foreground` is set.
///
/// Forks; the parent exits immediately and the child continues in a new
/// session with `/` as its working directory and the standard streams on
/// `/dev/null`. Must be called before any thread is spawned and before a
/// tracing subscriber writing to stderr is installed.
///
/// # Errors
/// `Daemonize` naming the step that failed. The caller should treat this as
/// fatal: running on in a half-detached state could leave two writers
/// behind the same segment path.
#[cfg(unix)]
pub fn daemonize(run_foreground: bool) -> Result<(), ContextError> {
    use std::io;
    use std::os::fd::AsRawFd;

    if run_foreground {
        return Ok(());
    }

    let fail = |stage| ContextError::Daemonize {
        stage,
        source: io::Error::last_os_error(),
    };

    // SAFETY: called while the process is still single-threaded
    match unsafe { libc::fork() } {
        -1 => return Err(fail("fork")),
        0 => {}
        // SAFETY: parent leaves without running destructors or atexit hooks
        _ => unsafe { libc::_exit(0) },
    }

    // SAFETY: plain syscall, no memory handed over
    if unsafe { libc::setsid() } == -1 {
        return Err(fail("setsid"));
    }

    std::env::set_current_dir("/").map_err(|source| ContextError::Daemonize {
        stage: "chdir",
        source,
    })?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|source| ContextError::Daemonize {
            stage: "open /dev/null",
            source,
        })?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open; dup2 replaces fd atomically
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } == -1 {
            return Err(fail("redirect stdio"));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(run_foreground: bool) -> Result<(), ContextError> {
    if run_foreground {
        return Ok(());
    }
    Err(ContextError::Daemonize {
        stage: "fork",
        source: std::io::Error::from(std::io::ErrorKind::Unsupported),
    })
}

/// Opens the named pipe the detached daemon reads reader events from,
/// creating it (mode 0620) if nothing exists at `path`.
///
/// The pipe is opened read-write so it never reports end-of-file when the
/// last writer goes away; the daemon keeps listening until it is signalled.
///
/// # Errors
/// - `EventSource` if `path` exists and is not a FIFO
/// - `Io` if the pipe cannot be created or opened
#[cfg(unix)]
pub fn open_event_fifo<P: AsRef<Path>>(path: P) -> Result<File, ContextError> {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::FileTypeExt;

    let path = path.as_ref();
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {}
        Ok(_) => {
            return Err(ContextError::EventSource {
                path: path.display().to_string(),
            });
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            // SAFETY: c_path is a valid NUL-terminated string for the call
            if unsafe { libc::mkfifo(c_path.as_ptr(), 0o620) } == -1 {
                return Err(io::Error::last_os_error().into());
            }
            info!(path = %path.display(), "event fifo created");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

#[cfg(not(unix))]
pub fn open_event_fifo<P: AsRef<Path>>(path: P) -> Result<File, ContextError> {
    Err(ContextError::EventSource {
        path: path.as_ref().display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreground_is_a_no_op() {
        let cwd = std::env::current_dir().unwrap();
        daemonize(true).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), cwd);
    }

    #[cfg(unix)]
    #[test]
    fn event_fifo_is_created_and_carries_lines() {
        use std::io::{BufRead, BufReader, Write};
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystoned.events");
        let fifo = open_event_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        let mut client = OpenOptions::new().write(true).open(&path).unwrap();
        writeln!(client, "attach R1").unwrap();
        drop(client);

        let mut line = String::new();
        BufReader::new(fifo).read_line(&mut line).unwrap();
        assert_eq!(line, "attach R1\n");

        // Reopening an existing pipe is fine.
        open_event_fifo(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn regular_file_is_not_an_event_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystoned.events");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            open_event_fifo(&path),
            Err(ContextError::EventSource { .. })
        ));
    }
}
