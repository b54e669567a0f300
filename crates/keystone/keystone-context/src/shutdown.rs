//! SIGTERM/SIGINT turned into a flag the daemon's event loop polls.
//!
//! The handler only stores to an atomic; everything else (retiring and
//! unlinking the segment, dropping the instance lock) runs on the main
//! thread once the loop sees the flag.

use crate::error::ContextError;
use std::sync::atomic::{AtomicBool, Ordering};

static REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct ShutdownSignal {
    flag: &'static AtomicBool,
}

impl ShutdownSignal {
    /// Routes SIGTERM and SIGINT to the process-wide shutdown flag.
    ///
    /// Handlers are installed with `SA_RESTART`, so threads blocked reading
    /// an event source are not woken with `EINTR`.
    ///
    /// # Errors
    /// `SignalHandler` naming the signal whose handler could not be set.
    #[cfg(unix)]
    pub fn install() -> Result<Self, ContextError> {
        extern "C" fn on_signal(_: libc::c_int) {
            REQUESTED.store(true, Ordering::SeqCst);
        }

        // SAFETY: sigaction is plain old data; zeroed is a valid empty action
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        // SAFETY: sa_mask is owned by `action`
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        for (signal, name) in [(libc::SIGTERM, "SIGTERM"), (libc::SIGINT, "SIGINT")] {
            // SAFETY: the handler is async-signal-safe (one atomic store)
            if unsafe { libc::sigaction(signal, &action, std::ptr::null_mut()) } == -1 {
                return Err(ContextError::SignalHandler {
                    signal: name,
                    source: std::io::Error::last_os_error(),
                });
            }
        }
        Ok(Self { flag: &REQUESTED })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self, ContextError> {
        Ok(Self { flag: &REQUESTED })
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The flag itself, for loops that take a plain `&AtomicBool`.
    pub fn flag(&self) -> &'static AtomicBool {
        self.flag
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn sigterm_sets_the_flag_instead_of_killing() {
        let signal = ShutdownSignal::install().unwrap();
        assert!(!signal.requested());

        // SAFETY: delivers to this process; the handler above is installed
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);

        assert!(signal.requested());
        assert!(signal.flag().load(Ordering::SeqCst));
    }
}
