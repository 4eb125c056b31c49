//! Signal-triggered checkpointing
//!
//! [`SignalCheckpointGuard`] installs handlers for SIGINT, SIGQUIT and
//! SIGTERM for as long as it lives and restores the previous handlers when
//! dropped. The handlers only record the signal in a shared
//! [`Interruption`]; the upload session polls it between work steps, saves a
//! checkpoint and stops.
//!
//! The handlers are installed without `SA_RESTART`, so a read blocked on a
//! pipe fails with `EINTR` on the thread that takes the signal. The kernel
//! picks any thread that does not block it: run the upload on the only such
//! thread (the binary runs it on the main thread before starting any other).

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to an interruption flag.
pub type SharedInterruption = Arc<Interruption>;

static GLOBAL_INTERRUPTION: OnceCell<SharedInterruption> = OnceCell::new();

/// Process-wide interruption flag written by the signal handlers.
pub fn global_interruption() -> SharedInterruption {
    GLOBAL_INTERRUPTION.get_or_init(Interruption::shared).clone()
}

/// Records the first interrupting signal received.
#[derive(Debug, Default)]
pub struct Interruption {
    signal: AtomicI32,
}

impl Interruption {
    /// Create a flag with no pending signal.
    pub const fn new() -> Self {
        Self {
            signal: AtomicI32::new(0),
        }
    }

    /// Create a new shared flag wrapped in [`Arc`].
    pub fn shared() -> SharedInterruption {
        Arc::new(Self::new())
    }

    /// Record `signal` unless another one is already pending.
    ///
    /// Only touches an atomic, so it may be called from a signal handler.
    pub fn request(&self, signal: i32) {
        let _ = self
            .signal
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The pending signal, if any.
    pub fn pending(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Forget any pending signal.
    pub fn clear(&self) {
        self.signal.store(0, Ordering::SeqCst);
    }
}

/// Process exit status for an upload stopped by `signal`.
///
/// Exiting with the negated signal number yields `256 - signal` as seen by
/// the parent shell.
pub fn exit_code_for(signal: i32) -> i32 {
    -signal
}

/// Signals that trigger a checkpoint
#[cfg(unix)]
pub const CAUGHT_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

/// Scoped registration of the checkpoint signal handlers.
pub struct SignalCheckpointGuard {
    interruption: SharedInterruption,
    #[cfg(unix)]
    previous: Vec<(libc::c_int, libc::sigaction)>,
}

impl SignalCheckpointGuard {
    /// Install the handlers, remembering the ones they replace.
    ///
    /// Clears any signal left pending from an earlier guard.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        let interruption = global_interruption();
        interruption.clear();

        let mut guard = Self {
            interruption,
            previous: Vec::with_capacity(CAUGHT_SIGNALS.len()),
        };

        for signal in CAUGHT_SIGNALS {
            // SAFETY: both sigaction structs are fully initialized before use and
            // the handler only stores into an atomic.
            let previous = unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
                action.sa_flags = 0;
                libc::sigemptyset(&mut action.sa_mask);

                let mut previous: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(signal, &action, &mut previous) != 0 {
                    // Dropping the guard restores whatever was already replaced.
                    return Err(std::io::Error::last_os_error());
                }
                previous
            };
            guard.previous.push((signal, previous));
        }

        debug!(signals = ?CAUGHT_SIGNALS, "Installed checkpoint signal handlers");
        Ok(guard)
    }

    /// Signal handling is unavailable on this platform; the guard only
    /// carries the interruption flag.
    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        let interruption = global_interruption();
        interruption.clear();
        Ok(Self { interruption })
    }

    /// Flag the handlers write to.
    pub fn interruption(&self) -> SharedInterruption {
        self.interruption.clone()
    }
}

impl Drop for SignalCheckpointGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: `previous` was filled in by a successful sigaction call.
            let rc = unsafe { libc::sigaction(signal, &previous, std::ptr::null_mut()) };
            if rc != 0 {
                warn!(
                    signal,
                    error = %std::io::Error::last_os_error(),
                    "Failed to restore signal handler"
                );
            }
        }
    }
}

#[cfg(unix)]
extern "C" fn record_signal(signal: libc::c_int) {
    if let Some(interruption) = GLOBAL_INTERRUPTION.get() {
        interruption.request(signal);
    }
}
