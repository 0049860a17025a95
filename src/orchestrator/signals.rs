//! Cooperative cancellation on SIGINT/SIGTERM.
//!
//! The signal handler only flips an atomic flag. The orchestrator polls it
//! between pipeline steps, so a profile write that has started always
//! finishes.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation state.
///
/// `Relaxed` is enough: the flag is polled and no other memory is published
/// through it.
#[derive(Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// A flag nothing but [`CancelFlag::request_cancel`] will set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that SIGINT and SIGTERM set.
    ///
    /// Registration is best-effort; failures are reported on stderr and the
    /// run proceeds without signal-driven cancellation.
    #[must_use]
    pub fn with_signal_hooks() -> Self {
        let flag = Self::new();
        flag.register_signals();
        flag
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[cfg(feature = "signals")]
    fn register_signals(&self) {
        use signal_hook::consts::{SIGINT, SIGTERM};

        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.cancelled)) {
            eprintln!("[DVS-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.cancelled)) {
            eprintln!("[DVS-SIGNAL] failed to register SIGINT: {e}");
        }
    }

    #[cfg(not(feature = "signals"))]
    fn register_signals(&self) {
        eprintln!("[DVS-SIGNAL] built without signal support; Ctrl-C aborts immediately");
    }
}
