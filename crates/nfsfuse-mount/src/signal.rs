//! Signal-driven shutdown using signal-hook.
//!
//! The first SIGINT, SIGTERM or SIGHUP requests a clean unmount; a second
//! one exits the process immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::consts::signal::SIGHUP;
use signal_hook::flag;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Shared {
    requested: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

/// A shutdown request that signal handlers or other threads can raise.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    shared: Arc<Shared>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes termination signals to this handle.
    ///
    /// A monitor thread turns the signal-hook flag into a wakeup for
    /// [`wait`](Self::wait).
    pub fn install(&self) -> std::io::Result<()> {
        let flag_set = Arc::new(AtomicBool::new(false));
        for &sig in TERM_SIGNALS.iter().chain(&[SIGHUP]) {
            // Second signal terminates if the first is still being handled.
            flag::register_conditional_shutdown(sig, 1, Arc::clone(&flag_set))?;
            flag::register(sig, Arc::clone(&flag_set))?;
        }

        let this = self.clone();
        std::thread::Builder::new()
            .name("nfsfuse-signal".into())
            .spawn(move || {
                while !flag_set.load(Ordering::Relaxed) {
                    if this.is_requested() {
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                info!("shutdown requested (signal again to force exit)");
                this.request();
            })?;
        Ok(())
    }

    /// Raises the request and wakes every waiter.
    pub fn request(&self) {
        let _guard = self.shared.lock.lock();
        self.shared.requested.store(true, Ordering::SeqCst);
        self.shared.cvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Blocks until shutdown is requested.
    pub fn wait(&self) {
        let mut guard = self.shared.lock.lock();
        while !self.is_requested() {
            self.shared.cvar.wait(&mut guard);
        }
    }

    /// Waits up to `timeout`; true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.lock.lock();
        if !self.is_requested() {
            self.shared.cvar.wait_for(&mut guard, timeout);
        }
        self.is_requested()
    }
}
