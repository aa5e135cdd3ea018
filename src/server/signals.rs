//! Signal handling for the shardfsd server binary

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

// シグナルハンドラから参照するため static に置く
static RUNNING_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Set up signal handlers for graceful shutdown
///
/// SIGINT and SIGTERM clear `running`. Only the first flag registered in a
/// process is used.
///
/// # Example
/// ```ignore
/// let running = Arc::new(AtomicBool::new(true));
/// setup_signal_handlers(running.clone());
///
/// while running.load(Ordering::Relaxed) {
///     // Server loop
/// }
/// ```
pub fn setup_signal_handlers(running: Arc<AtomicBool>) {
    if RUNNING_FLAG.set(running).is_err() {
        tracing::warn!("Signal handlers already installed");
        return;
    }

    #[cfg(unix)]
    {
        use libc::{SIGINT, SIGTERM};
        unsafe {
            libc::signal(SIGINT, shutdown_signal_handler as libc::sighandler_t);
            libc::signal(SIGTERM, shutdown_signal_handler as libc::sighandler_t);
        }
        tracing::debug!("Signal handlers registered (SIGINT/SIGTERM: graceful shutdown)");
    }
}

/// Whether a shutdown signal has been received
pub fn shutdown_requested() -> bool {
    RUNNING_FLAG
        .get()
        .is_some_and(|flag| !flag.load(Ordering::Acquire))
}

#[cfg(unix)]
extern "C" fn shutdown_signal_handler(_: libc::c_int) {
    // OnceLock::get はロックを取らない
    if let Some(flag) = RUNNING_FLAG.get() {
        flag.store(false, Ordering::Release);
    }
}
