use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use snapvault_types::CancelToken;

/// Global shutdown flag. Set to `true` on first SIGINT/SIGTERM.
pub(crate) static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Install signal handlers for cooperative shutdown.
///
/// First signal sets [`SHUTDOWN`] and restores the default handler so a
/// second signal terminates immediately.
pub(crate) fn install_signal_handlers() {
    #[cfg(unix)]
    {
        // Safety: the handler only stores to an atomic and resets the disposition.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    // Restore default handler so a second signal kills immediately
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Cancel `token` once a shutdown signal arrives. Waking a condvar is not
/// async-signal-safe, so a detached thread polls the flag instead.
pub(crate) fn cancel_on_shutdown(token: CancelToken) {
    std::thread::spawn(move || loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            tracing::warn!("interrupted, stopping the job and cleaning up");
            token.cancel();
            return;
        }
        if token.is_cancelled() {
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    });
}
