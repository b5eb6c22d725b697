//! Signal handling and shutdown (C8, spec §4.7).
//!
//! Replaces the source's module-level `CLOSE_SERVER` global, mutated from
//! a closure that captures the loop's dictionaries directly, with an
//! atomic flag the signal handler's only job is to flip (spec §9,
//! re-architecting note) plus an idempotent `compare_exchange` gate so the
//! shutdown routine itself only ever runs once (spec §8 property 4).

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_STARTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs handlers for `SIGINT` and `SIGTERM` that flip a flag the
/// readiness loop polls after every `EINTR` from `epoll_wait`.
pub fn install_signal_handlers() -> std::io::Result<()> {
    unsafe {
        if libc::signal(libc::SIGINT, on_signal as libc::sighandler_t) == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
        if libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t) == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Returns `true` the first time it is called after a shutdown was
/// requested, and `false` on every call thereafter — the gate that makes
/// `Server::shutdown` idempotent under repeated signal delivery.
pub fn take_shutdown_once() -> bool {
    SHUTDOWN_STARTED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}
