//! Process-wide shutdown plumbing.
//!
//! - Controller side: every live worker registers its command sender; an
//!   `atexit` hook sends `Terminate` to whatever is still registered when the
//!   owning process exits. Handles deregister on their own teardown, so the
//!   hook is only a fallback.
//! - Worker side: SIGTERM sets a flag the dispatch loop checks on every idle
//!   poll, turning the signal into the same clean exit as `Terminate`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::Sender;

use super::ipc_types::{encode_command, Command, Frame};

lazy_static::lazy_static! {
    static ref LIVE_WORKERS: Mutex<HashMap<u64, Sender<Frame>>> = Mutex::new(HashMap::new());
}

static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(not(windows))]
static EXIT_HOOK: std::sync::Once = std::sync::Once::new();

pub(crate) fn register(id: u64, sender: Sender<Frame>) {
    #[cfg(not(windows))]
    EXIT_HOOK.call_once(|| {
        // SAFETY: registering a plain extern "C" fn with no captured state.
        let rc = unsafe { libc::atexit(terminate_live_workers) };
        if rc != 0 {
            log::warn!("[PROCESS_MGR] Failed to register exit hook");
        }
    });
    LIVE_WORKERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(id, sender);
}

pub(crate) fn deregister(id: u64) {
    LIVE_WORKERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id);
}

#[cfg(test)]
fn live_workers() -> usize {
    LIVE_WORKERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .len()
}

#[cfg(not(windows))]
extern "C" fn terminate_live_workers() {
    // never block at exit: skip if another thread holds the lock
    let Ok(workers) = LIVE_WORKERS.try_lock() else {
        return;
    };
    terminate_all(&workers);
}

#[cfg_attr(windows, allow(dead_code))]
fn terminate_all(workers: &HashMap<u64, Sender<Frame>>) {
    let frame = encode_command(&Command::Terminate);
    for sender in workers.values() {
        let _ = sender.try_send(frame.clone());
    }
}

/// Flag set by SIGTERM in a worker process.
pub fn termination_flag() -> &'static AtomicBool {
    &TERMINATION_REQUESTED
}

#[cfg(not(windows))]
extern "C" fn on_sigterm(_signal: libc::c_int) {
    TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
}

/// Route SIGTERM to [`termination_flag`] instead of the default abrupt exit.
pub fn install_termination_handler() {
    #[cfg(not(windows))]
    {
        let handler = on_sigterm as extern "C" fn(libc::c_int);
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let previous = unsafe { libc::signal(libc::SIGTERM, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            log::warn!("[WORKER] Failed to install SIGTERM handler");
        }
    }
    TERMINATION_REQUESTED.store(false, Ordering::SeqCst);
}
