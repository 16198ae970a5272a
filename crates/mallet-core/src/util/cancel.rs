//! Cooperative cancellation.
//!
//! A single process-wide flag is set by the SIGINT handler, by the timeout
//! watchdog, or by the temperature wait loop. The flip finders poll it
//! between hammer windows and between banks; the hammer kernels themselves
//! are never interrupted, so the current window always completes before the
//! loop exits.

use log::{trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

static EXIT: AtomicBool = AtomicBool::new(false);

/// Returns true once cancellation has been requested.
pub fn exit_requested() -> bool {
    EXIT.load(Ordering::Relaxed)
}

/// Requests cooperative cancellation of the running experiment.
pub fn request_exit() {
    EXIT.store(true, Ordering::Relaxed);
}

/// Clears the cancellation flag before a new repetition starts.
pub fn reset() {
    EXIT.store(false, Ordering::Relaxed);
}

extern "C" fn on_sigint(_: libc::c_int) {
    // only async-signal-safe work here
    EXIT.store(true, Ordering::Relaxed);
}

/// Installs the SIGINT handler for the duration of a hammering session.
///
/// The previous disposition is restored on drop, so a session leaves the
/// process signal state the way it found it.
pub struct SigintGuard {
    previous: libc::sighandler_t,
}

impl SigintGuard {
    /// Registers the cancellation handler and returns the restore guard.
    pub fn install() -> Self {
        let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        let previous = unsafe { libc::signal(libc::SIGINT, handler) };
        trace!("SIGINT handler installed");
        Self { previous }
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        unsafe { libc::signal(libc::SIGINT, self.previous) };
        trace!("SIGINT handler restored");
    }
}

/// Spawns a detached watchdog that requests cancellation after `duration`.
pub fn arm_timeout(duration: Duration) {
    thread::spawn(move || {
        thread::sleep(duration);
        warn!(
            "Timeout of {} s reached, requesting exit",
            duration.as_secs()
        );
        request_exit();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test: the flag is process-global, parallel tests would race it
    #[test]
    fn test_flag_and_timeout() {
        reset();
        assert!(!exit_requested());
        request_exit();
        assert!(exit_requested());

        reset();
        arm_timeout(Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !exit_requested() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(exit_requested());
        reset();
    }
}
