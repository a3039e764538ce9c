//! Batch, non-blocking collection of exited children.
//!
//! Built on `wait4(-1, WNOHANG, &mut rusage)`; pid `-1` means "any child."

use std::mem::MaybeUninit;

/// Outcome of a single `wait4` call.
pub enum ReapEvent {
    /// A child exited; here's its pid, wait status, and resource usage.
    Exited {
        pid: libc::pid_t,
        status: libc::c_int,
        rusage: libc::rusage,
    },
    /// No child has changed state right now (but children remain).
    NoneReady,
    /// No children left to wait for (`ECHILD`).
    NoChildren,
}

/// One non-blocking `wait4(-1, ...)` call.
pub fn try_wait_any() -> ReapEvent {
    let mut status: libc::c_int = 0;
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();

    loop {
        let pid = unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, rusage.as_mut_ptr()) };
        if pid > 0 {
            return ReapEvent::Exited {
                pid,
                status,
                rusage: unsafe { rusage.assume_init() },
            };
        }
        if pid == 0 {
            return ReapEvent::NoneReady;
        }
        // pid < 0
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return ReapEvent::NoChildren,
            _ => return ReapEvent::NoneReady,
        }
    }
}

/// Exit status helpers mirroring the wait-status macros used throughout the
/// lifecycle (`WIFEXITED`/`WEXITSTATUS` are libc macros, not functions, so
/// the bit tests are reproduced here).
pub fn exited_normally(status: libc::c_int) -> bool {
    (status & 0x7f) == 0
}
