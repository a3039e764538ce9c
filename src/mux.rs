//! A single-threaded readiness abstraction over a set of descriptors, built
//! directly on `poll(2)`.
//!
//! Unlike a callback-registry design, this multiplexer only tracks interest;
//! `poll()` returns the ready set and the caller (the supervisor loop)
//! dispatches each ready descriptor itself. This avoids boxed closures and
//! the lifetime/ownership complexity they'd add to a loop that already owns
//! every job exclusively.

use std::io;
use std::os::unix::io::RawFd;

/// Readiness event mask bits, mirroring the `POLLIN`/`POLLHUP`/`POLLERR` bits
/// a caller cares about. Level-triggered: a descriptor with unread data stays
/// ready across polls until fully drained.
pub const READABLE: i16 = libc::POLLIN | libc::POLLHUP | libc::POLLERR;

pub struct Multiplexer {
    fds: Vec<libc::pollfd>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Multiplexer { fds: Vec::new() }
    }

    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    /// Register `fd` for readability events. No-op if already registered.
    pub fn register(&mut self, fd: RawFd) {
        if self.fds.iter().any(|p| p.fd == fd) {
            return;
        }
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }

    /// Deregister `fd`. No-op if not registered.
    pub fn unregister(&mut self, fd: RawFd) {
        self.fds.retain(|p| p.fd != fd);
    }

    /// Block for up to `timeout_ms` milliseconds (`-1` blocks indefinitely, `0`
    /// returns immediately) and return the `(fd, revents)` pairs that are ready.
    ///
    /// Invokes at most one entry per ready descriptor, per spec.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<Vec<(RawFd, i16)>> {
        if self.fds.is_empty() {
            // `poll([], -1)` would block forever with nothing to ever wake it;
            // callers are expected not to do that (the supervisor loop exits
            // once num_fds() reaches zero), but guard against misuse.
            return Ok(Vec::new());
        }
        loop {
            let ret = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            break;
        }

        let mut ready = Vec::new();
        for pfd in &self.fds {
            if pfd.revents != 0 {
                ready.push((pfd.fd, pfd.revents));
            }
        }
        Ok(ready)
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn register_unregister_tracks_count() {
        let mut mux = Multiplexer::new();
        assert_eq!(mux.num_fds(), 0);
        mux.register(0);
        assert_eq!(mux.num_fds(), 1);
        mux.register(0); // duplicate, no-op
        assert_eq!(mux.num_fds(), 1);
        mux.unregister(0);
        assert_eq!(mux.num_fds(), 0);
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut mux = Multiplexer::new();
        mux.register(read_fd);

        // Nothing written yet: immediate poll sees nothing ready.
        let ready = mux.poll(0).unwrap();
        assert!(ready.is_empty());

        let mut f = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(write_fd) };
        f.write_all(b"x").unwrap();
        std::mem::forget(f); // avoid double-closing write_fd's underlying descriptor twice

        let ready = mux.poll(1000).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, read_fd);
        assert_ne!(ready[0].1 & libc::POLLIN, 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn poll_zero_timeout_returns_immediately() {
        let mut mux = Multiplexer::new();
        let mut fds = [0; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        mux.register(fds[0]);
        let start = std::time::Instant::now();
        let _ = mux.poll(0).unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
