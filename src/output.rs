//! Non-blocking drain of stdout/stderr into the job's growable buffers.

use std::io;

use crate::config::OUTPUT_READ_CHUNK;
use crate::job::OutputBuffer;

#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// EAGAIN/EWOULDBLOCK: no more data right now, wait for the next readiness event.
    WouldBlock,
    /// EOF or an unexpected error: the descriptor was closed.
    Closed,
}

/// Drain `buf`'s descriptor until it would block, hits EOF, or errors.
///
/// Invoked both from multiplexer readiness (`final=false`) and as a final
/// drain from `finish_job` (`final=true`); the `final` flag only affects
/// whether the caller still needs to decide what happens next (the
/// completion check on non-final closes is the caller's job, not this one's —
/// see [`DrainOutcome::Closed`]).
pub fn drain(buf: &mut OutputBuffer) -> DrainOutcome {
    let Some(fd) = buf.fd else {
        return DrainOutcome::Closed;
    };

    let mut chunk = [0u8; OUTPUT_READ_CHUNK];
    loop {
        let n = unsafe {
            libc::read(
                fd,
                chunk.as_mut_ptr() as *mut libc::c_void,
                chunk.len(),
            )
        };

        if n > 0 {
            buf.data.extend_from_slice(&chunk[..n as usize]);
            continue;
        }

        if n == 0 {
            close_fd(buf);
            return DrainOutcome::Closed;
        }

        // n < 0
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return DrainOutcome::WouldBlock,
            _ => {
                tracing::warn!(fd, error = %err, "unexpected error reading child output; closing fd");
                close_fd(buf);
                return DrainOutcome::Closed;
            }
        }
    }
}

fn close_fd(buf: &mut OutputBuffer) {
    if let Some(fd) = buf.fd.take() {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pipe() -> (libc::c_int, libc::c_int) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        (fds[0], fds[1])
    }

    #[test]
    fn drains_available_bytes_then_would_block() {
        let (r, w) = make_pipe();
        unsafe {
            libc::write(w, b"hello".as_ptr() as *const libc::c_void, 5);
        }
        let mut buf = OutputBuffer::new(r);
        let outcome = drain(&mut buf);
        assert_eq!(outcome, DrainOutcome::WouldBlock);
        assert_eq!(buf.data, b"hello");
        assert_eq!(buf.fd, Some(r));
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn eof_closes_descriptor() {
        let (r, w) = make_pipe();
        unsafe {
            libc::close(w); // EOF on read side
        }
        let mut buf = OutputBuffer::new(r);
        let outcome = drain(&mut buf);
        assert_eq!(outcome, DrainOutcome::Closed);
        assert_eq!(buf.fd, None);
    }

    #[test]
    fn accumulates_across_multiple_drains() {
        let (r, w) = make_pipe();
        unsafe {
            libc::write(w, b"abc".as_ptr() as *const libc::c_void, 3);
        }
        let mut buf = OutputBuffer::new(r);
        drain(&mut buf);
        unsafe {
            libc::write(w, b"def".as_ptr() as *const libc::c_void, 3);
        }
        drain(&mut buf);
        assert_eq!(buf.data, b"abcdef");
        unsafe {
            libc::close(w);
        }
    }
}
