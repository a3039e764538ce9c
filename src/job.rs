//! Job data model and lifecycle state.

use std::os::unix::io::RawFd;

use crate::frame::Pairs;
use crate::time::TimeVal;
use crate::timer::TimerHandle;

/// Slab key identifying a job within the supervisor's job table. Distinct
/// from the OS pid and from the master-assigned `job_id`.
pub type JobId = usize;

/// One of the two captured output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A growable byte buffer paired with its read descriptor (`None` once closed).
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pub data: Vec<u8>,
    pub fd: Option<RawFd>,
}

impl OutputBuffer {
    pub fn new(fd: RawFd) -> Self {
        OutputBuffer {
            data: Vec::new(),
            fd: Some(fd),
        }
    }

    /// NUL-truncate the captured output; the wire format is NUL-sensitive.
    pub fn truncate_at_first_nul(&mut self) {
        if let Some(pos) = self.data.iter().position(|&b| b == 0) {
            self.data.truncate(pos);
        }
    }
}

/// `Running` is the initial state; `Stale` is entered once a SIGKILL attempt
/// failed to reap the child within one reap cycle. A stale job has already
/// had its completion reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Stale,
}

/// Outcome of the child's execution, recorded once known.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecResult {
    pub wait_status: Option<i32>,
    pub rusage: Option<libc::rusage>,
    pub stop: Option<TimeVal>,
}

/// The unit of work.
pub struct Job {
    pub id: JobId,
    /// Master-assigned 32-bit id, echoed back verbatim and used for correlation.
    pub job_id: u32,
    pub command: String,
    pub timeout_secs: u64,
    /// Original request pairs, minus `env`, retained verbatim to echo in the response.
    pub request: Pairs,
    pub pid: libc::pid_t,
    pub start: TimeVal,
    pub result: ExecResult,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    pub state: LifecycleState,
    pub timer_handle: TimerHandle,
}

impl Job {
    pub fn output_mut(&mut self, stream: Stream) -> &mut OutputBuffer {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    /// True once both output descriptors are closed (drained to EOF).
    pub fn outputs_closed(&self) -> bool {
        self.stdout.fd.is_none() && self.stderr.fd.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_at_first_nul_drops_tail() {
        let mut buf = OutputBuffer {
            data: b"hello\0world".to_vec(),
            fd: None,
        };
        buf.truncate_at_first_nul();
        assert_eq!(buf.data, b"hello");
    }

    #[test]
    fn truncate_is_noop_without_nul() {
        let mut buf = OutputBuffer {
            data: b"hello".to_vec(),
            fd: None,
        };
        buf.truncate_at_first_nul();
        assert_eq!(buf.data, b"hello");
    }
}
