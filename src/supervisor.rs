//! The main event loop and process exit sequence: the orchestration that
//! wires every other component together.
//!
//! Signal delivery uses the self-pipe trick: `SIGCHLD` writes one byte to a
//! pipe whose read end is just another descriptor in the [`Multiplexer`],
//! instead of a shared atomic counter polled every iteration. This keeps the
//! signal handler itself to a single async-signal-safe `write(2)` and keeps
//! all job bookkeeping on the main loop's stack.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::config;
use crate::error::{JobErrorCode, WorkerError};
use crate::frame::{Decoder, Pairs};
use crate::job::{ExecResult, Job, JobId, LifecycleState, OutputBuffer, Stream};
use crate::mux::Multiplexer;
use crate::output::{self, DrainOutcome};
use crate::process_table::ProcessTable;
use crate::reaper::{self, ReapEvent};
use crate::spawn;
use crate::sys;
use crate::time::TimeVal;
use crate::timer::TimerQueue;
use crate::wire;

static SIGCHLD_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigchld_handler(_sig: libc::c_int) {
    let fd = SIGCHLD_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn install_sigchld_handler(write_fd: RawFd) {
    SIGCHLD_PIPE_WRITE.store(write_fd, Ordering::Relaxed);
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigchld_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut());
    }
}

fn make_self_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    sys::set_nonblocking(fds[0])?;
    sys::set_nonblocking(fds[1])?;
    // Neither end may leak into a spawned job: `spawn::spawn_command` forks
    // via `std::process::Command`, which doesn't close arbitrary inherited
    // fds on its own.
    sys::set_cloexec(fds[0])?;
    sys::set_cloexec(fds[1])?;
    Ok((fds[0], fds[1]))
}

#[derive(Debug, Clone, Copy)]
enum FdRole {
    Master,
    SelfPipe,
    JobOutput(JobId, Stream),
}

/// Top-level entry point: set up the master descriptor, install signal
/// handling, and run the supervisor loop until the master disconnects or a
/// fatal error occurs. Never returns.
pub fn run(master_fd: RawFd) -> ! {
    let mut supervisor = match Supervisor::new(master_fd) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize worker");
            std::process::exit(1);
        }
    };
    supervisor.run()
}

pub struct Supervisor {
    master_fd: RawFd,
    mux: Multiplexer,
    timers: TimerQueue<JobId>,
    ptable: ProcessTable,
    jobs: Vec<Option<Job>>,
    free_job_ids: Vec<JobId>,
    decoder: Decoder,
    fd_roles: HashMap<RawFd, FdRole>,
    self_pipe_read: RawFd,
    started: u64,
    timeouts: u64,
}

impl Supervisor {
    pub fn new(master_fd: RawFd) -> io::Result<Self> {
        sys::set_cloexec(master_fd)?;
        sys::set_nonblocking(master_fd)?;
        sys::set_socket_buffers(master_fd, config::MASTER_SOCKET_BUFFER_SIZE)?;

        let (pipe_r, pipe_w) = make_self_pipe()?;
        install_sigchld_handler(pipe_w);

        let mut mux = Multiplexer::new();
        mux.register(master_fd);
        mux.register(pipe_r);

        let mut fd_roles = HashMap::new();
        fd_roles.insert(master_fd, FdRole::Master);
        fd_roles.insert(pipe_r, FdRole::SelfPipe);

        Ok(Supervisor {
            master_fd,
            mux,
            timers: TimerQueue::new(),
            ptable: ProcessTable::new(),
            jobs: Vec::new(),
            free_job_ids: Vec::new(),
            decoder: Decoder::new(),
            fd_roles,
            self_pipe_read: pipe_r,
            started: 0,
            timeouts: 0,
        })
    }

    /// The main event loop. Runs until the master disconnects or
    /// `num_fds()` drops to zero (which implies the master is already gone,
    /// since it's unregistered only on disconnect).
    pub fn run(&mut self) -> ! {
        loop {
            self.check_invariant();

            let poll_time = self.next_poll_timeout_ms();
            let ready = match self.mux.poll(poll_time) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    self.exit_cleanup(1);
                }
            };

            for (fd, _revents) in ready {
                let Some(role) = self.fd_roles.get(&fd).copied() else {
                    continue;
                };
                match role {
                    FdRole::Master => match self.handle_master_readable() {
                        Ok(()) => {}
                        Err(WorkerError::MasterClosed) => {
                            tracing::info!("master closed connection, shutting down");
                            self.exit_cleanup(0);
                        }
                        Err(e) if e.is_fatal() => {
                            tracing::error!(error = %e, "fatal master error");
                            self.exit_cleanup(1);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recoverable master error");
                        }
                    },
                    FdRole::SelfPipe => {
                        self.drain_self_pipe();
                        self.reap_all();
                    }
                    FdRole::JobOutput(job_id, stream) => {
                        self.handle_output_ready(job_id, stream);
                    }
                }
            }

            if self.mux.num_fds() == 0 {
                self.exit_cleanup(0);
            }
        }
    }

    /// Pop and handle every timer entry already due, returning the
    /// millisecond timeout for the next `poll()` (`-1` = block indefinitely).
    fn next_poll_timeout_ms(&mut self) -> i32 {
        loop {
            let now = TimeVal::now();
            let Some((deadline, _)) = self.timers.peek() else {
                return -1;
            };
            let delta_ms = now.delta_ms(*deadline) + config::POLL_SLACK_MS;
            if delta_ms > 0 {
                return delta_ms.clamp(0, i32::MAX as i64) as i32;
            }

            let (_, job_id) = self.timers.pop().expect("peek just confirmed an entry");
            let reason = match self.jobs[job_id].as_ref().map(|j| j.state) {
                Some(LifecycleState::Running) => JobErrorCode::Etime,
                Some(LifecycleState::Stale) => JobErrorCode::Estale,
                None => continue, // destroyed between peek and pop; shouldn't happen, but don't panic
            };
            self.kill_job(job_id, reason);
        }
    }

    fn drain_self_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.self_pipe_read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn handle_master_readable(&mut self) -> Result<(), WorkerError> {
        let mut chunk = [0u8; 65536];
        loop {
            let n = unsafe {
                libc::read(
                    self.master_fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            if n > 0 {
                self.decoder.feed(&chunk[..n as usize]);
                continue;
            }
            if n == 0 {
                return Err(WorkerError::MasterClosed);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break,
                _ => return Err(WorkerError::Io(err)),
            }
        }

        loop {
            match self.decoder.next_message() {
                Ok(Some(pairs)) => self.spawn_job(pairs),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame from master");
                    let record = wire::job_error_record(None, &format!("frame error: {e}"));
                    self.send_pairs(&record);
                }
            }
        }
        Ok(())
    }

    fn spawn_job(&mut self, pairs: Pairs) {
        let parsed = match parse_job_request(pairs) {
            Ok(p) => p,
            Err((job_id, msg)) => {
                let record = wire::job_error_record(job_id, &msg);
                self.send_pairs(&record);
                return;
            }
        };

        let start = TimeVal::now();
        match spawn::spawn_command(&parsed.command) {
            Ok(child) => {
                let id = self.reserve_job_slot();
                let deadline = start.plus_secs(parsed.timeout_secs as i64);
                let timer_handle = self.timers.push(deadline, id);

                let job = Job {
                    id,
                    job_id: parsed.job_id,
                    command: parsed.command.clone(),
                    timeout_secs: parsed.timeout_secs,
                    request: parsed.request,
                    pid: child.pid,
                    start,
                    result: ExecResult::default(),
                    stdout: OutputBuffer::new(child.stdout_fd),
                    stderr: OutputBuffer::new(child.stderr_fd),
                    state: LifecycleState::Running,
                    timer_handle,
                };
                self.jobs[id] = Some(job);

                self.mux.register(child.stdout_fd);
                self.fd_roles
                    .insert(child.stdout_fd, FdRole::JobOutput(id, Stream::Stdout));
                self.mux.register(child.stderr_fd);
                self.fd_roles
                    .insert(child.stderr_fd, FdRole::JobOutput(id, Stream::Stderr));
                self.ptable.insert(child.pid, id);

                self.started += 1;
                tracing::info!(job_id = parsed.job_id, pid = child.pid, "job started");
            }
            Err(e) => {
                let record = wire::job_error_record(
                    Some(parsed.job_id),
                    &format!("Failed to start child: {e}"),
                );
                self.send_pairs(&record);
            }
        }
    }

    fn reserve_job_slot(&mut self) -> JobId {
        if let Some(id) = self.free_job_ids.pop() {
            id
        } else {
            self.jobs.push(None);
            self.jobs.len() - 1
        }
    }

    fn handle_output_ready(&mut self, job_id: JobId, stream: Stream) {
        let Some(job) = self.jobs[job_id].as_mut() else {
            return;
        };
        let buf = job.output_mut(stream);
        let had_fd = buf.fd;
        let outcome = output::drain(buf);
        if outcome == DrainOutcome::Closed {
            if let Some(fd) = had_fd {
                self.mux.unregister(fd);
                self.fd_roles.remove(&fd);
            }
            // A closed stream doesn't necessarily mean the child has exited
            // (the other stream may still be open), so this is always a
            // non-blocking check, never a wait.
            self.try_reap_one(job_id);
        }
    }

    /// Non-blocking, targeted reap of a single job's pid, mirroring
    /// `check_completion()`: used both after an output descriptor closes and
    /// from `kill_job`'s concurrent-exit race. The single code path here
    /// resolves the "how many places reap a job" open question: the self-pipe
    /// reaper and this function are the only two, and this one always
    /// delegates into a normal (non-error) completion on success.
    fn try_reap_one(&mut self, job_id: JobId) -> bool {
        let pid = match self.jobs[job_id].as_ref() {
            Some(j) => j.pid,
            None => return false,
        };
        let mut status: libc::c_int = 0;
        let mut rusage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        loop {
            let ret = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, rusage.as_mut_ptr()) };
            if ret == pid {
                if let Some(job) = self.jobs[job_id].as_mut() {
                    job.result.wait_status = Some(status);
                    job.result.rusage = Some(unsafe { rusage.assume_init() });
                    job.result.stop = Some(TimeVal::now());
                }
                self.finish_and_destroy(job_id, None);
                return true;
            }
            if ret == 0 {
                return false;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => {
                    if let Some(job) = self.jobs[job_id].as_mut() {
                        job.result.stop = Some(TimeVal::now());
                    }
                    self.finish_and_destroy(job_id, None);
                    return true;
                }
                _ => return false,
            }
        }
    }

    /// Batch reap driven by the self-pipe: every child `wait4` reports
    /// is looked up in the process table and finished.
    fn reap_all(&mut self) {
        loop {
            match reaper::try_wait_any() {
                ReapEvent::Exited { pid, status, rusage } => {
                    let Some(job_id) = self.ptable.get(pid) else {
                        // Orphaned grandchild reparented to the worker; nothing to do.
                        continue;
                    };
                    let Some(job) = self.jobs[job_id].as_mut() else {
                        continue;
                    };
                    job.result.wait_status = Some(status);
                    job.result.rusage = Some(rusage);
                    job.result.stop = Some(TimeVal::now());

                    if job.state == LifecycleState::Stale {
                        // Completion for this job was already sent when it
                        // went stale; this is just the delayed reap.
                        tracing::info!(pid, "stale job finally reaped");
                        self.destroy_job(job_id);
                    } else {
                        self.finish_and_destroy(job_id, None);
                    }
                }
                ReapEvent::NoneReady | ReapEvent::NoChildren => break,
            }
        }
    }

    /// Timeout/kill handling for a job whose deadline has elapsed.
    fn kill_job(&mut self, job_id: JobId, reason: JobErrorCode) {
        if reason == JobErrorCode::Etime {
            // The child may have exited in the same instant its deadline
            // fired; check before escalating to SIGKILL.
            if self.try_reap_one(job_id) {
                self.timeouts += 1;
                return;
            }
        }

        let Some(job) = self.jobs[job_id].as_ref() else {
            return;
        };
        let pid = job.pid;
        sys::kill_process_group(pid, libc::SIGKILL);

        let mut reaped = false;
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret == pid {
                if let Some(job) = self.jobs[job_id].as_mut() {
                    job.result.wait_status = Some(status);
                    job.result.stop = Some(TimeVal::now());
                }
                reaped = true;
                break;
            }
            if ret == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => {
                    reaped = true;
                    break;
                }
                _ => break,
            }
        }

        if reason == JobErrorCode::Etime {
            self.timeouts += 1;
        }

        if reaped {
            if reason == JobErrorCode::Etime {
                self.finish_and_destroy(job_id, Some(reason));
            } else {
                // Already Stale: the completion was sent on the first
                // attempt. This retry only needed to finish the reap.
                self.destroy_job(job_id);
            }
            return;
        }

        // SIGKILL didn't take effect in time. On the first attempt (ETIME),
        // report the completion now and mark the job Stale; on a later retry
        // the completion was already sent, so just reschedule.
        let delay_secs = if reason == JobErrorCode::Etime {
            self.send_completion(job_id, Some(JobErrorCode::Etime));
            if let Some(job) = self.jobs[job_id].as_mut() {
                job.state = LifecycleState::Stale;
            }
            config::STALE_FIRST_RETRY_SECS
        } else {
            config::STALE_RETRY_SECS
        };

        let deadline = TimeVal::now().plus_secs(delay_secs);
        let handle = self.timers.push(deadline, job_id);
        if let Some(job) = self.jobs[job_id].as_mut() {
            job.timer_handle = handle;
        }
    }

    /// Final output drain, NUL-truncation, and completion send — without
    /// destroying the job. Used both by the normal finish path and by the
    /// Stale transition (which must send its completion immediately but
    /// can't destroy the job until it's actually reaped).
    fn send_completion(&mut self, job_id: JobId, error: Option<JobErrorCode>) {
        self.finalize_output(job_id, Stream::Stdout);
        self.finalize_output(job_id, Stream::Stderr);

        let Some(job) = self.jobs[job_id].as_mut() else {
            return;
        };
        job.stdout.truncate_at_first_nul();
        job.stderr.truncate_at_first_nul();
        if job.result.stop.is_none() {
            job.result.stop = Some(TimeVal::now());
        }
        let pairs = wire::completion_record(job, error);
        self.send_pairs(&pairs);
    }

    fn finish_and_destroy(&mut self, job_id: JobId, error: Option<JobErrorCode>) {
        self.send_completion(job_id, error);
        self.destroy_job(job_id);
    }

    /// Drain whatever's left on `stream`'s descriptor and force it closed if
    /// still open, unregistering it from the multiplexer either way.
    fn finalize_output(&mut self, job_id: JobId, stream: Stream) {
        let Some(job) = self.jobs[job_id].as_mut() else {
            return;
        };
        let buf = job.output_mut(stream);
        let original_fd = buf.fd;
        if original_fd.is_some() {
            output::drain(buf);
        }
        if let Some(fd) = buf.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(fd) = original_fd {
            self.mux.unregister(fd);
            self.fd_roles.remove(&fd);
        }
    }

    fn destroy_job(&mut self, job_id: JobId) {
        let Some(job) = self.jobs[job_id].take() else {
            return;
        };
        self.timers.remove(job.timer_handle);
        self.ptable.remove(job.pid);
        self.free_job_ids.push(job_id);
    }

    fn send_pairs(&mut self, pairs: &Pairs) {
        let bytes = crate::frame::encode(pairs);
        if let Err(e) = sys::write_all_blocking(self.master_fd, &bytes) {
            tracing::error!(error = %e, "failed to write to master; exiting");
            self.exit_cleanup(1);
        }
    }

    /// The running-job count, timer-queue size, and process-table size must
    /// agree at every quiescent point (the top of this loop, before any due
    /// timer is handled). A divergence is reported to the master as well as
    /// logged locally, since it signals state corruption the master may want
    /// to act on.
    fn check_invariant(&mut self) {
        let running_jobs = self.jobs.iter().filter(|j| j.is_some()).count();
        let tq = self.timers.size();
        let pt = self.ptable.len();
        if running_jobs != tq || tq != pt {
            tracing::warn!(
                running_jobs,
                timer_queue = tq,
                process_table = pt,
                started = self.started,
                "invariant violation: running_jobs/timer_queue/process_table diverged"
            );
            let message = format!(
                "invariant violation: running_jobs={running_jobs} timer_queue={tq} process_table={pt}"
            );
            let pairs = wire::log_record(&message);
            self.send_pairs(&pairs);
        }
    }

    /// Ignore SIGTERM, signal our own process group, reap what we can, wait
    /// a grace period, SIGKILL the rest, reap again, then exit.
    fn exit_cleanup(&mut self, code: i32) -> ! {
        sys::ignore_sigterm();
        sys::kill_own_group_term();
        sys::reap_all_available();

        std::thread::sleep(std::time::Duration::from_secs(config::EXIT_CLEANUP_GRACE_SECS));

        while let Some((_, job_id)) = self.timers.pop() {
            if let Some(job) = self.jobs.get(job_id).and_then(|j| j.as_ref()) {
                sys::kill_process_group(job.pid, libc::SIGKILL);
            }
        }

        std::thread::sleep(std::time::Duration::from_secs(config::EXIT_CLEANUP_GRACE_SECS));
        sys::reap_all_available();

        std::process::exit(code);
    }
}

struct ParsedRequest {
    command: String,
    job_id: u32,
    timeout_secs: u64,
    request: Pairs,
}

/// Parse an inbound message into a job request, filtering `env` out of the
/// pairs that get echoed back: it's consumed here and never forwarded to
/// the response or the child's argv.
///
/// Returns `Err((job_id, message))` on a missing required key; `job_id` is
/// `Some` only if it was itself present and parseable.
fn parse_job_request(pairs: Pairs) -> Result<ParsedRequest, (Option<u32>, String)> {
    let mut command: Option<String> = None;
    let mut job_id: Option<u32> = None;
    let mut timeout_secs: u64 = 0;
    let mut request = Pairs::new();

    for (key, value) in pairs {
        match key.as_str() {
            "command" => {
                command = Some(String::from_utf8_lossy(&value).into_owned());
                request.push((key, value));
            }
            "job_id" => {
                job_id = String::from_utf8_lossy(&value).trim().parse::<u32>().ok();
                request.push((key, value));
            }
            "timeout" => {
                timeout_secs = String::from_utf8_lossy(&value)
                    .trim()
                    .parse::<u64>()
                    .unwrap_or(0);
                request.push((key, value));
            }
            "env" => {
                // Consumed, not echoed; not otherwise used (no env support
                // for the spawned shell in this core, per Non-goals).
            }
            _ => request.push((key, value)),
        }
    }

    let command = command.ok_or_else(|| (job_id, "missing required key: command".to_string()))?;
    let job_id = job_id.ok_or_else(|| (None, "missing required key: job_id".to_string()))?;
    if timeout_secs == 0 {
        timeout_secs = config::DEFAULT_TIMEOUT_SECS;
    }

    Ok(ParsedRequest {
        command,
        job_id,
        timeout_secs,
        request,
    })
}
