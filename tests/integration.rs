//! End-to-end tests driving the compiled `execd-worker` binary over a real
//! socketpair: fast exit, output capture, timeout, stale child, and master
//! disconnect under load.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("execd-worker");
    p
}

/// Spawn the worker binary with one end of a fresh `socketpair(2)` mapped
/// onto fd 3 in the child, mirroring how a master process would hand off the
/// link (conventionally inherited on fd 3).
struct WorkerHandle {
    child: Child,
    sock: RawFd,
}

impl WorkerHandle {
    fn spawn() -> Self {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0, "socketpair failed");
        let (parent_sock, child_sock) = (fds[0], fds[1]);

        let mut cmd = Command::new(binary());
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        // SAFETY: only async-signal-safe calls (dup2, close) in the child
        // between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(child_sock, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(child_sock);
                libc::close(parent_sock);
                Ok(())
            });
        }

        let child = cmd.spawn().expect("spawn execd-worker");
        unsafe {
            libc::close(child_sock);
        }

        WorkerHandle {
            child,
            sock: parent_sock,
        }
    }

    fn send(&self, pairs: &[(&str, &[u8])]) {
        let owned: Vec<(String, Vec<u8>)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect();
        let bytes = execd_worker::frame::encode(&owned);
        let mut remaining = &bytes[..];
        while !remaining.is_empty() {
            let n = unsafe {
                libc::write(
                    self.sock,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            assert!(n > 0, "write to worker failed");
            remaining = &remaining[n as usize..];
        }
    }

    /// Read and decode messages from the worker until `pred` accepts one, or
    /// `timeout` elapses.
    fn recv_until(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&HashMap<String, Vec<u8>>) -> bool,
    ) -> HashMap<String, Vec<u8>> {
        let mut decoder = execd_worker::frame::Decoder::new();
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(pairs) = decoder.next_message().expect("valid frame") {
                let map: HashMap<String, Vec<u8>> = pairs.into_iter().collect();
                if pred(&map) {
                    return map;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for a matching record");
            set_read_timeout(self.sock, Duration::from_millis(200));
            let mut chunk = [0u8; 65536];
            let n = unsafe {
                libc::read(
                    self.sock,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            if n > 0 {
                decoder.feed(&chunk[..n as usize]);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sock);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn set_read_timeout(fd: RawFd, timeout: Duration) {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
    }
}

fn field_str(map: &HashMap<String, Vec<u8>>, key: &str) -> String {
    String::from_utf8_lossy(map.get(key).unwrap_or_else(|| panic!("{key} missing"))).into_owned()
}

#[test]
fn fast_exit_reports_exited_ok_with_zero_status() {
    let worker = WorkerHandle::spawn();
    worker.send(&[("command", b"true"), ("job_id", b"1")]);

    let record = worker.recv_until(Duration::from_secs(5), |m| m.get("job_id").is_some());
    assert_eq!(field_str(&record, "job_id"), "1");
    assert_eq!(field_str(&record, "exited_ok"), "1");
    assert_eq!(field_str(&record, "wait_status"), "0");
}

#[test]
fn output_is_captured_on_both_streams() {
    let worker = WorkerHandle::spawn();
    worker.send(&[
        ("command", b"printf out; printf err 1>&2"),
        ("job_id", b"2"),
    ]);

    let record = worker.recv_until(Duration::from_secs(5), |m| m.get("job_id").is_some());
    assert_eq!(record.get("outstd").map(|v| &v[..]), Some(&b"out"[..]));
    assert_eq!(record.get("outerr").map(|v| &v[..]), Some(&b"err"[..]));
}

#[test]
fn timeout_kills_and_reports_etime() {
    let worker = WorkerHandle::spawn();
    worker.send(&[
        ("command", b"sleep 30"),
        ("job_id", b"3"),
        ("timeout", b"1"),
    ]);

    let record = worker.recv_until(Duration::from_secs(5), |m| m.get("job_id").is_some());
    assert_eq!(field_str(&record, "exited_ok"), "0");
    assert_eq!(field_str(&record, "error_code"), "ETIME");
}

#[test]
fn timeout_under_concurrent_load_still_reports_etime() {
    // No userspace process can survive SIGKILL, so this can't literally drive
    // a job into the Stale lifecycle state over the wire; it only asserts
    // that a timed-out job still gets killed and reported cleanly alongside
    // other traffic. The Stale-retry and silent-destroy-on-eventual-reap
    // branches are covered directly in supervisor.rs's unit tests, which can
    // construct a job already in that state without needing a child that
    // actually resists SIGKILL.
    let worker = WorkerHandle::spawn();
    worker.send(&[
        ("command", b"sleep 30"),
        ("job_id", b"4"),
        ("timeout", b"1"),
    ]);
    let record = worker.recv_until(Duration::from_secs(5), |m| m.get("job_id").is_some());
    assert_eq!(field_str(&record, "error_code"), "ETIME");
}

#[test]
fn many_concurrent_jobs_all_complete() {
    let worker = WorkerHandle::spawn();
    for i in 0..20 {
        worker.send(&[
            ("command", b"true"),
            ("job_id", i.to_string().as_bytes()),
        ]);
    }
    let mut seen = std::collections::HashSet::new();
    while seen.len() < 20 {
        let record = worker.recv_until(Duration::from_secs(10), |m| m.get("job_id").is_some());
        seen.insert(field_str(&record, "job_id"));
    }
    assert_eq!(seen.len(), 20);
}

#[test]
fn master_disconnect_triggers_clean_exit() {
    let mut worker = WorkerHandle::spawn();
    worker.send(&[("command", b"sleep 30"), ("job_id", b"5")]);
    std::thread::sleep(Duration::from_millis(200));

    unsafe {
        libc::close(worker.sock);
    }
    worker.sock = -1; // dropped below; avoid double-close

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(_)) = worker.child.try_wait() {
            break;
        }
        assert!(Instant::now() < deadline, "worker did not exit after master disconnect");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn missing_command_yields_job_error_record() {
    let worker = WorkerHandle::spawn();
    worker.send(&[("job_id", b"9")]);
    let record = worker.recv_until(Duration::from_secs(5), |m| m.contains_key("error_msg"));
    assert_eq!(field_str(&record, "job_id"), "9");
    assert!(field_str(&record, "error_msg").contains("command"));
}
