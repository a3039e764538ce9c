//! Forks a command into its own process group, returning its pid and two
//! read-side descriptors for stdout/stderr.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

pub struct SpawnedChild {
    pub pid: libc::pid_t,
    pub stdout_fd: RawFd,
    pub stderr_fd: RawFd,
}

/// Fork a shell (`/bin/sh -c command`) into its own process group, with
/// stdout/stderr piped back non-blocking. stdin is `/dev/null`; the worker
/// never feeds stdin to a job.
pub fn spawn_command(command: &str) -> io::Result<SpawnedChild> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: `pre_exec` runs in the forked child before exec, with only
    // async-signal-safe operations performed here (a single setpgid(2)
    // call). This gives each child its own process group so the worker can
    // later signal the whole group on timeout.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child.id() as libc::pid_t;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let stdout_fd = stdout.into_raw_fd();
    let stderr_fd = stderr.into_raw_fd();

    set_nonblocking(stdout_fd)?;
    set_nonblocking(stderr_fd)?;

    // We manage `pid` ourselves via wait4() from here on; `child`'s Drop does
    // not wait() or signal anything (stdin/stdout/stderr are already taken),
    // so letting it go out of scope here is safe and leak-free.
    drop(child);

    Ok(SpawnedChild {
        pid,
        stdout_fd,
        stderr_fd,
    })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_and_sets_nonblocking_fds() {
        let child = spawn_command("printf hello; printf err 1>&2").expect("spawn");
        assert!(child.pid > 0);

        // Give the shell a brief moment to exec and write.
        std::thread::sleep(std::time::Duration::from_millis(200));

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    child.stdout_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        assert_eq!(out, b"hello");

        unsafe {
            libc::close(child.stdout_fd);
            libc::close(child.stderr_fd);
            let mut status = 0;
            libc::waitpid(child.pid, &mut status, 0);
        }
    }

    #[test]
    fn child_is_in_its_own_process_group() {
        let child = spawn_command("sleep 5").expect("spawn");
        let pgid = unsafe { libc::getpgid(child.pid) };
        assert_eq!(pgid, child.pid, "child should be its own group leader");

        unsafe {
            libc::kill(-child.pid, libc::SIGKILL);
            libc::close(child.stdout_fd);
            libc::close(child.stderr_fd);
            let mut status = 0;
            libc::waitpid(child.pid, &mut status, 0);
        }
    }
}
