//! Small raw-syscall helpers shared by process-contract setup, the
//! supervisor loop, and exit cleanup. Kept separate from `supervisor.rs` so
//! that orchestration logic isn't buried in `unsafe` plumbing.

use std::io;
use std::os::unix::io::RawFd;

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `SO_SNDBUF`/`SO_RCVBUF` on a socket.
pub fn set_socket_buffers(fd: RawFd, bufsize: i32) -> io::Result<()> {
    unsafe {
        let ret = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &bufsize as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &bufsize as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Write the whole buffer to `fd`, treating `EAGAIN` on this (non-blocking)
/// descriptor as "wait for writability" rather than an error, so callers can
/// treat master-socket writes as blocking despite the descriptor itself
/// being `O_NONBLOCK`.
pub fn write_all_blocking(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n > 0 {
            buf = &buf[n as usize..];
            continue;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                wait_writable(fd)?;
                continue;
            }
            _ => return Err(err),
        }
    }
    Ok(())
}

fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(());
    }
}

/// `chdir` to the invoking user's home directory, falling back to `/` on
/// failure. Failures are silently ignored — a worker with no fixed working
/// directory shouldn't refuse to start over it.
pub fn chdir_to_home_or_root() {
    let home = home_dir();
    let target = home.as_deref().unwrap_or("/");
    unsafe {
        let c = std::ffi::CString::new(target).unwrap_or_else(|_| std::ffi::CString::new("/").unwrap());
        if libc::chdir(c.as_ptr()) != 0 {
            let root = std::ffi::CString::new("/").unwrap();
            libc::chdir(root.as_ptr());
        }
    }
}

fn home_dir() -> Option<String> {
    unsafe {
        let uid = libc::getuid();
        let pwd = libc::getpwuid(uid);
        if pwd.is_null() {
            return None;
        }
        let dir = (*pwd).pw_dir;
        if dir.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(dir).to_str().ok().map(String::from)
    }
}

/// `setpgid(0, 0)`: place the worker itself in a new process group, so that
/// exit cleanup's `kill(0, SIGTERM)` only reaches our own descendants.
pub fn become_process_group_leader() {
    unsafe {
        libc::setpgid(0, 0);
    }
}

/// A tight, blocking `waitpid(-1, WNOHANG)` drain loop, used only during exit
/// cleanup where job bookkeeping no longer matters.
pub fn reap_all_available() {
    loop {
        let mut status = 0;
        let ret = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if ret <= 0 {
            break;
        }
    }
}

pub fn ignore_sigterm() {
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

pub fn kill_own_group_term() {
    unsafe {
        libc::kill(0, libc::SIGTERM);
    }
}

pub fn kill_process_group(pid: libc::pid_t, signal: libc::c_int) {
    unsafe {
        libc::kill(-pid, signal);
    }
}
