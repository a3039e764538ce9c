//! execd-worker — entry point
//!
//! Resolves the process contract (chdir, process group, descriptor on which
//! the master link is inherited) and hands off to [`execd_worker::run`],
//! which never returns.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use execd_worker::config;
use execd_worker::sys;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    sys::chdir_to_home_or_root();
    sys::become_process_group_leader();

    // Jobs must never inherit the worker's own stdout/stderr.
    sys::set_cloexec(libc::STDOUT_FILENO).context("setting FD_CLOEXEC on stdout")?;
    sys::set_cloexec(libc::STDERR_FILENO).context("setting FD_CLOEXEC on stderr")?;

    tracing::info!(fd = config::MASTER_FD, "starting worker");

    // `run` never returns; the process always exits from inside it.
    // FD_CLOEXEC, non-blocking mode, and socket buffer sizing on the master
    // descriptor itself are applied by `Supervisor::new`.
    execd_worker::run(config::MASTER_FD)
}
