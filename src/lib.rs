//! execd-worker — core library
//!
//! A long-running, single-threaded supervisor that receives framed job
//! requests over a duplex byte stream (conventionally inherited on fd 3),
//! runs each as its own process group, and reports structured completion
//! records back once each finishes, times out, or is forcibly reaped.
//!
//! [`run`] is the library entry point; `main.rs` is a thin wrapper that
//! resolves the master descriptor and the rest of the process contract
//! before calling into it.
pub mod config;
pub mod error;
pub mod frame;
pub mod job;
pub mod mux;
pub mod output;
pub mod process_table;
pub mod reaper;
pub mod spawn;
pub mod supervisor;
pub mod sys;
pub mod time;
pub mod timer;
pub mod wire;

use std::os::unix::io::RawFd;

/// Run the worker against `master_fd`. Never returns — the process exits
/// from within, once the master disconnects or a fatal error occurs.
pub fn run(master_fd: RawFd) -> ! {
    supervisor::run(master_fd)
}
