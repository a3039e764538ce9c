//! Process-wide constants. None of these are read from the environment or
//! command-line flags — the core consults neither.

use std::os::unix::io::RawFd;

/// Conventional descriptor the master socket is inherited on.
pub const MASTER_FD: RawFd = 3;

/// Default job timeout in whole seconds, applied when `timeout` is absent or zero.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Initial frame-decoder cache size.
pub const FRAME_CACHE_INITIAL_CAPACITY: usize = 512 * 1024;

/// `SO_SNDBUF`/`SO_RCVBUF` applied to the master socket.
pub const MASTER_SOCKET_BUFFER_SIZE: i32 = 256 * 1024;

/// Initial process-table capacity hint.
pub const PROCESS_TABLE_CAPACITY: usize = 4096;

/// Chunk size for non-blocking output reads.
pub const OUTPUT_READ_CHUNK: usize = 4096;

/// Slack added to a timer deadline before comparing against `now()`.
pub const POLL_SLACK_MS: i64 = 5;

/// Delay before the first re-reap attempt on a job transitioning to `Stale`.
pub const STALE_FIRST_RETRY_SECS: i64 = 1;

/// Delay between subsequent re-reap attempts once a job is `Stale`.
pub const STALE_RETRY_SECS: i64 = 5;

/// How long exit cleanup waits after SIGTERM (and again after SIGKILL) for
/// stragglers to be reaped.
pub const EXIT_CLEANUP_GRACE_SECS: u64 = 1;
