//! Typed errors for the recoverable paths the worker distinguishes.
//!
//! Fatal conditions (master pipe broken, allocation failure on essential
//! structures) are reported through [`WorkerError`]'s fatal variants and
//! propagate out of the supervisor loop; everything else is reported to the
//! master as a structured record and handled inline.

use crate::frame::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("frame protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("master connection closed")]
    MasterClosed,

    #[error("write to master failed: {0}")]
    MasterWrite(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Fatal errors are the ones that should trigger exit cleanup and process exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::MasterClosed | WorkerError::MasterWrite(_)
        )
    }
}

/// Error kind echoed in the `error_code` field of a completion record, or in
/// an `error_msg` job-error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorCode {
    /// The job's deadline elapsed before it exited.
    Etime,
    /// SIGKILL was sent but the child could not be reaped within the cycle.
    Estale,
}

impl JobErrorCode {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            JobErrorCode::Etime => "ETIME",
            JobErrorCode::Estale => "ESTALE",
        }
    }
}
