//! Error taxonomy for the pipeline.
//!
//! Capability and buffer-grant failures are fatal at startup; transient
//! "not ready" conditions never surface here (they are part of the normal
//! return values); hard per-frame I/O errors are logged by the caller and
//! confined to the cycle that hit them.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The device is missing a capability the pipeline cannot run without.
    #[error("{device}: missing required capability: {what}")]
    MissingCapability {
        device: String,
        what: &'static str,
    },

    /// The driver granted fewer buffers than the ownership handoff needs.
    #[error("insufficient buffer grant: driver granted {granted}, need at least {required}")]
    InsufficientBuffers { granted: u32, required: u32 },

    /// No connected display output with at least one mode was found.
    #[error("no usable display output found")]
    NoDisplay,

    /// Plane discovery produced no plane usable for the requested stream.
    #[error("no overlay plane available for stream {stream}")]
    NoPlane { stream: usize },

    /// An operation was issued out of order on a capture stream.
    #[error("capture stream: {op} called in state {state}")]
    StreamState {
        op: &'static str,
        state: &'static str,
    },

    /// A buffer-slot transition that the ownership state machine forbids.
    #[error("slot {index}: invalid transition {from} -> {to}")]
    SlotTransition {
        index: u32,
        from: &'static str,
        to: &'static str,
    },

    /// A buffer index outside the configured pool.
    #[error("buffer index {index} out of range (pool size {count})")]
    BadIndex { index: u32, count: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Numeric driver error code, when this wraps an OS error.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(errno as i32))
    }
}
