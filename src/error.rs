//! Error types for the NCI stack
//!
//! Session-level failures raised by the frame codec and controller. The NDEF
//! codec, the T4T responder and configuration loading have their own error
//! enums next to the code that raises them.

use thiserror::Error;

use crate::nci::state::NciState;

/// Errors raised while talking to the NFC controller
#[derive(Debug, Error)]
pub enum NciError {
    #[error("transport I/O failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timed out after {timeout_ms} ms waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        timeout_ms: u64,
    },

    #[error("unexpected message while waiting for {expected}: {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: String,
    },

    #[error("{command} rejected with status 0x{status:02X}")]
    Rejected { command: &'static str, status: u8 },

    #[error("operation not allowed in state {0:?}")]
    InvalidState(NciState),

    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),

    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    #[error("no further tag was registered during discovery")]
    NoNextTag,

    #[error("no discovery candidate at index {0}")]
    NoSuchCandidate(usize),

    #[error("controller generation unknown or unsupported for {0}")]
    UnsupportedGeneration(&'static str),
}

/// Result alias used throughout the controller
pub type Result<T> = std::result::Result<T, NciError>;
