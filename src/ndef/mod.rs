//! NDEF message codec
//!
//! Builds and parses NFC Data Exchange Format messages: a sequence of
//! records, each with a flags/TNF header, a type, an optional id and a
//! payload. The first record carries MB, the last ME.

pub mod message;
pub mod record;
pub mod uri;

pub use message::{NdefMessage, Records};
pub use record::{flags, BluetoothOob, NdefRecord, RecordKind, Tnf, WifiCredential};

use thiserror::Error;

/// Errors raised while building or parsing NDEF data
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NdefError {
    #[error("message would grow to {size} bytes, limit is {limit}")]
    SizeLimit { size: usize, limit: usize },

    #[error("record payload is empty")]
    EmptyPayload,

    #[error("truncated record: {0}")]
    Truncated(&'static str),

    #[error("{0} is longer than 255 bytes")]
    FieldTooLong(&'static str),

    #[error("chunked records are not supported")]
    ChunkedUnsupported,

    #[error("record is not a {0} record")]
    UnexpectedType(&'static str),

    #[error("invalid text encoding")]
    InvalidText,

    #[error("Wi-Fi credential containers nested too deeply")]
    NestingTooDeep,
}

/// Result alias for NDEF operations
pub type Result<T> = std::result::Result<T, NdefError>;
