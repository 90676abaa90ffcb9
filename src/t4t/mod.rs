//! Type 4 Tag emulation
//!
//! APDU parsing, response encoding and the NDEF file responder used when the
//! controller is in card emulation mode.

mod apdu;
mod emulator;
mod response;
mod status;

pub use apdu::{ins, parse_apdu, Apdu, ApduError};
pub use emulator::{T4tEmulator, T4tState, CAPABILITY_CONTAINER, NDEF_APP_AID};
pub use response::Response;
pub use status::SW;
