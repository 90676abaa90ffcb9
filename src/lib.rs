//! NFC Controller Interface stack
//!
//! Drives an NCI front-end chip (PN7150 class) over a frame transport:
//! bring-up, discovery and tag arbitration, presence checking, plus an NDEF
//! codec and a Type 4 Tag responder for card emulation.
//!
//! The controller is generic over a [`transport::Transport`] and a
//! [`transport::Clock`], so the same state machine runs against an I2C
//! driver, a TCP simulator socket or a scripted mock in tests.

pub mod config;
pub mod error;
pub mod nci;
pub mod ndef;
pub mod t4t;
pub mod transport;

pub use config::{ChipModel, Mode, NciConfig};
pub use error::{NciError, Result};
pub use nci::{Controller, NciState, Presence, RemoteDevice};
pub use ndef::{NdefMessage, NdefRecord};
pub use t4t::T4tEmulator;
