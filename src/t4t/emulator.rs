//! NFC Forum Type 4 Tag emulation
//!
//! Exposes one NDEF file and its capability container to a remote reader.
//! The reader walks `Ready -> ApplicationSelected -> CcSelected ->
//! NdefSelected`; anything unexpected is answered with `6A 82` and the walk
//! starts over.

use log::{debug, info, warn};

use super::apdu::{ins, parse_apdu, Apdu};
use super::response::Response;
use super::status::SW;
use crate::nci::frame::hexify;

/// NDEF Tag Application AID (version 2)
pub const NDEF_APP_AID: &[u8] = &[0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];
pub const CC_FILE_ID: &[u8] = &[0xE1, 0x03];
pub const NDEF_FILE_ID: &[u8] = &[0xE1, 0x04];

/// Capability container: mapping 2.0, MLe/MLc 255, NDEF file E104 of up to
/// 255 bytes, free read and write access
pub const CAPABILITY_CONTAINER: &[u8] = &[
    0x00, 0x0F, 0x20, 0x00, 0xFF, 0x00, 0xFF, 0x04, 0x06, 0xE1, 0x04, 0x00, 0xFF, 0x00, 0x00,
];

/// Maximum NDEF file size advertised in the capability container (bytes 11-12),
/// NLEN included
pub const MAX_NDEF_FILE_SIZE: usize = 0x00FF;
/// Size of the NLEN prefix in front of the NDEF message
const NLEN_SIZE: usize = 2;
/// Largest NDEF message the file can hold, exposed or written
pub const STAGING_CAPACITY: usize = MAX_NDEF_FILE_SIZE - NLEN_SIZE;

/// Position in the select sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T4tState {
    Ready,
    ApplicationSelected,
    CcSelected,
    NdefSelected,
}

type MessageCallback = Box<dyn FnMut(&[u8])>;

/// Type 4 Tag responder backed by an in-memory NDEF file
pub struct T4tEmulator {
    state: T4tState,
    message: Vec<u8>,
    /// Armed until a read covers the end of the message
    sent_pending: bool,
    staging: [u8; STAGING_CAPACITY],
    staged_nlen: [u8; NLEN_SIZE],
    /// Highest body offset written in the current transaction
    written: usize,
    delivered: bool,
    on_sent: Option<MessageCallback>,
    on_received: Option<MessageCallback>,
}

impl Default for T4tEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl T4tEmulator {
    pub fn new() -> Self {
        Self {
            state: T4tState::Ready,
            message: Vec::new(),
            sent_pending: true,
            staging: [0u8; STAGING_CAPACITY],
            staged_nlen: [0u8; NLEN_SIZE],
            written: 0,
            delivered: false,
            on_sent: None,
            on_received: None,
        }
    }

    pub fn with_message(message: &[u8]) -> Self {
        let mut emulator = Self::new();
        emulator.set_message(message);
        emulator
    }

    /// Replace the exposed NDEF message; returns false, keeping the current
    /// one, if it does not fit the advertised file size
    pub fn set_message(&mut self, message: &[u8]) -> bool {
        if message.len() > STAGING_CAPACITY {
            warn!(
                "NDEF message of {} bytes exceeds the {} byte NDEF file",
                message.len(),
                MAX_NDEF_FILE_SIZE
            );
            return false;
        }
        self.message = message.to_vec();
        self.sent_pending = true;
        true
    }

    /// The currently exposed NDEF message
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn state(&self) -> T4tState {
        self.state
    }

    /// Called once each time a reader has read the whole message
    pub fn on_message_sent<F>(&mut self, callback: F)
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.on_sent = Some(Box::new(callback));
    }

    /// Called with the new message once a remote writer completes it
    pub fn on_message_received<F>(&mut self, callback: F)
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.on_received = Some(Box::new(callback));
    }

    /// Back to `Ready`, e.g. when a new reader session starts
    pub fn reset(&mut self) {
        self.state = T4tState::Ready;
    }

    /// Answer one command APDU
    pub fn process(&mut self, command: &[u8]) -> Vec<u8> {
        debug!("T4T APDU: {}", hexify(command));
        let response = match parse_apdu(command) {
            Ok(apdu) if apdu.cla == 0x00 => self.dispatch(&apdu),
            Ok(apdu) => {
                debug!("Unsupported class {:02X}", apdu.cla);
                Response::error(SW::FILE_NOT_FOUND)
            }
            Err(e) => {
                debug!("Malformed APDU: {}", e);
                Response::error(SW::FILE_NOT_FOUND)
            }
        };

        if !response.is_okay() {
            warn!("T4T command rejected in {:?}", self.state);
            self.reset();
        }
        response.to_bytes()
    }

    fn dispatch(&mut self, apdu: &Apdu) -> Response {
        match apdu.ins {
            ins::SELECT => self.handle_select(apdu),
            ins::READ_BINARY => self.handle_read(apdu),
            ins::UPDATE_BINARY => self.handle_write(apdu),
            _ => Response::error(SW::FILE_NOT_FOUND),
        }
    }

    // =========================================================================
    // Command Handlers
    // =========================================================================

    /// Handle SELECT by name (application) or by file id (CC, NDEF)
    fn handle_select(&mut self, apdu: &Apdu) -> Response {
        match (apdu.p1, apdu.p2, apdu.data.as_slice()) {
            (0x04, 0x00, aid) if aid == NDEF_APP_AID => {
                self.state = T4tState::ApplicationSelected;
                self.start_write_transaction();
                debug!("NDEF application selected");
                Response::ok()
            }
            (0x00, 0x0C, fid) if fid == CC_FILE_ID => {
                if self.state != T4tState::ApplicationSelected {
                    return Response::error(SW::FILE_NOT_FOUND);
                }
                self.state = T4tState::CcSelected;
                Response::ok()
            }
            (0x00, 0x0C, fid) if fid == NDEF_FILE_ID => {
                if self.state == T4tState::Ready {
                    return Response::error(SW::FILE_NOT_FOUND);
                }
                self.state = T4tState::NdefSelected;
                self.sent_pending = true;
                Response::ok()
            }
            _ => Response::error(SW::FILE_NOT_FOUND),
        }
    }

    /// Handle READ BINARY on the selected file
    fn handle_read(&mut self, apdu: &Apdu) -> Response {
        let le = match apdu.le {
            Some(le) => le,
            None => return Response::error(SW::FILE_NOT_FOUND),
        };
        let offset = apdu.p1p2() as usize;

        match self.state {
            T4tState::CcSelected => match window(CAPABILITY_CONTAINER, offset, le) {
                Some(bytes) => Response::success(bytes.to_vec()),
                None => Response::error(SW::FILE_NOT_FOUND),
            },
            T4tState::NdefSelected => {
                let file = self.ndef_file();
                let bytes = match window(&file, offset, le) {
                    Some(bytes) => bytes.to_vec(),
                    None => return Response::error(SW::FILE_NOT_FOUND),
                };
                if offset + bytes.len() >= file.len() && self.sent_pending {
                    self.sent_pending = false;
                    info!("NDEF message of {} bytes read by remote reader", self.message.len());
                    if let Some(callback) = self.on_sent.as_mut() {
                        callback(&self.message);
                    }
                }
                Response::success(bytes)
            }
            _ => Response::error(SW::FILE_NOT_FOUND),
        }
    }

    /// Handle UPDATE BINARY into the staging buffer
    fn handle_write(&mut self, apdu: &Apdu) -> Response {
        if self.state != T4tState::NdefSelected {
            return Response::error(SW::FILE_NOT_FOUND);
        }
        let offset = apdu.p1p2() as usize;
        let end = offset + apdu.data.len();
        if end > MAX_NDEF_FILE_SIZE {
            return Response::error(SW::FILE_NOT_FOUND);
        }

        let mut touched_nlen = false;
        for (pos, byte) in (offset..end).zip(apdu.data.iter()) {
            if pos < NLEN_SIZE {
                self.staged_nlen[pos] = *byte;
                touched_nlen = true;
            } else {
                self.staging[pos - NLEN_SIZE] = *byte;
            }
        }

        let nlen = u16::from_be_bytes(self.staged_nlen) as usize;
        if touched_nlen && nlen == 0 {
            self.start_write_transaction();
        }
        self.written = self.written.max(end.saturating_sub(NLEN_SIZE));

        if nlen > 0 && self.written >= nlen && !self.delivered {
            self.delivered = true;
            self.message = self.staging[..nlen].to_vec();
            self.sent_pending = true;
            info!("NDEF message of {} bytes written by remote reader", nlen);
            if let Some(callback) = self.on_received.as_mut() {
                callback(&self.message);
            }
        }
        Response::ok()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// The NDEF file image: big-endian NLEN followed by the message
    fn ndef_file(&self) -> Vec<u8> {
        let mut file = Vec::with_capacity(NLEN_SIZE + self.message.len());
        file.extend_from_slice(&(self.message.len() as u16).to_be_bytes());
        file.extend_from_slice(&self.message);
        file
    }

    fn start_write_transaction(&mut self) {
        self.written = 0;
        self.delivered = false;
    }
}

/// Up to `len` bytes of `file` starting at `offset`; None past the end
fn window(file: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    if offset >= file.len() {
        return None;
    }
    let end = (offset + len).min(file.len());
    file.get(offset..end)
}
