//! NCI frame codec
//!
//! Every NCI message is a 3-byte header followed by up to 255 payload bytes:
//!
//! ```text
//! byte 0: MT(3) | PBF(1) | GID(4)     message type, boundary flag, group
//! byte 1: RFU(2) | OID(6)             opcode
//! byte 2: L                           payload length
//! ```
//!
//! Data packets reuse the layout with the connection id in place of the
//! group and an RFU opcode byte.

use std::fmt;

use log::{debug, warn};

use crate::error::{NciError, Result};
use crate::transport::{Clock, Transport};

pub const HEADER_SIZE: usize = 3;
pub const MAX_PAYLOAD_SIZE: usize = 255;
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Packet boundary flag, always cleared on transmit
pub const PBF_MASK: u8 = 0x10;
const MT_MASK: u8 = 0xE0;
const GID_MASK: u8 = 0x0F;
const OID_MASK: u8 = 0x3F;

/// Timeout used when a caller passes 0
pub const DEFAULT_TIMEOUT_MS: u64 = 5;
/// Timeout sentinel meaning "wait until something arrives"
pub const WAIT_FOREVER: u64 = u64::MAX;

pub const STATUS_OK: u8 = 0x00;

/// Group identifiers
pub mod gid {
    pub const CORE: u8 = 0x00;
    pub const RF: u8 = 0x01;
    pub const NFCEE: u8 = 0x02;
    pub const PROPRIETARY: u8 = 0x0F;
}

/// Opcode identifiers per group
pub mod oid {
    pub mod core {
        pub const RESET: u8 = 0x00;
        pub const INIT: u8 = 0x01;
        pub const SET_CONFIG: u8 = 0x02;
        pub const GET_CONFIG: u8 = 0x03;
        pub const CONN_CREDITS: u8 = 0x06;
        pub const GENERIC_ERROR: u8 = 0x07;
        pub const INTERFACE_ERROR: u8 = 0x08;
    }

    pub mod rf {
        pub const DISCOVER_MAP: u8 = 0x00;
        pub const SET_LISTEN_MODE_ROUTING: u8 = 0x01;
        pub const DISCOVER: u8 = 0x03;
        pub const DISCOVER_SELECT: u8 = 0x04;
        pub const INTF_ACTIVATED: u8 = 0x05;
        pub const DEACTIVATE: u8 = 0x06;
        pub const T3T_POLLING: u8 = 0x08;
    }

    pub mod proprietary {
        pub const ACT: u8 = 0x02;
        pub const ISO_DEP_PRESENCE_CHECK: u8 = 0x11;
        pub const TEST_PRBS: u8 = 0x30;
        pub const TEST_RF_ON: u8 = 0x3D;
    }
}

/// NCI message type (the top three header bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data = 0x00,
    Command = 0x20,
    Response = 0x40,
    Notification = 0x60,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Data,
        MessageType::Command,
        MessageType::Response,
        MessageType::Notification,
    ];

    pub fn from_header_byte(byte: u8) -> Option<Self> {
        match byte & MT_MASK {
            0x00 => Some(MessageType::Data),
            0x20 => Some(MessageType::Command),
            0x40 => Some(MessageType::Response),
            0x60 => Some(MessageType::Notification),
            _ => None,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            MessageType::Data => "DATA",
            MessageType::Command => "CMD",
            MessageType::Response => "RSP",
            MessageType::Notification => "NTF",
        }
    }
}

/// Classified frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub message_type: MessageType,
    /// Group id, or connection id for data packets
    pub group: u8,
    pub opcode: u8,
}

impl Header {
    pub fn new(message_type: MessageType, group: u8, opcode: u8) -> Self {
        Self {
            message_type,
            group: group & GID_MASK,
            opcode: opcode & OID_MASK,
        }
    }

    /// Header of a data packet on the static RF connection
    pub fn data() -> Self {
        Self::new(MessageType::Data, 0, 0)
    }

    /// The two identifying header bytes, with PBF and RFU bits cleared
    pub fn encode(&self) -> [u8; 2] {
        [
            (self.message_type as u8 | self.group) & !PBF_MASK,
            self.opcode & OID_MASK,
        ]
    }

    /// Recover type, group and opcode from a raw frame
    pub fn classify(frame: &[u8]) -> Option<Self> {
        let b0 = *frame.first()?;
        let b1 = *frame.get(1)?;
        let message_type = MessageType::from_header_byte(b0)?;
        Some(Self::new(message_type, b0 & GID_MASK, b1 & OID_MASK))
    }

    pub fn is(&self, message_type: MessageType, group: u8, opcode: u8) -> bool {
        *self == Self::new(message_type, group, opcode)
    }

    /// CORE_CONN_CREDITS_NTF, sent by the controller after every data packet
    pub fn is_credit_notification(&self) -> bool {
        self.is(MessageType::Notification, gid::CORE, oid::core::CONN_CREDITS)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gid=0x{:02X} oid=0x{:02X}",
            self.message_type.short_name(),
            self.group,
            self.opcode
        )
    }
}

/// An owned NCI frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(header: Header, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NciError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let [b0, b1] = self.header.encode();
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.push(b0);
        bytes.push(b1);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a received frame, requiring the length byte to match
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(NciError::Truncated("missing header"));
        }
        let header = Header::classify(bytes).ok_or(NciError::Truncated("unknown message type"))?;
        let declared = bytes[2] as usize;
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + declared)
            .ok_or(NciError::Truncated("payload shorter than length byte"))?;
        if bytes.len() != HEADER_SIZE + declared {
            return Err(NciError::Truncated("length byte does not match payload"));
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }
}

/// Format bytes as space separated hex for logs
pub fn hexify(value: &[u8]) -> String {
    value.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

/// Sends frames and waits for replies over a [`Transport`]
///
/// Owns the single receive buffer; the last frame read stays available
/// through [`FrameCodec::received`] until the next read or timeout.
pub struct FrameCodec<T, C> {
    transport: T,
    clock: C,
    rx: Vec<u8>,
    rx_len: usize,
}

impl<T: Transport, C: Clock> FrameCodec<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            rx: vec![0u8; MAX_FRAME_SIZE],
            rx_len: 0,
        }
    }

    /// Build and write one frame
    pub fn send(&mut self, header: Header, payload: &[u8]) -> Result<()> {
        let frame = Frame::new(header, payload)?.to_bytes();
        debug!("NCI TX [{}]: {}", header, hexify(&frame));
        self.transport.write(&frame)?;
        Ok(())
    }

    pub fn send_command(&mut self, group: u8, opcode: u8, payload: &[u8]) -> Result<()> {
        self.send(Header::new(MessageType::Command, group, opcode), payload)
    }

    /// Send a data packet on the static RF connection
    pub fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        self.send(Header::data(), payload)
    }

    /// Read a frame if one is pending, without waiting
    pub fn poll_message(&mut self) -> Option<usize> {
        if !self.transport.has_data() {
            return None;
        }
        match self.transport.read(&mut self.rx) {
            Ok(0) => None,
            Ok(len) => {
                self.rx_len = len.min(self.rx.len());
                debug!("NCI RX: {}", hexify(self.received()));
                Some(self.rx_len)
            }
            Err(e) => {
                warn!("NCI transport read failed: {}", e);
                self.rx_len = 0;
                None
            }
        }
    }

    /// Wait up to `timeout_ms` for a frame; returns its length, 0 on timeout
    pub fn await_message(&mut self, timeout_ms: u64) -> usize {
        let timeout = if timeout_ms == 0 { DEFAULT_TIMEOUT_MS } else { timeout_ms };
        let start = self.clock.now_ms();
        loop {
            if let Some(len) = self.poll_message() {
                return len;
            }
            if timeout != WAIT_FOREVER && self.clock.now_ms().saturating_sub(start) >= timeout {
                self.rx_len = 0;
                return 0;
            }
            self.clock.sleep_ms(1);
        }
    }

    /// Like [`FrameCodec::await_message`] but discards frames for which
    /// `skip` returns true, all within one overall deadline
    pub fn await_skipping<F>(&mut self, timeout_ms: u64, skip: F) -> usize
    where
        F: Fn(&Header) -> bool,
    {
        let deadline = self.clock.now_ms().saturating_add(timeout_ms);
        loop {
            let remaining = deadline.saturating_sub(self.clock.now_ms());
            if remaining == 0 {
                self.rx_len = 0;
                return 0;
            }
            let len = self.await_message(remaining);
            if len == 0 {
                return 0;
            }
            match self.header() {
                Some(header) if skip(&header) => {
                    debug!("Skipping {}", header);
                }
                _ => return len,
            }
        }
    }

    /// Wait for the answer to a data packet, ignoring credit notifications
    pub fn await_data_answer(&mut self, timeout_ms: u64) -> usize {
        self.await_skipping(timeout_ms, Header::is_credit_notification)
    }

    /// Wait for a complete data message, joining packets sent with PBF set
    ///
    /// Credit notifications are skipped. The overall deadline covers every
    /// segment; any other frame aborts the message as unexpected.
    pub fn await_data_message(&mut self, timeout_ms: u64, waiting_for: &'static str) -> Result<Vec<u8>> {
        let timeout = if timeout_ms == 0 { DEFAULT_TIMEOUT_MS } else { timeout_ms };
        let deadline = self.clock.now_ms().saturating_add(timeout);
        let mut message = Vec::new();
        loop {
            let remaining = deadline.saturating_sub(self.clock.now_ms());
            if remaining == 0 || self.await_data_answer(remaining) == 0 {
                self.rx_len = 0;
                return Err(NciError::Timeout {
                    waiting_for,
                    timeout_ms,
                });
            }
            if !self.is_message(MessageType::Data, 0, 0) {
                return Err(NciError::UnexpectedMessage {
                    expected: waiting_for,
                    received: hexify(self.received()),
                });
            }
            if self.append_segment(&mut message)? {
                return Ok(message);
            }
        }
    }

    /// Append the payload of the data packet in the receive buffer to
    /// `message`; true when that packet completes the message
    pub fn append_segment(&self, message: &mut Vec<u8>) -> Result<bool> {
        let payload = self.payload().ok_or(NciError::Truncated("data packet"))?;
        message.extend_from_slice(payload);
        if self.is_segment() {
            debug!("Data segment of {} bytes, {} so far", payload.len(), message.len());
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Whether the last frame has the packet boundary flag set
    pub fn is_segment(&self) -> bool {
        self.byte(0).map(|b| b & PBF_MASK != 0).unwrap_or(false)
    }

    /// The last received frame (empty after a timeout)
    pub fn received(&self) -> &[u8] {
        &self.rx[..self.rx_len]
    }

    pub fn header(&self) -> Option<Header> {
        Header::classify(self.received())
    }

    pub fn is_message(&self, message_type: MessageType, group: u8, opcode: u8) -> bool {
        self.header()
            .map(|h| h.is(message_type, group, opcode))
            .unwrap_or(false)
    }

    /// Byte at `index` of the last received frame
    pub fn byte(&self, index: usize) -> Option<u8> {
        self.received().get(index).copied()
    }

    /// Payload of the last frame, bounded by its declared length
    pub fn payload(&self) -> Option<&[u8]> {
        let declared = self.byte(2)? as usize;
        self.received().get(HEADER_SIZE..HEADER_SIZE + declared)
    }

    /// Status byte of a response (payload offset 0)
    pub fn status(&self) -> Option<u8> {
        self.byte(HEADER_SIZE)
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
