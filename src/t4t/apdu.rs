//! Command APDU parsing
//!
//! Only the short ISO 7816-4 form is needed here: the emulated tag announces
//! a 255 byte maximum in its capability container, so readers never send
//! extended lengths.

use thiserror::Error;

/// Errors that can occur during APDU parsing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU too short: expected at least 4 bytes, got {0}")]
    TooShort(usize),

    #[error("Lc of {lc} does not match {available} trailing bytes")]
    InvalidLength { lc: usize, available: usize },
}

/// Instruction bytes understood by the Type 4 Tag responder
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const UPDATE_BINARY: u8 = 0xD6;
}

/// A parsed command APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Command data (may be empty)
    pub data: Vec<u8>,
    /// Expected response length, 256 when encoded as 0
    pub le: Option<usize>,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// P1-P2 combined; the file offset for READ/UPDATE BINARY
    pub fn p1p2(&self) -> u16 {
        ((self.p1 as u16) << 8) | (self.p2 as u16)
    }
}

/// Parse a short APDU: `CLA INS P1 P2 [Lc Data] [Le]`
///
/// ```ignore
/// let apdu = parse_apdu(&[0x00, 0xB0, 0x00, 0x02, 0x10]).unwrap();
/// assert_eq!(apdu.p1p2(), 2);
/// assert_eq!(apdu.le, Some(16));
/// ```
pub fn parse_apdu(data: &[u8]) -> Result<Apdu, ApduError> {
    if data.len() < 4 {
        return Err(ApduError::TooShort(data.len()));
    }
    let mut apdu = Apdu::new(data[0], data[1], data[2], data[3]);
    let remaining = &data[4..];

    match remaining.len() {
        // Case 1: header only
        0 => Ok(apdu),
        // Case 2: Le only
        1 => {
            apdu.le = Some(decode_le(remaining[0]));
            Ok(apdu)
        }
        _ => {
            let lc = remaining[0] as usize;
            let body = &remaining[1..];
            if body.len() == lc {
                // Case 3: Lc + Data
                apdu.data = body.to_vec();
                Ok(apdu)
            } else if body.len() == lc + 1 {
                // Case 4: Lc + Data + Le
                apdu.data = body[..lc].to_vec();
                apdu.le = Some(decode_le(body[lc]));
                Ok(apdu)
            } else {
                Err(ApduError::InvalidLength {
                    lc,
                    available: body.len(),
                })
            }
        }
    }
}

fn decode_le(byte: u8) -> usize {
    if byte == 0 {
        256
    } else {
        byte as usize
    }
}
