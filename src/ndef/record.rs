//! NDEF records
//!
//! Record layout:
//!
//! ```text
//! flags|TNF  type length  payload length (1 or 4)  [id length]  type  [id]  payload
//! ```

use super::uri;
use super::{NdefError, Result};

/// Header flag bits
pub mod flags {
    /// Message begin
    pub const MB: u8 = 0x80;
    /// Message end
    pub const ME: u8 = 0x40;
    /// Chunk flag
    pub const CF: u8 = 0x20;
    /// Short record: one byte payload length
    pub const SR: u8 = 0x10;
    /// Id length present
    pub const IL: u8 = 0x08;
    pub const TNF_MASK: u8 = 0x07;
}

pub const TEXT_TYPE: &[u8] = b"T";
pub const URI_TYPE: &[u8] = b"U";
pub const WIFI_MIME_TYPE: &str = "application/vnd.wfa.wsc";
pub const BLUETOOTH_EP_MIME_TYPE: &str = "application/vnd.bluetooth.ep.oob";
pub const BLUETOOTH_LE_MIME_TYPE: &str = "application/vnd.bluetooth.le.oob";
pub const DEFAULT_LANGUAGE: &str = "en";

/// Text record status byte: UTF-16 flag and language code length
const TEXT_UTF16: u8 = 0x80;
const TEXT_LANGUAGE_MASK: u8 = 0x3F;

/// Type Name Format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tnf {
    Empty = 0x00,
    WellKnown = 0x01,
    MimeMedia = 0x02,
    AbsoluteUri = 0x03,
    External = 0x04,
    Unknown = 0x05,
    Unchanged = 0x06,
    Reserved = 0x07,
}

impl Tnf {
    pub fn from_bits(bits: u8) -> Self {
        match bits & flags::TNF_MASK {
            0x00 => Tnf::Empty,
            0x01 => Tnf::WellKnown,
            0x02 => Tnf::MimeMedia,
            0x03 => Tnf::AbsoluteUri,
            0x04 => Tnf::External,
            0x05 => Tnf::Unknown,
            0x06 => Tnf::Unchanged,
            _ => Tnf::Reserved,
        }
    }
}

/// What a record carries, judged from its TNF and type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Text,
    Uri,
    WifiSimpleConfig,
    BluetoothEp,
    BluetoothLe,
    VCard,
    Mime,
    External,
    Unknown,
}

/// Wi-Fi credential from a Wi-Fi Simple Configuration record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredential {
    pub ssid: String,
    pub authentication: u16,
    pub encryption: u16,
    pub network_key: String,
}

impl WifiCredential {
    pub fn authentication_name(&self) -> &'static str {
        match self.authentication {
            0x0001 => "OPEN",
            0x0002 => "WPA PERSONAL",
            0x0004 => "SHARED",
            0x0008 => "WPA ENTERPRISE",
            0x0010 => "WPA2 ENTERPRISE",
            0x0020 => "WPA2 PERSONAL",
            0x0022 => "WPA/WPA2 PERSONAL",
            _ => "UNKNOWN",
        }
    }

    pub fn encryption_name(&self) -> &'static str {
        match self.encryption {
            0x0001 => "NONE",
            0x0002 => "WEP",
            0x0004 => "TKIP",
            0x0008 => "AES",
            0x000C => "AES/TKIP",
            _ => "UNKNOWN",
        }
    }
}

// Wi-Fi Simple Configuration attribute ids
mod wsc {
    pub const AUTH_TYPE: u16 = 0x1003;
    pub const CREDENTIAL: u16 = 0x100E;
    pub const ENCRYPTION_TYPE: u16 = 0x100F;
    pub const NETWORK_KEY: u16 = 0x1027;
    pub const SSID: u16 = 0x1045;
}

// EIR / AD structure types
const EIR_SHORT_NAME: u8 = 0x08;
const EIR_COMPLETE_NAME: u8 = 0x09;
const AD_LE_DEVICE_ADDRESS: u8 = 0x1B;

/// Bluetooth out-of-band pairing data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothOob {
    /// Device address, most significant byte first
    pub address: [u8; 6],
    pub name: Option<String>,
}

impl BluetoothOob {
    /// Address in the usual `AA:BB:CC:DD:EE:FF` notation
    pub fn address_string(&self) -> String {
        self.address
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Lengths decoded from a record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub flags: u8,
    pub type_len: usize,
    pub id_len: usize,
    pub payload_len: usize,
    /// Bytes before the type field
    pub header_len: usize,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let flags = *bytes.first().ok_or(NdefError::Truncated("header"))?;
        if flags & flags::CF != 0 {
            return Err(NdefError::ChunkedUnsupported);
        }
        let type_len = *bytes.get(1).ok_or(NdefError::Truncated("type length"))? as usize;
        let (payload_len, mut header_len) = if flags & flags::SR != 0 {
            let len = *bytes.get(2).ok_or(NdefError::Truncated("payload length"))?;
            (len as usize, 3)
        } else {
            let len = bytes.get(2..6).ok_or(NdefError::Truncated("payload length"))?;
            (u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize, 6)
        };
        let id_len = if flags & flags::IL != 0 {
            let len = *bytes.get(header_len).ok_or(NdefError::Truncated("id length"))?;
            header_len += 1;
            len as usize
        } else {
            0
        };
        Ok(Self {
            flags,
            type_len,
            id_len,
            payload_len,
            header_len,
        })
    }

    /// Encoded size of the whole record
    pub fn record_len(&self) -> usize {
        self.header_len + self.type_len + self.id_len + self.payload_len
    }
}

/// One NDEF record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    pub fn new(tnf: Tnf, record_type: &[u8], payload: &[u8]) -> Self {
        Self {
            tnf,
            record_type: record_type.to_vec(),
            id: Vec::new(),
            payload: payload.to_vec(),
        }
    }

    /// Well-known text record, UTF-8 encoded
    pub fn text(text: &str, language: &str) -> Self {
        let language = &language.as_bytes()[..language.len().min(TEXT_LANGUAGE_MASK as usize)];
        let mut payload = Vec::with_capacity(1 + language.len() + text.len());
        payload.push(language.len() as u8);
        payload.extend_from_slice(language);
        payload.extend_from_slice(text.as_bytes());
        Self::new(Tnf::WellKnown, TEXT_TYPE, &payload)
    }

    /// Well-known URI record, abbreviated with the longest known prefix
    pub fn uri(uri: &str) -> Self {
        let (code, rest) = uri::abbreviate(uri);
        let mut payload = Vec::with_capacity(1 + rest.len());
        payload.push(code);
        payload.extend_from_slice(rest.as_bytes());
        Self::new(Tnf::WellKnown, URI_TYPE, &payload)
    }

    pub fn mime(mime_type: &str, payload: &[u8]) -> Self {
        Self::new(Tnf::MimeMedia, mime_type.as_bytes(), payload)
    }

    /// NFC Forum external type, e.g. `android.com:pkg`
    pub fn external(record_type: &str, payload: &[u8]) -> Self {
        Self::new(Tnf::External, record_type.as_bytes(), payload)
    }

    pub fn with_id(mut self, id: &[u8]) -> Self {
        self.id = id.to_vec();
        self
    }

    /// Encode as the only record of a message (MB and ME set)
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with(true, true)
    }

    /// Encode with explicit message begin/end flags
    pub fn encode_with(&self, begin: bool, end: bool) -> Result<Vec<u8>> {
        if self.record_type.len() > u8::MAX as usize {
            return Err(NdefError::FieldTooLong("record type"));
        }
        if self.id.len() > u8::MAX as usize {
            return Err(NdefError::FieldTooLong("record id"));
        }
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| NdefError::FieldTooLong("payload"))?;
        let short = self.payload.len() <= u8::MAX as usize;

        let mut header = self.tnf as u8;
        if begin {
            header |= flags::MB;
        }
        if end {
            header |= flags::ME;
        }
        if short {
            header |= flags::SR;
        }
        if !self.id.is_empty() {
            header |= flags::IL;
        }

        let mut out = Vec::with_capacity(
            6 + 1 + self.record_type.len() + self.id.len() + self.payload.len(),
        );
        out.push(header);
        out.push(self.record_type.len() as u8);
        if short {
            out.push(payload_len as u8);
        } else {
            out.extend_from_slice(&payload_len.to_be_bytes());
        }
        if !self.id.is_empty() {
            out.push(self.id.len() as u8);
        }
        out.extend_from_slice(&self.record_type);
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode the record at the start of `bytes`; returns it with its
    /// encoded length
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = RecordHeader::parse(bytes)?;
        let mut pos = header.header_len;
        let record_type = take(bytes, &mut pos, header.type_len, "type")?;
        let id = take(bytes, &mut pos, header.id_len, "id")?;
        let payload = take(bytes, &mut pos, header.payload_len, "payload")?;
        let record = Self {
            tnf: Tnf::from_bits(header.flags),
            record_type: record_type.to_vec(),
            id: id.to_vec(),
            payload: payload.to_vec(),
        };
        Ok((record, pos))
    }

    pub fn kind(&self) -> RecordKind {
        match self.tnf {
            Tnf::WellKnown if self.record_type == TEXT_TYPE => RecordKind::Text,
            Tnf::WellKnown if self.record_type == URI_TYPE => RecordKind::Uri,
            Tnf::MimeMedia => {
                let mime = String::from_utf8_lossy(&self.record_type).to_ascii_lowercase();
                match mime.as_str() {
                    WIFI_MIME_TYPE => RecordKind::WifiSimpleConfig,
                    BLUETOOTH_EP_MIME_TYPE => RecordKind::BluetoothEp,
                    BLUETOOTH_LE_MIME_TYPE => RecordKind::BluetoothLe,
                    "text/vcard" | "text/x-vcard" => RecordKind::VCard,
                    _ => RecordKind::Mime,
                }
            }
            Tnf::External => RecordKind::External,
            _ => RecordKind::Unknown,
        }
    }

    /// Language code of a text record
    pub fn language(&self) -> Result<String> {
        let (status, rest) = self.text_parts()?;
        let len = (status & TEXT_LANGUAGE_MASK) as usize;
        let code = rest.get(..len).ok_or(NdefError::Truncated("language code"))?;
        String::from_utf8(code.to_vec()).map_err(|_| NdefError::InvalidText)
    }

    /// Body of a text record
    pub fn text_content(&self) -> Result<String> {
        let (status, rest) = self.text_parts()?;
        let len = (status & TEXT_LANGUAGE_MASK) as usize;
        let body = rest.get(len..).ok_or(NdefError::Truncated("text"))?;
        if status & TEXT_UTF16 != 0 {
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).map_err(|_| NdefError::InvalidText)
        } else {
            String::from_utf8(body.to_vec()).map_err(|_| NdefError::InvalidText)
        }
    }

    fn text_parts(&self) -> Result<(u8, &[u8])> {
        if self.kind() != RecordKind::Text {
            return Err(NdefError::UnexpectedType("text"));
        }
        let (status, rest) = self
            .payload
            .split_first()
            .ok_or(NdefError::Truncated("text status"))?;
        Ok((*status, rest))
    }

    /// Full URI of a URI record
    pub fn uri_content(&self) -> Result<String> {
        if self.kind() != RecordKind::Uri {
            return Err(NdefError::UnexpectedType("URI"));
        }
        let (code, rest) = self
            .payload
            .split_first()
            .ok_or(NdefError::Truncated("URI identifier code"))?;
        let rest = std::str::from_utf8(rest).map_err(|_| NdefError::InvalidText)?;
        Ok(uri::expand(*code, rest))
    }

    /// Body of a vCard record
    pub fn vcard(&self) -> Result<String> {
        if self.kind() != RecordKind::VCard {
            return Err(NdefError::UnexpectedType("vCard"));
        }
        String::from_utf8(self.payload.clone()).map_err(|_| NdefError::InvalidText)
    }

    /// Network credential of a Wi-Fi Simple Configuration record
    pub fn wifi_credential(&self) -> Result<WifiCredential> {
        if self.kind() != RecordKind::WifiSimpleConfig {
            return Err(NdefError::UnexpectedType("Wi-Fi"));
        }
        let mut credential = WifiCredential {
            ssid: String::new(),
            authentication: 0,
            encryption: 0,
            network_key: String::new(),
        };
        collect_wsc(&self.payload, &mut credential, 0)?;
        Ok(credential)
    }

    /// Pairing data of a Bluetooth BR/EDR or LE OOB record
    pub fn bluetooth_oob(&self) -> Result<BluetoothOob> {
        match self.kind() {
            RecordKind::BluetoothEp => {
                // OOB data length (2, LE), address (6, LE), EIR structures
                let addr = self
                    .payload
                    .get(2..8)
                    .ok_or(NdefError::Truncated("Bluetooth address"))?;
                let eir = &self.payload[8..];
                Ok(BluetoothOob {
                    address: reversed_address(addr),
                    name: eir_name(eir),
                })
            }
            RecordKind::BluetoothLe => {
                let addr = eir_find(&self.payload, AD_LE_DEVICE_ADDRESS)
                    .and_then(|data| data.get(..6))
                    .ok_or(NdefError::Truncated("LE device address"))?;
                Ok(BluetoothOob {
                    address: reversed_address(addr),
                    name: eir_name(&self.payload),
                })
            }
            _ => Err(NdefError::UnexpectedType("Bluetooth")),
        }
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize, what: &'static str) -> Result<&'a [u8]> {
    let field = bytes
        .get(*pos..*pos + len)
        .ok_or(NdefError::Truncated(what))?;
    *pos += len;
    Ok(field)
}

/// Credential containers are only expected at the top level of the payload
const MAX_WSC_DEPTH: usize = 2;

/// Walk WSC attributes (type u16, length u16, value), descending into the
/// credential container
fn collect_wsc(mut data: &[u8], credential: &mut WifiCredential, depth: usize) -> Result<()> {
    while data.len() >= 4 {
        let id = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let value = data
            .get(4..4 + len)
            .ok_or(NdefError::Truncated("Wi-Fi attribute"))?;
        match id {
            wsc::CREDENTIAL if depth + 1 >= MAX_WSC_DEPTH => return Err(NdefError::NestingTooDeep),
            wsc::CREDENTIAL => collect_wsc(value, credential, depth + 1)?,
            wsc::SSID => credential.ssid = String::from_utf8_lossy(value).into_owned(),
            wsc::NETWORK_KEY => credential.network_key = String::from_utf8_lossy(value).into_owned(),
            wsc::AUTH_TYPE if len == 2 => {
                credential.authentication = u16::from_be_bytes([value[0], value[1]])
            }
            wsc::ENCRYPTION_TYPE if len == 2 => {
                credential.encryption = u16::from_be_bytes([value[0], value[1]])
            }
            _ => {}
        }
        data = &data[4 + len..];
    }
    Ok(())
}

/// Data of the first EIR/AD structure of type `wanted`
fn eir_find(mut data: &[u8], wanted: u8) -> Option<&[u8]> {
    while let Some((&len, rest)) = data.split_first() {
        let len = len as usize;
        if len == 0 {
            return None;
        }
        let structure = rest.get(..len)?;
        if structure[0] == wanted {
            return Some(&structure[1..]);
        }
        data = &rest[len..];
    }
    None
}

fn eir_name(data: &[u8]) -> Option<String> {
    eir_find(data, EIR_COMPLETE_NAME)
        .or_else(|| eir_find(data, EIR_SHORT_NAME))
        .map(|name| String::from_utf8_lossy(name).into_owned())
}

fn reversed_address(addr: &[u8]) -> [u8; 6] {
    let mut out = [0u8; 6];
    for (i, byte) in addr.iter().take(6).enumerate() {
        out[5 - i] = *byte;
    }
    out
}
