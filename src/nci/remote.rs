//! Remote endpoint descriptors
//!
//! Built from RF_INTF_ACTIVATED_NTF and RF_DISCOVER_NTF payloads. A
//! [`RemoteDevice`] is created whole from one notification and never patched
//! afterwards; a new activation replaces it.

use crate::error::{NciError, Result};

/// RF protocol reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Undetermined,
    T1t,
    T2t,
    T3t,
    IsoDep,
    NfcDep,
    Iso15693,
    Mifare,
    Other(u8),
}

impl Protocol {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Protocol::Undetermined,
            0x01 => Protocol::T1t,
            0x02 => Protocol::T2t,
            0x03 => Protocol::T3t,
            0x04 => Protocol::IsoDep,
            0x05 => Protocol::NfcDep,
            0x06 => Protocol::Iso15693,
            0x80 => Protocol::Mifare,
            other => Protocol::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Protocol::Undetermined => 0x00,
            Protocol::T1t => 0x01,
            Protocol::T2t => 0x02,
            Protocol::T3t => 0x03,
            Protocol::IsoDep => 0x04,
            Protocol::NfcDep => 0x05,
            Protocol::Iso15693 => 0x06,
            Protocol::Mifare => 0x80,
            Protocol::Other(byte) => byte,
        }
    }
}

/// RF interface used to exchange data with the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Undetermined,
    Frame,
    IsoDep,
    NfcDep,
    TagCmd,
    Other(u8),
}

impl Interface {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Interface::Undetermined,
            0x01 => Interface::Frame,
            0x02 => Interface::IsoDep,
            0x03 => Interface::NfcDep,
            0x80 => Interface::TagCmd,
            other => Interface::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Interface::Undetermined => 0x00,
            Interface::Frame => 0x01,
            Interface::IsoDep => 0x02,
            Interface::NfcDep => 0x03,
            Interface::TagCmd => 0x80,
            Interface::Other(byte) => byte,
        }
    }

    /// Interface requested when selecting an endpoint speaking `protocol`
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::IsoDep => Interface::IsoDep,
            Protocol::NfcDep => Interface::NfcDep,
            Protocol::Mifare => Interface::TagCmd,
            _ => Interface::Frame,
        }
    }
}

/// RF technology, without the poll/listen bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technology {
    NfcAPassive,
    NfcBPassive,
    NfcFPassive,
    NfcAActive,
    NfcFActive,
    Iso15693Passive,
    Other(u8),
}

impl Technology {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0x00 => Technology::NfcAPassive,
            0x01 => Technology::NfcBPassive,
            0x02 => Technology::NfcFPassive,
            0x03 => Technology::NfcAActive,
            0x05 => Technology::NfcFActive,
            0x06 => Technology::Iso15693Passive,
            other => Technology::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Technology::NfcAPassive => 0x00,
            Technology::NfcBPassive => 0x01,
            Technology::NfcFPassive => 0x02,
            Technology::NfcAActive => 0x03,
            Technology::NfcFActive => 0x05,
            Technology::Iso15693Passive => 0x06,
            Technology::Other(bits) => bits,
        }
    }
}

/// Combined RF mode and technology byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeTech(pub u8);

impl ModeTech {
    pub const LISTEN: u8 = 0x80;

    pub fn poll(technology: Technology) -> Self {
        ModeTech(technology.bits())
    }

    pub fn listen(technology: Technology) -> Self {
        ModeTech(Self::LISTEN | technology.bits())
    }

    pub fn is_listen(&self) -> bool {
        self.0 & Self::LISTEN == Self::LISTEN
    }

    pub fn technology(&self) -> Technology {
        Technology::from_bits(self.0 & !Self::LISTEN)
    }
}

/// Technology specific parameters of a polled endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TechParams {
    NfcA {
        sens_res: [u8; 2],
        nfcid1: Vec<u8>,
        sel_res: Option<u8>,
    },
    NfcB {
        sensb_res: Vec<u8>,
    },
    NfcF {
        bit_rate: u8,
        sensf_res: Vec<u8>,
    },
    Iso15693 {
        flags: u8,
        dsfid: u8,
        /// Most significant byte first, i.e. reversed from the air order
        uid: [u8; 8],
    },
    Raw(Vec<u8>),
}

impl TechParams {
    /// Decode technology parameters; unknown layouts are kept raw
    pub fn parse(mode_tech: ModeTech, params: &[u8]) -> Result<Self> {
        if mode_tech.is_listen() {
            return Ok(TechParams::Raw(params.to_vec()));
        }
        match mode_tech.technology() {
            Technology::NfcAPassive | Technology::NfcAActive => {
                let sens_res = params
                    .get(0..2)
                    .ok_or(NciError::Truncated("NFC-A SENS_RES"))?;
                let id_len = *params.get(2).ok_or(NciError::Truncated("NFC-A NFCID1 length"))? as usize;
                let nfcid1 = params
                    .get(3..3 + id_len)
                    .ok_or(NciError::Truncated("NFC-A NFCID1"))?;
                let sel_res = match params.get(3 + id_len) {
                    Some(1) => params.get(4 + id_len).copied(),
                    _ => None,
                };
                Ok(TechParams::NfcA {
                    sens_res: [sens_res[0], sens_res[1]],
                    nfcid1: nfcid1.to_vec(),
                    sel_res,
                })
            }
            Technology::NfcBPassive => {
                let len = *params.first().ok_or(NciError::Truncated("NFC-B SENSB_RES length"))? as usize;
                let sensb_res = params
                    .get(1..1 + len)
                    .ok_or(NciError::Truncated("NFC-B SENSB_RES"))?;
                Ok(TechParams::NfcB {
                    sensb_res: sensb_res.to_vec(),
                })
            }
            Technology::NfcFPassive | Technology::NfcFActive => {
                let bit_rate = *params.first().ok_or(NciError::Truncated("NFC-F bit rate"))?;
                let len = *params.get(1).ok_or(NciError::Truncated("NFC-F SENSF_RES length"))? as usize;
                let sensf_res = params
                    .get(2..2 + len)
                    .ok_or(NciError::Truncated("NFC-F SENSF_RES"))?;
                Ok(TechParams::NfcF {
                    bit_rate,
                    sensf_res: sensf_res.to_vec(),
                })
            }
            Technology::Iso15693Passive => {
                let fields = params
                    .get(0..10)
                    .ok_or(NciError::Truncated("ISO-15693 parameters"))?;
                let mut uid = [0u8; 8];
                for (i, byte) in fields[2..10].iter().enumerate() {
                    uid[7 - i] = *byte;
                }
                Ok(TechParams::Iso15693 {
                    flags: fields[0],
                    dsfid: fields[1],
                    uid,
                })
            }
            Technology::Other(_) => Ok(TechParams::Raw(params.to_vec())),
        }
    }

    /// The endpoint identifier (NFCID1, NFCID0, NFCID2 or UID)
    pub fn identifier(&self) -> &[u8] {
        match self {
            TechParams::NfcA { nfcid1, .. } => nfcid1,
            TechParams::NfcB { sensb_res } => sensb_res.get(0..4).unwrap_or(sensb_res),
            TechParams::NfcF { sensf_res, .. } => sensf_res.get(0..8).unwrap_or(sensf_res),
            TechParams::Iso15693 { uid, .. } => uid,
            TechParams::Raw(_) => &[],
        }
    }
}

/// An endpoint announced by RF_DISCOVER_NTF while several are in the field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryCandidate {
    pub rf_discovery_id: u8,
    pub protocol: Protocol,
    pub mode_tech: ModeTech,
    pub tech_params: TechParams,
}

impl DiscoveryCandidate {
    /// Parse an RF_DISCOVER_NTF frame; also returns its notification type byte
    pub fn from_notification(frame: &[u8]) -> Result<(Self, u8)> {
        let fixed = frame.get(3..7).ok_or(NciError::Truncated("RF_DISCOVER_NTF"))?;
        let params_len = fixed[3] as usize;
        let params = frame
            .get(7..7 + params_len)
            .ok_or(NciError::Truncated("RF_DISCOVER_NTF parameters"))?;
        let notification = *frame
            .get(7 + params_len)
            .ok_or(NciError::Truncated("RF_DISCOVER_NTF notification type"))?;
        let mode_tech = ModeTech(fixed[2]);
        let candidate = Self {
            rf_discovery_id: fixed[0],
            protocol: Protocol::from_byte(fixed[1]),
            mode_tech,
            tech_params: TechParams::parse(mode_tech, params)?,
        };
        Ok((candidate, notification))
    }
}

/// The currently activated remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub rf_discovery_id: u8,
    pub interface: Interface,
    pub protocol: Protocol,
    pub mode_tech: ModeTech,
    pub max_payload_size: u8,
    pub initial_credits: u8,
    pub tech_params: TechParams,
    /// Raw activation parameters (RATS/ATTRIB/ATR_RES answers)
    pub activation_params: Vec<u8>,
    /// Whether other endpoints were reported during discovery
    pub more_tags: bool,
}

impl RemoteDevice {
    /// Parse an RF_INTF_ACTIVATED_NTF frame
    pub fn from_activation(frame: &[u8]) -> Result<Self> {
        let fixed = frame
            .get(3..10)
            .ok_or(NciError::Truncated("RF_INTF_ACTIVATED_NTF"))?;
        let params_len = fixed[6] as usize;
        let params = frame
            .get(10..10 + params_len)
            .ok_or(NciError::Truncated("RF_INTF_ACTIVATED_NTF parameters"))?;
        let mode_tech = ModeTech(fixed[3]);
        let interface = Interface::from_byte(fixed[1]);
        let mut protocol = Protocol::from_byte(fixed[2]);
        if interface == Interface::Undetermined {
            protocol = Protocol::Undetermined;
        }

        // data exchange mode, tx rate, rx rate, then activation parameters
        let activation_params = frame
            .get(13 + params_len)
            .and_then(|&len| frame.get(14 + params_len..14 + params_len + len as usize))
            .map(|p| p.to_vec())
            .unwrap_or_default();

        Ok(Self {
            rf_discovery_id: fixed[0],
            interface,
            protocol,
            mode_tech,
            max_payload_size: fixed[4],
            initial_credits: fixed[5],
            tech_params: TechParams::parse(mode_tech, params)?,
            activation_params,
            more_tags: false,
        })
    }

    pub fn identifier(&self) -> &[u8] {
        self.tech_params.identifier()
    }

    pub fn technology(&self) -> Technology {
        self.mode_tech.technology()
    }

    /// Whether a remote reader activated us (card emulation / P2P target)
    pub fn is_remote_reader(&self) -> bool {
        self.mode_tech.is_listen()
    }

    /// ATS or ATTRIB answer carried in the activation parameters
    pub fn activation_response(&self) -> Option<&[u8]> {
        let len = *self.activation_params.first()? as usize;
        self.activation_params.get(1..1 + len)
    }
}
