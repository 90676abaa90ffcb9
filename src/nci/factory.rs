//! Proprietary RF test modes used during board bring-up and certification

use log::info;

use super::controller::Controller;
use super::frame::{gid, oid, MessageType};
use super::state::NciState;
use crate::error::{NciError, Result};
use crate::transport::{Clock, Transport};

/// RF technology of a PRBS test signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestTechnology {
    NfcA = 0x00,
    NfcB = 0x01,
    NfcF = 0x02,
}

/// Bit rate of a PRBS test signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBitrate {
    Kbps106 = 0x00,
    Kbps212 = 0x01,
    Kbps424 = 0x02,
    Kbps848 = 0x03,
}

/// TEST_PRBS payload for a controller generation
fn prbs_payload(generation: u8, technology: TestTechnology, bitrate: TestBitrate) -> Option<Vec<u8>> {
    match generation {
        1 => Some(vec![technology as u8, bitrate as u8, 0x01, 0x01]),
        2 => Some(vec![0x00, 0x00, technology as u8, bitrate as u8, 0x01, 0x01]),
        _ => None,
    }
}

impl<T: Transport, C: Clock> Controller<T, C> {
    /// Emit a pseudo-random bit sequence until the controller is reset
    ///
    /// The payload layout depends on the controller generation, so this is
    /// only available once bring-up has read a known firmware version.
    pub fn factory_test_prbs(&mut self, technology: TestTechnology, bitrate: TestBitrate) -> Result<()> {
        self.require_idle()?;
        let payload = self
            .generation()
            .and_then(|generation| prbs_payload(generation, technology, bitrate))
            .ok_or(NciError::UnsupportedGeneration("TEST_PRBS"))?;
        self.proprietary_test("TEST_PRBS", oid::proprietary::TEST_PRBS, &payload)?;
        info!("PRBS test signal on ({:?}, {:?})", technology, bitrate);
        Ok(())
    }

    /// Switch the RF field on permanently until the controller is reset
    pub fn factory_test_rf_on(&mut self) -> Result<()> {
        self.require_idle()?;
        self.proprietary_test("TEST_RF_ON", oid::proprietary::TEST_RF_ON, &[0x20, 0x01])?;
        info!("RF field forced on");
        Ok(())
    }

    fn require_idle(&self) -> Result<()> {
        match self.state() {
            NciState::Idle => Ok(()),
            other => Err(NciError::InvalidState(other)),
        }
    }

    fn proprietary_test(&mut self, name: &'static str, opcode: u8, payload: &[u8]) -> Result<()> {
        self.codec.send_command(gid::PROPRIETARY, opcode, payload)?;
        self.expect_ok(MessageType::Response, gid::PROPRIETARY, opcode, name)
    }
}
