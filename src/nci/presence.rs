//! Presence checks for the activated tag
//!
//! Each protocol has its own check: a cheap read, a poll command or a
//! proprietary controller check. [`PresenceCheck`] spaces checks out so it
//! can be polled from a loop that also does other work.

use log::{debug, info};

use super::controller::Controller;
use super::frame::{gid, hexify, oid, Header, MessageType, STATUS_OK};
use super::remote::{Interface, Protocol, TechParams};
use super::state::{DeactivationType, NciState};
use crate::error::{NciError, Result};
use crate::transport::{Clock, Transport};

const T1T_READ_ID: &[u8] = &[0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
const T2T_READ_PAGE0: &[u8] = &[0x30, 0x00];
/// T3T polling: wildcard system code, no request code, one time slot
const T3T_POLL: &[u8] = &[0xFF, 0xFF, 0x00, 0x01];
/// ISO 15693 inventory: high data rate, one slot, 64-bit mask
const ISO15693_INVENTORY: &[u8] = &[0x26, 0x01, 0x40];

/// Result of one [`PresenceCheck::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Next check not due yet
    Pending,
    Present,
    Removed,
}

/// Periodic presence probing of the activated tag
#[derive(Debug, Clone)]
pub struct PresenceCheck {
    interval_ms: u64,
    next_due_ms: Option<u64>,
}

impl PresenceCheck {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            next_due_ms: None,
        }
    }

    /// Check the tag if the interval has elapsed since the last check
    pub fn poll<T: Transport, C: Clock>(&mut self, ctrl: &mut Controller<T, C>) -> Result<Presence> {
        let now = ctrl.codec.clock().now_ms();
        let due = *self
            .next_due_ms
            .get_or_insert(now.saturating_add(self.interval_ms));
        if now < due {
            return Ok(Presence::Pending);
        }

        let present = ctrl.check_presence()?;
        self.next_due_ms = Some(ctrl.codec.clock().now_ms().saturating_add(self.interval_ms));
        Ok(if present {
            Presence::Present
        } else {
            Presence::Removed
        })
    }
}

impl<T: Transport, C: Clock> Controller<T, C> {
    /// Check the activated tag once
    pub fn check_presence(&mut self) -> Result<bool> {
        if self.state() != NciState::PollActive {
            return Err(NciError::InvalidState(self.state()));
        }
        let (protocol, id, uid) = match self.remote() {
            Some(remote) => {
                let uid = match &remote.tech_params {
                    TechParams::Iso15693 { uid, .. } => Some(*uid),
                    _ => None,
                };
                (remote.protocol, remote.rf_discovery_id, uid)
            }
            None => return Err(NciError::InvalidState(self.state())),
        };

        let present = match protocol {
            Protocol::T1t => self.check_data(T1T_READ_ID, |rx| rx.starts_with(&[0x00, 0x00]))?,
            Protocol::T2t => self.check_data(T2T_READ_PAGE0, |rx| rx.starts_with(&[0x00, 0x00, 0x11]))?,
            Protocol::T3t => self.check_t3t()?,
            Protocol::IsoDep => self.check_iso_dep()?,
            Protocol::Iso15693 => match uid {
                Some(uid) => self.check_iso15693(&uid)?,
                None => false,
            },
            Protocol::Mifare => self.check_mifare(id)?,
            other => {
                debug!("No presence check for {:?}", other);
                false
            }
        };
        if !present {
            info!("Tag {:?} removed", protocol);
        }
        Ok(present)
    }

    /// Block until the activated tag leaves the field
    pub fn wait_for_removal(&mut self) -> Result<()> {
        let mut check = PresenceCheck::new(self.config.presence_interval_ms);
        loop {
            if check.poll(self)? == Presence::Removed {
                return Ok(());
            }
            self.codec.clock().sleep_ms(1);
        }
    }

    fn check_data<F>(&mut self, command: &[u8], present: F) -> Result<bool>
    where
        F: Fn(&[u8]) -> bool,
    {
        self.codec.send_data(command)?;
        let timeout_ms = self.config.presence_timeout_ms;
        Ok(self.codec.await_data_answer(timeout_ms) > 0 && present(self.codec.received()))
    }

    fn check_t3t(&mut self) -> Result<bool> {
        self.codec.send_command(gid::RF, oid::rf::T3T_POLLING, T3T_POLL)?;
        let timeout_ms = self.config.presence_timeout_ms;
        let n = self.codec.await_skipping(timeout_ms, |h| {
            h.is(MessageType::Response, gid::RF, oid::rf::T3T_POLLING)
        });
        Ok(n > 0
            && self.codec.is_message(MessageType::Notification, gid::RF, oid::rf::T3T_POLLING)
            && (self.codec.byte(3) == Some(0x00) || self.codec.byte(4).map_or(false, |b| b > 0)))
    }

    fn check_iso_dep(&mut self) -> Result<bool> {
        self.codec
            .send_command(gid::PROPRIETARY, oid::proprietary::ISO_DEP_PRESENCE_CHECK, &[])?;
        let timeout_ms = self.config.presence_timeout_ms;
        let n = self.codec.await_skipping(timeout_ms, |h| {
            h.is(MessageType::Response, gid::PROPRIETARY, oid::proprietary::ISO_DEP_PRESENCE_CHECK)
        });
        Ok(n > 0 && self.codec.received() == [0x6F, 0x11, 0x01, 0x01])
    }

    fn check_iso15693(&mut self, uid: &[u8; 8]) -> Result<bool> {
        let mut command = ISO15693_INVENTORY.to_vec();
        // uid is kept most significant byte first; the mask goes out LSB first
        command.extend(uid.iter().rev());
        self.check_data(&command, |rx| {
            rx.starts_with(&[0x00, 0x00]) && rx.last() == Some(&0x00)
        })
    }

    /// MIFARE Classic has no cheap check: sleep and reselect the tag
    fn check_mifare(&mut self, rf_discovery_id: u8) -> Result<bool> {
        let timeout_ms = self.config.presence_timeout_ms;
        self.codec
            .send_command(gid::RF, oid::rf::DEACTIVATE, &[DeactivationType::Sleep as u8])?;
        let asleep = self.await_deactivate(timeout_ms, MessageType::Response)
            && self.codec.status() == Some(STATUS_OK)
            && self.await_deactivate(timeout_ms, MessageType::Notification);
        if !asleep {
            debug!("MIFARE sleep not confirmed: {}", hexify(self.codec.received()));
            return Ok(false);
        }

        let protocol = Protocol::Mifare.to_byte();
        self.codec.send_command(
            gid::RF,
            oid::rf::DISCOVER_SELECT,
            &[rf_discovery_id, protocol, Interface::TagCmd.to_byte()],
        )?;
        let n = self.codec.await_skipping(timeout_ms, |h| {
            h.is(MessageType::Response, gid::RF, oid::rf::DISCOVER_SELECT) || h.is_credit_notification()
        });
        if n == 0 {
            return Ok(false);
        }
        let rx = self.codec.received();
        let start = rx.iter().position(|&b| b != 0xFF).unwrap_or(rx.len());
        let frame = &rx[start..];
        if frame.len() < 2 {
            return Ok(false);
        }
        Ok(Header::classify(frame)
            .map_or(false, |h| h.is(MessageType::Notification, gid::RF, oid::rf::INTF_ACTIVATED)))
    }

    /// Next non-credit frame is an RF_DEACTIVATE of `message_type`
    fn await_deactivate(&mut self, timeout_ms: u64, message_type: MessageType) -> bool {
        self.codec.await_skipping(timeout_ms, Header::is_credit_notification) > 0
            && self.codec.is_message(message_type, gid::RF, oid::rf::DEACTIVATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NciConfig;
    use crate::transport::mock::{ManualClock, MockTransport};

    fn activation(protocol: u8, interface: u8) -> Vec<u8> {
        vec![
            0x61, 0x05, 0x14, 0x01, interface, protocol, 0x00, 0xFF, 0x01, 0x09, 0x44, 0x00,
            0x04, 0x11, 0x22, 0x33, 0x44, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]
    }

    fn active(frame: &[u8]) -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let transport = MockTransport::new();
        let clock = ManualClock::new();
        let mut ctrl = Controller::new(transport.clone(), clock.clone(), NciConfig::default());
        transport.push(&[0x40, 0x00, 0x03, 0x00, 0x10, 0x01]);
        transport.push(&[0x40, 0x01, 0x01, 0x00]);
        transport.push(&[0x4F, 0x02, 0x01, 0x00]);
        ctrl.bring_up().unwrap();
        ctrl.start_discovery().unwrap();
        transport.push(&[0x41, 0x03, 0x01, 0x00]);
        transport.push(frame);
        ctrl.wait_for_tag(100).unwrap();
        transport.clear_written();
        (ctrl, transport, clock)
    }

    #[test]
    fn test_t2t_present_then_removed() {
        let (mut ctrl, transport, _clock) = active(&activation(0x02, 0x01));
        let mut answer = vec![0x00, 0x00, 0x11];
        answer.extend_from_slice(&[0u8; 17]);
        transport.push(&[0x60, 0x06, 0x03, 0x01, 0x00, 0x01]);
        transport.push(&answer);
        assert!(ctrl.check_presence().unwrap());
        assert_eq!(transport.last_written(), Some(vec![0x00, 0x00, 0x02, 0x30, 0x00]));

        assert!(!ctrl.check_presence().unwrap());
    }

    #[test]
    fn test_t1t_presence() {
        let (mut ctrl, transport, _clock) = active(&activation(0x01, 0x01));
        transport.push(&[0x00, 0x00, 0x03, 0x11, 0x48, 0x00]);
        assert!(ctrl.check_presence().unwrap());
        assert_eq!(
            transport.last_written(),
            Some(vec![0x00, 0x00, 0x07, 0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
        );
    }

    #[test]
    fn test_t3t_presence() {
        let (mut ctrl, transport, _clock) = active(&activation(0x03, 0x01));
        transport.push(&[0x41, 0x08, 0x01, 0x00]);
        transport.push(&[0x61, 0x08, 0x02, 0x00, 0x01]);
        assert!(ctrl.check_presence().unwrap());
        assert_eq!(
            transport.last_written(),
            Some(vec![0x21, 0x08, 0x04, 0xFF, 0xFF, 0x00, 0x01])
        );

        transport.push(&[0x41, 0x08, 0x01, 0x00]);
        transport.push(&[0x61, 0x08, 0x02, 0xB2, 0x00]);
        assert!(!ctrl.check_presence().unwrap());
    }

    #[test]
    fn test_iso_dep_presence() {
        let (mut ctrl, transport, _clock) = active(&activation(0x04, 0x02));
        transport.push(&[0x4F, 0x11, 0x01, 0x00]);
        transport.push(&[0x6F, 0x11, 0x01, 0x01]);
        assert!(ctrl.check_presence().unwrap());
        assert_eq!(transport.last_written(), Some(vec![0x2F, 0x11, 0x00]));

        transport.push(&[0x4F, 0x11, 0x01, 0x00]);
        transport.push(&[0x6F, 0x11, 0x01, 0x00]);
        assert!(!ctrl.check_presence().unwrap());
    }

    #[test]
    fn test_iso15693_check_sends_uid_in_air_order() {
        let mut frame = vec![0x61, 0x05, 0x15, 0x01, 0x01, 0x06, 0x06, 0xFF, 0x01, 0x0A, 0x00, 0x00];
        frame.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xE0]);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let (mut ctrl, transport, _clock) = active(&frame);

        transport.push(&[0x00, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xE0, 0x00]);
        assert!(ctrl.check_presence().unwrap());
        assert_eq!(
            transport.last_written(),
            Some(vec![
                0x00, 0x00, 0x0B, 0x26, 0x01, 0x40, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xE0
            ])
        );

        transport.push(&[0x00, 0x00, 0x02, 0x00, 0x01]);
        assert!(!ctrl.check_presence().unwrap());
    }

    #[test]
    fn test_mifare_check_reselects() {
        let (mut ctrl, transport, _clock) = active(&activation(0x80, 0x80));
        transport.push(&[0x41, 0x06, 0x01, 0x00]);
        transport.push(&[0x61, 0x06, 0x02, 0x01, 0x00]);
        transport.push(&[0x41, 0x04, 0x01, 0x00]);
        transport.push(&activation(0x80, 0x80));
        assert!(ctrl.check_presence().unwrap());

        let written = transport.written();
        assert_eq!(written[0], vec![0x21, 0x06, 0x01, 0x01]);
        assert_eq!(written[1], vec![0x21, 0x04, 0x03, 0x01, 0x80, 0x80]);
    }

    #[test]
    fn test_mifare_removed_without_activation() {
        let (mut ctrl, transport, _clock) = active(&activation(0x80, 0x80));
        transport.push(&[0x41, 0x06, 0x01, 0x00]);
        transport.push(&[0x61, 0x06, 0x02, 0x01, 0x00]);
        transport.push(&[0x41, 0x04, 0x01, 0x00]);
        assert!(!ctrl.check_presence().unwrap());
    }

    #[test]
    fn test_mifare_missing_deactivate_notification_is_removed() {
        let (mut ctrl, transport, _clock) = active(&activation(0x80, 0x80));
        transport.push(&[0x41, 0x06, 0x01, 0x00]);
        assert!(!ctrl.check_presence().unwrap());
        // no reselect once the sleep was not confirmed
        assert_eq!(transport.written(), vec![vec![0x21, 0x06, 0x01, 0x01]]);
    }

    #[test]
    fn test_mifare_rejected_deactivate_is_removed() {
        let (mut ctrl, transport, _clock) = active(&activation(0x80, 0x80));
        transport.push(&[0x41, 0x06, 0x01, 0x06]);
        transport.push(&[0x61, 0x06, 0x02, 0x01, 0x00]);
        assert!(!ctrl.check_presence().unwrap());
        assert_eq!(transport.written().len(), 1);
    }

    #[test]
    fn test_unsupported_protocol_is_removed() {
        let (mut ctrl, transport, _clock) = active(&activation(0x05, 0x03));
        assert!(!ctrl.check_presence().unwrap());
        assert!(transport.written().is_empty());
    }

    #[test]
    fn test_presence_check_interval() {
        let (mut ctrl, transport, clock) = active(&activation(0x04, 0x02));
        let mut check = PresenceCheck::new(500);
        assert_eq!(check.poll(&mut ctrl).unwrap(), Presence::Pending);
        clock.advance(499);
        assert_eq!(check.poll(&mut ctrl).unwrap(), Presence::Pending);
        assert!(transport.written().is_empty());

        clock.advance(1);
        transport.push(&[0x4F, 0x11, 0x01, 0x00]);
        transport.push(&[0x6F, 0x11, 0x01, 0x01]);
        assert_eq!(check.poll(&mut ctrl).unwrap(), Presence::Present);
        assert_eq!(check.poll(&mut ctrl).unwrap(), Presence::Pending);
    }

    #[test]
    fn test_wait_for_removal() {
        let (mut ctrl, transport, _clock) = active(&activation(0x04, 0x02));
        transport.push(&[0x4F, 0x11, 0x01, 0x00]);
        transport.push(&[0x6F, 0x11, 0x01, 0x01]);
        ctrl.wait_for_removal().unwrap();
        assert_eq!(transport.written().len(), 2);
    }

    #[test]
    fn test_presence_requires_active_tag() {
        let transport = MockTransport::new();
        let mut ctrl = Controller::new(transport, ManualClock::new(), NciConfig::default());
        assert!(matches!(
            ctrl.check_presence(),
            Err(NciError::InvalidState(NciState::HwReset))
        ));
    }
}
