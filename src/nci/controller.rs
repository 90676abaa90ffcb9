//! NCI session state machine
//!
//! [`Controller::step`] advances bring-up, discovery and deactivation one
//! frame at a time without blocking, so it can be driven from an event loop.
//! Transactions the host starts on an activated endpoint (selection, tag
//! commands, card emulation exchanges) are blocking and bounded by the
//! timeouts in [`NciConfig`].

use log::{debug, error, info, warn};

use super::frame::{gid, hexify, oid, FrameCodec, Header, MessageType, STATUS_OK, WAIT_FOREVER};
use super::remote::{DiscoveryCandidate, Interface, Protocol, RemoteDevice};
use super::state::{Deadline, DeactivationType, DiscoverNotification, NciState};
use crate::config::{ChipModel, Mode, NciConfig};
use crate::error::{NciError, Result};
use crate::t4t::T4tEmulator;
use crate::transport::{Clock, Transport};

// CORE_RESET_CMD reset types
const RESET_KEEP_CONFIG: u8 = 0x00;
const RESET_CLEAR_CONFIG: u8 = 0x01;
/// NCI 1.0 CORE_RESET_RSP is exactly header + status + version + config status
const RESET_RSP_LEN: usize = 6;
/// NCI 2.0 moves version and config status into CORE_RESET_NTF
const RESET_RSP_LEN_NCI2: usize = 4;
/// NCI 2.0 CORE_INIT_CMD: no proprietary feature bits
const INIT_NCI2: &[u8] = &[0x00, 0x00];
/// RF_DISCOVER_RSP is exactly header + status
const DISCOVER_RSP_LEN: usize = 4;
/// Discovery frequency byte paired with each technology
const DISCOVERY_EVERY_PERIOD: u8 = 0x01;
/// How long a peer gets to reappear after rediscovery
const PEER_RECHECK_TIMEOUT_MS: u64 = 1000;

// RF_DISCOVER_MAP_CMD mappings: protocol, mode (1 poll, 2 listen, 3 both), interface
const MAP_READER_WRITER: &[u8] = &[
    0x05, 0x01, 0x01, 0x01, 0x02, 0x01, 0x01, 0x03, 0x01, 0x01, 0x04, 0x01, 0x02, 0x80, 0x01,
    0x80,
];
const MAP_CARD_EMULATION: &[u8] = &[0x01, 0x04, 0x02, 0x02];
const MAP_PEER_TO_PEER: &[u8] = &[0x01, 0x05, 0x03, 0x03];

// RF_SET_LISTEN_MODE_ROUTING_CMD: one protocol based entry routed to the host
const ROUTING_CARD_EMULATION: &[u8] = &[0x00, 0x01, 0x01, 0x03, 0x00, 0x01, 0x04];
const ROUTING_PEER_TO_PEER: &[u8] = &[0x00, 0x01, 0x01, 0x03, 0x00, 0x01, 0x05];

/// LA_SEL_INFO parameter id
const LA_SEL_INFO: u8 = 0x32;
const SEL_INFO_ISO_DEP: u8 = 0x20;
const SEL_INFO_NFC_DEP: u8 = 0x40;

// LLCP general bytes for poll (LN_ATR_REQ_GEN_BYTES) and listen (LN_ATR_RES_GEN_BYTES)
const LLCP_GENERAL_BYTES: &[u8] = &[
    0x02, 0x29, 0x0D, 0x46, 0x66, 0x6D, 0x01, 0x01, 0x11, 0x03, 0x02, 0x00, 0x01, 0x04, 0x01,
    0xFA, 0x61, 0x0D, 0x46, 0x66, 0x6D, 0x01, 0x01, 0x11, 0x03, 0x02, 0x00, 0x01, 0x04, 0x01,
    0xFA,
];

// Controller defaults applied by `configure_settings`, as CORE_SET_CONFIG payloads
/// TOTAL_DURATION of one discovery period
const TOTAL_DURATION_PN7150: &[u8] = &[0x01, 0x00, 0x02, 0x00, 0x01];
const TOTAL_DURATION_PN7160: &[u8] = &[0x01, 0x00, 0x02, 0xFE, 0x01];
/// Tag detector: disabled, threshold and fallback counter
const TAG_DETECTOR_PN7150: &[u8] = &[
    0x03, 0xA0, 0x40, 0x01, 0x00, 0xA0, 0x41, 0x01, 0x04, 0xA0, 0x43, 0x01, 0x00,
];
const TAG_DETECTOR_PN7160: &[u8] = &[0x01, 0xA0, 0x40, 0x01, 0x00];

impl ChipModel {
    fn reset_response_len(&self) -> usize {
        if self.is_nci2() {
            RESET_RSP_LEN_NCI2
        } else {
            RESET_RSP_LEN
        }
    }

    fn init_payload(&self) -> &'static [u8] {
        if self.is_nci2() {
            INIT_NCI2
        } else {
            &[]
        }
    }

    fn default_settings(&self) -> [&'static [u8]; 2] {
        match self {
            ChipModel::Pn7150 => [TOTAL_DURATION_PN7150, TAG_DETECTOR_PN7150],
            ChipModel::Pn7160 => [TOTAL_DURATION_PN7160, TAG_DETECTOR_PN7160],
        }
    }
}

/// Controller firmware, from the manufacturer information of CORE_INIT_RSP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub hardware: u8,
    pub rom_code: u8,
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    /// ROM code, major and minor packed as `0xRRMMmm`
    pub fn as_u32(&self) -> u32 {
        (self.rom_code as u32) << 16 | (self.major as u32) << 8 | self.minor as u32
    }

    /// Controller generation derived from the ROM code version
    pub fn generation(&self) -> Option<u8> {
        match self.rom_code {
            0x08 => Some(1),
            0x10 => Some(2),
            _ => None,
        }
    }
}

/// Capabilities reported in CORE_INIT_RSP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub features: [u8; 4],
    pub rf_interfaces: Vec<u8>,
    pub max_logical_connections: u8,
    pub max_routing_table_size: u16,
    pub max_control_payload: u8,
    pub manufacturer_id: u8,
    pub firmware: Option<FirmwareVersion>,
}

impl ControllerInfo {
    /// Parse a CORE_INIT_RSP frame; the manufacturer block is optional
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let features = frame.get(4..8)?;
        let n = *frame.get(8)? as usize;
        let rf_interfaces = frame.get(9..9 + n)?.to_vec();
        let fixed = frame.get(9 + n..16 + n)?;
        let firmware = frame.get(16 + n..20 + n).map(|m| FirmwareVersion {
            hardware: m[0],
            rom_code: m[1],
            major: m[2],
            minor: m[3],
        });
        Some(Self {
            features: [features[0], features[1], features[2], features[3]],
            rf_interfaces,
            max_logical_connections: fixed[0],
            max_routing_table_size: u16::from_le_bytes([fixed[1], fixed[2]]),
            max_control_payload: fixed[3],
            manufacturer_id: fixed[6],
            firmware,
        })
    }

    /// Parse an NCI 2.0 CORE_INIT_RSP; manufacturer details come from the
    /// reset notification instead
    pub fn parse_nci2(frame: &[u8]) -> Option<Self> {
        let features = frame.get(4..8)?;
        let fixed = frame.get(8..17)?;
        let n = fixed[8] as usize;
        let mut rf_interfaces = Vec::with_capacity(n);
        let mut offset = 17;
        for _ in 0..n {
            let interface = *frame.get(offset)?;
            let extensions = *frame.get(offset + 1)? as usize;
            rf_interfaces.push(interface);
            offset += 2 + extensions;
        }
        Some(Self {
            features: [features[0], features[1], features[2], features[3]],
            rf_interfaces,
            max_logical_connections: fixed[0],
            max_routing_table_size: u16::from_le_bytes([fixed[1], fixed[2]]),
            max_control_payload: fixed[3],
            manufacturer_id: 0,
            firmware: None,
        })
    }
}

/// NCI 2.0 CORE_RESET_NTF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetNotification {
    pub trigger: u8,
    pub nci_version: u8,
    pub manufacturer_id: u8,
    pub firmware: Option<FirmwareVersion>,
}

impl ResetNotification {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let fixed = frame.get(3..8)?;
        let info_len = fixed[4] as usize;
        let firmware = frame
            .get(8..8 + info_len)
            .filter(|info| info.len() >= 4)
            .map(|m| FirmwareVersion {
                hardware: m[0],
                rom_code: m[1],
                major: m[2],
                minor: m[3],
            });
        Some(Self {
            trigger: fixed[0],
            nci_version: fixed[2],
            manufacturer_id: fixed[3],
            firmware,
        })
    }
}

/// Outcome of a non-blocking card emulation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationEvent {
    /// Nothing to do yet
    Pending,
    /// A command was answered
    Exchanged,
    /// The remote reader went away; the session state has moved on
    Deactivated,
}

/// Drives one NFC controller through an NCI session
pub struct Controller<T, C> {
    pub(crate) codec: FrameCodec<T, C>,
    pub(crate) config: NciConfig,
    state: NciState,
    deadline: Deadline,
    remote: Option<RemoteDevice>,
    candidates: Vec<DiscoveryCandidate>,
    next_tag: Option<DiscoveryCandidate>,
    pending_deactivation: DeactivationType,
    nci_version: Option<u8>,
    info: Option<ControllerInfo>,
    reset_notification: Option<ResetNotification>,
    reset_attempt: u32,
    retry_pause: Option<Deadline>,
    last_error: Option<NciError>,
}

impl<T: Transport, C: Clock> Controller<T, C> {
    pub fn new(transport: T, clock: C, config: NciConfig) -> Self {
        Self {
            codec: FrameCodec::new(transport, clock),
            config,
            state: NciState::HwReset,
            deadline: Deadline::never(),
            remote: None,
            candidates: Vec::new(),
            next_tag: None,
            pending_deactivation: DeactivationType::Idle,
            nci_version: None,
            info: None,
            reset_notification: None,
            reset_attempt: 0,
            retry_pause: None,
            last_error: None,
        }
    }

    /// Restart the session from `HwReset`, forgetting everything learned
    pub fn initialize(&mut self) {
        self.state = NciState::HwReset;
        self.deadline = Deadline::never();
        self.remote = None;
        self.candidates.clear();
        self.next_tag = None;
        self.nci_version = None;
        self.info = None;
        self.reset_notification = None;
        self.reset_attempt = 0;
        self.retry_pause = None;
        self.last_error = None;
    }

    pub fn state(&self) -> NciState {
        self.state
    }

    pub fn config(&self) -> &NciConfig {
        &self.config
    }

    /// The activated endpoint, if any
    pub fn remote(&self) -> Option<&RemoteDevice> {
        self.remote.as_ref()
    }

    /// Endpoints reported by RF_DISCOVER_NTF in the current discovery
    pub fn candidates(&self) -> &[DiscoveryCandidate] {
        &self.candidates
    }

    /// The endpoint [`Controller::activate_next`] would switch to
    pub fn next_tag(&self) -> Option<&DiscoveryCandidate> {
        self.next_tag.as_ref()
    }

    pub fn nci_version(&self) -> Option<u8> {
        self.nci_version
    }

    pub fn controller_info(&self) -> Option<&ControllerInfo> {
        self.info.as_ref()
    }

    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.info.as_ref().and_then(|info| info.firmware)
    }

    /// CORE_RESET_NTF of the last NCI 2.0 bring-up
    pub fn reset_notification(&self) -> Option<&ResetNotification> {
        self.reset_notification.as_ref()
    }

    /// Controller generation, known for PN7150 class firmware only
    pub fn generation(&self) -> Option<u8> {
        match self.config.chip {
            ChipModel::Pn7150 => self.firmware_version().and_then(|fw| fw.generation()),
            ChipModel::Pn7160 => None,
        }
    }

    /// Why the state machine entered `Error`
    pub fn last_error(&self) -> Option<&NciError> {
        self.last_error.as_ref()
    }

    /// Advance the state machine by at most one message
    pub fn step(&mut self) -> NciState {
        match self.state {
            NciState::HwReset => {
                let now = self.codec.clock().now_ms();
                if self.retry_pause.map_or(true, |pause| pause.is_expired(now)) {
                    self.retry_pause = None;
                    self.issue(gid::CORE, oid::core::RESET, &[RESET_CLEAR_CONFIG], NciState::HwResetWait);
                }
            }
            NciState::HwResetWait => self.step_reset_wait(),
            NciState::SwReset => self.step_sw_reset(),
            NciState::SwResetWait => {
                if self.await_armed("CORE_INIT_RSP") {
                    if self.is_after_reset_notification() {
                        self.absorb_reset_notification();
                    } else if self.is_ok_response(gid::CORE, oid::core::INIT) {
                        self.record_init_response();
                        self.enter(NciState::EnableVendorExt);
                    } else {
                        self.fail_unexpected("CORE_INIT_RSP");
                    }
                }
            }
            NciState::EnableVendorExt => self.issue(
                gid::PROPRIETARY,
                oid::proprietary::ACT,
                &[],
                NciState::EnableVendorExtWait,
            ),
            NciState::EnableVendorExtWait => {
                if self.await_armed("proprietary ACT response") {
                    if self.is_ok_response(gid::PROPRIETARY, oid::proprietary::ACT) {
                        info!("NCI session ready");
                        self.enter(NciState::Idle);
                    } else {
                        self.fail_unexpected("proprietary ACT response");
                    }
                }
            }
            NciState::StartDiscoveryWait => {
                if self.await_armed("RF_DISCOVER_RSP") {
                    let ok = self.codec.received().len() == DISCOVER_RSP_LEN
                        && self.is_ok_response(gid::RF, oid::rf::DISCOVER);
                    if ok {
                        self.enter(NciState::Discovering);
                    } else {
                        self.fail_unexpected("RF_DISCOVER_RSP");
                    }
                }
            }
            NciState::Discovering => self.step_discovering(),
            NciState::WaitAllDiscoveries => {
                if self.await_armed("RF_DISCOVER_NTF") {
                    if self.codec.is_message(MessageType::Notification, gid::RF, oid::rf::DISCOVER) {
                        self.register_candidate();
                    } else {
                        self.fail_unexpected("RF_DISCOVER_NTF");
                    }
                }
            }
            NciState::Deactivate1Wait => {
                if self.await_armed("RF_DEACTIVATE_RSP") {
                    if self.is_ok_response(gid::RF, oid::rf::DEACTIVATE) {
                        self.finish_deactivation();
                    } else {
                        self.fail_unexpected("RF_DEACTIVATE_RSP");
                    }
                }
            }
            NciState::Deactivate2Wait => {
                if self.await_armed("RF_DEACTIVATE_RSP") {
                    if self.is_ok_response(gid::RF, oid::rf::DEACTIVATE) {
                        self.arm(self.config.deactivate_timeout_ms);
                        self.enter(NciState::Deactivate2NotifyWait);
                    } else {
                        self.fail_unexpected("RF_DEACTIVATE_RSP");
                    }
                }
            }
            NciState::Deactivate2NotifyWait => {
                if self.await_armed("RF_DEACTIVATE_NTF") {
                    if self.codec.is_message(MessageType::Notification, gid::RF, oid::rf::DEACTIVATE) {
                        self.finish_deactivation();
                    } else {
                        self.fail_unexpected("RF_DEACTIVATE_NTF");
                    }
                }
            }
            NciState::Idle | NciState::WaitHostSelect | NciState::PollActive | NciState::Error => {}
        }
        self.state
    }

    /// Step until `done` holds, the machine fails, or a waiting state stalls
    /// for longer than `limit_ms`
    fn drive<F>(&mut self, limit_ms: u64, done: F) -> NciState
    where
        F: Fn(NciState) -> bool,
    {
        let limit = Deadline::new(self.codec.clock().now_ms(), limit_ms);
        loop {
            let before = self.state;
            let after = self.step();
            if done(after) || after == NciState::Error {
                return after;
            }
            if after == before {
                if limit.is_expired(self.codec.clock().now_ms()) {
                    return after;
                }
                self.codec.clock().sleep_ms(1);
            }
        }
    }

    /// Run reset, init and vendor activation until the session is `Idle`
    pub fn bring_up(&mut self) -> Result<()> {
        self.initialize();
        match self.drive(WAIT_FOREVER, |s| s == NciState::Idle) {
            NciState::Idle => Ok(()),
            _ => Err(self.take_error()),
        }
    }

    /// Step until no response deadline is armed; fails if that ends in `Error`
    pub fn settle(&mut self) -> Result<NciState> {
        match self.drive(WAIT_FOREVER, |s| !s.is_waiting()) {
            NciState::Error => Err(self.take_error()),
            state => Ok(state),
        }
    }

    fn take_error(&mut self) -> NciError {
        self.last_error
            .take()
            .unwrap_or(NciError::InvalidState(NciState::Error))
    }

    // ========================================================================
    // Mode configuration
    // ========================================================================

    /// Program discovery map, listen routing and RF parameters for `mode`
    pub fn configure_mode(&mut self, mode: Mode) -> Result<()> {
        self.require(NciState::Idle)?;
        self.config.mode = mode;

        let map = match mode {
            Mode::ReaderWriter => MAP_READER_WRITER,
            Mode::CardEmulation => MAP_CARD_EMULATION,
            Mode::PeerToPeer => MAP_PEER_TO_PEER,
        };
        self.command("RF_DISCOVER_MAP_CMD", gid::RF, oid::rf::DISCOVER_MAP, map)?;

        let listen = match mode {
            Mode::ReaderWriter => None,
            Mode::CardEmulation => Some((ROUTING_CARD_EMULATION, SEL_INFO_ISO_DEP)),
            Mode::PeerToPeer => Some((ROUTING_PEER_TO_PEER, SEL_INFO_NFC_DEP)),
        };
        if let Some((routing, sel_info)) = listen {
            self.command(
                "RF_SET_LISTEN_MODE_ROUTING_CMD",
                gid::RF,
                oid::rf::SET_LISTEN_MODE_ROUTING,
                routing,
            )?;
            self.command(
                "CORE_SET_CONFIG_CMD",
                gid::CORE,
                oid::core::SET_CONFIG,
                &[0x01, LA_SEL_INFO, 0x01, sel_info],
            )?;
        }

        if mode == Mode::PeerToPeer {
            self.command(
                "CORE_SET_CONFIG_CMD",
                gid::CORE,
                oid::core::SET_CONFIG,
                LLCP_GENERAL_BYTES,
            )?;
        }

        info!("Controller configured for {:?}", mode);
        Ok(())
    }

    /// Apply the raw CORE_SET_CONFIG payloads listed in the configuration
    pub fn apply_core_settings(&mut self) -> Result<()> {
        self.require(NciState::Idle)?;
        let settings = self.config.core_settings.clone();
        for payload in &settings {
            self.command("CORE_SET_CONFIG_CMD", gid::CORE, oid::core::SET_CONFIG, payload)?;
        }
        Ok(())
    }

    /// Apply the chip defaults (discovery period, tag detector) and the
    /// configured payloads, then reset and re-init the controller so they
    /// take effect
    pub fn configure_settings(&mut self) -> Result<()> {
        self.require(NciState::Idle)?;
        for payload in self.config.chip.default_settings() {
            self.command("CORE_SET_CONFIG_CMD", gid::CORE, oid::core::SET_CONFIG, payload)?;
        }
        self.apply_core_settings()?;
        self.reinitialize().map_err(|e| self.park(e))?;
        info!("{:?} settings applied", self.config.chip);
        Ok(())
    }

    /// Blocking CORE_RESET (keeping the configuration) and CORE_INIT
    fn reinitialize(&mut self) -> Result<()> {
        self.codec
            .send_command(gid::CORE, oid::core::RESET, &[RESET_KEEP_CONFIG])?;
        self.expect_ok(MessageType::Response, gid::CORE, oid::core::RESET, "CORE_RESET_RSP")?;

        let init = self.config.chip.init_payload();
        self.codec.send_command(gid::CORE, oid::core::INIT, init)?;
        let timeout_ms = self.config.command_timeout_ms;
        let skip_notifications = |h: &Header| {
            h.is(MessageType::Notification, gid::CORE, oid::core::RESET)
                || h.is(MessageType::Notification, gid::CORE, oid::core::GENERIC_ERROR)
        };
        if self.codec.await_skipping(timeout_ms, skip_notifications) == 0 {
            return Err(NciError::Timeout {
                waiting_for: "CORE_INIT_RSP",
                timeout_ms,
            });
        }
        if !self.is_ok_response(gid::CORE, oid::core::INIT) {
            return Err(self.unexpected("CORE_INIT_RSP"));
        }
        Ok(())
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Send RF_DISCOVER_CMD; the response is consumed by [`Controller::step`]
    pub fn start_discovery(&mut self) -> Result<()> {
        self.require(NciState::Idle)?;
        let technologies = self.config.technologies();
        let mut payload = Vec::with_capacity(1 + technologies.len() * 2);
        payload.push(technologies.len() as u8);
        for tech in &technologies {
            payload.push(*tech);
            payload.push(DISCOVERY_EVERY_PERIOD);
        }

        self.candidates.clear();
        self.next_tag = None;
        self.remote = None;
        self.issue(gid::RF, oid::rf::DISCOVER, &payload, NciState::StartDiscoveryWait);
        match self.state {
            NciState::Error => Err(self.take_error()),
            _ => Ok(()),
        }
    }

    /// Start a deactivation; the exchange is completed by [`Controller::step`]
    ///
    /// While discovering, the controller always returns to idle. With an
    /// activated endpoint `kind` chooses where the session goes next.
    pub fn deactivate(&mut self, kind: DeactivationType) -> Result<()> {
        let (kind, next) = match self.state {
            s if s.is_discovering() => (DeactivationType::Idle, NciState::Deactivate1Wait),
            NciState::PollActive => (kind, NciState::Deactivate2Wait),
            other => return Err(NciError::InvalidState(other)),
        };
        self.pending_deactivation = kind;
        self.issue(gid::RF, oid::rf::DEACTIVATE, &[kind as u8], next);
        match self.state {
            NciState::Error => Err(self.take_error()),
            _ => Ok(()),
        }
    }

    /// Deactivate to idle and wait for the controller to confirm
    pub fn stop_discovery(&mut self) -> Result<()> {
        self.deactivate(DeactivationType::Idle)?;
        self.settle().map(|_| ())
    }

    /// Release the activated endpoint and resume discovery
    pub fn restart_discovery(&mut self) -> Result<()> {
        self.deactivate(DeactivationType::Discovery)?;
        self.settle().map(|_| ())
    }

    /// Wait for an endpoint to be activated, selecting the first candidate
    /// when several were discovered
    ///
    /// In peer-to-peer mode an ISO-DEP card activation is double checked,
    /// see [`Controller::recheck_peer`].
    pub fn wait_for_tag(&mut self, timeout_ms: u64) -> Result<RemoteDevice> {
        let remote = self.await_activation(timeout_ms)?;
        if self.config.mode == Mode::PeerToPeer && is_card_lookalike(&remote) {
            return self.recheck_peer();
        }
        Ok(remote)
    }

    /// Phones in peer-to-peer mode may also emulate an ISO-DEP card and get
    /// activated as one first; rediscover once so an NFC-DEP activation of
    /// the same device can take over
    pub fn recheck_peer(&mut self) -> Result<RemoteDevice> {
        debug!("ISO-DEP card activated in peer-to-peer mode, rediscovering");
        self.restart_discovery()?;
        let remote = self.await_activation(PEER_RECHECK_TIMEOUT_MS)?;
        if remote.protocol == Protocol::NfcDep {
            info!("Peer {} activated over NFC-DEP", remote.rf_discovery_id);
        }
        Ok(remote)
    }

    fn await_activation(&mut self, timeout_ms: u64) -> Result<RemoteDevice> {
        let state = self.drive(timeout_ms, |s| {
            matches!(s, NciState::PollActive | NciState::WaitHostSelect)
        });
        match state {
            NciState::PollActive => self.remote.clone().ok_or(NciError::InvalidState(state)),
            NciState::WaitHostSelect => self.select_candidate(0),
            NciState::Error => Err(self.take_error()),
            _ => Err(NciError::Timeout {
                waiting_for: "endpoint activation",
                timeout_ms,
            }),
        }
    }

    /// Whether a remote reader activated us within `timeout_ms`
    pub fn is_reader_detected(&mut self, timeout_ms: u64) -> Result<bool> {
        match self.wait_for_tag(timeout_ms) {
            Ok(remote) => Ok(remote.is_remote_reader()),
            Err(NciError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Activate the discovered candidate at `index`
    pub fn select_candidate(&mut self, index: usize) -> Result<RemoteDevice> {
        self.require(NciState::WaitHostSelect)?;
        let candidate = self
            .candidates
            .get(index)
            .cloned()
            .ok_or(NciError::NoSuchCandidate(index))?;

        let mut remote = self
            .select(candidate.rf_discovery_id, candidate.protocol)
            .map_err(|e| self.park(e))?;
        remote.more_tags = self.candidates.len() > 1;
        self.next_tag = self
            .candidates
            .iter()
            .find(|c| c.rf_discovery_id != candidate.rf_discovery_id)
            .cloned();
        info!(
            "Selected endpoint {} ({:?}), id {}",
            remote.rf_discovery_id,
            remote.protocol,
            hexify(remote.identifier())
        );
        self.remote = Some(remote.clone());
        self.enter(NciState::PollActive);
        Ok(remote)
    }

    /// Put the active tag to sleep and activate the other discovered one
    ///
    /// A failed switch parks the session in `Error` and drops the remote
    /// descriptor, as [`Controller::select_candidate`] does.
    pub fn activate_next(&mut self) -> Result<RemoteDevice> {
        self.require(NciState::PollActive)?;
        let next = self.next_tag.clone().ok_or(NciError::NoNextTag)?;

        let switched = self
            .sleep_active()
            .and_then(|_| self.select(next.rf_discovery_id, next.protocol));
        let mut remote = match switched {
            Ok(remote) => remote,
            Err(e) => {
                self.remote = None;
                return Err(self.park(e));
            }
        };
        remote.more_tags = true;

        // the tag put to sleep becomes the next one to switch back to
        self.next_tag = self.remote.as_ref().map(|previous| DiscoveryCandidate {
            rf_discovery_id: previous.rf_discovery_id,
            protocol: previous.protocol,
            mode_tech: previous.mode_tech,
            tech_params: previous.tech_params.clone(),
        });
        info!("Switched to endpoint {}", remote.rf_discovery_id);
        self.remote = Some(remote.clone());
        self.enter(NciState::PollActive);
        Ok(remote)
    }

    /// Sleep and reselect the active tag, resetting its protocol state
    pub fn reactivate(&mut self) -> Result<()> {
        self.require(NciState::PollActive)?;
        let (id, protocol, more_tags) = match &self.remote {
            Some(remote) => (remote.rf_discovery_id, remote.protocol, remote.more_tags),
            None => return Err(NciError::InvalidState(self.state)),
        };

        self.sleep_active()?;
        let mut remote = self.select(id, protocol)?;
        remote.more_tags = more_tags;
        self.remote = Some(remote);
        self.enter(NciState::PollActive);
        Ok(())
    }

    // ========================================================================
    // Data exchange
    // ========================================================================

    /// Send a raw command to the activated tag and return its answer
    pub fn reader_tag_cmd(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.require(NciState::PollActive)?;
        self.codec.send_data(command)?;
        let timeout_ms = self.config.data_timeout_ms;
        self.receive_data(timeout_ms, "tag answer")
    }

    /// Send a data packet to the remote reader
    pub fn card_mode_send(&mut self, data: &[u8]) -> Result<()> {
        self.require(NciState::PollActive)?;
        self.codec.send_data(data)
    }

    /// Wait for the next data packet from the remote reader
    pub fn card_mode_receive(&mut self, timeout_ms: u64) -> Result<Vec<u8>> {
        self.require(NciState::PollActive)?;
        self.receive_data(timeout_ms, "reader command")
    }

    fn receive_data(&mut self, timeout_ms: u64, waiting_for: &'static str) -> Result<Vec<u8>> {
        self.codec.await_data_message(timeout_ms, waiting_for)
    }

    /// Handle at most one pending frame of a card emulation session
    pub fn emulation_step(&mut self, emulator: &mut T4tEmulator) -> Result<EmulationEvent> {
        self.require(NciState::PollActive)?;
        if self.codec.poll_message().is_none() {
            return Ok(EmulationEvent::Pending);
        }
        let header = match self.codec.header() {
            Some(header) => header,
            None => return Ok(EmulationEvent::Pending),
        };

        if header.is(MessageType::Data, 0, 0) {
            let mut command = Vec::new();
            if !self.codec.append_segment(&mut command)? {
                let timeout_ms = self.config.data_timeout_ms;
                let rest = self.codec.await_data_message(timeout_ms, "reader command segment")?;
                command.extend_from_slice(&rest);
            }
            let response = emulator.process(&command);
            self.codec.send_data(&response)?;
            return Ok(EmulationEvent::Exchanged);
        }

        if header.is(MessageType::Notification, gid::RF, oid::rf::DEACTIVATE) {
            let kind = self
                .codec
                .byte(3)
                .and_then(DeactivationType::from_byte)
                .unwrap_or(DeactivationType::Discovery);
            info!("Remote reader left ({:?})", kind);
            self.pending_deactivation = kind;
            self.finish_deactivation();
            return Ok(EmulationEvent::Deactivated);
        }

        if !header.is_credit_notification() {
            debug!("Ignoring {} during card emulation", header);
        }
        Ok(EmulationEvent::Pending)
    }

    /// Serve a remote reader until it leaves or stays silent for the
    /// configured emulation timeout
    pub fn handle_card_emulation(&mut self, emulator: &mut T4tEmulator) -> Result<()> {
        emulator.reset();
        let timeout_ms = self.config.emulation_timeout_ms;
        let mut idle = Deadline::new(self.codec.clock().now_ms(), timeout_ms);
        loop {
            match self.emulation_step(emulator)? {
                EmulationEvent::Exchanged => {
                    idle = Deadline::new(self.codec.clock().now_ms(), timeout_ms);
                }
                EmulationEvent::Deactivated => return Ok(()),
                EmulationEvent::Pending => {
                    if idle.is_expired(self.codec.clock().now_ms()) {
                        debug!("Card emulation idle for {} ms, ending session", timeout_ms);
                        return Ok(());
                    }
                    self.codec.clock().sleep_ms(1);
                }
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn enter(&mut self, next: NciState) {
        if self.state != next {
            debug!("NCI state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    fn arm(&mut self, timeout_ms: u64) {
        self.deadline = Deadline::new(self.codec.clock().now_ms(), timeout_ms);
    }

    fn require(&self, expected: NciState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NciError::InvalidState(self.state))
        }
    }

    fn timeout_for(&self, state: NciState) -> u64 {
        match state {
            NciState::WaitAllDiscoveries => self.config.arbitration_timeout_ms,
            NciState::Deactivate1Wait | NciState::Deactivate2Wait | NciState::Deactivate2NotifyWait => {
                self.config.deactivate_timeout_ms
            }
            _ => self.config.command_timeout_ms,
        }
    }

    /// Send a command and arm the deadline of the waiting state `next`
    fn issue(&mut self, group: u8, opcode: u8, payload: &[u8], next: NciState) {
        match self.codec.send_command(group, opcode, payload) {
            Ok(()) => {
                self.arm(self.timeout_for(next));
                self.enter(next);
            }
            Err(e) => self.fail(e),
        }
    }

    /// Poll in an armed state: true once a frame is in the receive buffer,
    /// false while pending; an expired deadline moves to `Error`
    fn await_armed(&mut self, waiting_for: &'static str) -> bool {
        if self.codec.poll_message().is_some() {
            return true;
        }
        if self.deadline.is_expired(self.codec.clock().now_ms()) {
            let timeout_ms = self.deadline.timeout_ms();
            self.fail(NciError::Timeout {
                waiting_for,
                timeout_ms,
            });
        }
        false
    }

    fn is_ok_response(&self, group: u8, opcode: u8) -> bool {
        self.codec.is_message(MessageType::Response, group, opcode)
            && self.codec.status() == Some(STATUS_OK)
    }

    fn unexpected(&self, expected: &'static str) -> NciError {
        NciError::UnexpectedMessage {
            expected,
            received: hexify(self.codec.received()),
        }
    }

    fn fail_unexpected(&mut self, expected: &'static str) {
        let err = self.unexpected(expected);
        self.fail(err);
    }

    fn fail(&mut self, err: NciError) {
        error!("NCI session failed in {:?}: {}", self.state, err);
        self.last_error = Some(err);
        self.enter(NciState::Error);
    }

    /// Move to `Error` after a failed blocking transaction, handing the
    /// error back to the caller
    fn park(&mut self, err: NciError) -> NciError {
        error!("NCI session failed in {:?}: {}", self.state, err);
        self.enter(NciState::Error);
        err
    }

    fn step_reset_wait(&mut self) {
        if self.codec.poll_message().is_some() {
            let ok = self.codec.received().len() == self.config.chip.reset_response_len()
                && self.is_ok_response(gid::CORE, oid::core::RESET);
            if ok {
                if !self.config.chip.is_nci2() {
                    self.nci_version = self.codec.byte(4);
                }
                // NCI 2.0 announces itself in CORE_RESET_NTF, awaited in SwReset
                self.arm(self.config.command_timeout_ms);
                self.enter(NciState::SwReset);
            } else {
                let err = self.unexpected("CORE_RESET_RSP");
                self.retry_reset(err);
            }
        } else if self.deadline.is_expired(self.codec.clock().now_ms()) {
            let err = NciError::Timeout {
                waiting_for: "CORE_RESET_RSP",
                timeout_ms: self.deadline.timeout_ms(),
            };
            self.retry_reset(err);
        }
    }

    /// Go back to `HwReset` after a pause while attempts remain
    fn retry_reset(&mut self, err: NciError) {
        self.reset_attempt += 1;
        if self.reset_attempt >= self.config.reset_attempts {
            self.fail(err);
            return;
        }
        warn!(
            "CORE_RESET attempt {}/{} failed: {}",
            self.reset_attempt, self.config.reset_attempts, err
        );
        let now = self.codec.clock().now_ms();
        self.retry_pause = Some(Deadline::new(now, self.config.reset_retry_delay_ms));
        self.enter(NciState::HwReset);
    }

    /// NCI 2.0 controllers send CORE_RESET_NTF before accepting CORE_INIT;
    /// give it until the armed deadline, then init regardless
    fn step_sw_reset(&mut self) {
        let waiting = self.config.chip.is_nci2()
            && self.reset_notification.is_none()
            && !self.deadline.is_expired(self.codec.clock().now_ms());
        if waiting {
            if self.codec.poll_message().is_some() {
                if self.is_after_reset_notification() {
                    self.absorb_reset_notification();
                } else if let Some(header) = self.codec.header() {
                    debug!("Ignoring {} before CORE_INIT", header);
                }
            }
            return;
        }
        let init = self.config.chip.init_payload();
        self.issue(gid::CORE, oid::core::INIT, init, NciState::SwResetWait);
    }

    /// CORE_RESET_NTF, or the CORE_GENERIC_ERROR_NTF some firmware sends
    /// after an anti-tearing recovery
    fn is_after_reset_notification(&self) -> bool {
        self.codec.is_message(MessageType::Notification, gid::CORE, oid::core::RESET)
            || self.codec.is_message(MessageType::Notification, gid::CORE, oid::core::GENERIC_ERROR)
    }

    fn absorb_reset_notification(&mut self) {
        if !self.codec.is_message(MessageType::Notification, gid::CORE, oid::core::RESET) {
            debug!("Ignoring {} after reset", hexify(self.codec.received()));
            return;
        }
        match ResetNotification::parse(self.codec.received()) {
            Some(ntf) => {
                debug!("CORE_RESET_NTF trigger 0x{:02X}, NCI 0x{:02X}", ntf.trigger, ntf.nci_version);
                self.nci_version = Some(ntf.nci_version);
                self.reset_notification = Some(ntf);
            }
            None => warn!("Short CORE_RESET_NTF: {}", hexify(self.codec.received())),
        }
    }

    fn record_init_response(&mut self) {
        let received = self.codec.received();
        self.info = if self.config.chip.is_nci2() {
            ControllerInfo::parse_nci2(received).map(|mut info| {
                if let Some(ntf) = &self.reset_notification {
                    info.manufacturer_id = ntf.manufacturer_id;
                    info.firmware = ntf.firmware;
                }
                info
            })
        } else {
            ControllerInfo::parse(received)
        };
        if let Some(fw) = self.firmware_version() {
            info!("NFC controller firmware {:06X}", fw.as_u32());
        }
    }

    fn step_discovering(&mut self) {
        if self.codec.poll_message().is_none() {
            return;
        }
        if self.codec.is_message(MessageType::Notification, gid::RF, oid::rf::INTF_ACTIVATED) {
            match RemoteDevice::from_activation(self.codec.received()) {
                Ok(remote) => {
                    info!(
                        "Endpoint activated: {:?} over {:?}, id {}",
                        remote.protocol,
                        remote.interface,
                        hexify(remote.identifier())
                    );
                    self.candidates.clear();
                    self.next_tag = None;
                    self.remote = Some(remote);
                    self.enter(NciState::PollActive);
                }
                Err(e) => self.fail(e),
            }
        } else if self.codec.is_message(MessageType::Notification, gid::RF, oid::rf::DISCOVER) {
            self.register_candidate();
        } else if let Some(header) = self.codec.header() {
            debug!("Ignoring {} while discovering", header);
        }
    }

    /// Record the RF_DISCOVER_NTF in the receive buffer and pick the next state
    fn register_candidate(&mut self) {
        let parsed = DiscoveryCandidate::from_notification(self.codec.received()).and_then(
            |(candidate, kind)| {
                DiscoverNotification::from_byte(kind)
                    .map(|kind| (candidate, kind))
                    .ok_or_else(|| self.unexpected("RF_DISCOVER_NTF notification type"))
            },
        );
        match parsed {
            Ok((candidate, kind)) => {
                debug!(
                    "Discovered endpoint {} ({:?})",
                    candidate.rf_discovery_id, candidate.protocol
                );
                self.candidates.push(candidate);
                if kind.is_last() {
                    info!("{} endpoints discovered, waiting for selection", self.candidates.len());
                    self.enter(NciState::WaitHostSelect);
                } else {
                    self.arm(self.config.arbitration_timeout_ms);
                    self.enter(NciState::WaitAllDiscoveries);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn finish_deactivation(&mut self) {
        let next = match self.state {
            NciState::Deactivate1Wait => NciState::Idle,
            _ => self.pending_deactivation.resulting_state(),
        };
        if matches!(next, NciState::Idle | NciState::Discovering) {
            self.remote = None;
            self.candidates.clear();
            self.next_tag = None;
        }
        self.enter(next);
    }

    /// Blocking command transaction; failures park the session in `Error`
    fn command(&mut self, name: &'static str, group: u8, opcode: u8, payload: &[u8]) -> Result<()> {
        self.transact(name, group, opcode, payload)
            .map_err(|e| self.park(e))
    }

    fn transact(&mut self, name: &'static str, group: u8, opcode: u8, payload: &[u8]) -> Result<()> {
        self.codec.send_command(group, opcode, payload)?;
        let timeout_ms = self.config.command_timeout_ms;
        if self.codec.await_message(timeout_ms) == 0 {
            return Err(NciError::Timeout {
                waiting_for: name,
                timeout_ms,
            });
        }
        if !self.codec.is_message(MessageType::Response, group, opcode) {
            return Err(self.unexpected(name));
        }
        match self.codec.status() {
            Some(STATUS_OK) => Ok(()),
            Some(status) => Err(NciError::Rejected {
                command: name,
                status,
            }),
            None => Err(NciError::Truncated("response status")),
        }
    }

    /// Deactivate the active endpoint to sleep and wait for the notification
    fn sleep_active(&mut self) -> Result<()> {
        self.codec
            .send_command(gid::RF, oid::rf::DEACTIVATE, &[DeactivationType::Sleep as u8])?;
        self.expect(MessageType::Response, gid::RF, oid::rf::DEACTIVATE, "RF_DEACTIVATE_RSP")?;
        self.expect(
            MessageType::Notification,
            gid::RF,
            oid::rf::DEACTIVATE,
            "RF_DEACTIVATE_NTF",
        )?;
        self.enter(NciState::WaitHostSelect);
        Ok(())
    }

    /// Select an endpoint and build its descriptor without touching state
    fn select(&mut self, rf_discovery_id: u8, protocol: Protocol) -> Result<RemoteDevice> {
        let interface = Interface::for_protocol(protocol);
        self.codec.send_command(
            gid::RF,
            oid::rf::DISCOVER_SELECT,
            &[rf_discovery_id, protocol.to_byte(), interface.to_byte()],
        )?;
        self.expect(
            MessageType::Response,
            gid::RF,
            oid::rf::DISCOVER_SELECT,
            "RF_DISCOVER_SELECT_RSP",
        )?;
        if self.codec.status() != Some(STATUS_OK) {
            return Err(NciError::Rejected {
                command: "RF_DISCOVER_SELECT_CMD",
                status: self.codec.status().unwrap_or(0xFF),
            });
        }
        self.expect(
            MessageType::Notification,
            gid::RF,
            oid::rf::INTF_ACTIVATED,
            "RF_INTF_ACTIVATED_NTF",
        )?;
        RemoteDevice::from_activation(self.codec.received())
    }

    /// Await one frame within the activation timeout and check its header
    fn expect(
        &mut self,
        message_type: MessageType,
        group: u8,
        opcode: u8,
        name: &'static str,
    ) -> Result<()> {
        let timeout_ms = self.config.activation_timeout_ms;
        if self.codec.await_skipping(timeout_ms, Header::is_credit_notification) == 0 {
            return Err(NciError::Timeout {
                waiting_for: name,
                timeout_ms,
            });
        }
        if self.codec.is_message(message_type, group, opcode) {
            Ok(())
        } else {
            warn!("Expected {}, got {}", name, hexify(self.codec.received()));
            Err(self.unexpected(name))
        }
    }

    /// [`Controller::expect`] followed by a status check
    pub(super) fn expect_ok(
        &mut self,
        message_type: MessageType,
        group: u8,
        opcode: u8,
        name: &'static str,
    ) -> Result<()> {
        self.expect(message_type, group, opcode, name)?;
        match self.codec.status() {
            Some(STATUS_OK) => Ok(()),
            Some(status) => Err(NciError::Rejected {
                command: name,
                status,
            }),
            None => Err(NciError::Truncated("response status")),
        }
    }
}

/// A polled ISO-DEP card, which a peer device may present before NFC-DEP
fn is_card_lookalike(remote: &RemoteDevice) -> bool {
    remote.interface == Interface::IsoDep
        && remote.protocol == Protocol::IsoDep
        && !remote.mode_tech.is_listen()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{ManualClock, MockTransport};

    const RESET_RSP: &[u8] = &[0x40, 0x00, 0x03, 0x00, 0x10, 0x01];
    const INIT_RSP: &[u8] = &[
        0x40, 0x01, 0x15, 0x00, 0x03, 0x1E, 0x03, 0x00, 0x04, 0x01, 0x02, 0x03, 0x80, 0x01, 0xFF,
        0x00, 0xFF, 0x00, 0x01, 0x04, 0x00, 0x10, 0x12, 0x34,
    ];
    const ACT_RSP: &[u8] = &[0x4F, 0x02, 0x01, 0x00];
    const DISCOVER_RSP: &[u8] = &[0x41, 0x03, 0x01, 0x00];
    const T2T_ACTIVATION: &[u8] = &[
        0x61, 0x05, 0x17, 0x01, 0x01, 0x02, 0x00, 0xFF, 0x01, 0x0C, 0x44, 0x00, 0x07, 0x04,
        0x9D, 0x3A, 0x12, 0x6B, 0x70, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    // two NFC-A tags: id 1 (T2T) announced with "more", id 2 (ISO-DEP) last
    const DISCOVER_FIRST: &[u8] = &[
        0x61, 0x03, 0x0E, 0x01, 0x02, 0x00, 0x09, 0x44, 0x00, 0x04, 0x11, 0x22, 0x33, 0x44, 0x01,
        0x00, 0x02,
    ];
    const DISCOVER_LAST: &[u8] = &[
        0x61, 0x03, 0x0E, 0x02, 0x04, 0x00, 0x09, 0x04, 0x00, 0x04, 0xAA, 0xBB, 0xCC, 0xDD, 0x01,
        0x20, 0x00,
    ];
    const ISO_DEP_ACTIVATION: &[u8] = &[
        0x61, 0x05, 0x18, 0x02, 0x02, 0x04, 0x00, 0xFF, 0x01, 0x09, 0x04, 0x00, 0x04, 0xAA,
        0xBB, 0xCC, 0xDD, 0x01, 0x20, 0x00, 0x00, 0x00, 0x04, 0x03, 0x78, 0x80, 0x02,
    ];
    const T2T_ACTIVATION_ID1: &[u8] = &[
        0x61, 0x05, 0x14, 0x01, 0x01, 0x02, 0x00, 0xFF, 0x01, 0x09, 0x44, 0x00, 0x04, 0x11,
        0x22, 0x33, 0x44, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    const SELECT_RSP: &[u8] = &[0x41, 0x04, 0x01, 0x00];
    const DEACTIVATE_RSP: &[u8] = &[0x41, 0x06, 0x01, 0x00];
    const DEACTIVATE_SLEEP_NTF: &[u8] = &[0x61, 0x06, 0x02, 0x01, 0x00];
    const SET_CONFIG_RSP: &[u8] = &[0x40, 0x02, 0x02, 0x00, 0x00];

    // NCI 2.0 (PN7160) bring-up
    const RESET_RSP_NCI2: &[u8] = &[0x40, 0x00, 0x01, 0x00];
    const RESET_NTF: &[u8] = &[0x60, 0x00, 0x09, 0x02, 0x00, 0x20, 0x04, 0x04, 0x51, 0x12, 0x01, 0x90];
    const INIT_RSP_NCI2: &[u8] = &[
        0x40, 0x01, 0x12, 0x00, 0x1A, 0x1E, 0x03, 0x00, 0x08, 0x00, 0x02, 0xFF, 0xFF, 0x01, 0x00,
        0x01, 0x02, 0x01, 0x00, 0x02, 0x00,
    ];

    fn controller_with(
        config: NciConfig,
    ) -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let transport = MockTransport::new();
        let clock = ManualClock::new();
        let ctrl = Controller::new(transport.clone(), clock.clone(), config);
        (ctrl, transport, clock)
    }

    fn controller() -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        controller_with(NciConfig::default())
    }

    fn single_attempt_controller() -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let mut config = NciConfig::default();
        config.reset_attempts = 1;
        controller_with(config)
    }

    fn idle_controller() -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let (mut ctrl, transport, clock) = controller();
        transport.push(RESET_RSP);
        transport.push(INIT_RSP);
        transport.push(ACT_RSP);
        ctrl.bring_up().unwrap();
        transport.clear_written();
        (ctrl, transport, clock)
    }

    fn discovering_controller() -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let (mut ctrl, transport, clock) = idle_controller();
        ctrl.start_discovery().unwrap();
        transport.push(DISCOVER_RSP);
        assert_eq!(ctrl.step(), NciState::Discovering);
        transport.clear_written();
        (ctrl, transport, clock)
    }

    fn active_controller() -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let (mut ctrl, transport, clock) = discovering_controller();
        transport.push(T2T_ACTIVATION);
        assert_eq!(ctrl.step(), NciState::PollActive);
        (ctrl, transport, clock)
    }

    fn host_select_controller() -> (Controller<MockTransport, ManualClock>, MockTransport, ManualClock) {
        let (mut ctrl, transport, clock) = discovering_controller();
        transport.push(DISCOVER_FIRST);
        assert_eq!(ctrl.step(), NciState::WaitAllDiscoveries);
        transport.push(DISCOVER_LAST);
        assert_eq!(ctrl.step(), NciState::WaitHostSelect);
        (ctrl, transport, clock)
    }

    #[test]
    fn test_bring_up_steps() {
        let (mut ctrl, transport, _clock) = controller();
        transport.push(RESET_RSP);
        transport.push(INIT_RSP);
        transport.push(ACT_RSP);

        let states: Vec<NciState> = (0..6).map(|_| ctrl.step()).collect();
        assert_eq!(
            states,
            vec![
                NciState::HwResetWait,
                NciState::SwReset,
                NciState::SwResetWait,
                NciState::EnableVendorExt,
                NciState::EnableVendorExtWait,
                NciState::Idle,
            ]
        );
        assert_eq!(
            transport.written(),
            vec![vec![0x20, 0x00, 0x01, 0x01], vec![0x20, 0x01, 0x00], vec![0x2F, 0x02, 0x00]]
        );
        assert_eq!(ctrl.nci_version(), Some(0x10));
    }

    #[test]
    fn test_controller_info() {
        let (ctrl, _transport, _clock) = idle_controller();
        let info = ctrl.controller_info().unwrap();
        assert_eq!(info.rf_interfaces, vec![0x01, 0x02, 0x03, 0x80]);
        assert_eq!(info.manufacturer_id, 0x04);
        let fw = ctrl.firmware_version().unwrap();
        assert_eq!(fw.as_u32(), 0x101234);
        assert_eq!(fw.generation(), Some(2));
    }

    #[test]
    fn test_missing_response_times_out() {
        let (mut ctrl, transport, clock) = single_attempt_controller();
        assert_eq!(ctrl.step(), NciState::HwResetWait);
        assert_eq!(ctrl.step(), NciState::HwResetWait);
        clock.advance(10);
        assert_eq!(ctrl.step(), NciState::Error);
        assert!(matches!(ctrl.last_error(), Some(NciError::Timeout { .. })));

        // Error is absorbing
        transport.push(RESET_RSP);
        assert_eq!(ctrl.step(), NciState::Error);
        assert_eq!(transport.pending(), 1);
    }

    #[test]
    fn test_bring_up_fails_without_controller() {
        let (mut ctrl, transport, _clock) = controller();
        assert!(matches!(ctrl.bring_up(), Err(NciError::Timeout { .. })));
        assert_eq!(ctrl.state(), NciState::Error);
        assert_eq!(transport.written(), vec![vec![0x20, 0x00, 0x01, 0x01]; 3]);
    }

    #[test]
    fn test_reset_retried_after_timeout() {
        let (mut ctrl, transport, clock) = controller();
        assert_eq!(ctrl.step(), NciState::HwResetWait);
        clock.advance(10);
        assert_eq!(ctrl.step(), NciState::HwReset);
        assert!(ctrl.last_error().is_none());

        // paused before the next attempt
        assert_eq!(ctrl.step(), NciState::HwReset);
        assert_eq!(transport.written().len(), 1);
        clock.advance(500);
        assert_eq!(ctrl.step(), NciState::HwResetWait);
        assert_eq!(transport.written().len(), 2);

        transport.push(RESET_RSP);
        transport.push(INIT_RSP);
        transport.push(ACT_RSP);
        let state = ctrl.drive(1000, |s| s == NciState::Idle);
        assert_eq!(state, NciState::Idle);
    }

    #[test]
    fn test_reset_response_must_be_six_bytes() {
        let (mut ctrl, transport, _clock) = single_attempt_controller();
        transport.push(&[0x40, 0x00, 0x01, 0x00]);
        ctrl.step();
        assert_eq!(ctrl.step(), NciState::Error);
        assert!(matches!(ctrl.last_error(), Some(NciError::UnexpectedMessage { .. })));
    }

    #[test]
    fn test_init_rejected() {
        let (mut ctrl, transport, _clock) = controller();
        transport.push(RESET_RSP);
        transport.push(&[0x40, 0x01, 0x01, 0x03]);
        assert!(ctrl.bring_up().is_err());
        assert_eq!(ctrl.state(), NciState::Error);
    }

    #[test]
    fn test_vendor_activation_rejected() {
        let (mut ctrl, transport, _clock) = controller();
        transport.push(RESET_RSP);
        transport.push(INIT_RSP);
        transport.push(&[0x4F, 0x02, 0x01, 0x01]);
        assert!(matches!(ctrl.bring_up(), Err(NciError::UnexpectedMessage { .. })));
        assert_eq!(ctrl.state(), NciState::Error);
    }

    #[test]
    fn test_generic_error_after_reset_is_tolerated() {
        let (mut ctrl, transport, _clock) = controller();
        transport.push(RESET_RSP);
        transport.push(&[0x60, 0x07, 0x01, 0xE6]);
        transport.push(INIT_RSP);
        transport.push(ACT_RSP);
        ctrl.bring_up().unwrap();
        assert_eq!(ctrl.firmware_version().unwrap().rom_code, 0x10);
    }

    #[test]
    fn test_pn7160_bring_up() {
        let config = NciConfig::default().with_chip(ChipModel::Pn7160);
        let (mut ctrl, transport, _clock) = controller_with(config);
        transport.push(RESET_RSP_NCI2);
        transport.push(RESET_NTF);
        transport.push(INIT_RSP_NCI2);
        transport.push(ACT_RSP);
        ctrl.bring_up().unwrap();

        assert_eq!(
            transport.written(),
            vec![
                vec![0x20, 0x00, 0x01, 0x01],
                vec![0x20, 0x01, 0x02, 0x00, 0x00],
                vec![0x2F, 0x02, 0x00],
            ]
        );
        assert_eq!(ctrl.nci_version(), Some(0x20));
        let info = ctrl.controller_info().unwrap();
        assert_eq!(info.rf_interfaces, vec![0x01, 0x02]);
        assert_eq!(info.max_logical_connections, 0x08);
        assert_eq!(info.manufacturer_id, 0x04);
        assert_eq!(info.firmware.unwrap().rom_code, 0x12);
        assert_eq!(ctrl.generation(), None);
        assert_eq!(ctrl.reset_notification().map(|ntf| ntf.trigger), Some(0x02));
    }

    #[test]
    fn test_pn7160_init_sent_without_reset_notification() {
        let config = NciConfig::default().with_chip(ChipModel::Pn7160);
        let (mut ctrl, transport, clock) = controller_with(config);
        transport.push(RESET_RSP_NCI2);
        assert_eq!(ctrl.step(), NciState::HwResetWait);
        assert_eq!(ctrl.step(), NciState::SwReset);
        assert_eq!(ctrl.step(), NciState::SwReset);
        assert_eq!(transport.written().len(), 1);

        clock.advance(10);
        assert_eq!(ctrl.step(), NciState::SwResetWait);
        assert_eq!(transport.last_written(), Some(vec![0x20, 0x01, 0x02, 0x00, 0x00]));
        transport.push(INIT_RSP_NCI2);
        assert_eq!(ctrl.step(), NciState::EnableVendorExt);
    }

    #[test]
    fn test_pn7150_rejects_short_reset_response() {
        let (mut ctrl, transport, _clock) = single_attempt_controller();
        transport.push(RESET_RSP_NCI2);
        ctrl.step();
        assert_eq!(ctrl.step(), NciState::Error);
    }

    #[test]
    fn test_reset_notification_parse() {
        let ntf = ResetNotification::parse(RESET_NTF).unwrap();
        assert_eq!(ntf.trigger, 0x02);
        assert_eq!(ntf.nci_version, 0x20);
        let fw = ntf.firmware.unwrap();
        assert_eq!((fw.hardware, fw.major, fw.minor), (0x51, 0x01, 0x90));

        let bare = ResetNotification::parse(&[0x60, 0x00, 0x05, 0x02, 0x00, 0x20, 0x04, 0x00]).unwrap();
        assert!(bare.firmware.is_none());
        assert!(ResetNotification::parse(&[0x60, 0x00, 0x01, 0x02]).is_none());
    }

    #[test]
    fn test_configure_settings_pn7150() {
        let (mut ctrl, transport, _clock) = idle_controller();
        transport.push(SET_CONFIG_RSP);
        transport.push(SET_CONFIG_RSP);
        transport.push(&[0x40, 0x00, 0x03, 0x00, 0x10, 0x00]);
        transport.push(INIT_RSP);
        ctrl.configure_settings().unwrap();

        assert_eq!(
            transport.written(),
            vec![
                vec![0x20, 0x02, 0x05, 0x01, 0x00, 0x02, 0x00, 0x01],
                vec![
                    0x20, 0x02, 0x0D, 0x03, 0xA0, 0x40, 0x01, 0x00, 0xA0, 0x41, 0x01, 0x04, 0xA0,
                    0x43, 0x01, 0x00
                ],
                vec![0x20, 0x00, 0x01, 0x00],
                vec![0x20, 0x01, 0x00],
            ]
        );
        assert_eq!(ctrl.state(), NciState::Idle);
    }

    #[test]
    fn test_configure_settings_pn7160() {
        let config = NciConfig::default().with_chip(ChipModel::Pn7160);
        let (mut ctrl, transport, _clock) = controller_with(config);
        transport.push(RESET_RSP_NCI2);
        transport.push(RESET_NTF);
        transport.push(INIT_RSP_NCI2);
        transport.push(ACT_RSP);
        ctrl.bring_up().unwrap();
        transport.clear_written();

        ctrl.config.core_settings = vec![vec![0x01, 0xA0, 0x03, 0x01, 0x08]];
        transport.push(SET_CONFIG_RSP);
        transport.push(SET_CONFIG_RSP);
        transport.push(SET_CONFIG_RSP);
        transport.push(RESET_RSP_NCI2);
        transport.push(RESET_NTF);
        transport.push(INIT_RSP_NCI2);
        ctrl.configure_settings().unwrap();

        let written = transport.written();
        assert_eq!(written[0], vec![0x20, 0x02, 0x05, 0x01, 0x00, 0x02, 0xFE, 0x01]);
        assert_eq!(written[1], vec![0x20, 0x02, 0x05, 0x01, 0xA0, 0x40, 0x01, 0x00]);
        assert_eq!(written[2], vec![0x20, 0x02, 0x05, 0x01, 0xA0, 0x03, 0x01, 0x08]);
        assert_eq!(written[4], vec![0x20, 0x01, 0x02, 0x00, 0x00]);
        assert_eq!(transport.pending(), 0);
    }

    #[test]
    fn test_configure_settings_failed_reset_parks_in_error() {
        let (mut ctrl, transport, _clock) = idle_controller();
        transport.push(SET_CONFIG_RSP);
        transport.push(SET_CONFIG_RSP);
        transport.push(&[0x40, 0x00, 0x03, 0x03, 0x10, 0x00]);
        assert!(matches!(
            ctrl.configure_settings(),
            Err(NciError::Rejected { status: 0x03, .. })
        ));
        assert_eq!(ctrl.state(), NciState::Error);
    }

    #[test]
    fn test_write_failure_parks_in_error() {
        let (mut ctrl, transport, _clock) = controller();
        transport.fail_writes(true);
        assert_eq!(ctrl.step(), NciState::Error);
        assert!(matches!(ctrl.last_error(), Some(NciError::Transport(_))));
    }

    #[test]
    fn test_initialize_recovers_from_error() {
        let (mut ctrl, transport, clock) = single_attempt_controller();
        ctrl.step();
        clock.advance(20);
        assert_eq!(ctrl.step(), NciState::Error);

        transport.push(RESET_RSP);
        transport.push(INIT_RSP);
        transport.push(ACT_RSP);
        ctrl.bring_up().unwrap();
        assert_eq!(ctrl.state(), NciState::Idle);
        assert!(ctrl.last_error().is_none());
    }

    #[test]
    fn test_start_discovery_payload() {
        let (mut ctrl, transport, _clock) = idle_controller();
        ctrl.start_discovery().unwrap();
        assert_eq!(ctrl.state(), NciState::StartDiscoveryWait);
        assert_eq!(
            transport.last_written(),
            Some(vec![0x21, 0x03, 0x09, 0x04, 0x00, 0x01, 0x02, 0x01, 0x01, 0x01, 0x06, 0x01])
        );
        transport.push(DISCOVER_RSP);
        assert_eq!(ctrl.step(), NciState::Discovering);
    }

    #[test]
    fn test_discover_response_rejected() {
        let (mut ctrl, transport, _clock) = idle_controller();
        ctrl.start_discovery().unwrap();
        transport.push(&[0x41, 0x03, 0x01, 0x06]);
        assert_eq!(ctrl.step(), NciState::Error);
    }

    #[test]
    fn test_start_discovery_only_from_idle() {
        let (mut ctrl, _transport, _clock) = controller();
        assert!(matches!(
            ctrl.start_discovery(),
            Err(NciError::InvalidState(NciState::HwReset))
        ));
    }

    #[test]
    fn test_single_tag_activation() {
        let (ctrl, _transport, _clock) = active_controller();
        let remote = ctrl.remote().unwrap();
        assert_eq!(remote.protocol, Protocol::T2t);
        assert!(!remote.more_tags);
        assert!(ctrl.next_tag().is_none());
    }

    #[test]
    fn test_discovering_ignores_other_frames() {
        let (mut ctrl, transport, _clock) = discovering_controller();
        transport.push(&[0x60, 0x07, 0x01, 0xA1]);
        assert_eq!(ctrl.step(), NciState::Discovering);
        assert_eq!(ctrl.step(), NciState::Discovering);
    }

    #[test]
    fn test_multiple_tags_wait_for_host_select() {
        let (mut ctrl, transport, _clock) = host_select_controller();
        assert_eq!(ctrl.candidates().len(), 2);

        transport.push(SELECT_RSP);
        transport.push(T2T_ACTIVATION_ID1);
        let remote = ctrl.select_candidate(0).unwrap();
        assert_eq!(ctrl.state(), NciState::PollActive);
        assert_eq!(remote.rf_discovery_id, 1);
        assert!(remote.more_tags);
        assert_eq!(ctrl.next_tag().unwrap().rf_discovery_id, 2);
        assert_eq!(transport.last_written(), Some(vec![0x21, 0x04, 0x03, 0x01, 0x02, 0x01]));
    }

    #[test]
    fn test_select_out_of_range() {
        let (mut ctrl, _transport, _clock) = host_select_controller();
        assert!(matches!(ctrl.select_candidate(5), Err(NciError::NoSuchCandidate(5))));
        assert_eq!(ctrl.state(), NciState::WaitHostSelect);
    }

    #[test]
    fn test_select_failure_moves_to_error() {
        let (mut ctrl, transport, _clock) = host_select_controller();
        transport.push(&[0x41, 0x04, 0x01, 0x03]);
        assert!(matches!(ctrl.select_candidate(1), Err(NciError::Rejected { .. })));
        assert_eq!(ctrl.state(), NciState::Error);
    }

    #[test]
    fn test_arbitration_timeout() {
        let (mut ctrl, transport, clock) = discovering_controller();
        transport.push(DISCOVER_FIRST);
        assert_eq!(ctrl.step(), NciState::WaitAllDiscoveries);
        clock.advance(99);
        assert_eq!(ctrl.step(), NciState::WaitAllDiscoveries);
        clock.advance(1);
        assert_eq!(ctrl.step(), NciState::Error);
    }

    #[test]
    fn test_wait_for_tag_selects_first_candidate() {
        let (mut ctrl, transport, _clock) = discovering_controller();
        transport.push(DISCOVER_FIRST);
        transport.push(DISCOVER_LAST);
        transport.push(SELECT_RSP);
        transport.push(T2T_ACTIVATION_ID1);
        let remote = ctrl.wait_for_tag(1000).unwrap();
        assert_eq!(remote.rf_discovery_id, 1);
        assert_eq!(ctrl.state(), NciState::PollActive);
    }

    #[test]
    fn test_peer_to_peer_prefers_nfc_dep_after_iso_dep() {
        let (mut ctrl, transport, _clock) = discovering_controller();
        ctrl.config.mode = Mode::PeerToPeer;
        transport.push(ISO_DEP_ACTIVATION);
        transport.push(DEACTIVATE_RSP);
        transport.push(&[0x61, 0x06, 0x02, 0x03, 0x00]);
        transport.push(&[
            0x61, 0x05, 0x14, 0x01, 0x03, 0x05, 0x00, 0xFF, 0x01, 0x09, 0x44, 0x00, 0x04, 0x11,
            0x22, 0x33, 0x44, 0x01, 0x40, 0x00, 0x00, 0x00, 0x00,
        ]);
        let remote = ctrl.wait_for_tag(1000).unwrap();
        assert_eq!(remote.protocol, Protocol::NfcDep);
        assert_eq!(remote.interface, Interface::NfcDep);
        assert_eq!(transport.last_written(), Some(vec![0x21, 0x06, 0x01, 0x03]));
    }

    #[test]
    fn test_peer_recheck_keeps_plain_card() {
        let (mut ctrl, transport, _clock) = discovering_controller();
        ctrl.config.mode = Mode::PeerToPeer;
        transport.push(ISO_DEP_ACTIVATION);
        transport.push(DEACTIVATE_RSP);
        transport.push(&[0x61, 0x06, 0x02, 0x03, 0x00]);
        transport.push(ISO_DEP_ACTIVATION);
        let remote = ctrl.wait_for_tag(1000).unwrap();
        assert_eq!(remote.protocol, Protocol::IsoDep);
        assert_eq!(ctrl.state(), NciState::PollActive);
    }

    #[test]
    fn test_reader_mode_skips_peer_recheck() {
        let (mut ctrl, transport, _clock) = discovering_controller();
        transport.push(ISO_DEP_ACTIVATION);
        let remote = ctrl.wait_for_tag(1000).unwrap();
        assert_eq!(remote.protocol, Protocol::IsoDep);
        assert!(transport.written().is_empty());
    }

    #[test]
    fn test_wait_for_tag_timeout_keeps_discovering() {
        let (mut ctrl, _transport, _clock) = discovering_controller();
        assert!(matches!(ctrl.wait_for_tag(50), Err(NciError::Timeout { .. })));
        assert_eq!(ctrl.state(), NciState::Discovering);
    }

    #[test]
    fn test_deactivate_active_endpoint() {
        let (mut ctrl, transport, _clock) = active_controller();
        ctrl.deactivate(DeactivationType::Idle).unwrap();
        assert_eq!(ctrl.state(), NciState::Deactivate2Wait);
        assert_eq!(transport.last_written(), Some(vec![0x21, 0x06, 0x01, 0x00]));

        transport.push(DEACTIVATE_RSP);
        assert_eq!(ctrl.step(), NciState::Deactivate2NotifyWait);
        transport.push(&[0x61, 0x06, 0x02, 0x00, 0x00]);
        assert_eq!(ctrl.step(), NciState::Idle);
        assert!(ctrl.remote().is_none());
    }

    #[test]
    fn test_deactivate_notification_timeout() {
        let (mut ctrl, transport, clock) = active_controller();
        ctrl.deactivate(DeactivationType::Discovery).unwrap();
        transport.push(DEACTIVATE_RSP);
        assert_eq!(ctrl.step(), NciState::Deactivate2NotifyWait);
        clock.advance(10);
        assert_eq!(ctrl.step(), NciState::Error);
    }

    #[test]
    fn test_restart_discovery() {
        let (mut ctrl, transport, _clock) = active_controller();
        transport.push(DEACTIVATE_RSP);
        transport.push(&[0x61, 0x06, 0x02, 0x03, 0x00]);
        ctrl.restart_discovery().unwrap();
        assert_eq!(ctrl.state(), NciState::Discovering);
        assert_eq!(transport.last_written(), Some(vec![0x21, 0x06, 0x01, 0x03]));
    }

    #[test]
    fn test_stop_discovery_from_host_select() {
        let (mut ctrl, transport, _clock) = host_select_controller();
        transport.push(DEACTIVATE_RSP);
        ctrl.stop_discovery().unwrap();
        assert_eq!(ctrl.state(), NciState::Idle);
        assert!(ctrl.candidates().is_empty());
    }

    #[test]
    fn test_deactivate_rejected_in_idle() {
        let (mut ctrl, _transport, _clock) = idle_controller();
        assert!(matches!(
            ctrl.deactivate(DeactivationType::Idle),
            Err(NciError::InvalidState(NciState::Idle))
        ));
    }

    #[test]
    fn test_reader_tag_cmd() {
        let (mut ctrl, transport, _clock) = active_controller();
        transport.push(&[0x60, 0x06, 0x03, 0x01, 0x00, 0x01]);
        transport.push(&[0x00, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x00]);
        let answer = ctrl.reader_tag_cmd(&[0x30, 0x04]).unwrap();
        assert_eq!(answer, vec![0x01, 0x02, 0x03, 0x04, 0x00]);
        assert_eq!(transport.last_written(), Some(vec![0x00, 0x00, 0x02, 0x30, 0x04]));
    }

    #[test]
    fn test_reader_tag_cmd_reassembles_segments() {
        let (mut ctrl, transport, _clock) = active_controller();
        transport.push(&[0x10, 0x00, 0x02, 0xAA, 0xBB]);
        transport.push(&[0x00, 0x00, 0x01, 0xCC]);
        let answer = ctrl.reader_tag_cmd(&[0x30, 0x04]).unwrap();
        assert_eq!(answer, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_reader_tag_cmd_timeout() {
        let (mut ctrl, _transport, _clock) = active_controller();
        assert!(matches!(
            ctrl.reader_tag_cmd(&[0x30, 0x04]),
            Err(NciError::Timeout { timeout_ms: 1000, .. })
        ));
        assert_eq!(ctrl.state(), NciState::PollActive);
    }

    #[test]
    fn test_activate_next_swaps_tags() {
        let (mut ctrl, transport, _clock) = host_select_controller();
        transport.push(SELECT_RSP);
        transport.push(T2T_ACTIVATION_ID1);
        ctrl.select_candidate(0).unwrap();

        transport.push(DEACTIVATE_RSP);
        transport.push(DEACTIVATE_SLEEP_NTF);
        transport.push(SELECT_RSP);
        transport.push(ISO_DEP_ACTIVATION);
        let remote = ctrl.activate_next().unwrap();
        assert_eq!(remote.rf_discovery_id, 2);
        assert_eq!(remote.protocol, Protocol::IsoDep);
        assert_eq!(ctrl.state(), NciState::PollActive);
        assert_eq!(ctrl.next_tag().unwrap().rf_discovery_id, 1);
        assert_eq!(transport.last_written(), Some(vec![0x21, 0x04, 0x03, 0x02, 0x04, 0x02]));
    }

    #[test]
    fn test_activate_next_failure_parks_in_error() {
        let (mut ctrl, transport, _clock) = host_select_controller();
        transport.push(SELECT_RSP);
        transport.push(T2T_ACTIVATION_ID1);
        ctrl.select_candidate(0).unwrap();

        transport.push(DEACTIVATE_RSP);
        transport.push(DEACTIVATE_SLEEP_NTF);
        transport.push(&[0x60, 0x07, 0x01, 0xB0]);
        assert!(matches!(ctrl.activate_next(), Err(NciError::UnexpectedMessage { .. })));
        assert_eq!(ctrl.state(), NciState::Error);
        assert!(ctrl.remote().is_none());
    }

    #[test]
    fn test_activate_next_sleep_timeout_parks_in_error() {
        let (mut ctrl, transport, _clock) = host_select_controller();
        transport.push(SELECT_RSP);
        transport.push(T2T_ACTIVATION_ID1);
        ctrl.select_candidate(0).unwrap();

        transport.push(DEACTIVATE_RSP);
        assert!(matches!(ctrl.activate_next(), Err(NciError::Timeout { .. })));
        assert_eq!(ctrl.state(), NciState::Error);
        assert!(ctrl.remote().is_none());
    }

    #[test]
    fn test_activate_next_without_other_tag() {
        let (mut ctrl, _transport, _clock) = active_controller();
        assert!(matches!(ctrl.activate_next(), Err(NciError::NoNextTag)));
    }

    #[test]
    fn test_reactivate() {
        let (mut ctrl, transport, _clock) = active_controller();
        transport.push(DEACTIVATE_RSP);
        transport.push(DEACTIVATE_SLEEP_NTF);
        transport.push(SELECT_RSP);
        transport.push(T2T_ACTIVATION);
        ctrl.reactivate().unwrap();
        assert_eq!(ctrl.state(), NciState::PollActive);
        assert_eq!(transport.last_written(), Some(vec![0x21, 0x04, 0x03, 0x01, 0x02, 0x01]));
    }

    #[test]
    fn test_configure_card_emulation() {
        let (mut ctrl, transport, _clock) = idle_controller();
        transport.push(&[0x41, 0x00, 0x01, 0x00]);
        transport.push(&[0x41, 0x01, 0x01, 0x00]);
        transport.push(&[0x40, 0x02, 0x02, 0x00, 0x00]);
        ctrl.configure_mode(Mode::CardEmulation).unwrap();

        let written = transport.written();
        assert_eq!(written[0], vec![0x21, 0x00, 0x04, 0x01, 0x04, 0x02, 0x02]);
        assert_eq!(written[1], vec![0x21, 0x01, 0x07, 0x00, 0x01, 0x01, 0x03, 0x00, 0x01, 0x04]);
        assert_eq!(written[2], vec![0x20, 0x02, 0x04, 0x01, 0x32, 0x01, 0x20]);
        assert_eq!(ctrl.config().technologies(), vec![0x80]);
    }

    #[test]
    fn test_configure_peer_to_peer_sets_llcp() {
        let (mut ctrl, transport, _clock) = idle_controller();
        transport.push(&[0x41, 0x00, 0x01, 0x00]);
        transport.push(&[0x41, 0x01, 0x01, 0x00]);
        transport.push(&[0x40, 0x02, 0x02, 0x00, 0x00]);
        transport.push(&[0x40, 0x02, 0x02, 0x00, 0x00]);
        ctrl.configure_mode(Mode::PeerToPeer).unwrap();

        let written = transport.written();
        assert_eq!(written.len(), 4);
        assert_eq!(written[2][6], 0x40);
        assert_eq!(written[3][2], 31);
    }

    #[test]
    fn test_configure_rejected_parks_in_error() {
        let (mut ctrl, transport, _clock) = idle_controller();
        transport.push(&[0x41, 0x00, 0x01, 0x09]);
        assert!(matches!(
            ctrl.configure_mode(Mode::ReaderWriter),
            Err(NciError::Rejected { status: 0x09, .. })
        ));
        assert_eq!(ctrl.state(), NciState::Error);
    }

    #[test]
    fn test_card_emulation_session() {
        let (mut ctrl, transport, _clock) = idle_controller();
        ctrl.config.mode = Mode::CardEmulation;
        ctrl.start_discovery().unwrap();
        transport.push(DISCOVER_RSP);
        ctrl.step();
        transport.push(&[0x61, 0x05, 0x0A, 0x01, 0x02, 0x04, 0x80, 0xFF, 0x01, 0x00, 0x80, 0x00, 0x00]);
        assert!(ctrl.is_reader_detected(100).unwrap());

        let mut emulator = T4tEmulator::new();
        transport.push(&[
            0x00, 0x00, 0x0D, 0x00, 0xA4, 0x04, 0x00, 0x07, 0xD2, 0x76, 0x00, 0x00, 0x85, 0x01,
            0x01, 0x00,
        ]);
        transport.push(&[0x61, 0x06, 0x02, 0x03, 0x00]);
        ctrl.handle_card_emulation(&mut emulator).unwrap();

        assert_eq!(transport.last_written(), Some(vec![0x00, 0x00, 0x02, 0x90, 0x00]));
        assert_eq!(ctrl.state(), NciState::Discovering);
    }

    #[test]
    fn test_emulation_step_joins_segmented_command() {
        let (mut ctrl, transport, _clock) = active_controller();
        let mut emulator = T4tEmulator::new();
        transport.push(&[0x10, 0x00, 0x06, 0x00, 0xA4, 0x04, 0x00, 0x07, 0xD2]);
        transport.push(&[0x00, 0x00, 0x07, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01, 0x00]);
        assert_eq!(ctrl.emulation_step(&mut emulator).unwrap(), EmulationEvent::Exchanged);
        assert_eq!(transport.last_written(), Some(vec![0x00, 0x00, 0x02, 0x90, 0x00]));
    }

    #[test]
    fn test_card_emulation_ends_on_silence() {
        let (mut ctrl, _transport, clock) = active_controller();
        let mut emulator = T4tEmulator::new();
        let start = clock.now_ms();
        ctrl.handle_card_emulation(&mut emulator).unwrap();
        assert!(clock.now_ms() - start >= 2000);
        assert_eq!(ctrl.state(), NciState::PollActive);
    }
}
