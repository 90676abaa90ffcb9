//! Session states and deadlines

use super::frame::WAIT_FOREVER;

/// States of the NCI session
///
/// `*Wait` states have a response deadline armed on entry. `Error` is
/// absorbing until the session is re-initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NciState {
    /// Ready to send CORE_RESET_CMD
    HwReset,
    HwResetWait,
    /// Ready to send CORE_INIT_CMD
    SwReset,
    SwResetWait,
    /// Ready to send the proprietary activation command
    EnableVendorExt,
    EnableVendorExtWait,
    /// Configured, waiting for the application to start discovery
    Idle,
    StartDiscoveryWait,
    /// Polling/listening; no deadline
    Discovering,
    /// Collecting RF_DISCOVER_NTF until the last one arrives
    WaitAllDiscoveries,
    /// Several candidates found, waiting for the host to pick one
    WaitHostSelect,
    /// An endpoint is activated and data may flow
    PollActive,
    /// Deactivation without an activated endpoint: response only
    Deactivate1Wait,
    /// Deactivation of an activated endpoint: response...
    Deactivate2Wait,
    /// ...then notification
    Deactivate2NotifyWait,
    Error,
}

impl NciState {
    /// Whether a response deadline is armed in this state
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            NciState::HwResetWait
                | NciState::SwResetWait
                | NciState::EnableVendorExtWait
                | NciState::StartDiscoveryWait
                | NciState::WaitAllDiscoveries
                | NciState::Deactivate1Wait
                | NciState::Deactivate2Wait
                | NciState::Deactivate2NotifyWait
        )
    }

    /// Whether discovery is running on the controller
    pub fn is_discovering(&self) -> bool {
        matches!(
            self,
            NciState::Discovering | NciState::WaitAllDiscoveries | NciState::WaitHostSelect
        )
    }
}

/// RF_DEACTIVATE_CMD deactivation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeactivationType {
    Idle = 0x00,
    Sleep = 0x01,
    SleepAf = 0x02,
    Discovery = 0x03,
}

impl DeactivationType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DeactivationType::Idle),
            0x01 => Some(DeactivationType::Sleep),
            0x02 => Some(DeactivationType::SleepAf),
            0x03 => Some(DeactivationType::Discovery),
            _ => None,
        }
    }

    /// Session state once the controller confirms this deactivation
    pub fn resulting_state(self) -> NciState {
        match self {
            DeactivationType::Idle => NciState::Idle,
            DeactivationType::Sleep | DeactivationType::SleepAf => NciState::WaitHostSelect,
            DeactivationType::Discovery => NciState::Discovering,
        }
    }
}

/// RF_DISCOVER_NTF notification type, found after the technology parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverNotification {
    Last,
    LastNfccLimit,
    More,
}

impl DiscoverNotification {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DiscoverNotification::Last),
            1 => Some(DiscoverNotification::LastNfccLimit),
            2 => Some(DiscoverNotification::More),
            _ => None,
        }
    }

    pub fn is_last(&self) -> bool {
        !matches!(self, DiscoverNotification::More)
    }
}

/// An armed timeout, measured against a millisecond clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start_ms: u64,
    timeout_ms: u64,
}

impl Deadline {
    pub fn new(now_ms: u64, timeout_ms: u64) -> Self {
        Self {
            start_ms: now_ms,
            timeout_ms,
        }
    }

    pub fn never() -> Self {
        Self::new(0, WAIT_FOREVER)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.timeout_ms != WAIT_FOREVER && now_ms.saturating_sub(self.start_ms) >= self.timeout_ms
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }
}
