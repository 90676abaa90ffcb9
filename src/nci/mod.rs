//! NCI host stack: frame codec, session state machine and presence checks

pub mod controller;
pub mod factory;
pub mod frame;
pub mod presence;
pub mod remote;
pub mod state;

pub use controller::{Controller, ControllerInfo, EmulationEvent, FirmwareVersion, ResetNotification};
pub use factory::{TestBitrate, TestTechnology};
pub use frame::{Frame, FrameCodec, Header, MessageType};
pub use presence::{Presence, PresenceCheck};
pub use remote::{DiscoveryCandidate, Interface, ModeTech, Protocol, RemoteDevice, TechParams, Technology};
pub use state::{DeactivationType, NciState};
