//! Controller configuration
//!
//! Timeouts, the operating mode and a few tunables, persisted as JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nci::remote::{ModeTech, Technology};

/// Errors while loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What the controller is set up to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Poll for tags and read/write them
    ReaderWriter,
    /// Emulate a Type 4 Tag towards a remote reader
    CardEmulation,
    /// NFC-DEP initiator/target
    PeerToPeer,
}

impl Mode {
    /// Technologies put into RF_DISCOVER_CMD for this mode
    pub fn default_technologies(&self) -> Vec<u8> {
        match self {
            Mode::ReaderWriter => vec![
                ModeTech::poll(Technology::NfcAPassive).0,
                ModeTech::poll(Technology::NfcFPassive).0,
                ModeTech::poll(Technology::NfcBPassive).0,
                ModeTech::poll(Technology::Iso15693Passive).0,
            ],
            Mode::CardEmulation => vec![ModeTech::listen(Technology::NfcAPassive).0],
            Mode::PeerToPeer => vec![
                ModeTech::poll(Technology::NfcAPassive).0,
                ModeTech::poll(Technology::NfcFPassive).0,
                ModeTech::poll(Technology::NfcAActive).0,
                ModeTech::listen(Technology::NfcFPassive).0,
                ModeTech::listen(Technology::NfcAActive).0,
                ModeTech::listen(Technology::NfcFActive).0,
            ],
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rw" | "reader" | "reader_writer" => Ok(Mode::ReaderWriter),
            "ce" | "card" | "card_emulation" => Ok(Mode::CardEmulation),
            "p2p" | "peer_to_peer" => Ok(Mode::PeerToPeer),
            other => Err(format!("unknown mode '{}' (expected rw, ce or p2p)", other)),
        }
    }
}

/// NFC controller family; selects the NCI version spoken during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipModel {
    /// PN7150 class, NCI 1.0
    Pn7150,
    /// PN7160 class, NCI 2.0
    Pn7160,
}

impl ChipModel {
    pub fn is_nci2(&self) -> bool {
        matches!(self, ChipModel::Pn7160)
    }
}

impl FromStr for ChipModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pn7150" => Ok(ChipModel::Pn7150),
            "pn7160" => Ok(ChipModel::Pn7160),
            other => Err(format!("unknown chip '{}' (expected pn7150 or pn7160)", other)),
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NciConfig {
    pub mode: Mode,
    pub chip: ChipModel,
    /// CORE_RESET exchanges tried before bring-up gives up
    pub reset_attempts: u32,
    /// Pause between two reset attempts
    pub reset_retry_delay_ms: u64,
    /// Reset, init, vendor and configuration commands
    pub command_timeout_ms: u64,
    /// Gap allowed between RF_DISCOVER_NTF while arbitrating several tags
    pub arbitration_timeout_ms: u64,
    /// RF_DISCOVER_SELECT response and the activation that follows
    pub activation_timeout_ms: u64,
    pub deactivate_timeout_ms: u64,
    /// Answer to a data packet sent to the active tag
    pub data_timeout_ms: u64,
    pub presence_interval_ms: u64,
    pub presence_timeout_ms: u64,
    /// Silence after which a card emulation session is considered over
    pub emulation_timeout_ms: u64,
    /// Largest NDEF message the codec will build
    pub ndef_size_limit: usize,
    /// Overrides [`Mode::default_technologies`]
    pub discovery_technologies: Option<Vec<u8>>,
    /// Raw CORE_SET_CONFIG payloads applied by `apply_core_settings`
    pub core_settings: Vec<Vec<u8>>,
}

impl Default for NciConfig {
    fn default() -> Self {
        Self {
            mode: Mode::ReaderWriter,
            chip: ChipModel::Pn7150,
            reset_attempts: 3,
            reset_retry_delay_ms: 500,
            command_timeout_ms: 10,
            arbitration_timeout_ms: 100,
            activation_timeout_ms: 100,
            deactivate_timeout_ms: 10,
            data_timeout_ms: 1000,
            presence_interval_ms: 500,
            presence_timeout_ms: 100,
            emulation_timeout_ms: 2000,
            ndef_size_limit: 249,
            discovery_technologies: None,
            core_settings: Vec::new(),
        }
    }
}

impl NciConfig {
    const CONFIG_FILE: &'static str = "config.json";

    /// Default location: `$NCI_CONFIG`, else `~/.nci/config.json`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("NCI_CONFIG") {
            return PathBuf::from(path);
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".nci").join(Self::CONFIG_FILE);
        }
        PathBuf::from("/etc/nci").join(Self::CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        debug!("Loaded NCI config from {:?}", path);
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when missing or invalid
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No NCI config at {:?}, using defaults", path);
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring NCI config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved NCI config to {:?}", path);
        Ok(())
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_chip(mut self, chip: ChipModel) -> Self {
        self.chip = chip;
        self
    }

    /// Technologies to discover in the configured mode
    pub fn technologies(&self) -> Vec<u8> {
        self.discovery_technologies
            .clone()
            .unwrap_or_else(|| self.mode.default_technologies())
    }
}
