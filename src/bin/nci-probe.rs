//! Bring an NCI controller up over TCP and exercise one mode
//!
//! Usage:
//!   nci-probe --address 127.0.0.1:7000 --mode rw
//!   nci-probe --mode ce --text "hello"
//!   nci-probe --chip pn7160 --factory-test rf-on

use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use argh::FromArgs;
use log::{error, info, warn};

use nci_stack::config::{ChipModel, Mode, NciConfig};
use nci_stack::nci::frame::WAIT_FOREVER;
use nci_stack::nci::{Controller, NciState, RemoteDevice, TestBitrate, TestTechnology};
use nci_stack::ndef::NdefMessage;
use nci_stack::t4t::T4tEmulator;
use nci_stack::transport::{Clock, SystemClock, TcpTransport, Transport};

/// RF test mode entered instead of discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FactoryTest {
    RfOn,
    /// NFC-A at 106 kbit/s
    Prbs,
}

impl FromStr for FactoryTest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rf-on" => Ok(FactoryTest::RfOn),
            "prbs" => Ok(FactoryTest::Prbs),
            other => Err(format!("unknown factory test '{}' (expected rf-on or prbs)", other)),
        }
    }
}

#[derive(FromArgs, Debug)]
/// Probe an NFC controller through the NCI protocol.
struct Opt {
    #[argh(option, default = "String::from(\"127.0.0.1:7000\")")]
    /// address of the NCI TCP endpoint.
    address: String,
    #[argh(option)]
    /// operating mode: rw, ce or p2p (overrides the config file).
    mode: Option<Mode>,
    #[argh(option)]
    /// controller family: pn7150 or pn7160 (overrides the config file).
    chip: Option<ChipModel>,
    #[argh(option)]
    /// run an RF test (rf-on or prbs) instead of discovery.
    factory_test: Option<FactoryTest>,
    #[argh(option)]
    /// path of the JSON configuration file.
    config: Option<PathBuf>,
    #[argh(option, default = "String::from(\"nci-stack\")")]
    /// text served as an NDEF record in card emulation.
    text: String,
    #[argh(option, default = "1")]
    /// number of tags or reader sessions to handle before exiting.
    count: u32,
}

fn report(remote: &RemoteDevice) {
    info!(
        "Tag: protocol {:?}, technology {:?}, id {}",
        remote.protocol,
        remote.technology(),
        remote
            .identifier()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<String>()
    );
}

fn run_reader<T: Transport, C: Clock>(
    ctrl: &mut Controller<T, C>,
    count: u32,
) -> nci_stack::Result<()> {
    for _ in 0..count {
        let remote = ctrl.wait_for_tag(WAIT_FOREVER)?;
        report(&remote);
        if remote.more_tags {
            info!("{} endpoints reported during discovery", ctrl.candidates().len());
        }
        ctrl.wait_for_removal()?;
        info!("Tag removed");
        ctrl.restart_discovery()?;
    }
    Ok(())
}

fn run_emulation<T: Transport, C: Clock>(
    ctrl: &mut Controller<T, C>,
    text: &str,
    count: u32,
) -> nci_stack::Result<()> {
    let mut message = NdefMessage::with_size_limit(ctrl.config().ndef_size_limit);
    if let Err(e) = message.add_text_record(text) {
        warn!("Serving an empty message: {}", e);
    }
    let mut emulator = T4tEmulator::with_message(message.content());
    emulator.on_message_sent(|_| info!("NDEF message read by the remote reader"));
    emulator.on_message_received(|bytes| match NdefMessage::from_bytes(bytes) {
        Ok(received) => info!("Reader wrote {} record(s)", received.record_count()),
        Err(e) => warn!("Reader wrote an unreadable message: {}", e),
    });

    let mut served = 0;
    while served < count {
        if !ctrl.is_reader_detected(WAIT_FOREVER)? {
            warn!("Activated endpoint is not a reader, resuming discovery");
            ctrl.restart_discovery()?;
            continue;
        }
        info!("Remote reader activated");
        ctrl.handle_card_emulation(&mut emulator)?;
        if ctrl.state() == NciState::PollActive {
            // reader went quiet without deactivating
            ctrl.restart_discovery()?;
        }
        served += 1;
    }
    Ok(())
}

fn run(opt: Opt) -> nci_stack::Result<()> {
    let path = opt.config.unwrap_or_else(NciConfig::default_path);
    let mut config = NciConfig::load_or_default(&path);
    if let Some(mode) = opt.mode {
        config = config.with_mode(mode);
    }
    if let Some(chip) = opt.chip {
        config = config.with_chip(chip);
    }
    let mode = config.mode;

    let transport = TcpTransport::connect(opt.address.as_str())?;
    let mut ctrl = Controller::new(transport, SystemClock::new(), config);

    ctrl.bring_up()?;
    if let Some(version) = ctrl.firmware_version() {
        info!(
            "Controller firmware {:02X}.{:02X}.{:02X}.{:02X} (generation {:?})",
            version.hardware,
            version.rom_code,
            version.major,
            version.minor,
            ctrl.generation()
        );
    }
    ctrl.configure_settings()?;

    if let Some(test) = opt.factory_test {
        match test {
            FactoryTest::RfOn => ctrl.factory_test_rf_on()?,
            FactoryTest::Prbs => ctrl.factory_test_prbs(TestTechnology::NfcA, TestBitrate::Kbps106)?,
        }
        info!("{:?} running until the controller is reset", test);
        return Ok(());
    }

    ctrl.configure_mode(mode)?;
    ctrl.start_discovery()?;
    info!("Discovery started in {:?} mode", mode);

    match mode {
        Mode::CardEmulation => run_emulation(&mut ctrl, &opt.text, opt.count),
        Mode::ReaderWriter | Mode::PeerToPeer => run_reader(&mut ctrl, opt.count),
    }
}

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let opt: Opt = argh::from_env();
    if let Err(e) = run(opt) {
        error!("nci-probe failed: {}", e);
        process::exit(1);
    }
}
