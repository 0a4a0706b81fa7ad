//! Runs the ring engine against the simulated controller.
//!
//! Usage: `xhci-ring-sim [CONFIG.toml]`. Without a configuration file the defaults shipped in
//! `xhci-ring.toml` are used. Set `XHCI_LOG=debug` to follow the rings.
use std::env;
use std::process;
use std::sync::Arc;

use common::logger;
use common::timeout::MonotonicClock;
use log::{error, info};
use xhci_ring::sim::{SimulatedHc, TdOutcome};
use xhci_ring::xhci::{
    Command, Direction, EndpointConfig, EndpointId, EndpointType, SetupPacket, TransferRequest,
};
use xhci_ring::{Result, Xhci, XhciConfig};

const DEFAULT_CONFIG: &str = include_str!("../xhci-ring.toml");

fn load_config() -> Result<XhciConfig> {
    match env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            XhciConfig::load(path)
        }
        None => XhciConfig::from_toml(DEFAULT_CONFIG),
    }
}

fn run() -> Result<()> {
    let config = load_config()?;
    let sim = SimulatedHc::new();
    let xhci = Xhci::new(sim.clone(), config, Arc::new(MonotonicClock::new()))?;

    let handle = xhci.submit_command(Command::EnableSlot { slot_type: 0 })?;
    sim.run_commands(&xhci);
    let slot = handle.wait()?.slot_id;
    info!("Enabled slot {}", slot);

    let control = EndpointId::new(slot, 0);
    let dequeue = xhci.add_endpoint(EndpointConfig::new(control, EndpointType::Control, 64))?;
    sim.configure_endpoint(control, dequeue);

    // GET_DESCRIPTOR(Device), the device only returns the first 8 bytes.
    let buffer = sim.alloc_buffer(18);
    let setup = SetupPacket {
        request_type: 0x80,
        request: 6,
        value: 0x0100,
        index: 0,
        length: 18,
    };
    let handle = xhci.queue_transfer(TransferRequest::control(control, setup, buffer))?;
    sim.complete_td(&xhci, control, TdOutcome::Short { residue: 10 });
    let result = handle.wait();
    info!(
        "GET_DESCRIPTOR: {:?}, {} bytes",
        result.status, result.actual_length
    );

    let bulk = EndpointId::new(slot, 2);
    let dequeue = xhci.add_endpoint(EndpointConfig::new(bulk, EndpointType::Bulk, 512))?;
    sim.configure_endpoint(bulk, dequeue);

    let buffer = sim.alloc_buffer(64 * 1024);
    let first = xhci.queue_transfer(TransferRequest::bulk(bulk, Direction::In, buffer, 4096))?;
    let second = xhci.queue_transfer(TransferRequest::bulk(bulk, Direction::In, buffer, 4096))?;
    sim.complete_td(&xhci, bulk, TdOutcome::Stall);
    for _ in 0..2 {
        sim.run_commands(&xhci);
    }
    sim.complete_td(&xhci, bulk, TdOutcome::Success);

    for (name, handle) in [("first", first), ("second", second)] {
        let result = handle.wait();
        info!(
            "Bulk {}: {:?}, {} bytes",
            name, result.status, result.actual_length
        );
    }
    info!("Executed commands: {:?}", sim.command_log());
    Ok(())
}

fn main() {
    logger::setup_logging(
        "usb",
        "xhci-ring-sim",
        logger::output_level(),
        logger::file_level(),
    );

    if let Err(err) = run() {
        error!("xhci-ring-sim: {}", err);
        process::exit(1);
    }
}
