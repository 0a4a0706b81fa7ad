//! Ring-buffer engine of an eXtensible Host Controller Interface (xHCI) driver.
//!
//! The controller and the driver share three kinds of rings made of Transfer Request Blocks
//! (TRBs): the command ring and the per-endpoint transfer rings, which software produces and
//! hardware consumes, and the event ring, which hardware produces. Ownership of each slot is
//! decided by its cycle bit compared against the consumer's cycle state.
//!
//! This crate implements those rings together with the logic that depends on them:
//!
//! - segment-linked rings that grow under producer pressure,
//! - the command lifecycle, including timeout handling through the command abort sequence,
//! - transfer descriptor (TD) construction for control, bulk, interrupt and isochronous
//!   endpoints,
//! - cancellation of queued TDs, relocating the hardware dequeue pointer when needed,
//! - the event ring processor mapping completion codes to request results.
//!
//! Registers and DMA memory are reached through [`xhci::HostController`]. [`sim::SimulatedHc`]
//! implements it for tests and the `xhci-ring-sim` binary.
//!
//! The xHCI specification is referred to as XHCI below; section numbers follow revision 1.2.
#[macro_use]
extern crate bitflags;

pub mod completion;
pub mod config;
pub mod error;
pub mod sim;
pub mod xhci;

pub use config::{Quirks, XhciConfig};
pub use error::{Error, Result, TransferError};
pub use xhci::Xhci;
