//! Register and memory boundary between the ring engine and a host controller.
use crate::error::Result;

use super::endpoint::{EndpointContext, EndpointId};

/// USBSTS: Host Controller Halted.
pub const USBSTS_HCH: u32 = 1 << 0;
/// USBSTS: Host System Error.
pub const USBSTS_HSE: u32 = 1 << 2;
/// USBSTS: Event Interrupt (RW1C).
pub const USBSTS_EINT: u32 = 1 << 3;
/// USBSTS: Host Controller Error.
pub const USBSTS_HCE: u32 = 1 << 12;

/// CRCR: Ring Cycle State.
pub const CRCR_RCS: u64 = 1 << 0;
/// CRCR: Command Abort.
pub const CRCR_CA: u64 = 1 << 2;
/// CRCR: Command Ring Running.
pub const CRCR_CRR: u64 = 1 << 3;
pub const CRCR_PTR_MASK: u64 = !0x3F;

/// ERDP: Dequeue ERST Segment Index.
pub const ERDP_DESI_MASK: u64 = 0x7;
/// ERDP: Event Handler Busy (RW1C).
pub const ERDP_EHB: u64 = 1 << 3;
pub const ERDP_PTR_MASK: u64 = !0xF;

/// Doorbell target of the command ring.
pub const DB_TARGET_HOST: u8 = 0;

/// DMA memory as seen from the driver. Addresses are bus addresses.
pub trait DmaAllocator {
    /// Allocates `size` zeroed bytes, aligned to 64 bytes.
    fn alloc_dma(&mut self, size: usize) -> Result<u64>;
    fn free_dma(&mut self, address: u64, size: usize);
    /// Copies between two DMA buffers, used for bounce buffers.
    fn copy_dma(&mut self, dst: u64, src: u64, len: usize);
}

/// The registers of a host controller the ring engine drives.
///
/// All methods are called with the engine lock held.
pub trait HostController: DmaAllocator + Send {
    /// Writes `value` to doorbell `target`. Target 0 is the command ring.
    fn ring_doorbell(&mut self, target: u8, value: u32);

    fn read_usbsts(&mut self) -> u32;
    /// Writes USBSTS. Status bits are write-1-to-clear.
    fn write_usbsts(&mut self, value: u32);

    fn read_crcr(&mut self) -> u64;
    fn write_crcr(&mut self, value: u64);

    /// Programs ERSTSZ, ERDP and ERSTBA of the primary interrupter, in that order.
    fn setup_event_ring(&mut self, erstba: u64, erstsz: u16, erdp: u64);
    fn read_erdp(&mut self) -> u64;
    fn write_erdp(&mut self, value: u64);

    /// Reads the endpoint context from the output device context.
    fn endpoint_context(&mut self, endpoint: EndpointId) -> EndpointContext;

    /// Clears Run/Stop and waits for the controller to halt.
    fn halt(&mut self);
}
