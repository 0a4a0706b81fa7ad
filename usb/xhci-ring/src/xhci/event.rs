use std::mem;

use common::io::{Io, Mmio};
use log::trace;

use crate::error::Result;

use super::regs::{DmaAllocator, HostController, ERDP_DESI_MASK, ERDP_EHB, ERDP_PTR_MASK};
use super::ring::{Ring, RingKind};
use super::trb::Trb;

/// Isochronous TDs may block their event interrupt for this many TDs at most, halved whenever
/// the event ring has to be written back mid-interrupt.
pub const ISOC_BEI_INTERVAL_MAX: u32 = 32;
const ISOC_BEI_INTERVAL_MIN: u32 = 8;

/// Event Ring Segment Table entry (XHCI 6.5).
#[repr(C)]
pub struct EventRingSte {
    pub address_low: Mmio<u32>,
    pub address_high: Mmio<u32>,
    pub size: Mmio<u16>,
    _rsvd: Mmio<u16>,
    _rsvd2: Mmio<u32>,
}

impl EventRingSte {
    fn new(address: u64, size: u16) -> Self {
        Self {
            address_low: Mmio::new(address as u32),
            address_high: Mmio::new((address >> 32) as u32),
            size: Mmio::new(size),
            _rsvd: Mmio::default(),
            _rsvd2: Mmio::default(),
        }
    }

    pub fn address(&self) -> u64 {
        u64::from(self.address_low.read()) | (u64::from(self.address_high.read()) << 32)
    }

    /// The entry as the controller reads it.
    pub fn fields(&self) -> [u32; 4] {
        [
            self.address_low.read(),
            self.address_high.read(),
            u32::from(self.size.read()),
            0,
        ]
    }
}

pub struct EventRing {
    pub ste: Box<[EventRingSte]>,
    pub erst_dma: u64,
    pub ring: Ring,
    /// Isochronous TDs queued with Block Event Interrupt between two interrupting ones.
    pub isoc_bei_interval: u32,
}

impl EventRing {
    pub fn new(
        dma: &mut dyn DmaAllocator,
        num_segs: usize,
        trbs_per_segment: usize,
    ) -> Result<EventRing> {
        let ring = Ring::new(dma, RingKind::Event, num_segs, trbs_per_segment, false, 0)?;
        let erst_dma = dma.alloc_dma(num_segs * mem::size_of::<EventRingSte>())?;
        let ste = ring
            .segments()
            .map(|segment| EventRingSte::new(segment.dma, segment.trbs.len() as u16))
            .collect();

        Ok(EventRing {
            ste,
            erst_dma,
            ring,
            isoc_bei_interval: ISOC_BEI_INTERVAL_MAX,
        })
    }

    /// The slot the driver consumes next.
    pub fn next(&self) -> &Trb {
        self.ring.trb(self.ring.dequeue)
    }
    /// True when the next slot holds an event the controller has written.
    pub fn has_event(&self) -> bool {
        self.next().cycle() == self.ring.cycle_state
    }

    pub fn erdp(&self) -> u64 {
        self.ring.trb_dma(self.ring.dequeue) & ERDP_PTR_MASK
    }
    pub fn erstba(&self) -> u64 {
        self.erst_dma
    }
    pub fn erstsz(&self) -> u16 {
        self.ste.len() as u16
    }

    /// Tells the controller how far the driver has consumed. Clearing Event Handler Busy always
    /// writes, otherwise an unchanged dequeue pointer is not written again.
    pub fn update_erdp(&mut self, hc: &mut dyn HostController, clear_ehb: bool) {
        let deq = self.erdp();
        let old = hc.read_erdp();
        if !clear_ehb && old & ERDP_PTR_MASK == deq {
            return;
        }

        let desi = u64::from(self.ring.segment(self.ring.dequeue.seg).num) & ERDP_DESI_MASK;
        let mut value = deq | desi;
        if clear_ehb {
            value |= ERDP_EHB;
        }
        trace!("ERDP <- {:#x}", value);
        hc.write_erdp(value);
    }

    /// Makes isochronous TDs interrupt more often after the event ring came close to full.
    pub fn shrink_bei_interval(&mut self) {
        if self.isoc_bei_interval > ISOC_BEI_INTERVAL_MIN {
            self.isoc_bei_interval /= 2;
        }
    }

    pub fn free(&mut self, dma: &mut dyn DmaAllocator) {
        dma.free_dma(self.erst_dma, self.ste.len() * mem::size_of::<EventRingSte>());
        self.ring.free(dma);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedHc;

    #[test]
    fn ste_layout() {
        assert_eq!(mem::size_of::<EventRingSte>(), 16);
    }

    #[test]
    fn segment_table_follows_ring_order() {
        let mut hc = SimulatedHc::new();
        let events = EventRing::new(&mut hc, 2, 16).unwrap();
        assert_eq!(events.erstsz(), 2);
        for (ste, segment) in events.ste.iter().zip(events.ring.segments()) {
            assert_eq!(ste.address(), segment.dma);
            assert_eq!(ste.size.read(), 16);
        }
        assert!(!events.has_event());
        assert!(events.ring.cycle_state);
    }

    #[test]
    fn erdp_carries_segment_index() {
        let mut hc = SimulatedHc::new();
        let mut events = EventRing::new(&mut hc, 2, 16).unwrap();
        for _ in 0..17 {
            events.ring.inc_deq();
        }
        events.update_erdp(&mut hc, true);
        let erdp = *hc.erdp_writes().last().unwrap();
        assert_eq!(erdp & ERDP_DESI_MASK, 1);
        assert_eq!(erdp & ERDP_EHB, ERDP_EHB);
        assert_eq!(erdp & ERDP_PTR_MASK, events.erdp());
    }

    #[test]
    fn bei_interval_floor() {
        let mut hc = SimulatedHc::new();
        let mut events = EventRing::new(&mut hc, 1, 16).unwrap();
        for _ in 0..10 {
            events.shrink_bei_interval();
        }
        assert_eq!(events.isoc_bei_interval, ISOC_BEI_INTERVAL_MIN);
    }
}
