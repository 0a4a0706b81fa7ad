use std::collections::VecDeque;
use std::fmt;
use common::timeout::Timeout;

use super::ring::{Ring, TrbPos};

/// Identifies an endpoint by device slot and endpoint index (the Device Context Index minus
/// one).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EndpointId {
    pub slot: u8,
    pub ep_index: u8,
}

impl EndpointId {
    pub const fn new(slot: u8, ep_index: u8) -> Self {
        Self { slot, ep_index }
    }
    /// The Device Context Index, as used in doorbells and endpoint commands.
    pub const fn dci(&self) -> u8 {
        self.ep_index + 1
    }
    /// Parses the slot id and endpoint id fields of an event or command TRB.
    pub fn from_trb_control(control: u32) -> Option<Self> {
        let slot = (control >> 24) as u8;
        let dci = ((control >> 16) & 0x1F) as u8;
        if dci == 0 {
            return None;
        }
        Some(Self::new(slot, dci - 1))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.slot, self.ep_index)
    }
}

/// Endpoint State field of an endpoint context (XHCI 6.2.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Disabled,
    Running,
    Halted,
    Stopped,
    Error,
    Reserved(u8),
}

impl EndpointState {
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x7 {
            0 => Self::Disabled,
            1 => Self::Running,
            2 => Self::Halted,
            3 => Self::Stopped,
            4 => Self::Error,
            other => Self::Reserved(other),
        }
    }
}

/// The fields of an endpoint context the ring engine reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointContext {
    pub state: EndpointState,
    /// TR Dequeue Pointer, with the Dequeue Cycle State in bit 0.
    pub dequeue: u64,
}

impl EndpointContext {
    pub const DISABLED: Self = Self {
        state: EndpointState::Disabled,
        dequeue: 0,
    };

    pub fn dequeue_address(&self) -> u64 {
        self.dequeue & !0xF
    }
    pub fn dequeue_cycle(&self) -> bool {
        self.dequeue & 1 == 1
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointType {
    Control,
    Isoch,
    Bulk,
    Interrupt,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Speed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Clone, Copy, Debug)]
pub struct EndpointConfig {
    pub id: EndpointId,
    pub kind: EndpointType,
    pub speed: Speed,
    pub max_packet_size: u16,
    /// Zero based, as in the SuperSpeed endpoint companion descriptor.
    pub max_burst: u8,
    /// Service interval in (micro)frames, used to space isochronous frame ids.
    pub interval: u32,
}

impl EndpointConfig {
    pub fn new(id: EndpointId, kind: EndpointType, max_packet_size: u16) -> Self {
        Self {
            id,
            kind,
            speed: Speed::High,
            max_packet_size,
            max_burst: 0,
            interval: 1,
        }
    }

    pub fn max_packet(&self) -> u32 {
        u32::from(self.max_packet_size.max(1))
    }
}

bitflags! {
    /// Commands in flight that keep the endpoint doorbell from being rung.
    pub struct EpFlags: u32 {
        const SET_DEQ_PENDING = 1 << 0;
        const HALTED = 1 << 1;
        const STOP_CMD_PENDING = 1 << 2;
    }
}

impl EpFlags {
    pub fn blocks_doorbell(&self) -> bool {
        self.intersects(Self::SET_DEQ_PENDING | Self::HALTED | Self::STOP_CMD_PENDING)
    }
}

pub struct Endpoint {
    pub config: EndpointConfig,
    pub ring: Ring,
    pub flags: EpFlags,
    /// TDs being cancelled, in cancellation order.
    pub cancelled: VecDeque<usize>,
    /// Where the ring dequeue moves once the pending Set TR Dequeue Pointer completes.
    pub queued_deq: Option<TrbPos>,
    /// Set after Missed Service, isochronous TDs are skipped until the event's TD is found.
    pub skip: bool,
    pub err_count: u32,
    /// Started with the first Stop Endpoint of the current cancellation. Context State Error
    /// retries end when it expires.
    pub stop_retry: Option<Timeout>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, ring: Ring) -> Self {
        Self {
            config,
            ring,
            flags: EpFlags::empty(),
            cancelled: VecDeque::new(),
            queued_deq: None,
            skip: false,
            err_count: 0,
            stop_retry: None,
        }
    }

    /// The doorbell value addressing this endpoint.
    pub fn doorbell_value(&self) -> u32 {
        super::doorbell::db_value(self.config.id.ep_index, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_trb() {
        let control = (4 << 24) | (3 << 16) | (32 << 10);
        assert_eq!(
            EndpointId::from_trb_control(control),
            Some(EndpointId::new(4, 2))
        );
        assert_eq!(EndpointId::from_trb_control(4 << 24), None);
        assert_eq!(EndpointId::new(4, 2).dci(), 3);
    }

    #[test]
    fn doorbell_blockers() {
        assert!(!EpFlags::empty().blocks_doorbell());
        assert!(EpFlags::HALTED.blocks_doorbell());
        assert!(EpFlags::STOP_CMD_PENDING.blocks_doorbell());
        assert!(EpFlags::SET_DEQ_PENDING.blocks_doorbell());
    }

    #[test]
    fn context_state() {
        assert_eq!(EndpointState::from_raw(2), EndpointState::Halted);
        assert_eq!(EndpointState::from_raw(7), EndpointState::Reserved(7));
        let ctx = EndpointContext {
            state: EndpointState::Running,
            dequeue: 0x1230 | 1,
        };
        assert_eq!(ctx.dequeue_address(), 0x1230);
        assert!(ctx.dequeue_cycle());
    }
}
