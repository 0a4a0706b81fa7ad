//! Transfer descriptors: building them on the transfer rings and giving back their requests.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{fence, Ordering};
use std::task;

use log::{debug, error, trace, warn};
use smallvec::SmallVec;

use crate::completion::{self, CompletionFuture, Waiter};
use crate::config::Quirks;
use crate::error::{Error, Result, TransferError};

use super::endpoint::{Direction, EndpointConfig, EndpointId, EndpointType, Speed};
use super::regs::{DmaAllocator, HostController};
use super::ring::{Segment, TrbPos};
use super::trb::{
    trb_frame_id, trb_intr_target, trb_len, trb_tbc, trb_td_size, trb_tlbpc, trb_type,
    TransferKind, Trb, TrbType, TRB_BEI, TRB_CHAIN, TRB_CYCLE, TRB_IOC, TRB_ISP,
    TRB_MAX_BUFF_SIZE, TRB_SIA,
};
use super::{Xhci, XhciInner};

bitflags! {
    pub struct TransferFlags: u32 {
        /// Completing with less data than requested is an error.
        const SHORT_NOT_OK = 1 << 0;
        /// End an OUT transfer whose length is a multiple of the max packet size with a zero
        /// length packet.
        const ZERO_PACKET = 1 << 1;
    }
}

/// The 8 byte request of a control transfer's setup stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// The packet as the immediate data of a Setup Stage TRB.
    pub fn to_u64(&self) -> u64 {
        u64::from(self.request_type)
            | (u64::from(self.request) << 8)
            | (u64::from(self.value) << 16)
            | (u64::from(self.index) << 32)
            | (u64::from(self.length) << 48)
    }

    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// One frame of an isochronous request, relative to the request buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub endpoint: EndpointId,
    pub direction: Direction,
    /// Bus address of the data buffer.
    pub buffer: u64,
    pub length: u32,
    pub setup: Option<SetupPacket>,
    pub iso_packets: Vec<IsoPacket>,
    /// Frame of the first isochronous packet. Scheduled as soon as possible when not set.
    pub start_frame: Option<u16>,
    pub flags: TransferFlags,
}

impl TransferRequest {
    pub fn bulk(endpoint: EndpointId, direction: Direction, buffer: u64, length: u32) -> Self {
        Self {
            endpoint,
            direction,
            buffer,
            length,
            setup: None,
            iso_packets: Vec::new(),
            start_frame: None,
            flags: TransferFlags::empty(),
        }
    }

    pub fn control(endpoint: EndpointId, setup: SetupPacket, buffer: u64) -> Self {
        let direction = if setup.is_in() {
            Direction::In
        } else {
            Direction::Out
        };
        Self {
            setup: Some(setup),
            ..Self::bulk(endpoint, direction, buffer, u32::from(setup.length))
        }
    }

    pub fn isoch(
        endpoint: EndpointId,
        direction: Direction,
        buffer: u64,
        packets: Vec<IsoPacket>,
    ) -> Self {
        let length = packets
            .iter()
            .map(|packet| packet.offset + packet.length)
            .max()
            .unwrap_or(0);
        Self {
            iso_packets: packets,
            ..Self::bulk(endpoint, direction, buffer, length)
        }
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_in(&self) -> bool {
        self.direction == Direction::In
    }

    fn validate(&self, config: &EndpointConfig) -> Result<()> {
        match config.kind {
            EndpointType::Control => {
                let setup = self
                    .setup
                    .ok_or(Error::InvalidRequest("control transfer without setup packet"))?;
                if u32::from(setup.length) != self.length {
                    return Err(Error::InvalidRequest("setup length differs from buffer length"));
                }
            }
            EndpointType::Isoch => {
                if self.iso_packets.is_empty() {
                    return Err(Error::InvalidRequest("isochronous transfer without packets"));
                }
                if self
                    .iso_packets
                    .iter()
                    .any(|packet| packet.offset + packet.length > self.length)
                {
                    return Err(Error::InvalidRequest("isochronous packet past buffer end"));
                }
            }
            EndpointType::Bulk | EndpointType::Interrupt => {
                if self.setup.is_some() || !self.iso_packets.is_empty() {
                    return Err(Error::InvalidRequest(
                        "setup packet or frames on a bulk or interrupt endpoint",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsoFrameResult {
    pub status: Result<(), TransferError>,
    pub actual_length: u32,
}

impl Default for IsoFrameResult {
    fn default() -> Self {
        Self {
            status: Err(TransferError::MissedService),
            actual_length: 0,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferResult {
    pub status: Result<(), TransferError>,
    pub actual_length: u32,
    /// Per frame results of isochronous requests.
    pub frames: Vec<IsoFrameResult>,
}

/// Identifies a queued request. Stays unique after the request has been given back.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RequestId {
    key: usize,
    serial: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.serial)
    }
}

/// A queued request. Resolves once the request is given back.
pub struct TransferHandle {
    id: RequestId,
    result: CompletionFuture<TransferResult>,
}

impl TransferHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn wait(self) -> TransferResult {
        self.result.wait()
    }

    /// The result, if the request has been given back.
    pub fn try_result(&mut self) -> Option<TransferResult> {
        self.result.try_take()
    }
}

impl Future for TransferHandle {
    type Output = TransferResult;

    fn poll(mut self: Pin<&mut Self>, context: &mut task::Context) -> task::Poll<TransferResult> {
        Pin::new(&mut self.result).poll(context)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum CancelStatus {
    None,
    /// Cancelled, the controller may still have it cached.
    Dirty,
    /// The endpoint halted on it.
    Halted,
    /// Turned into no-ops, waiting for Set TR Dequeue Pointer to move past it.
    ClearingCache,
    ClearingCacheDeferred,
    /// Turned into no-ops, ready to be given back.
    Cleared,
}

pub(super) struct Td {
    pub urb: usize,
    pub endpoint: EndpointId,
    pub start: TrbPos,
    pub end: TrbPos,
    pub cancel_status: CancelStatus,
    pub status: Result<(), TransferError>,
    /// The actual length was taken from an earlier event of this TD.
    pub length_set: bool,
    /// An isochronous TRB before the last one failed.
    pub error_mid_td: bool,
    /// Segment whose bounce buffer holds the tail of this TD.
    pub bounce_seg: Option<usize>,
    /// Isochronous frame index.
    pub frame: usize,
    pub done: bool,
}

impl Td {
    fn new(urb: usize, endpoint: EndpointId, start: TrbPos, frame: usize) -> Self {
        Self {
            urb,
            endpoint,
            start,
            end: start,
            cancel_status: CancelStatus::None,
            status: Ok(()),
            length_set: false,
            error_mid_td: false,
            bounce_seg: None,
            frame,
            done: false,
        }
    }
}

pub(super) struct Urb {
    pub serial: u64,
    pub endpoint: EndpointId,
    pub request: TransferRequest,
    pub tds: SmallVec<[usize; 2]>,
    pub tds_done: usize,
    pub actual_length: u32,
    pub frames: Vec<IsoFrameResult>,
    pub unlinked: bool,
    pub status: Result<(), TransferError>,
    pub waiter: Option<Waiter<TransferResult>>,
}

/// Number of TRBs for `len` bytes at `addr`, none of them crossing a 64 KiB boundary.
pub(super) fn count_trbs(addr: u64, len: u32) -> usize {
    let offset = addr & u64::from(TRB_MAX_BUFF_SIZE - 1);
    let num = (u64::from(len) + offset + u64::from(TRB_MAX_BUFF_SIZE) - 1)
        / u64::from(TRB_MAX_BUFF_SIZE);
    num.max(1) as usize
}

/// Bytes a TRB at `addr` may carry before the next 64 KiB boundary.
fn len_up_to_boundary(addr: u64) -> u32 {
    TRB_MAX_BUFF_SIZE - (addr as u32 & (TRB_MAX_BUFF_SIZE - 1))
}

/// The TD Size field: packets left in the TD after this TRB (XHCI 4.11.2.4).
pub(super) fn td_remainder(
    hci_version: u16,
    mtk: bool,
    transferred: u32,
    trb_buff_len: u32,
    td_total_len: u32,
    max_packet: u32,
    more_trbs_coming: bool,
) -> u32 {
    // Before 1.0 the field counted bytes in KiB.
    if hci_version < 0x100 && !mtk {
        return (td_total_len - transferred) >> 10;
    }
    if !more_trbs_coming
        || (transferred == 0 && trb_buff_len == 0)
        || trb_buff_len == td_total_len
    {
        return 0;
    }
    // MTK 0.96 counts the current TRB too.
    let trb_buff_len = if mtk && hci_version < 0x100 {
        0
    } else {
        trb_buff_len
    };
    let total_packets = (td_total_len + max_packet - 1) / max_packet;
    total_packets.saturating_sub((transferred + trb_buff_len) / max_packet)
}

/// Transfer Burst Count of an isochronous TD, zero based.
pub(super) fn burst_count(hci_version: u16, speed: Speed, max_burst: u8, packets: u32) -> u32 {
    if hci_version < 0x100 || speed < Speed::Super {
        return 0;
    }
    let per_burst = u32::from(max_burst) + 1;
    (packets + per_burst - 1) / per_burst - 1
}

/// Transfer Last Burst Packet Count of an isochronous TD, zero based.
pub(super) fn last_burst_packet_count(
    hci_version: u16,
    speed: Speed,
    max_burst: u8,
    packets: u32,
) -> u32 {
    if hci_version < 0x100 {
        return 0;
    }
    if speed >= Speed::Super {
        let residue = packets % (u32::from(max_burst) + 1);
        if residue == 0 {
            return u32::from(max_burst);
        }
        return residue - 1;
    }
    packets.saturating_sub(1)
}

/// Whether the isochronous TD at `index` may suppress its completion interrupt.
fn block_event_intr(
    hci_version: u16,
    avoid_bei: bool,
    bei_interval: u32,
    num_tds: usize,
    index: usize,
) -> bool {
    if hci_version < 0x100 || index == num_tds - 1 {
        return false;
    }
    if index > 0 && bei_interval > 0 && avoid_bei {
        return index % bei_interval as usize != 0;
    }
    true
}

/// Makes the data queued up to the link TRB at the end of a segment a multiple of the max
/// packet size, either by shortening the TRB or by sending the tail through the segment's
/// bounce buffer. Returns the bounce buffer address when it is used.
fn align_td(
    dma: &mut dyn DmaAllocator,
    segment: &mut Segment,
    request: &TransferRequest,
    enqd_len: u32,
    trb_buff_len: &mut u32,
    max_packet: u32,
) -> Option<u64> {
    let unalign = (enqd_len + *trb_buff_len) % max_packet;
    if unalign == 0 {
        return None;
    }
    trace!("Unaligned {} bytes, buffer length {}", unalign, trb_buff_len);

    if *trb_buff_len > unalign {
        *trb_buff_len -= unalign;
        trace!("Split align, new buffer length {}", trb_buff_len);
        return None;
    }

    let new_len = (max_packet - enqd_len % max_packet).min(request.length - enqd_len);
    let bounce = match segment.bounce.as_mut() {
        Some(bounce) if new_len as usize <= bounce.size => bounce,
        _ => {
            warn!("No bounce buffer for {} unaligned bytes", new_len);
            return None;
        }
    };
    if !request.is_in() {
        dma.copy_dma(
            bounce.dma,
            request.buffer + u64::from(enqd_len),
            new_len as usize,
        );
    }
    *trb_buff_len = new_len;
    bounce.len = new_len;
    bounce.offset = enqd_len;
    debug!("Bounce align, new buffer length {}", new_len);
    Some(bounce.dma)
}

impl<H: HostController> Xhci<H> {
    /// Queues a transfer and returns a handle resolving once it is given back.
    pub fn queue_transfer(&self, request: TransferRequest) -> Result<TransferHandle> {
        let (completer, result) = completion::channel();
        let id = self.with_inner(|inner| inner.queue_urb(request, Waiter::Future(completer)))?;
        Ok(TransferHandle { id, result })
    }

    /// Queues a transfer; `callback` runs with its result once the engine lock is released.
    pub fn queue_transfer_with<F>(&self, request: TransferRequest, callback: F) -> Result<RequestId>
    where
        F: FnOnce(TransferResult) + Send + 'static,
    {
        self.with_inner(|inner| inner.queue_urb(request, Waiter::callback(callback)))
    }
}

impl<H: HostController> XhciInner<H> {
    pub(super) fn urb_key(&self, id: RequestId) -> Result<usize> {
        match self.urbs.get(id.key) {
            Some(urb) if urb.serial == id.serial => Ok(id.key),
            _ => Err(Error::NoRequest(id)),
        }
    }

    fn queue_urb(&mut self, request: TransferRequest, waiter: Waiter<TransferResult>) -> Result<RequestId> {
        if self.dying {
            return Err(Error::HostDied);
        }
        let config = self
            .endpoints
            .get(&request.endpoint)
            .ok_or(Error::NoEndpoint(request.endpoint))?
            .config;
        request.validate(&config)?;

        let serial = self.next_serial;
        self.next_serial += 1;
        let endpoint = request.endpoint;
        let frames = vec![IsoFrameResult::default(); request.iso_packets.len()];
        let key = self.urbs.insert(Urb {
            serial,
            endpoint,
            request,
            tds: SmallVec::new(),
            tds_done: 0,
            actual_length: 0,
            frames,
            unlinked: false,
            status: Ok(()),
            waiter: Some(waiter),
        });

        let queued = match config.kind {
            EndpointType::Control => self.queue_ctrl_tx(key),
            EndpointType::Isoch => self.queue_isoc_tx(key),
            EndpointType::Bulk | EndpointType::Interrupt => self.queue_bulk_tx(key),
        };
        if let Err(err) = queued {
            let urb = self.urbs.remove(key);
            if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                ep.ring.td_list.retain(|td| !urb.tds.contains(td));
            }
            for td in urb.tds {
                self.tds.try_remove(td);
            }
            return Err(err);
        }

        let id = RequestId { key, serial };
        trace!("Queued request {} on {}", id, endpoint);
        Ok(id)
    }

    /// Makes room for `num_trbs` TRBs and starts a TD at the enqueue pointer.
    fn prepare_transfer(
        &mut self,
        endpoint: EndpointId,
        num_trbs: usize,
        urb: usize,
        frame: usize,
    ) -> Result<usize> {
        let ctx = self.hc.endpoint_context(endpoint);
        let max_segments = self.config.max_ring_segments;
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        ep.ring
            .prepare(&mut self.hc, ctx.state, num_trbs, max_segments)?;

        let key = self
            .tds
            .insert(Td::new(urb, endpoint, ep.ring.enqueue, frame));
        ep.ring.td_list.push_back(key);
        self.urbs[urb].tds.push(key);
        Ok(key)
    }

    /// Hands the first TRB of a request to the controller, then rings the endpoint doorbell.
    fn giveback_first_trb(&mut self, endpoint: EndpointId, start: TrbPos, start_cycle: bool) {
        fence(Ordering::Release);
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.ring.trb_mut(start).set_cycle(start_cycle);
        }
        self.ring_ep_doorbell(endpoint);
    }

    pub(super) fn ring_ep_doorbell(&mut self, endpoint: EndpointId) {
        let ep = match self.endpoints.get(&endpoint) {
            Some(ep) => ep,
            None => return,
        };
        if ep.flags.blocks_doorbell() {
            trace!("Not ringing doorbell of {}, {:?}", endpoint, ep.flags);
            return;
        }
        self.hc.ring_doorbell(endpoint.slot, ep.doorbell_value());
    }

    /// Restarts the endpoint if it has TDs left.
    pub(super) fn ring_doorbell_for_active_rings(&mut self, endpoint: EndpointId) {
        let active = self
            .endpoints
            .get(&endpoint)
            .map_or(false, |ep| !ep.ring.td_list.is_empty());
        if active {
            self.ring_ep_doorbell(endpoint);
        }
    }

    fn queue_ctrl_tx(&mut self, urb_key: usize) -> Result<()> {
        let urb = &self.urbs[urb_key];
        let endpoint = urb.endpoint;
        let buffer = urb.request.buffer;
        let length = urb.request.length;
        let setup = urb
            .request
            .setup
            .ok_or(Error::InvalidRequest("control transfer without setup packet"))?;

        let num_trbs = if length > 0 { 3 } else { 2 };
        let td = self.prepare_transfer(endpoint, num_trbs, urb_key, 0)?;

        let version = self.config.hci_version;
        let mtk = self.quirks.contains(Quirks::MTK_HOST);
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        let max_packet = ep.config.max_packet();
        let ring = &mut ep.ring;
        let start = ring.enqueue;
        let start_cycle = ring.cycle_state;

        let transfer = if (version >= 0x100 || mtk) && length > 0 {
            if setup.is_in() {
                TransferKind::In
            } else {
                TransferKind::Out
            }
        } else {
            TransferKind::NoData
        };
        let mut trb = Trb::default();
        trb.setup(setup.to_u64(), transfer, !start_cycle);
        ring.enqueue(&trb, true);

        if length > 0 {
            let remainder = td_remainder(version, mtk, 0, length, length, max_packet, true);
            trb.data(buffer, length, remainder, setup.is_in(), ring.cycle_state);
            ring.enqueue(&trb, true);
        }

        // The device sent data, the status stage goes the other way.
        let status_in = !(length > 0 && setup.is_in());
        trb.status(0, status_in, true, false, false, ring.cycle_state);
        let end = ring.enqueue(&trb, false);
        self.tds[td].end = end;

        self.giveback_first_trb(endpoint, start, start_cycle);
        Ok(())
    }

    fn queue_bulk_tx(&mut self, urb_key: usize) -> Result<()> {
        let urb = &self.urbs[urb_key];
        let endpoint = urb.endpoint;
        let buffer = urb.request.buffer;
        let full_len = urb.request.length;
        let dir_in = urb.request.is_in();
        let zero_packet = urb.request.flags.contains(TransferFlags::ZERO_PACKET);

        let max_packet = self
            .endpoints
            .get(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?
            .config
            .max_packet();
        let need_zero_packet =
            zero_packet && !dir_in && full_len > 0 && full_len % max_packet == 0;
        let num_trbs = count_trbs(buffer, full_len);

        // Reserve the zero length TD too, so it cannot fail once the first one is written.
        let td = self.prepare_transfer(
            endpoint,
            num_trbs + usize::from(need_zero_packet),
            urb_key,
            0,
        )?;

        let version = self.config.hci_version;
        let mtk = self.quirks.contains(Quirks::MTK_HOST);
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        let ring = &mut ep.ring;
        let request = &self.urbs[urb_key].request;
        let start = ring.enqueue;
        let start_cycle = ring.cycle_state;

        let mut addr = buffer;
        let mut send_addr = addr;
        let mut enqd_len = 0;
        let mut first_trb = true;
        let mut more_trbs_coming = true;
        let mut trb = Trb::default();

        while first_trb || enqd_len < full_len {
            let mut field = trb_type(TrbType::Normal);
            let mut trb_buff_len = len_up_to_boundary(addr).min(full_len - enqd_len);

            // The first TRB goes to the controller last.
            if first_trb {
                first_trb = false;
                if !start_cycle {
                    field |= TRB_CYCLE;
                }
            } else {
                field |= u32::from(ring.cycle_state);
            }

            if enqd_len + trb_buff_len < full_len {
                field |= TRB_CHAIN;
                let next = TrbPos::new(ring.enqueue.seg, ring.enqueue.idx + 1);
                if ring.is_link(next) {
                    let seg = ring.enqueue.seg;
                    if let Some(bounce) = align_td(
                        &mut self.hc,
                        ring.segment_mut(seg),
                        request,
                        enqd_len,
                        &mut trb_buff_len,
                        max_packet,
                    ) {
                        send_addr = bounce;
                        self.tds[td].bounce_seg = Some(seg);
                    }
                }
            }
            let last = enqd_len + trb_buff_len >= full_len;
            if last {
                field &= !TRB_CHAIN;
                field |= TRB_IOC;
                more_trbs_coming = false;
            }
            if dir_in {
                field |= TRB_ISP;
            }

            let remainder = td_remainder(
                version,
                mtk,
                enqd_len,
                trb_buff_len,
                full_len,
                max_packet,
                more_trbs_coming,
            );
            trb.set(
                send_addr,
                trb_len(trb_buff_len) | trb_td_size(remainder) | trb_intr_target(0),
                field,
            );
            let pos = ring.enqueue(&trb, more_trbs_coming || need_zero_packet);
            if last {
                self.tds[td].end = pos;
            }

            addr += u64::from(trb_buff_len);
            enqd_len += trb_buff_len;
            send_addr = addr;
        }

        if need_zero_packet {
            let zero_td = self.prepare_transfer(endpoint, 1, urb_key, 0)?;
            let ring = &mut self
                .endpoints
                .get_mut(&endpoint)
                .ok_or(Error::NoEndpoint(endpoint))?
                .ring;
            trb.set(
                0,
                trb_intr_target(0),
                trb_type(TrbType::Normal) | u32::from(ring.cycle_state) | TRB_IOC,
            );
            let pos = ring.enqueue(&trb, false);
            self.tds[zero_td].end = pos;
        }

        self.giveback_first_trb(endpoint, start, start_cycle);
        Ok(())
    }

    fn queue_isoc_tx(&mut self, urb_key: usize) -> Result<()> {
        let urb = &self.urbs[urb_key];
        let endpoint = urb.endpoint;
        let buffer = urb.request.buffer;
        let dir_in = urb.request.is_in();
        let start_frame = urb.request.start_frame;
        let packets = urb.request.iso_packets.clone();

        let version = self.config.hci_version;
        let mtk = self.quirks.contains(Quirks::MTK_HOST);
        let avoid_bei = self.quirks.contains(Quirks::AVOID_BEI);
        let bei_interval = self.events.isoc_bei_interval;
        let max_segments = self.config.max_ring_segments;

        let ctx = self.hc.endpoint_context(endpoint);
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        let config = ep.config;
        let max_packet = config.max_packet();

        // Room for every frame before anything is written.
        let total_trbs = packets
            .iter()
            .map(|packet| count_trbs(buffer + u64::from(packet.offset), packet.length))
            .sum();
        ep.ring
            .prepare(&mut self.hc, ctx.state, total_trbs, max_segments)?;
        let start = ep.ring.enqueue;
        let start_cycle = ep.ring.cycle_state;

        let num_tds = packets.len();
        let mut trb = Trb::default();
        for (i, packet) in packets.iter().enumerate() {
            let mut addr = buffer + u64::from(packet.offset);
            let td_len = packet.length;
            let total_packets = ((td_len + max_packet - 1) / max_packet).max(1);
            let burst = burst_count(version, config.speed, config.max_burst, total_packets);
            let last_burst =
                last_burst_packet_count(version, config.speed, config.max_burst, total_packets);
            let trbs_per_td = count_trbs(addr, td_len);

            let td = match self.prepare_transfer(endpoint, trbs_per_td, urb_key, i) {
                Ok(td) => td,
                Err(err) => {
                    if i > 0 {
                        self.unwind_isoc_tx(endpoint, urb_key, start, start_cycle);
                    }
                    return Err(err);
                }
            };

            let sia_frame_id = match start_frame {
                Some(frame) => trb_frame_id(u32::from(frame) + i as u32 * config.interval),
                None => TRB_SIA,
            };
            let ring = &mut self
                .endpoints
                .get_mut(&endpoint)
                .ok_or(Error::NoEndpoint(endpoint))?
                .ring;
            let first_cycle = if i == 0 {
                !start_cycle
            } else {
                ring.cycle_state
            };
            let mut field = trb_type(TrbType::Isoch)
                | trb_tlbpc(last_burst)
                | sia_frame_id
                | trb_tbc(burst)
                | u32::from(first_cycle);

            let mut running_total = 0;
            let mut remaining = td_len;
            for j in 0..trbs_per_td {
                if j > 0 {
                    field = trb_type(TrbType::Normal) | u32::from(ring.cycle_state);
                }
                if dir_in {
                    field |= TRB_ISP;
                }
                let more_trbs_coming = j < trbs_per_td - 1;
                if more_trbs_coming {
                    field |= TRB_CHAIN;
                } else {
                    field |= TRB_IOC;
                    if block_event_intr(version, avoid_bei, bei_interval, num_tds, i) {
                        field |= TRB_BEI;
                    }
                }

                let trb_buff_len = len_up_to_boundary(addr).min(remaining);
                let remainder = td_remainder(
                    version,
                    mtk,
                    running_total,
                    trb_buff_len,
                    td_len,
                    max_packet,
                    more_trbs_coming,
                );
                trb.set(
                    addr,
                    trb_len(trb_buff_len) | trb_td_size(remainder) | trb_intr_target(0),
                    field,
                );
                let pos = ring.enqueue(&trb, more_trbs_coming);
                if !more_trbs_coming {
                    self.tds[td].end = pos;
                }
                running_total += trb_buff_len;
                addr += u64::from(trb_buff_len);
                remaining -= trb_buff_len;
            }

            if running_total != td_len {
                error!(
                    "Isochronous TD length mismatch, queued {} of {} bytes",
                    running_total, td_len
                );
                self.unwind_isoc_tx(endpoint, urb_key, start, start_cycle);
                return Err(Error::InvalidRequest("isochronous TD length mismatch"));
            }
        }

        self.giveback_first_trb(endpoint, start, start_cycle);
        Ok(())
    }

    /// Turns a partially queued isochronous request into software owned no-ops and rewinds the
    /// enqueue pointer to its start.
    fn unwind_isoc_tx(&mut self, endpoint: EndpointId, urb_key: usize, start: TrbPos, start_cycle: bool) {
        let keys = self.urbs[urb_key].tds.clone();
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.ring.td_list.retain(|td| !keys.contains(td));
            let end = ep.ring.enqueue;
            ep.ring.td_to_noop(start, end, true);
            ep.ring.enqueue = start;
            ep.ring.cycle_state = start_cycle;
        }
    }

    /// Copies data received through a bounce buffer into the request buffer.
    fn unmap_bounce(&mut self, endpoint: EndpointId, seg: usize, urb_key: usize) {
        let request = match self.urbs.get(urb_key) {
            Some(urb) => &urb.request,
            None => return,
        };
        let ep = match self.endpoints.get_mut(&endpoint) {
            Some(ep) => ep,
            None => return,
        };
        if let Some(bounce) = ep.ring.segment_mut(seg).bounce.as_mut() {
            if request.is_in() && bounce.len > 0 {
                self.hc.copy_dma(
                    request.buffer + u64::from(bounce.offset),
                    bounce.dma,
                    bounce.len as usize,
                );
            }
            bounce.offset = 0;
            bounce.len = 0;
        }
    }

    /// Moves the ring dequeue pointer past the TD and completes it.
    pub(super) fn dequeue_td(&mut self, endpoint: EndpointId, td: usize) {
        let end = match self.tds.get(td) {
            Some(td) => td.end,
            None => return,
        };
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.ring.dequeue = end;
            ep.ring.inc_deq();
        }
        self.td_cleanup(td);
    }

    /// Takes a finished TD off its lists. The request is given back with its last TD.
    pub(super) fn td_cleanup(&mut self, key: usize) {
        let (urb_key, endpoint, mut status, bounce_seg) = match self.tds.get(key) {
            Some(td) if !td.done => (td.urb, td.endpoint, td.status, td.bounce_seg),
            _ => return,
        };
        if let Some(seg) = bounce_seg {
            self.unmap_bounce(endpoint, seg, urb_key);
        }

        let urb = match self.urbs.get_mut(urb_key) {
            Some(urb) => urb,
            None => {
                warn!("TD {} belongs to no request", key);
                return;
            }
        };
        if urb.actual_length > urb.request.length {
            warn!(
                "Controller reported {} bytes for a {} byte request",
                urb.actual_length, urb.request.length
            );
            urb.actual_length = 0;
            status = Ok(());
        }

        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.ring.td_list.retain(|&td| td != key);
            ep.cancelled.retain(|&td| td != key);
        }
        self.tds[key].done = true;

        urb.tds_done += 1;
        match status {
            Err(err @ (TransferError::HostDied | TransferError::Shutdown)) => urb.status = Err(err),
            Err(err) if urb.status.is_ok() => urb.status = Err(err),
            _ => (),
        }
        if urb.tds_done >= urb.tds.len() {
            self.giveback_urb(urb_key);
        }
    }

    fn giveback_urb(&mut self, urb_key: usize) {
        let urb = self.urbs.remove(urb_key);
        for &td in urb.tds.iter() {
            self.tds.try_remove(td);
        }

        let isoc = !urb.request.iso_packets.is_empty();
        let status = match urb.status {
            Err(err @ (TransferError::HostDied | TransferError::Shutdown)) => Err(err),
            _ if urb.unlinked => Err(TransferError::Cancelled),
            _ if isoc => Ok(()),
            Ok(())
                if urb.request.flags.contains(TransferFlags::SHORT_NOT_OK)
                    && urb.actual_length < urb.request.length =>
            {
                Err(TransferError::ShortPacket)
            }
            status => status,
        };
        debug!(
            "Giving back request #{} on {}: {:?}, {} of {} bytes",
            urb.serial, urb.endpoint, status, urb.actual_length, urb.request.length
        );

        let result = TransferResult {
            status,
            actual_length: urb.actual_length,
            frames: urb.frames,
        };
        if let Some(waiter) = urb.waiter {
            self.continuations.push(waiter.into_continuation(result));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trbs_never_cross_64k() {
        assert_eq!(count_trbs(0x1_0000, 0), 1);
        assert_eq!(count_trbs(0x1_0000, 0x1_0000), 1);
        assert_eq!(count_trbs(0x1_0000, 0x1_0001), 2);
        assert_eq!(count_trbs(0x1_FFF0, 0x20), 2);
        assert_eq!(count_trbs(0x1_8000, 0x2_0000), 3);
        assert_eq!(len_up_to_boundary(0x1_FFF0), 0x10);
        assert_eq!(len_up_to_boundary(0x2_0000), 0x1_0000);
    }

    #[test]
    fn td_size() {
        // Last TRB and single TRB TDs report zero.
        assert_eq!(td_remainder(0x110, false, 0, 512, 1024, 512, false), 0);
        assert_eq!(td_remainder(0x110, false, 0, 1024, 1024, 512, true), 0);
        assert_eq!(td_remainder(0x110, false, 0, 0, 0, 512, true), 0);
        // Packets left after this TRB.
        assert_eq!(td_remainder(0x110, false, 0, 1000, 3000, 512, true), 5);
        assert_eq!(td_remainder(0x110, false, 1000, 1000, 3000, 512, true), 3);
        // Bytes in KiB before 1.0.
        assert_eq!(td_remainder(0x96, false, 1024, 1024, 4096, 512, true), 3);
        // MTK 0.96 counts the current TRB.
        assert_eq!(td_remainder(0x96, true, 1000, 1000, 3000, 512, true), 5);
    }

    #[test]
    fn burst_counts() {
        // Only SuperSpeed endpoints burst.
        assert_eq!(burst_count(0x110, Speed::High, 3, 8), 0);
        assert_eq!(burst_count(0x96, Speed::Super, 3, 8), 0);
        assert_eq!(burst_count(0x110, Speed::Super, 3, 8), 1);
        assert_eq!(burst_count(0x110, Speed::Super, 3, 9), 2);

        assert_eq!(last_burst_packet_count(0x110, Speed::Super, 3, 8), 3);
        assert_eq!(last_burst_packet_count(0x110, Speed::Super, 3, 9), 0);
        assert_eq!(last_burst_packet_count(0x110, Speed::High, 0, 3), 2);
        assert_eq!(last_burst_packet_count(0x96, Speed::High, 0, 3), 0);
    }

    #[test]
    fn event_interrupt_blocking() {
        assert!(block_event_intr(0x110, false, 32, 4, 0));
        assert!(block_event_intr(0x110, false, 32, 4, 2));
        assert!(!block_event_intr(0x110, false, 32, 4, 3));
        assert!(!block_event_intr(0x96, false, 32, 4, 0));
        // Interrupt every 8th TD when blocking is avoided.
        assert!(block_event_intr(0x110, true, 8, 20, 7));
        assert!(!block_event_intr(0x110, true, 8, 20, 8));
    }

    #[test]
    fn setup_packet_layout() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        assert_eq!(setup.to_u64(), 0x0012_0000_0100_0680);
        assert!(setup.is_in());
        let request = TransferRequest::control(EndpointId::new(1, 0), setup, 0x1000);
        assert_eq!(request.direction, Direction::In);
        assert_eq!(request.length, 18);
    }

    #[test]
    fn requests_match_endpoint_type() {
        let id = EndpointId::new(1, 2);
        let bulk = EndpointConfig::new(id, EndpointType::Bulk, 512);
        let isoc = EndpointConfig::new(id, EndpointType::Isoch, 1024);

        assert!(TransferRequest::bulk(id, Direction::In, 0x1000, 64)
            .validate(&bulk)
            .is_ok());
        assert!(TransferRequest::bulk(id, Direction::In, 0x1000, 64)
            .validate(&isoc)
            .is_err());

        let packets = vec![
            IsoPacket {
                offset: 0,
                length: 100,
            },
            IsoPacket {
                offset: 100,
                length: 50,
            },
        ];
        let request = TransferRequest::isoch(id, Direction::Out, 0x1000, packets);
        assert_eq!(request.length, 150);
        assert!(request.validate(&isoc).is_ok());
    }
}
