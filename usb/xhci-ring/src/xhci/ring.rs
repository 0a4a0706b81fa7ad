use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{fence, Ordering};

use common::io::Io;
use log::{debug, error, trace, warn};

use crate::error::{Error, Result};

use super::endpoint::EndpointState;
use super::regs::DmaAllocator;
use super::trb::{Trb, TrbType, LINK_TOGGLE, TRB_CHAIN, TRB_CYCLE};

pub const TRB_SIZE: usize = mem::size_of::<Trb>();

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RingKind {
    Command,
    Transfer,
    Isoc,
    Event,
}

/// A TRB slot, as a segment handle and an index within that segment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TrbPos {
    pub seg: usize,
    pub idx: usize,
}

impl TrbPos {
    pub const fn new(seg: usize, idx: usize) -> Self {
        Self { seg, idx }
    }
}

/// Per segment buffer holding the unaligned tail of a TD that would otherwise straddle a link.
#[derive(Clone, Copy, Debug)]
pub struct BounceBuffer {
    pub dma: u64,
    pub size: usize,
    /// Offset into the request buffer the bounced bytes belong to.
    pub offset: u32,
    pub len: u32,
}

pub struct Segment {
    pub trbs: Box<[Trb]>,
    pub dma: u64,
    /// Handle of the following segment in ring order.
    pub next: usize,
    /// Position in ring order, the first segment is 0.
    pub num: u32,
    pub bounce: Option<BounceBuffer>,
}

impl Segment {
    fn size(&self) -> usize {
        self.trbs.len() * TRB_SIZE
    }
    fn contains(&self, address: u64) -> bool {
        address >= self.dma && address < self.dma + self.size() as u64
    }
}

/// A ring of TRB segments. Producer rings end every segment in a link TRB, the link of the last
/// segment toggles the cycle state. Event rings have no links and are walked through their
/// segment table.
///
/// Segments are kept in an arena and addressed by handle, so that a TD can keep pointing at its
/// TRBs across ring expansion.
pub struct Ring {
    segments: Vec<Segment>,
    first: usize,
    last: usize,
    num_segs: usize,
    trbs_per_segment: usize,
    kind: RingKind,
    chain_links: bool,
    bounce_size: usize,

    pub enqueue: TrbPos,
    pub dequeue: TrbPos,
    /// Producer cycle state for producer rings, consumer cycle state for the event ring.
    pub cycle_state: bool,

    /// TDs queued on this ring, oldest first.
    pub td_list: VecDeque<usize>,
    /// Completion code of the last transfer event handled on this ring.
    pub old_trb_comp_code: u8,
}

impl Ring {
    pub fn new(
        dma: &mut dyn DmaAllocator,
        kind: RingKind,
        num_segs: usize,
        trbs_per_segment: usize,
        chain_links: bool,
        bounce_size: usize,
    ) -> Result<Ring> {
        if num_segs == 0 || trbs_per_segment < 2 {
            return Err(Error::Config(format!(
                "cannot build a ring of {} segments with {} TRBs each",
                num_segs, trbs_per_segment
            )));
        }
        let mut ring = Ring {
            segments: Vec::with_capacity(num_segs),
            first: 0,
            last: 0,
            num_segs: 0,
            trbs_per_segment,
            kind,
            chain_links,
            bounce_size,
            enqueue: TrbPos::default(),
            dequeue: TrbPos::default(),
            cycle_state: true,
            td_list: VecDeque::new(),
            old_trb_comp_code: 0,
        };

        let (first, last) = ring.alloc_segments(dma, num_segs, true)?;
        ring.first = first;
        ring.last = last;
        ring.num_segs = num_segs;
        ring.link_segments(last, first);
        if kind != RingKind::Event {
            ring.segments[last].trbs[trbs_per_segment - 1]
                .control
                .writef(LINK_TOGGLE, true);
        }
        ring.renumber();
        ring.enqueue = TrbPos::new(first, 0);
        ring.dequeue = ring.enqueue;

        debug!(
            "Allocated {:?} ring, {} segments of {} TRBs",
            kind, num_segs, trbs_per_segment
        );
        Ok(ring)
    }

    /// Allocates a chain of `count` segments whose TRBs are owned by software for a producer
    /// cycle state of `cycle_state`. Returns the handles of the first and last new segment.
    fn alloc_segments(
        &mut self,
        dma: &mut dyn DmaAllocator,
        count: usize,
        cycle_state: bool,
    ) -> Result<(usize, usize)> {
        let start = self.segments.len();
        let size = self.trbs_per_segment * TRB_SIZE;

        for i in 0..count {
            let address = match dma.alloc_dma(size) {
                Ok(address) => address,
                Err(err) => {
                    self.release_from(dma, start);
                    return Err(err);
                }
            };
            let bounce = if self.bounce_size > 0 {
                match dma.alloc_dma(self.bounce_size) {
                    Ok(bounce) => Some(BounceBuffer {
                        dma: bounce,
                        size: self.bounce_size,
                        offset: 0,
                        len: 0,
                    }),
                    Err(err) => {
                        dma.free_dma(address, size);
                        self.release_from(dma, start);
                        return Err(err);
                    }
                }
            } else {
                None
            };

            let mut trbs = vec![Trb::default(); self.trbs_per_segment].into_boxed_slice();
            if !cycle_state {
                for trb in trbs.iter_mut() {
                    trb.control.write(TRB_CYCLE);
                }
            }
            self.segments.push(Segment {
                trbs,
                dma: address,
                next: start + i + 1,
                num: 0,
                bounce,
            });
        }

        let last = self.segments.len() - 1;
        for seg in start..last {
            self.link_segments(seg, seg + 1);
        }
        Ok((start, last))
    }

    fn release_from(&mut self, dma: &mut dyn DmaAllocator, start: usize) {
        for segment in self.segments.drain(start..) {
            dma.free_dma(segment.dma, segment.size());
            if let Some(bounce) = segment.bounce {
                dma.free_dma(bounce.dma, bounce.size);
            }
        }
    }

    /// Points `prev` at `next`. The link keeps its cycle and toggle bits.
    fn link_segments(&mut self, prev: usize, next: usize) {
        self.segments[prev].next = next;
        if self.kind == RingKind::Event {
            return;
        }
        let next_dma = self.segments[next].dma;
        let chain = self.chain_links;
        let link = &mut self.segments[prev].trbs[self.trbs_per_segment - 1];
        let (toggle, cycle) = (link.link_toggles_cycle(), link.cycle());
        link.link(next_dma, toggle, chain, cycle);
    }

    fn renumber(&mut self) {
        let mut seg = self.first;
        for num in 0..self.num_segs {
            self.segments[seg].num = num as u32;
            seg = self.segments[seg].next;
        }
    }

    /// Inserts `num_new` segments right after the enqueue segment.
    pub fn expand(&mut self, dma: &mut dyn DmaAllocator, num_new: usize) -> Result<()> {
        let (first, last) = self.alloc_segments(dma, num_new, self.cycle_state)?;
        let enq_seg = self.enqueue.seg;
        let old_next = self.segments[enq_seg].next;

        self.link_segments(enq_seg, first);
        self.link_segments(last, old_next);
        self.num_segs += num_new;

        if enq_seg == self.last {
            if self.kind != RingKind::Event {
                let n = self.trbs_per_segment;
                self.segments[enq_seg].trbs[n - 1]
                    .control
                    .writef(LINK_TOGGLE, false);
                self.segments[last].trbs[n - 1]
                    .control
                    .writef(LINK_TOGGLE, true);
            }
            self.last = last;
        }
        self.renumber();

        debug!(
            "Expanded {:?} ring by {} segments, now {}",
            self.kind, num_new, self.num_segs
        );
        Ok(())
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }
    pub fn num_segs(&self) -> usize {
        self.num_segs
    }
    pub fn trbs_per_segment(&self) -> usize {
        self.trbs_per_segment
    }
    pub fn first_seg(&self) -> usize {
        self.first
    }
    pub fn last_seg(&self) -> usize {
        self.last
    }
    pub fn segment(&self, seg: usize) -> &Segment {
        &self.segments[seg]
    }
    pub fn segment_mut(&mut self, seg: usize) -> &mut Segment {
        &mut self.segments[seg]
    }
    /// Segments in ring order, starting with the first.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        let mut seg = self.first;
        (0..self.num_segs).map(move |_| {
            let segment = &self.segments[seg];
            seg = segment.next;
            segment
        })
    }

    pub fn trb(&self, pos: TrbPos) -> &Trb {
        &self.segments[pos.seg].trbs[pos.idx]
    }
    pub fn trb_mut(&mut self, pos: TrbPos) -> &mut Trb {
        &mut self.segments[pos.seg].trbs[pos.idx]
    }
    pub fn trb_dma(&self, pos: TrbPos) -> u64 {
        self.segments[pos.seg].dma + (pos.idx * TRB_SIZE) as u64
    }
    pub fn dma_to_pos(&self, address: u64) -> Option<TrbPos> {
        if address & 0xF != 0 {
            return None;
        }
        self.segments
            .iter()
            .position(|segment| segment.contains(address))
            .map(|seg| {
                let idx = (address - self.segments[seg].dma) as usize / TRB_SIZE;
                TrbPos::new(seg, idx)
            })
    }

    /// The enqueue pointer in the format of CRCR and the TR Dequeue Pointer field.
    pub fn register(&self) -> u64 {
        self.trb_dma(self.enqueue) | u64::from(self.cycle_state)
    }

    fn last_trb_on_seg(&self, pos: TrbPos) -> bool {
        pos.idx == self.trbs_per_segment - 1
    }
    pub fn is_link(&self, pos: TrbPos) -> bool {
        self.kind != RingKind::Event && self.trb(pos).is_link()
    }

    /// The slot following `pos`, following a link TRB or, on event rings, the segment table.
    pub fn next_trb(&self, pos: TrbPos) -> TrbPos {
        if self.is_link(pos) || self.last_trb_on_seg(pos) {
            TrbPos::new(self.segments[pos.seg].next, 0)
        } else {
            TrbPos::new(pos.seg, pos.idx + 1)
        }
    }

    /// Writes `trb` at the enqueue pointer, control dword last, and advances. Returns where it
    /// was written.
    pub fn enqueue(&mut self, trb: &Trb, more_trbs_coming: bool) -> TrbPos {
        let pos = self.enqueue;
        let fields = trb.fields();
        self.trb_mut(pos).publish(fields);
        trace!("{:?} ring: queued {} at {:?}", self.kind, trb, pos);
        self.inc_enq(more_trbs_coming);
        pos
    }

    /// Advances the enqueue pointer by one slot. A link is only crossed while a TD is being
    /// built, so that an idle ring never hands an unused link to the controller.
    pub fn inc_enq(&mut self, more_trbs_coming: bool) {
        let chain = self.trb(self.enqueue).chain();

        if self.last_trb_on_seg(self.enqueue) {
            error!("{:?} ring: enqueue moved past a segment end", self.kind);
            return;
        }
        self.enqueue.idx += 1;

        if !self.is_link(self.enqueue) || !(chain || more_trbs_coming) {
            return;
        }
        self.inc_enq_past_link(chain);
    }

    /// Hands the link TRBs at the enqueue pointer over to the controller.
    pub fn inc_enq_past_link(&mut self, chain: bool) {
        let mut crossed = 0;
        while self.is_link(self.enqueue) {
            let cycle = self.cycle_state;
            let chain_links = self.chain_links;
            let pos = self.enqueue;
            let link = self.trb_mut(pos);

            if !chain_links {
                link.control.writef(TRB_CHAIN, chain);
            }
            // The rest of the TD has to be visible before the link is.
            fence(Ordering::Release);
            link.set_cycle(cycle);
            let toggles = link.link_toggles_cycle();

            if toggles {
                self.cycle_state = !self.cycle_state;
            }
            self.enqueue = TrbPos::new(self.segments[pos.seg].next, 0);

            crossed += 1;
            if crossed > self.num_segs {
                warn!("{:?} ring: link TRB loop at enqueue", self.kind);
                break;
            }
        }
    }

    /// Advances the dequeue pointer past the slot just consumed. On the event ring this flips
    /// the consumer cycle state when wrapping to the first segment.
    pub fn inc_deq(&mut self) {
        if self.kind == RingKind::Event {
            if !self.last_trb_on_seg(self.dequeue) {
                self.dequeue.idx += 1;
                return;
            }
            if self.dequeue.seg == self.last {
                self.cycle_state = !self.cycle_state;
            }
            self.dequeue = TrbPos::new(self.segments[self.dequeue.seg].next, 0);
            return;
        }

        if !self.is_link(self.dequeue) {
            if self.last_trb_on_seg(self.dequeue) {
                warn!("{:?} ring: dequeue moved past a segment end", self.kind);
                return;
            }
            self.dequeue.idx += 1;
        }

        let mut crossed = 0;
        while self.is_link(self.dequeue) {
            self.dequeue = TrbPos::new(self.segments[self.dequeue.seg].next, 0);
            crossed += 1;
            if crossed > self.num_segs {
                warn!("{:?} ring: link TRB loop at dequeue", self.kind);
                break;
            }
        }
    }

    /// True when the producer has nothing outstanding. Enqueue parked on a link counts as
    /// being at the start of the next segment.
    pub fn is_empty(&self) -> bool {
        let mut enq = self.enqueue;
        if self.is_link(enq) {
            enq = self.next_trb(enq);
        }
        enq == self.dequeue
    }

    /// Free TRB slots, not counting link TRBs.
    pub fn num_trbs_free(&self) -> usize {
        let usable = self.trbs_per_segment - 1;
        let mut enq = self.enqueue;
        if self.is_link(enq) {
            enq = TrbPos::new(self.segments[enq.seg].next, 0);
        }
        if enq == self.dequeue {
            return self.num_segs * usable;
        }

        let mut free = 0;
        for _ in 0..=self.num_segs {
            if self.dequeue.seg == enq.seg && self.dequeue.idx >= enq.idx {
                return free + (self.dequeue.idx - enq.idx);
            }
            free += usable - enq.idx;
            enq = TrbPos::new(self.segments[enq.seg].next, 0);
        }
        free
    }

    /// Number of segments to insert so that `num_trbs` can be queued without the enqueue
    /// pointer reaching the dequeue segment. Segments between the two still count as room.
    pub fn expansion_needed(&self, num_trbs: usize) -> usize {
        let usable = (self.trbs_per_segment - 1) as isize;
        let past_seg = self.enqueue.idx as isize + num_trbs as isize - usable;
        if past_seg < 0 {
            return 0;
        }

        let mut seg = self.enqueue.seg;
        if self.is_link(self.enqueue)
            && TrbPos::new(self.segments[seg].next, 0) == self.dequeue
        {
            return 0;
        }

        let mut new_segs = 1 + (past_seg / usable) as usize;
        while new_segs > 0 {
            seg = self.segments[seg].next;
            if seg == self.dequeue.seg {
                return new_segs;
            }
            new_segs -= 1;
        }
        0
    }

    /// Gets room for `num_trbs` TRBs at the enqueue pointer, growing transfer rings up to
    /// `max_segments`.
    pub fn prepare(
        &mut self,
        dma: &mut dyn DmaAllocator,
        state: EndpointState,
        num_trbs: usize,
        max_segments: usize,
    ) -> Result<()> {
        match state {
            EndpointState::Disabled => {
                warn!("Request submitted to a disabled endpoint");
                return Err(Error::InvalidState(state));
            }
            EndpointState::Error => {
                warn!("Endpoint is in the error state, waiting for it to be cleared");
                return Err(Error::InvalidState(state));
            }
            EndpointState::Halted => {
                debug!("Endpoint halted, queueing anyway, the reset will clear it");
            }
            EndpointState::Stopped | EndpointState::Running => (),
            EndpointState::Reserved(raw) => {
                error!("Unknown endpoint state {}", raw);
                return Err(Error::InvalidState(state));
            }
        }

        if self.kind == RingKind::Command {
            if self.num_trbs_free() <= num_trbs {
                warn!("Command ring full");
                return Err(Error::NoRoom { needed: num_trbs });
            }
        } else {
            let new_segs = self.expansion_needed(num_trbs);
            if new_segs > 0 {
                if self.num_segs + new_segs > max_segments {
                    warn!(
                        "{:?} ring cannot grow by {} segments past {}",
                        self.kind, new_segs, self.num_segs
                    );
                    return Err(Error::NoRoom { needed: num_trbs });
                }
                self.expand(dma, new_segs)?;
            }
        }

        if self.is_link(self.enqueue) {
            self.inc_enq_past_link(false);
        }
        if self.last_trb_on_seg(self.enqueue) {
            return Err(Error::Corrupt(format!(
                "{:?} ring: no link TRB at the end of segment {}",
                self.kind, self.segments[self.enqueue.seg].num
            )));
        }
        Ok(())
    }

    /// Finds the TRB at `address` within the TD spanning `start..=end`, which may wrap around
    /// inside a single segment.
    pub fn trb_in_td(&self, start: TrbPos, end: TrbPos, address: u64) -> Option<TrbPos> {
        let suspect = self.dma_to_pos(address)?;
        let mut seg = start.seg;
        let mut start_idx = start.idx;

        for _ in 0..self.num_segs {
            if seg == end.seg {
                let found = if start_idx <= end.idx {
                    suspect.seg == seg && suspect.idx >= start_idx && suspect.idx <= end.idx
                } else {
                    suspect.seg == seg && (suspect.idx >= start_idx || suspect.idx <= end.idx)
                };
                return if found { Some(suspect) } else { None };
            }
            if suspect.seg == seg && suspect.idx >= start_idx {
                return Some(suspect);
            }
            seg = self.segments[seg].next;
            start_idx = 0;
            if seg == start.seg {
                break;
            }
        }
        None
    }

    /// Overwrites `start..=end` with no-ops, keeping cycle bits. With `flip_cycle` every TRB
    /// but the first and last is handed back to software.
    pub fn td_to_noop(&mut self, start: TrbPos, end: TrbPos, flip_cycle: bool) {
        let noop = if self.kind == RingKind::Command {
            TrbType::NoOpCmd
        } else {
            TrbType::NoOp
        };
        let limit = self.num_segs * self.trbs_per_segment;
        let mut pos = start;
        for _ in 0..limit {
            let trb = self.trb_mut(pos);
            trb.to_noop(noop);
            if flip_cycle && pos != start && pos != end {
                trb.toggle_cycle();
            }
            if pos == end {
                return;
            }
            pos = self.next_trb(pos);
        }
        warn!("{:?} ring: TD end {:?} not reached from {:?}", self.kind, end, start);
    }

    /// Forgets every queued TRB and moves both pointers to the start of the first segment with
    /// cycle state 1. Only valid while the controller is not reading the ring.
    pub fn reset(&mut self) {
        let n = self.trbs_per_segment;
        for segment in self.segments.iter_mut() {
            for trb in segment.trbs[..n - 1].iter_mut() {
                trb.set(0, 0, 0);
            }
            if self.kind != RingKind::Event {
                segment.trbs[n - 1].control.writef(TRB_CYCLE, false);
            }
        }
        self.enqueue = TrbPos::new(self.first, 0);
        self.dequeue = self.enqueue;
        self.cycle_state = true;
        self.td_list.clear();
        debug!("{:?} ring reset", self.kind);
    }

    pub fn free(&mut self, dma: &mut dyn DmaAllocator) {
        self.release_from(dma, 0);
        self.num_segs = 0;
        self.td_list.clear();
    }
}
