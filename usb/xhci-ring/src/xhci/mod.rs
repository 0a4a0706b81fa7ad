//! The ring engine of an XHCI host controller driver.
//!
//! [`Xhci`] owns the command ring, the primary event ring and one transfer ring per endpoint.
//! Everything behind it is guarded by a single lock; work that has to happen once a request
//! completes (waking a future, running a callback) is queued while the lock is held and run after
//! it has been released.
use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use common::timeout::{Clock, Timeout};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};
use slab::Slab;

use crate::completion::Continuation;
use crate::config::{Quirks, XhciConfig};
use crate::error::{Error, Result, TransferError};

mod cancel;
mod command;
pub mod doorbell;
pub mod endpoint;
pub mod event;
mod irq_reactor;
pub mod regs;
pub mod ring;
mod transfer;
pub mod trb;

pub use self::command::{Command, CommandCompletion, CommandHandle, CommandRingState};
pub use self::endpoint::{
    Direction, EndpointConfig, EndpointContext, EndpointId, EndpointState, EndpointType, EpFlags,
    Speed,
};
pub use self::irq_reactor::HostEvent;
pub use self::regs::{DmaAllocator, HostController};
pub use self::transfer::{
    IsoFrameResult, IsoPacket, RequestId, SetupPacket, TransferFlags, TransferHandle,
    TransferRequest, TransferResult,
};

use self::command::CommandRing;
use self::endpoint::Endpoint;
use self::event::EventRing;
use self::ring::{Ring, RingKind};
use self::transfer::{Td, Urb};

pub struct Xhci<H: HostController> {
    inner: Mutex<XhciInner<H>>,
    host_events: Receiver<HostEvent>,
}

pub(crate) struct XhciInner<H: HostController> {
    hc: H,
    config: XhciConfig,
    quirks: Quirks,
    clock: Arc<dyn Clock>,

    cmd: CommandRing,
    events: EventRing,
    endpoints: BTreeMap<EndpointId, Endpoint>,

    tds: Slab<Td>,
    urbs: Slab<Urb>,
    next_serial: u64,

    /// Set once the controller stopped responding. Never cleared.
    dying: bool,
    host_event_sender: Sender<HostEvent>,
    /// Run in order once the lock is released.
    continuations: Vec<Continuation>,
}

impl<H: HostController> Xhci<H> {
    /// Builds the command and event rings and programs them into the controller.
    pub fn new(mut hc: H, config: XhciConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let quirks = config.quirks();

        let cmd = CommandRing::new(&mut hc, &config)?;
        let events = EventRing::new(
            &mut hc,
            config.event_ring_segments,
            config.trbs_per_segment,
        )?;

        hc.write_crcr(cmd.ring.register());
        hc.setup_event_ring(events.erstba(), events.erstsz(), events.erdp());

        info!(
            "XHCI ring engine: version {:#x}, {} TRBs per segment, quirks {:?}",
            config.hci_version, config.trbs_per_segment, quirks
        );

        let (host_event_sender, host_events) = crossbeam_channel::unbounded();

        Ok(Self {
            inner: Mutex::new(XhciInner {
                hc,
                config,
                quirks,
                clock,
                cmd,
                events,
                endpoints: BTreeMap::new(),
                tds: Slab::new(),
                urbs: Slab::new(),
                next_serial: 0,
                dying: false,
                host_event_sender,
                continuations: Vec::new(),
            }),
            host_events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, XhciInner<H>> {
        self.inner.lock().unwrap()
    }

    /// Runs `f` under the engine lock, then the continuations it queued.
    fn with_inner<R>(&self, f: impl FnOnce(&mut XhciInner<H>) -> R) -> R {
        let (result, continuations) = {
            let mut inner = self.lock();
            let result = f(&mut inner);
            (result, mem::take(&mut inner.continuations))
        };
        for continuation in continuations {
            continuation();
        }
        result
    }

    /// Creates the transfer ring of an endpoint. Returns the value for the TR Dequeue Pointer
    /// field of its endpoint context, Dequeue Cycle State included.
    pub fn add_endpoint(&self, config: EndpointConfig) -> Result<u64> {
        self.with_inner(|inner| inner.add_endpoint(config))
    }

    /// Gives back every request of the endpoint as shut down and frees its ring. The endpoint
    /// must have been stopped or disabled by then.
    pub fn remove_endpoint(&self, id: EndpointId) -> Result<()> {
        self.with_inner(|inner| inner.remove_endpoint(id))
    }

    /// Port status changes and device notifications, in the order the controller posted them.
    pub fn host_events(&self) -> &Receiver<HostEvent> {
        &self.host_events
    }

    pub fn is_dying(&self) -> bool {
        self.lock().dying
    }

    pub fn endpoint_flags(&self, id: EndpointId) -> Option<EpFlags> {
        self.lock().endpoints.get(&id).map(|ep| ep.flags)
    }

    /// Number of segments of an endpoint's transfer ring.
    pub fn endpoint_ring_segments(&self, id: EndpointId) -> Option<usize> {
        self.lock().endpoints.get(&id).map(|ep| ep.ring.num_segs())
    }

    /// Number of TDs still owned by the endpoint's ring.
    pub fn queued_tds(&self, id: EndpointId) -> Option<usize> {
        self.lock().endpoints.get(&id).map(|ep| ep.ring.td_list.len())
    }

    /// Reads the TRB at bus address `address` from any ring, or an entry of the Event Ring
    /// Segment Table. This is the view a controller has of the shared memory.
    pub fn dma_read_trb(&self, address: u64) -> Option<[u32; 4]> {
        self.lock().dma_read_trb(address)
    }

    /// Writes an event into the event ring, control dword last. Returns false if `address` is
    /// not an event ring slot.
    pub fn dma_write_trb(&self, address: u64, fields: [u32; 4]) -> bool {
        let mut inner = self.lock();
        match inner.events.ring.dma_to_pos(address) {
            Some(pos) => {
                inner.events.ring.trb_mut(pos).publish(fields);
                true
            }
            None => false,
        }
    }

    /// Spawns a thread that drives command timeouts and the abort sequence every `period`. The
    /// thread exits once the context is dropped or the host died.
    pub fn start_command_watchdog(self: &Arc<Self>, period: Duration) -> thread::JoinHandle<()>
    where
        H: 'static,
    {
        let xhci = Arc::downgrade(self);
        thread::spawn(move || loop {
            thread::sleep(period);
            let xhci = match xhci.upgrade() {
                Some(xhci) => xhci,
                None => break,
            };
            if xhci.is_dying() {
                debug!("Command watchdog exiting, host died");
                break;
            }
            xhci.check_command_timeout();
            xhci.poll_abort();
        })
    }
}

impl<H: HostController> Drop for Xhci<H> {
    fn drop(&mut self) {
        let continuations = {
            let inner = match self.inner.get_mut() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.shutdown();
            mem::take(&mut inner.continuations)
        };
        for continuation in continuations {
            continuation();
        }
    }
}

impl<H: HostController> XhciInner<H> {
    /// Starts a timeout of `duration` on the engine clock.
    fn timeout(&self, duration: Duration) -> Timeout {
        Timeout::new(&*self.clock, duration)
    }

    fn expired(&self, timeout: &Timeout) -> bool {
        timeout.expired(&*self.clock)
    }

    fn add_endpoint(&mut self, config: EndpointConfig) -> Result<u64> {
        if self.dying {
            return Err(Error::HostDied);
        }
        if self.endpoints.contains_key(&config.id) {
            return Err(Error::EndpointExists(config.id));
        }
        let (kind, segments) = match config.kind {
            EndpointType::Isoch => (RingKind::Isoc, self.config.isoc_ring_segments),
            _ => (RingKind::Transfer, self.config.transfer_ring_segments),
        };
        let bounce_size = match config.kind {
            EndpointType::Bulk | EndpointType::Interrupt => config.max_packet() as usize,
            _ => 0,
        };
        let ring = Ring::new(
            &mut self.hc,
            kind,
            segments,
            self.config.trbs_per_segment,
            self.quirks.contains(Quirks::LINK_TRB_CHAIN),
            bounce_size,
        )?;
        let dequeue = ring.register();

        debug!("Added {:?} endpoint {}", config.kind, config.id);
        self.endpoints.insert(config.id, Endpoint::new(config, ring));
        Ok(dequeue)
    }

    fn remove_endpoint(&mut self, id: EndpointId) -> Result<()> {
        if !self.endpoints.contains_key(&id) {
            return Err(Error::NoEndpoint(id));
        }
        self.kill_endpoint_transfers(id, TransferError::Shutdown);
        if let Some(mut ep) = self.endpoints.remove(&id) {
            ep.ring.free(&mut self.hc);
        }
        debug!("Removed endpoint {}", id);
        Ok(())
    }

    fn dma_read_trb(&self, address: u64) -> Option<[u32; 4]> {
        let erst_len = (self.events.ste.len() * mem::size_of::<event::EventRingSte>()) as u64;
        if address >= self.events.erst_dma && address < self.events.erst_dma + erst_len {
            let index = (address - self.events.erst_dma) as usize / mem::size_of::<event::EventRingSte>();
            return Some(self.events.ste[index].fields());
        }

        let rings = std::iter::once(&self.cmd.ring)
            .chain(std::iter::once(&self.events.ring))
            .chain(self.endpoints.values().map(|ep| &ep.ring));
        for ring in rings {
            if let Some(pos) = ring.dma_to_pos(address) {
                return Some(ring.trb(pos).fields());
            }
        }
        None
    }

    /// Gives back every TD of the endpoint with `error`.
    fn kill_endpoint_transfers(&mut self, id: EndpointId, error: TransferError) {
        let keys: Vec<usize> = match self.endpoints.get(&id) {
            Some(ep) => {
                let mut keys: Vec<usize> = ep.ring.td_list.iter().copied().collect();
                for &key in ep.cancelled.iter() {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            }
            None => return,
        };
        for key in keys {
            if let Some(td) = self.tds.get_mut(key) {
                if td.done {
                    continue;
                }
                td.status = Err(error);
                self.td_cleanup(key);
            }
        }
    }

    /// The controller stopped responding. Every command and transfer is completed as failed and
    /// new work is refused from now on.
    fn hc_died(&mut self) {
        if self.dying {
            return;
        }
        self.dying = true;
        error!("Host controller not responding, assuming it is dead");

        self.cmd.deadline = None;
        self.cmd.abort = None;
        for command in mem::take(&mut self.cmd.pending) {
            if let Some(waiter) = command.waiter {
                self.continuations
                    .push(waiter.into_continuation(Err(Error::HostDied)));
            }
        }

        let ids: Vec<EndpointId> = self.endpoints.keys().copied().collect();
        for id in ids {
            self.kill_endpoint_transfers(id, TransferError::HostDied);
        }
    }

    fn shutdown(&mut self) {
        for command in mem::take(&mut self.cmd.pending) {
            if let Some(waiter) = command.waiter {
                self.continuations
                    .push(waiter.into_continuation(Err(Error::HostDied)));
            }
        }
        let ids: Vec<EndpointId> = self.endpoints.keys().copied().collect();
        for id in ids {
            self.kill_endpoint_transfers(id, TransferError::Shutdown);
        }
        for ep in self.endpoints.values_mut() {
            ep.ring.free(&mut self.hc);
        }
        self.endpoints.clear();
        self.cmd.ring.free(&mut self.hc);
        self.events.free(&mut self.hc);
    }
}
