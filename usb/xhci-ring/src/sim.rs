//! A host controller model for tests and the `xhci-ring-sim` binary.
//!
//! [`SimulatedHc`] keeps its registers and DMA memory behind a shared handle: one clone is moved
//! into the [`Xhci`] context, the other one drives the controller side. The controller side
//! reads and writes ring slots through [`Xhci::dma_read_trb`] and [`Xhci::dma_write_trb`], so
//! it must never be used while the engine lock is held.
//!
//! Lock order is the engine lock first, then the simulator's. Methods taking an [`Xhci`] drop
//! the simulator lock before calling into the engine.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::xhci::doorbell::db_decode;
use crate::xhci::regs::{
    DmaAllocator, HostController, CRCR_CA, CRCR_CRR, CRCR_PTR_MASK, CRCR_RCS, DB_TARGET_HOST,
    ERDP_EHB, USBSTS_EINT, USBSTS_HCH, USBSTS_HSE,
};
use crate::xhci::trb::{trb_type, Trb, TrbCompletionCode, TrbType, TRB_IOC};
use crate::xhci::{EndpointContext, EndpointId, EndpointState, Xhci};

const DMA_BASE: u64 = 0x10_0000;
const DMA_ALIGN: u64 = 64;

/// What the controller does when software sets Command Abort.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortBehavior {
    /// Stops the ring, completes the current command as aborted and posts Command Ring Stopped.
    Stop,
    /// Stops the ring without posting any event.
    StopSilently,
    /// Ignores the abort, the ring keeps running.
    Hang,
}

/// How the controller finishes the next TD of an endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TdOutcome {
    Success,
    /// The device sent `residue` bytes less than the last data TRB asked for.
    Short { residue: u32 },
    Stall,
    TransactionError,
}

#[derive(Clone, Copy, Debug)]
struct SimEndpoint {
    state: EndpointState,
    /// TR Dequeue Pointer with the Dequeue Cycle State in bit 0.
    dequeue: u64,
}

struct SimState {
    memory: Vec<u8>,
    next_dma: u64,

    usbsts: u32,
    crcr: u64,
    erdp: u64,
    erdp_writes: Vec<u64>,
    erstba: u64,
    erstsz: u16,
    doorbells: Vec<(u8, u32)>,
    command_log: Vec<TrbType>,
    endpoints: BTreeMap<EndpointId, SimEndpoint>,
    abort_behavior: AbortBehavior,
    dead: bool,
    hold_commands: bool,
    spurious_success: bool,
    stop_endpoint_fails: bool,
    next_slot: u8,

    cmd_dequeue: u64,
    cmd_cycle: bool,

    /// Event ring producer: ERST entry, slot within its segment, cycle state.
    event_seg: usize,
    event_idx: usize,
    event_cycle: bool,
    /// ERST entries as (segment base, size), read on first use.
    erst: Vec<(u64, usize)>,
    deferred: VecDeque<Trb>,
}

#[derive(Clone)]
pub struct SimulatedHc {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedHc {
    fn default() -> Self {
        Self::new()
    }
}

fn event_trb(data: u64, status: u32, control: u32) -> Trb {
    let mut trb = Trb::default();
    trb.set(data, status, control);
    trb
}

fn completion_status(code: TrbCompletionCode, residue: u32) -> u32 {
    (u32::from(code as u8) << 24) | (residue & 0xFF_FFFF)
}

fn transfer_event(address: u64, endpoint: EndpointId, code: TrbCompletionCode, residue: u32) -> Trb {
    event_trb(
        address,
        completion_status(code, residue),
        trb_type(TrbType::Transfer)
            | (u32::from(endpoint.dci()) << 16)
            | (u32::from(endpoint.slot) << 24),
    )
}

impl SimulatedHc {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                memory: Vec::new(),
                next_dma: DMA_BASE,
                usbsts: 0,
                crcr: 0,
                erdp: 0,
                erdp_writes: Vec::new(),
                erstba: 0,
                erstsz: 0,
                doorbells: Vec::new(),
                command_log: Vec::new(),
                endpoints: BTreeMap::new(),
                abort_behavior: AbortBehavior::Stop,
                dead: false,
                hold_commands: false,
                spurious_success: false,
                stop_endpoint_fails: false,
                next_slot: 1,
                cmd_dequeue: 0,
                cmd_cycle: true,
                event_seg: 0,
                event_idx: 0,
                event_cycle: true,
                erst: Vec::new(),
                deferred: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Allocates a data buffer in DMA memory.
    pub fn alloc_buffer(&self, size: usize) -> u64 {
        self.lock().alloc(size)
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.lock();
        match state.range(address, len) {
            Some(range) => state.memory[range].to_vec(),
            None => vec![0; len],
        }
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) {
        let mut state = self.lock();
        if let Some(range) = state.range(address, data.len()) {
            state.memory[range].copy_from_slice(data);
        }
    }

    pub fn set_abort_behavior(&self, behavior: AbortBehavior) {
        self.lock().abort_behavior = behavior;
    }

    /// A dead controller reads all ones from every register.
    pub fn set_dead(&self, dead: bool) {
        self.lock().dead = dead;
    }

    /// While held, commands stay on the ring unexecuted.
    pub fn hold_commands(&self, hold: bool) {
        self.lock().hold_commands = hold;
    }

    /// Stops the command ring behind the driver's back.
    pub fn stop_command_ring(&self) {
        self.lock().crcr &= !CRCR_CRR;
    }

    /// Posts a Success event for the IOC TRB after every short packet.
    pub fn set_spurious_success(&self, enabled: bool) {
        self.lock().spurious_success = enabled;
    }

    /// Fails every Stop Endpoint command with a Context State Error, leaving the endpoint in
    /// whatever state it reports.
    pub fn set_stop_endpoint_fails(&self, fails: bool) {
        self.lock().stop_endpoint_fails = fails;
    }

    /// Makes an endpoint known to the controller, as a Configure Endpoint command would.
    pub fn configure_endpoint(&self, id: EndpointId, dequeue: u64) {
        self.lock().endpoints.insert(
            id,
            SimEndpoint {
                state: EndpointState::Running,
                dequeue,
            },
        );
    }

    pub fn set_endpoint_state(&self, id: EndpointId, state: EndpointState) {
        if let Some(ep) = self.lock().endpoints.get_mut(&id) {
            ep.state = state;
        }
    }

    pub fn context(&self, id: EndpointId) -> EndpointContext {
        self.lock().context(id)
    }

    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.lock().doorbells.clone()
    }

    pub fn clear_doorbells(&self) {
        self.lock().doorbells.clear();
    }

    pub fn erdp(&self) -> u64 {
        self.lock().erdp
    }

    pub fn erdp_writes(&self) -> Vec<u64> {
        self.lock().erdp_writes.clone()
    }

    /// Types of the commands executed so far, in order.
    pub fn command_log(&self) -> Vec<TrbType> {
        self.lock().command_log.clone()
    }

    pub fn command_running(&self) -> bool {
        self.lock().crcr & CRCR_CRR != 0
    }

    /// Queues an event; it is written with the next delivery.
    pub fn push_event(&self, event: Trb) {
        self.lock().deferred.push_back(event);
    }

    /// Writes the queued events into the event ring and runs the interrupt handler.
    pub fn deliver_events<H: HostController>(&self, xhci: &Xhci<H>) -> Result<usize> {
        self.write_deferred(xhci);
        self.interrupt(xhci)
    }

    pub fn post_event<H: HostController>(&self, xhci: &Xhci<H>, event: Trb) -> Result<usize> {
        self.push_event(event);
        self.deliver_events(xhci)
    }

    pub fn port_status_change<H: HostController>(&self, xhci: &Xhci<H>, port_id: u8) -> Result<usize> {
        self.post_event(
            xhci,
            event_trb(
                u64::from(port_id) << 24,
                completion_status(TrbCompletionCode::Success, 0),
                trb_type(TrbType::PortStatusChange),
            ),
        )
    }

    fn interrupt<H: HostController>(&self, xhci: &Xhci<H>) -> Result<usize> {
        self.lock().usbsts |= USBSTS_EINT;
        xhci.handle_irq()
    }

    fn write_deferred<H: HostController>(&self, xhci: &Xhci<H>) {
        loop {
            let event = match self.lock().deferred.pop_front() {
                Some(event) => event,
                None => break,
            };
            self.write_event(xhci, event);
        }
    }

    fn read_erst<H: HostController>(&self, xhci: &Xhci<H>) {
        let (erstba, erstsz, known) = {
            let state = self.lock();
            (state.erstba, state.erstsz, !state.erst.is_empty())
        };
        if known {
            return;
        }
        let erst = (0..u64::from(erstsz))
            .filter_map(|i| xhci.dma_read_trb(erstba + 16 * i))
            .map(|fields| {
                let base = u64::from(fields[0]) | (u64::from(fields[1]) << 32);
                (base, fields[2] as usize)
            })
            .collect();
        self.lock().erst = erst;
    }

    /// Writes one event at the producer slot of the event ring.
    fn write_event<H: HostController>(&self, xhci: &Xhci<H>, event: Trb) {
        self.read_erst(xhci);
        let (address, cycle) = {
            let mut state = self.lock();
            let (base, size) = match state.erst.get(state.event_seg) {
                Some(&entry) => entry,
                None => {
                    warn!("No event ring to post to");
                    return;
                }
            };
            let address = base + 16 * state.event_idx as u64;
            let cycle = state.event_cycle;

            state.event_idx += 1;
            if state.event_idx >= size {
                state.event_idx = 0;
                state.event_seg += 1;
                if state.event_seg >= state.erst.len() {
                    state.event_seg = 0;
                    state.event_cycle = !state.event_cycle;
                }
            }
            (address, cycle)
        };

        let mut fields = event.fields();
        fields[3] = (fields[3] & !1) | u32::from(cycle);
        trace!("Event at {:#x}: {:x?}", address, fields);
        if !xhci.dma_write_trb(address, fields) {
            warn!("Event slot {:#x} is not part of the event ring", address);
        }
    }

    /// Executes the commands on the ring, posts their completions and runs the interrupt
    /// handler. Commands queued by the handler are left for the next call. Returns the number
    /// of commands executed.
    pub fn run_commands<H: HostController>(&self, xhci: &Xhci<H>) -> usize {
        self.write_deferred(xhci);

        let mut executed = 0;
        loop {
            let (dequeue, cycle) = {
                let state = self.lock();
                if state.dead || state.hold_commands || state.crcr & CRCR_CRR == 0 {
                    break;
                }
                (state.cmd_dequeue, state.cmd_cycle)
            };
            let trb = match xhci.dma_read_trb(dequeue) {
                Some(fields) => Trb::from_fields(fields),
                None => {
                    warn!("Command ring dequeue {:#x} is not a ring slot", dequeue);
                    break;
                }
            };
            if trb.cycle() != cycle {
                break;
            }
            if trb.is_link() {
                let mut state = self.lock();
                state.cmd_dequeue = trb.read_data() & !0xF;
                if trb.link_toggles_cycle() {
                    state.cmd_cycle = !state.cmd_cycle;
                }
                continue;
            }

            let event = self.lock().execute_command(dequeue, &trb);
            self.lock().cmd_dequeue = dequeue + 16;
            self.write_event(xhci, event);
            executed += 1;
        }

        if let Err(err) = self.interrupt(xhci) {
            debug!("Interrupt after commands: {}", err);
        }
        executed
    }

    /// Finishes the TD at the dequeue pointer of a running endpoint and runs the interrupt
    /// handler. Returns false if the endpoint is not running or has no TD queued.
    pub fn complete_td<H: HostController>(
        &self,
        xhci: &Xhci<H>,
        endpoint: EndpointId,
        outcome: TdOutcome,
    ) -> bool {
        let (mut address, mut cycle) = match self.lock().endpoints.get(&endpoint) {
            Some(ep) if ep.state == EndpointState::Running => (ep.dequeue & !0xF, ep.dequeue & 1 == 1),
            _ => return false,
        };

        // Collect the TD the way the controller fetches it, skipping no-ops.
        let mut td: Vec<(u64, Trb)> = Vec::new();
        loop {
            let trb = match xhci.dma_read_trb(address) {
                Some(fields) => Trb::from_fields(fields),
                None => return false,
            };
            if trb.cycle() != cycle {
                return false;
            }
            if trb.is_link() {
                address = trb.read_data() & !0xF;
                if trb.link_toggles_cycle() {
                    cycle = !cycle;
                }
                continue;
            }
            let trb_address = address;
            address += 16;
            if trb.is_noop() {
                if td.is_empty() {
                    continue;
                }
                break;
            }
            // Control stages are not chained, a control TD ends with its status stage.
            let more = trb.chain()
                || matches!(
                    trb.trb_type_checked(),
                    Some(TrbType::SetupStage) | Some(TrbType::DataStage)
                );
            td.push((trb_address, trb));
            if !more {
                break;
            }
        }
        let after_td = address | u64::from(cycle);

        let spurious_success = self.lock().spurious_success;
        match outcome {
            TdOutcome::Success => {
                for (trb_address, trb) in td.iter() {
                    if trb.fields()[3] & TRB_IOC != 0 {
                        self.push_event(transfer_event(
                            *trb_address,
                            endpoint,
                            TrbCompletionCode::Success,
                            0,
                        ));
                    }
                }
                self.set_dequeue(endpoint, after_td);
            }
            TdOutcome::Short { residue } => {
                let data = td.iter().rev().find(|(_, trb)| {
                    matches!(
                        trb.trb_type_checked(),
                        Some(TrbType::Normal) | Some(TrbType::DataStage) | Some(TrbType::Isoch)
                    )
                });
                if let Some((trb_address, _)) = data {
                    self.push_event(transfer_event(
                        *trb_address,
                        endpoint,
                        TrbCompletionCode::ShortPacket,
                        residue,
                    ));
                }
                if let Some((trb_address, trb)) = td.last() {
                    let status_stage = trb.trb_type_checked() == Some(TrbType::StatusStage);
                    if status_stage || spurious_success {
                        self.push_event(transfer_event(
                            *trb_address,
                            endpoint,
                            TrbCompletionCode::Success,
                            0,
                        ));
                    }
                }
                self.set_dequeue(endpoint, after_td);
            }
            TdOutcome::Stall | TdOutcome::TransactionError => {
                let code = if outcome == TdOutcome::Stall {
                    TrbCompletionCode::Stall
                } else {
                    TrbCompletionCode::UsbTransaction
                };
                if let Some((trb_address, trb)) = td.first() {
                    self.push_event(transfer_event(
                        *trb_address,
                        endpoint,
                        code,
                        trb.buffer_length(),
                    ));
                }
                self.set_endpoint_state(endpoint, EndpointState::Halted);
            }
        }

        self.write_deferred(xhci);
        if let Err(err) = self.interrupt(xhci) {
            debug!("Interrupt after TD completion: {}", err);
        }
        true
    }

    fn set_dequeue(&self, endpoint: EndpointId, dequeue: u64) {
        if let Some(ep) = self.lock().endpoints.get_mut(&endpoint) {
            ep.dequeue = dequeue;
        }
    }
}

impl SimState {
    fn alloc(&mut self, size: usize) -> u64 {
        let address = self.next_dma;
        let end = address + size.max(1) as u64;
        self.next_dma = (end + DMA_ALIGN - 1) & !(DMA_ALIGN - 1);
        let len = (self.next_dma - DMA_BASE) as usize;
        if self.memory.len() < len {
            self.memory.resize(len, 0);
        }
        address
    }

    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(DMA_BASE)? as usize;
        let end = start.checked_add(len)?;
        if end > self.memory.len() {
            return None;
        }
        Some(start..end)
    }

    fn context(&self, id: EndpointId) -> EndpointContext {
        match self.endpoints.get(&id) {
            Some(ep) => EndpointContext {
                state: ep.state,
                dequeue: ep.dequeue,
            },
            None => EndpointContext {
                state: EndpointState::Disabled,
                dequeue: 0,
            },
        }
    }

    fn endpoint_command(
        &mut self,
        trb: &Trb,
        f: impl FnOnce(&mut SimEndpoint) -> TrbCompletionCode,
    ) -> TrbCompletionCode {
        let id = match EndpointId::from_trb_control(trb.fields()[3]) {
            Some(id) => id,
            None => return TrbCompletionCode::Trb,
        };
        match self.endpoints.get_mut(&id) {
            Some(ep) => f(ep),
            None => TrbCompletionCode::EndpointNotEnabled,
        }
    }

    /// Runs one command and returns its completion event.
    fn execute_command(&mut self, address: u64, trb: &Trb) -> Trb {
        let ty = trb.trb_type_checked();
        if let Some(ty) = ty {
            self.command_log.push(ty);
        }
        let mut slot = trb.event_slot();

        let code = match ty {
            Some(TrbType::StopEndpoint) if self.stop_endpoint_fails => {
                TrbCompletionCode::ContextState
            }
            Some(TrbType::StopEndpoint) => self.endpoint_command(trb, |ep| match ep.state {
                EndpointState::Running => {
                    ep.state = EndpointState::Stopped;
                    TrbCompletionCode::Success
                }
                _ => TrbCompletionCode::ContextState,
            }),
            Some(TrbType::SetTrDequeuePointer) => {
                let dequeue = trb.read_data();
                self.endpoint_command(trb, |ep| match ep.state {
                    EndpointState::Stopped | EndpointState::Error => {
                        ep.dequeue = dequeue & !0xE;
                        TrbCompletionCode::Success
                    }
                    _ => TrbCompletionCode::ContextState,
                })
            }
            Some(TrbType::ResetEndpoint) => self.endpoint_command(trb, |ep| match ep.state {
                EndpointState::Halted => {
                    ep.state = EndpointState::Stopped;
                    TrbCompletionCode::Success
                }
                _ => TrbCompletionCode::ContextState,
            }),
            Some(TrbType::EnableSlot) => {
                slot = self.next_slot;
                self.next_slot = self.next_slot.wrapping_add(1);
                TrbCompletionCode::Success
            }
            Some(TrbType::NoOpCmd) => {
                slot = 0;
                TrbCompletionCode::Success
            }
            Some(ty) if trb.is_command_trb() => {
                trace!("Simulated {:?}", ty);
                TrbCompletionCode::Success
            }
            _ => TrbCompletionCode::Trb,
        };
        debug!("Executed {:?} at {:#x}: {:?}", ty, address, code);

        event_trb(
            address,
            completion_status(code, 0),
            trb_type(TrbType::CommandCompletion) | (u32::from(slot) << 24),
        )
    }
}

impl DmaAllocator for SimulatedHc {
    fn alloc_dma(&mut self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(Error::DmaAlloc(size));
        }
        Ok(self.lock().alloc(size))
    }

    fn free_dma(&mut self, address: u64, size: usize) {
        trace!("Freed {} bytes at {:#x}", size, address);
    }

    fn copy_dma(&mut self, dst: u64, src: u64, len: usize) {
        let mut state = self.lock();
        match (state.range(src, len), state.range(dst, len)) {
            (Some(src), Some(dst)) => state.memory.copy_within(src, dst.start),
            _ => warn!("Copy of {} bytes from {:#x} to {:#x} out of range", len, src, dst),
        }
    }
}

impl HostController for SimulatedHc {
    fn ring_doorbell(&mut self, target: u8, value: u32) {
        let mut state = self.lock();
        state.doorbells.push((target, value));
        if state.dead {
            return;
        }
        if target == DB_TARGET_HOST {
            state.crcr |= CRCR_CRR;
            return;
        }
        let (dci, _stream) = db_decode(value);
        if dci == 0 {
            return;
        }
        if let Some(ep) = state.endpoints.get_mut(&EndpointId::new(target, dci - 1)) {
            if ep.state == EndpointState::Stopped {
                ep.state = EndpointState::Running;
            }
        }
    }

    fn read_usbsts(&mut self) -> u32 {
        let state = self.lock();
        if state.dead {
            u32::MAX
        } else {
            state.usbsts
        }
    }

    fn write_usbsts(&mut self, value: u32) {
        self.lock().usbsts &= !(value & (USBSTS_EINT | USBSTS_HSE));
    }

    fn read_crcr(&mut self) -> u64 {
        let state = self.lock();
        if state.dead {
            u64::MAX
        } else {
            state.crcr & CRCR_CRR
        }
    }

    fn write_crcr(&mut self, value: u64) {
        let mut state = self.lock();
        if state.dead {
            return;
        }
        if state.crcr & CRCR_CRR == 0 {
            state.cmd_dequeue = value & CRCR_PTR_MASK;
            state.cmd_cycle = value & CRCR_RCS != 0;
            return;
        }
        if value & CRCR_CA == 0 {
            return;
        }
        match state.abort_behavior {
            AbortBehavior::Stop => {
                state.crcr &= !CRCR_CRR;
                let aborted = state.cmd_dequeue;
                state.cmd_dequeue += 16;
                let next = state.cmd_dequeue;
                debug!("Aborting command at {:#x}", aborted);
                for (address, code) in [
                    (aborted, TrbCompletionCode::CommandAborted),
                    (next, TrbCompletionCode::CommandRingStopped),
                ] {
                    state.deferred.push_back(event_trb(
                        address,
                        completion_status(code, 0),
                        trb_type(TrbType::CommandCompletion),
                    ));
                }
            }
            AbortBehavior::StopSilently => state.crcr &= !CRCR_CRR,
            AbortBehavior::Hang => debug!("Ignoring command abort"),
        }
    }

    fn setup_event_ring(&mut self, erstba: u64, erstsz: u16, erdp: u64) {
        let mut state = self.lock();
        state.erstsz = erstsz;
        state.erdp = erdp;
        state.erstba = erstba;
        state.erst.clear();
        state.event_seg = 0;
        state.event_idx = 0;
        state.event_cycle = true;
    }

    fn read_erdp(&mut self) -> u64 {
        self.lock().erdp
    }

    fn write_erdp(&mut self, value: u64) {
        let mut state = self.lock();
        state.erdp_writes.push(value);
        state.erdp = value & !ERDP_EHB;
    }

    fn endpoint_context(&mut self, endpoint: EndpointId) -> EndpointContext {
        self.lock().context(endpoint)
    }

    fn halt(&mut self) {
        let mut state = self.lock();
        state.usbsts |= USBSTS_HCH;
        state.crcr &= !CRCR_CRR;
    }
}
