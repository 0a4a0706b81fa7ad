use std::collections::VecDeque;
use std::mem;

use common::timeout::Timeout;
use log::{debug, error, trace, warn};

use crate::completion::{self, CompletionFuture, Waiter};
use crate::config::{Quirks, XhciConfig};
use crate::error::{Error, Result};

use super::doorbell::DB_VALUE_HOST;
use super::endpoint::{EndpointId, EndpointState, EpFlags};
use super::regs::{DmaAllocator, HostController, CRCR_CA, CRCR_CRR, CRCR_PTR_MASK, DB_TARGET_HOST};
use super::ring::{Ring, RingKind, TrbPos};
use super::trb::{Trb, TrbCompletionCode, TrbType};
use super::{Xhci, XhciInner};

/// A command for the command ring.
///
/// Endpoint commands used for cancellation and halt recovery are issued by the engine itself
/// and cannot be submitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    NoOp,
    EnableSlot {
        slot_type: u8,
    },
    DisableSlot {
        slot: u8,
    },
    AddressDevice {
        slot: u8,
        input_context: u64,
        block_set_address: bool,
    },
    ConfigureEndpoint {
        slot: u8,
        input_context: u64,
        deconfigure: bool,
    },
    EvaluateContext {
        slot: u8,
        input_context: u64,
    },
    ResetDevice {
        slot: u8,
    },
    StopEndpoint {
        endpoint: EndpointId,
        suspend: bool,
    },
    SetTrDequeuePointer {
        endpoint: EndpointId,
        /// New dequeue pointer with the Dequeue Cycle State in bit 0.
        dequeue: u64,
    },
    ResetEndpoint {
        endpoint: EndpointId,
        transfer_state_preserve: bool,
    },
}

impl Command {
    pub fn trb_type(&self) -> TrbType {
        match self {
            Self::NoOp => TrbType::NoOpCmd,
            Self::EnableSlot { .. } => TrbType::EnableSlot,
            Self::DisableSlot { .. } => TrbType::DisableSlot,
            Self::AddressDevice { .. } => TrbType::AddressDevice,
            Self::ConfigureEndpoint { .. } => TrbType::ConfigureEndpoint,
            Self::EvaluateContext { .. } => TrbType::EvaluateContext,
            Self::ResetDevice { .. } => TrbType::ResetDevice,
            Self::StopEndpoint { .. } => TrbType::StopEndpoint,
            Self::SetTrDequeuePointer { .. } => TrbType::SetTrDequeuePointer,
            Self::ResetEndpoint { .. } => TrbType::ResetEndpoint,
        }
    }

    fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::StopEndpoint { .. } | Self::SetTrDequeuePointer { .. } | Self::ResetEndpoint { .. }
        )
    }

    pub fn write(&self, trb: &mut Trb, cycle: bool) {
        match *self {
            Self::NoOp => trb.no_op_cmd(cycle),
            Self::EnableSlot { slot_type } => trb.enable_slot(slot_type, cycle),
            Self::DisableSlot { slot } => trb.disable_slot(slot, cycle),
            Self::AddressDevice {
                slot,
                input_context,
                block_set_address,
            } => trb.address_device(slot, input_context, block_set_address, cycle),
            Self::ConfigureEndpoint {
                slot,
                input_context,
                deconfigure,
            } => trb.configure_endpoint(slot, input_context, deconfigure, cycle),
            Self::EvaluateContext {
                slot,
                input_context,
            } => trb.evaluate_context(slot, input_context, cycle),
            Self::ResetDevice { slot } => trb.reset_device(slot, cycle),
            Self::StopEndpoint { endpoint, suspend } => {
                trb.stop_endpoint(endpoint.slot, endpoint.dci(), suspend, cycle)
            }
            Self::SetTrDequeuePointer { endpoint, dequeue } => {
                trb.set_tr_deque_ptr(dequeue, cycle, 0, endpoint.dci(), endpoint.slot)
            }
            Self::ResetEndpoint {
                endpoint,
                transfer_state_preserve,
            } => trb.reset_endpoint(endpoint.slot, endpoint.dci(), transfer_state_preserve, cycle),
        }
    }
}

/// The Command Completion Event of a command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandCompletion {
    pub completion_code: u8,
    pub parameter: u32,
    pub slot_id: u8,
}

impl CommandCompletion {
    fn from_event(event: &Trb) -> Self {
        Self {
            completion_code: event.completion_code(),
            parameter: event.completion_param(),
            slot_id: event.event_slot(),
        }
    }

    pub fn code(&self) -> Option<TrbCompletionCode> {
        TrbCompletionCode::try_from(self.completion_code).ok()
    }

    pub fn is_success(&self) -> bool {
        self.completion_code == TrbCompletionCode::Success as u8
    }
}

pub type CommandHandle = CompletionFuture<Result<CommandCompletion>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandRingState {
    Running,
    Stopped,
    /// An abort was requested and the ring has not reported stopping yet.
    Aborted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum CommandStatus {
    None,
    /// Timed out, the abort sequence is in progress.
    Aborted,
    /// Timed out and turned into a no-op while the ring was stopped.
    RingStopped,
}

pub(super) struct PendingCommand {
    pub pos: TrbPos,
    pub command: Command,
    pub status: CommandStatus,
    /// None for commands issued by the engine.
    pub waiter: Option<Waiter<Result<CommandCompletion>>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum AbortPhase {
    /// Command Abort was written, waiting for CRR to clear.
    WaitRingStopped { timeout: Timeout },
    /// The ring stopped, waiting for the Command Ring Stopped event.
    WaitStopEvent { timeout: Timeout },
}

pub(super) struct CommandRing {
    pub ring: Ring,
    /// Commands on the ring in submission order. The head is the one the controller executes.
    pub pending: VecDeque<PendingCommand>,
    pub state: CommandRingState,
    /// When the head command times out.
    pub deadline: Option<Timeout>,
    pub abort: Option<AbortPhase>,
}

impl CommandRing {
    pub fn new(dma: &mut dyn DmaAllocator, config: &XhciConfig) -> Result<Self> {
        let ring = Ring::new(
            dma,
            RingKind::Command,
            config.command_ring_segments,
            config.trbs_per_segment,
            config.quirks().contains(Quirks::LINK_TRB_CHAIN),
            0,
        )?;
        Ok(Self {
            ring,
            pending: VecDeque::new(),
            state: CommandRingState::Stopped,
            deadline: None,
            abort: None,
        })
    }
}

impl<H: HostController> Xhci<H> {
    /// Queues `command` and returns a handle resolving to its completion event.
    pub fn submit_command(&self, command: Command) -> Result<CommandHandle> {
        check_submittable(&command)?;
        let (completer, handle) = completion::channel();
        self.with_inner(|inner| inner.queue_command(command, Some(Waiter::Future(completer))))?;
        Ok(handle)
    }

    /// Queues `command`; `callback` runs with its completion once the engine lock is released.
    pub fn submit_command_with<F>(&self, command: Command, callback: F) -> Result<()>
    where
        F: FnOnce(Result<CommandCompletion>) + Send + 'static,
    {
        check_submittable(&command)?;
        self.with_inner(|inner| inner.queue_command(command, Some(Waiter::callback(callback))))
    }

    /// Starts aborting the current command if it ran past its deadline.
    pub fn check_command_timeout(&self) {
        self.with_inner(|inner| inner.check_command_timeout())
    }

    /// Advances a command abort in progress.
    pub fn poll_abort(&self) {
        self.with_inner(|inner| inner.poll_abort())
    }

    pub fn command_ring_state(&self) -> CommandRingState {
        self.lock().cmd.state
    }

    pub fn pending_commands(&self) -> usize {
        self.lock().cmd.pending.len()
    }

    /// Bus address of the command ring dequeue pointer.
    pub fn command_ring_dequeue(&self) -> u64 {
        let inner = self.lock();
        inner.cmd.ring.trb_dma(inner.cmd.ring.dequeue)
    }
}

fn check_submittable(command: &Command) -> Result<()> {
    if command.is_internal() {
        return Err(Error::InvalidRequest(
            "endpoint commands are issued by the ring engine",
        ));
    }
    Ok(())
}

impl<H: HostController> XhciInner<H> {
    pub(super) fn queue_command(
        &mut self,
        command: Command,
        waiter: Option<Waiter<Result<CommandCompletion>>>,
    ) -> Result<()> {
        if self.dying {
            return Err(Error::HostDied);
        }
        self.cmd.ring.prepare(
            &mut self.hc,
            EndpointState::Running,
            1,
            self.config.max_ring_segments,
        )?;

        if self.cmd.pending.is_empty() {
            self.arm_command_timer();
        }

        let mut trb = Trb::default();
        command.write(&mut trb, self.cmd.ring.cycle_state);
        let pos = self.cmd.ring.enqueue(&trb, false);
        trace!("Queued {:?} at {:?}", command, pos);

        self.cmd.pending.push_back(PendingCommand {
            pos,
            command,
            status: CommandStatus::None,
            waiter,
        });

        match self.cmd.state {
            CommandRingState::Running => self.hc.ring_doorbell(DB_TARGET_HOST, DB_VALUE_HOST),
            CommandRingState::Stopped => {
                debug!("Starting command ring");
                self.cmd.state = CommandRingState::Running;
                self.hc.ring_doorbell(DB_TARGET_HOST, DB_VALUE_HOST);
            }
            // The ring is restarted once the abort is over.
            CommandRingState::Aborted => (),
        }
        Ok(())
    }

    pub(super) fn handle_cmd_completion(&mut self, event: &Trb) -> Result<()> {
        let code = event.completion_code();
        let pointer = event.completion_trb_pointer().unwrap_or(0);
        let expected = self.cmd.ring.trb_dma(self.cmd.ring.dequeue);
        if pointer != expected {
            warn!(
                "Mismatched command completion for {:#x}, command ring dequeue is {:#x}",
                pointer, expected
            );
            return Err(Error::Corrupt(format!(
                "command completion for {:#x}",
                pointer
            )));
        }

        if code == TrbCompletionCode::CommandRingStopped as u8 {
            if self.cmd.abort.take().is_some() {
                debug!("Command ring stopped for abort");
                self.handle_stopped_cmd_ring();
            } else {
                debug!("Command ring stopped");
            }
            return Ok(());
        }
        self.cmd.deadline = None;

        let (command, status) = match self.cmd.pending.front() {
            Some(head) if head.pos == self.cmd.ring.dequeue => (head.command, head.status),
            Some(head) => {
                warn!(
                    "Command completion at {:?}, head command is at {:?}",
                    self.cmd.ring.dequeue, head.pos
                );
                return Err(Error::Corrupt("command list out of sync with the ring".into()));
            }
            None => {
                warn!("Command completion with no command pending");
                self.cmd.ring.inc_deq();
                return Ok(());
            }
        };
        let completion = CommandCompletion::from_event(event);
        trace!("{:?} completed with code {}", command, code);

        if code == TrbCompletionCode::CommandAborted as u8 {
            self.cmd.state = CommandRingState::Stopped;
            if status == CommandStatus::Aborted {
                debug!("{:?} aborted", command);
                if command.is_internal() {
                    self.drop_internal_command(command);
                }
                self.finish_head_command(Err(Error::CommandAborted));
                return Ok(());
            }
        }

        let result = if status == CommandStatus::RingStopped {
            debug!("{:?} was turned into a no-op after timing out", command);
            Err(Error::CommandAborted)
        } else {
            Ok(completion)
        };

        // Handlers run before the command leaves the list so that commands they queue do not
        // restart the timer of an empty list.
        let effective_code = if status == CommandStatus::RingStopped {
            TrbCompletionCode::CommandAborted as u8
        } else {
            code
        };
        match command {
            Command::StopEndpoint { endpoint, .. } => {
                self.handle_stop_endpoint_completion(endpoint, effective_code)
            }
            Command::SetTrDequeuePointer { endpoint, .. } => {
                self.handle_set_deq_completion(endpoint, effective_code)
            }
            Command::ResetEndpoint {
                endpoint,
                transfer_state_preserve,
            } => self.handle_reset_endpoint_completion(endpoint, transfer_state_preserve),
            _ => (),
        }

        if self.cmd.pending.len() > 1 {
            self.arm_command_timer();
        } else {
            self.cmd.deadline = None;
        }
        self.finish_head_command(result);
        Ok(())
    }

    /// Removes the head command, hands its result to the waiter and moves past its TRB.
    fn finish_head_command(&mut self, result: Result<CommandCompletion>) {
        if let Some(head) = self.cmd.pending.pop_front() {
            if let Some(waiter) = head.waiter {
                self.continuations.push(waiter.into_continuation(result));
            }
        }
        self.cmd.ring.inc_deq();
    }

    fn arm_command_timer(&mut self) {
        let timeout = self.timeout(self.config.command_timeout());
        trace!("Command times out at {:?}", timeout.deadline());
        self.cmd.deadline = Some(timeout);
    }

    pub(super) fn check_command_timeout(&mut self) {
        let deadline = match self.cmd.deadline {
            Some(deadline) => deadline,
            None => return,
        };
        if self.dying || self.cmd.abort.is_some() || self.cmd.pending.is_empty() {
            return;
        }
        if !self.expired(&deadline) {
            // Raced with a completion that re-armed the timer.
            return;
        }
        self.cmd.deadline = None;

        let head = match self.cmd.pending.front_mut() {
            Some(head) => head,
            None => return,
        };
        if let Command::StopEndpoint { endpoint, .. } = head.command {
            error!("Stop Endpoint command on {} timed out", endpoint);
            if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                ep.flags.remove(EpFlags::STOP_CMD_PENDING);
            }
            self.hc.halt();
            self.hc_died();
            return;
        }

        warn!("{:?} timed out", head.command);
        head.status = CommandStatus::Aborted;

        let crcr = self.hc.read_crcr();
        if crcr == u64::MAX {
            warn!("Command ring control register reads all ones");
            self.hc_died();
            return;
        }

        if self.cmd.state == CommandRingState::Running && crcr & CRCR_CRR != 0 {
            self.abort_cmd_ring();
        } else {
            debug!("Command timed out on a stopped ring");
            self.handle_stopped_cmd_ring();
        }
    }

    fn abort_cmd_ring(&mut self) {
        debug!("Aborting command ring");
        self.cmd.state = CommandRingState::Aborted;

        // The upper dword has to point at the next command in case the ring stops before the
        // abort bit lands.
        let ring = &self.cmd.ring;
        let mut next = ring.next_trb(ring.dequeue);
        if ring.is_link(next) {
            next = ring.next_trb(next);
        }
        let crcr = (ring.trb_dma(next) & CRCR_PTR_MASK) | CRCR_CA;
        self.hc.write_crcr(crcr);

        self.cmd.abort = Some(AbortPhase::WaitRingStopped {
            timeout: self.timeout(self.config.abort_timeout()),
        });
        self.poll_abort();
    }

    pub(super) fn poll_abort(&mut self) {
        match self.cmd.abort {
            None => (),
            Some(AbortPhase::WaitRingStopped { timeout }) => {
                let crcr = self.hc.read_crcr();
                if crcr == u64::MAX {
                    self.hc_died();
                } else if crcr & CRCR_CRR == 0 {
                    debug!("Command ring stopped, waiting for the stop event");
                    self.cmd.abort = Some(AbortPhase::WaitStopEvent {
                        timeout: self.timeout(self.config.stop_event_timeout()),
                    });
                } else if self.expired(&timeout) {
                    error!("Abort failed to stop command ring");
                    self.hc.halt();
                    self.hc_died();
                }
            }
            Some(AbortPhase::WaitStopEvent { timeout }) => {
                if self.expired(&timeout) {
                    warn!("No Command Ring Stopped event after abort, clearing the command ring");
                    self.cmd.abort = None;
                    self.clear_command_ring();
                }
            }
        }
    }

    /// Turns aborted commands into no-ops and restarts the ring if work is left.
    fn handle_stopped_cmd_ring(&mut self) {
        for command in self.cmd.pending.iter_mut() {
            if command.status != CommandStatus::Aborted {
                continue;
            }
            debug!("Turning aborted {:?} into a no-op", command.command);
            self.cmd.ring.trb_mut(command.pos).to_noop(TrbType::NoOpCmd);
            command.status = CommandStatus::RingStopped;
        }

        if !self.cmd.pending.is_empty() && !self.dying {
            debug!("Restarting command ring");
            self.cmd.state = CommandRingState::Running;
            self.arm_command_timer();
            self.hc.ring_doorbell(DB_TARGET_HOST, DB_VALUE_HOST);
        } else {
            self.cmd.state = CommandRingState::Stopped;
        }
    }

    /// Completes every pending command as aborted and rewinds the ring to its start.
    fn clear_command_ring(&mut self) {
        let pending = mem::take(&mut self.cmd.pending);
        self.cmd.deadline = None;
        self.cmd.ring.reset();
        self.hc.write_crcr(self.cmd.ring.register());
        self.cmd.state = CommandRingState::Stopped;

        for command in pending {
            match command.waiter {
                Some(waiter) => self
                    .continuations
                    .push(waiter.into_continuation(Err(Error::CommandAborted))),
                None => self.drop_internal_command(command.command),
            }
        }
    }

    /// Undoes the bookkeeping of an engine command that will never complete.
    fn drop_internal_command(&mut self, command: Command) {
        match command {
            Command::StopEndpoint { endpoint, .. } => {
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.flags.remove(EpFlags::STOP_CMD_PENDING);
                }
            }
            Command::SetTrDequeuePointer { endpoint, .. } => {
                self.handle_set_deq_completion(endpoint, TrbCompletionCode::CommandAborted as u8)
            }
            Command::ResetEndpoint { endpoint, .. } => {
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.flags.remove(EpFlags::HALTED);
                }
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::io::Io;

    #[test]
    fn command_trbs() {
        let mut trb = Trb::default();
        Command::EnableSlot { slot_type: 0 }.write(&mut trb, true);
        assert_eq!(trb.trb_type_checked(), Some(TrbType::EnableSlot));
        assert!(trb.cycle());

        let endpoint = EndpointId::new(2, 3);
        Command::SetTrDequeuePointer {
            endpoint,
            dequeue: 0x1_2340 | 1,
        }
        .write(&mut trb, false);
        assert_eq!(trb.read_data(), 0x1_2340 | 1);
        assert_eq!(trb.event_slot(), 2);
        assert_eq!(trb.endpoint_id(), 4);
        assert!(!trb.cycle());

        Command::ResetEndpoint {
            endpoint,
            transfer_state_preserve: true,
        }
        .write(&mut trb, true);
        assert_eq!(trb.trb_type_checked(), Some(TrbType::ResetEndpoint));
        assert_eq!(trb.control.read() & (1 << 9), 1 << 9);
    }

    #[test]
    fn endpoint_commands_are_internal() {
        let endpoint = EndpointId::new(1, 0);
        assert!(check_submittable(&Command::StopEndpoint {
            endpoint,
            suspend: false
        })
        .is_err());
        assert!(check_submittable(&Command::ResetEndpoint {
            endpoint,
            transfer_state_preserve: false
        })
        .is_err());
        assert!(check_submittable(&Command::NoOp).is_ok());
        assert!(check_submittable(&Command::DisableSlot { slot: 1 }).is_ok());
    }
}
