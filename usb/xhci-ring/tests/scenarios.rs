use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::timeout::ManualClock;
use xhci_ring::config::QuirkName;
use xhci_ring::sim::{AbortBehavior, SimulatedHc, TdOutcome};
use xhci_ring::xhci::regs::ERDP_EHB;
use xhci_ring::xhci::trb::{trb_type, Trb, TrbCompletionCode, TrbType};
use xhci_ring::xhci::{
    Command, CommandRingState, Direction, EndpointConfig, EndpointId, EndpointType, EpFlags,
    HostEvent, IsoPacket, SetupPacket, TransferFlags, TransferRequest,
};
use xhci_ring::{Error, TransferError, Xhci, XhciConfig};

struct Setup {
    sim: SimulatedHc,
    xhci: Xhci<SimulatedHc>,
    clock: Arc<ManualClock>,
}

fn setup_with(config: XhciConfig) -> Setup {
    let sim = SimulatedHc::new();
    let clock = Arc::new(ManualClock::new());
    let xhci = Xhci::new(sim.clone(), config, clock.clone()).unwrap();
    Setup { sim, xhci, clock }
}

fn small_rings() -> XhciConfig {
    XhciConfig {
        trbs_per_segment: 16,
        ..XhciConfig::default()
    }
}

fn setup() -> Setup {
    setup_with(small_rings())
}

impl Setup {
    /// Adds a running endpoint and returns the address of its first ring segment.
    fn endpoint(&self, id: EndpointId, kind: EndpointType, max_packet_size: u16) -> u64 {
        let dequeue = self
            .xhci
            .add_endpoint(EndpointConfig::new(id, kind, max_packet_size))
            .unwrap();
        self.sim.configure_endpoint(id, dequeue);
        dequeue & !0xF
    }

    /// Queues and completes single TRB transfers until the ring is at `count` TRBs further.
    fn advance_ring(&self, id: EndpointId, buffer: u64, count: usize) {
        for _ in 0..count {
            let transfer = self
                .xhci
                .queue_transfer(TransferRequest::bulk(id, Direction::In, buffer, 512))
                .unwrap();
            assert!(self.sim.complete_td(&self.xhci, id, TdOutcome::Success));
            assert_eq!(transfer.wait().status, Ok(()));
        }
    }

    fn bulk_in(&self, id: EndpointId, length: u32) -> xhci_ring::xhci::TransferHandle {
        let buffer = self.sim.alloc_buffer(length as usize);
        self.xhci
            .queue_transfer(TransferRequest::bulk(id, Direction::In, buffer, length))
            .unwrap()
    }

    fn commands_of(&self, ty: TrbType) -> usize {
        self.sim
            .command_log()
            .into_iter()
            .filter(|&logged| logged == ty)
            .count()
    }
}

const BULK: EndpointId = EndpointId::new(1, 2);

#[test]
fn commands_complete_in_submission_order() {
    let s = setup();
    let noop = s.xhci.submit_command(Command::NoOp).unwrap();
    let first = s
        .xhci
        .submit_command(Command::EnableSlot { slot_type: 0 })
        .unwrap();
    let second = s
        .xhci
        .submit_command(Command::EnableSlot { slot_type: 0 })
        .unwrap();
    assert_eq!(s.xhci.pending_commands(), 3);
    assert_eq!(s.sim.doorbells()[0], (0, 0));

    assert_eq!(s.sim.run_commands(&s.xhci), 3);
    assert!(noop.wait().unwrap().is_success());
    assert_eq!(first.wait().unwrap().slot_id, 1);
    assert_eq!(second.wait().unwrap().slot_id, 2);
    assert_eq!(s.xhci.pending_commands(), 0);
}

#[test]
fn engine_commands_cannot_be_submitted() {
    let s = setup();
    let stop = Command::StopEndpoint {
        endpoint: BULK,
        suspend: false,
    };
    assert!(matches!(
        s.xhci.submit_command(stop),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn callbacks_run_outside_the_lock() {
    let s = setup();
    let xhci = Arc::new(s.xhci);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = Arc::clone(&order);
        let resubmit = Arc::clone(&xhci);
        xhci.submit_command_with(Command::NoOp, move |result| {
            assert!(result.unwrap().is_success());
            order.lock().unwrap().push(i);
            if i == 2 {
                // Submitting from a callback must not deadlock.
                resubmit.submit_command_with(Command::NoOp, |_| ()).unwrap();
            }
        })
        .unwrap();
    }
    s.sim.run_commands(&*xhci);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(xhci.pending_commands(), 1);
    assert_eq!(s.sim.run_commands(&*xhci), 1);
    assert_eq!(xhci.pending_commands(), 0);
}

#[test]
fn timed_out_command_is_aborted() {
    let s = setup();
    s.sim.hold_commands(true);
    let stuck = s.xhci.submit_command(Command::NoOp).unwrap();
    let next = s
        .xhci
        .submit_command(Command::EnableSlot { slot_type: 0 })
        .unwrap();

    s.clock.advance(Duration::from_millis(4999));
    s.xhci.check_command_timeout();
    assert_eq!(s.xhci.command_ring_state(), CommandRingState::Running);

    s.clock.advance(Duration::from_millis(2));
    s.xhci.check_command_timeout();
    assert_eq!(s.xhci.command_ring_state(), CommandRingState::Aborted);

    s.sim.hold_commands(false);
    // Delivers the abort events, the ring is restarted for the next command.
    s.sim.run_commands(&s.xhci);
    assert!(matches!(stuck.wait(), Err(Error::CommandAborted)));
    assert_eq!(s.xhci.command_ring_state(), CommandRingState::Running);
    assert!(s.sim.command_running());

    assert_eq!(s.sim.run_commands(&s.xhci), 1);
    assert_eq!(next.wait().unwrap().slot_id, 1);
    assert_eq!(s.xhci.pending_commands(), 0);
}

#[test]
fn timeout_on_stopped_ring_turns_command_into_noop() {
    let s = setup();
    s.sim.hold_commands(true);
    let stuck = s
        .xhci
        .submit_command(Command::EnableSlot { slot_type: 0 })
        .unwrap();
    let next = s
        .xhci
        .submit_command(Command::EnableSlot { slot_type: 0 })
        .unwrap();
    s.sim.stop_command_ring();

    s.clock.advance(Duration::from_secs(6));
    s.xhci.check_command_timeout();
    assert_eq!(s.xhci.command_ring_state(), CommandRingState::Running);

    s.sim.hold_commands(false);
    assert_eq!(s.sim.run_commands(&s.xhci), 2);
    assert!(matches!(stuck.wait(), Err(Error::CommandAborted)));
    assert_eq!(next.wait().unwrap().slot_id, 1);
    assert_eq!(
        s.sim.command_log(),
        vec![TrbType::NoOpCmd, TrbType::EnableSlot]
    );
}

#[test]
fn missing_stop_event_clears_the_command_ring() {
    let s = setup();
    s.sim.set_abort_behavior(AbortBehavior::StopSilently);
    s.sim.hold_commands(true);
    let first = s.xhci.submit_command(Command::NoOp).unwrap();
    let second = s.xhci.submit_command(Command::NoOp).unwrap();

    s.clock.advance(Duration::from_millis(5001));
    s.xhci.check_command_timeout();
    s.clock.advance(Duration::from_millis(1000));
    s.xhci.poll_abort();
    assert_eq!(s.xhci.pending_commands(), 2);

    s.clock.advance(Duration::from_millis(1001));
    s.xhci.poll_abort();
    assert!(matches!(first.wait(), Err(Error::CommandAborted)));
    assert!(matches!(second.wait(), Err(Error::CommandAborted)));
    assert_eq!(s.xhci.pending_commands(), 0);
    assert_eq!(s.xhci.command_ring_state(), CommandRingState::Stopped);

    // The ring starts over from its first slot.
    s.sim.hold_commands(false);
    let again = s
        .xhci
        .submit_command(Command::EnableSlot { slot_type: 0 })
        .unwrap();
    assert_eq!(s.sim.run_commands(&s.xhci), 1);
    assert_eq!(again.wait().unwrap().slot_id, 1);
}

#[test]
fn failed_abort_kills_the_host() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let transfer = s.bulk_in(BULK, 512);

    s.sim.set_abort_behavior(AbortBehavior::Hang);
    s.sim.hold_commands(true);
    let stuck = s.xhci.submit_command(Command::NoOp).unwrap();

    s.clock.advance(Duration::from_millis(5001));
    s.xhci.check_command_timeout();
    assert!(!s.xhci.is_dying());

    s.clock.advance(Duration::from_millis(5001));
    s.xhci.poll_abort();
    assert!(s.xhci.is_dying());
    assert!(matches!(stuck.wait(), Err(Error::HostDied)));
    assert_eq!(transfer.wait().status, Err(TransferError::HostDied));

    assert!(matches!(
        s.xhci.submit_command(Command::NoOp),
        Err(Error::HostDied)
    ));
}

#[test]
fn watchdog_drives_the_abort_sequence() {
    let sim = SimulatedHc::new();
    let clock = Arc::new(ManualClock::new());
    let xhci = Arc::new(Xhci::new(sim.clone(), small_rings(), clock.clone()).unwrap());
    sim.set_abort_behavior(AbortBehavior::Hang);
    sim.hold_commands(true);
    let stuck = xhci.submit_command(Command::NoOp).unwrap();

    let watchdog = xhci.start_command_watchdog(Duration::from_millis(1));
    clock.advance(Duration::from_millis(5001));
    while xhci.command_ring_state() != CommandRingState::Aborted {
        thread::sleep(Duration::from_millis(1));
    }
    clock.advance(Duration::from_millis(5001));
    watchdog.join().unwrap();

    assert!(xhci.is_dying());
    assert!(matches!(stuck.wait(), Err(Error::HostDied)));
}

#[test]
fn bulk_transfer_completes() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let transfer = s.bulk_in(BULK, 4096);
    assert_eq!(s.xhci.queued_tds(BULK), Some(1));
    assert_eq!(s.sim.doorbells().last(), Some(&(1, 3)));

    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    let result = transfer.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 4096);
    assert_eq!(s.xhci.queued_tds(BULK), Some(0));
    assert!(!s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
}

#[test]
fn transfer_ring_grows_under_pressure() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    assert_eq!(s.xhci.endpoint_ring_segments(BULK), Some(2));

    // One TRB per transfer: the buffer must not cross a 64 KiB boundary.
    let buffer = (s.sim.alloc_buffer(0x20000) + 0xFFFF) & !0xFFFF;
    let transfers: Vec<_> = (0..40)
        .map(|_| {
            s.xhci
                .queue_transfer(TransferRequest::bulk(BULK, Direction::In, buffer, 512))
                .unwrap()
        })
        .collect();
    assert_eq!(s.xhci.endpoint_ring_segments(BULK), Some(3));
    assert_eq!(s.xhci.queued_tds(BULK), Some(40));

    for _ in 0..40 {
        assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    }
    for transfer in transfers {
        let result = transfer.wait();
        assert_eq!(result.status, Ok(()));
        assert_eq!(result.actual_length, 512);
    }
    assert_eq!(s.xhci.queued_tds(BULK), Some(0));
}

#[test]
fn short_packets_report_actual_length() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let short = s.bulk_in(BULK, 1024);
    let buffer = s.sim.alloc_buffer(1024);
    let strict = s
        .xhci
        .queue_transfer(
            TransferRequest::bulk(BULK, Direction::In, buffer, 1024)
                .with_flags(TransferFlags::SHORT_NOT_OK),
        )
        .unwrap();

    s.sim
        .complete_td(&s.xhci, BULK, TdOutcome::Short { residue: 24 });
    let result = short.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 1000);

    s.sim
        .complete_td(&s.xhci, BULK, TdOutcome::Short { residue: 1000 });
    let result = strict.wait();
    assert_eq!(result.status, Err(TransferError::ShortPacket));
    assert_eq!(result.actual_length, 24);
}

#[test]
fn control_transfer_keeps_data_stage_length() {
    let s = setup();
    let control = EndpointId::new(1, 0);
    s.endpoint(control, EndpointType::Control, 64);

    let buffer = s.sim.alloc_buffer(18);
    let setup = SetupPacket {
        request_type: 0x80,
        request: 6,
        value: 0x0100,
        index: 0,
        length: 18,
    };
    let transfer = s
        .xhci
        .queue_transfer(TransferRequest::control(control, setup, buffer))
        .unwrap();
    s.sim
        .complete_td(&s.xhci, control, TdOutcome::Short { residue: 10 });

    let result = transfer.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 8);
}

#[test]
fn isochronous_frames_complete_individually() {
    let s = setup();
    let isoc = EndpointId::new(1, 4);
    s.endpoint(isoc, EndpointType::Isoch, 1024);

    let buffer = s.sim.alloc_buffer(1024);
    let packets = vec![
        IsoPacket {
            offset: 0,
            length: 512,
        },
        IsoPacket {
            offset: 512,
            length: 512,
        },
    ];
    let mut transfer = s
        .xhci
        .queue_transfer(TransferRequest::isoch(isoc, Direction::In, buffer, packets))
        .unwrap();
    assert_eq!(s.xhci.queued_tds(isoc), Some(2));

    assert!(s.sim.complete_td(&s.xhci, isoc, TdOutcome::Success));
    assert!(transfer.try_result().is_none());
    assert!(s.sim.complete_td(&s.xhci, isoc, TdOutcome::Success));

    let result = transfer.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 1024);
    assert_eq!(result.frames.len(), 2);
    for frame in result.frames {
        assert_eq!(frame.status, Ok(()));
        assert_eq!(frame.actual_length, 512);
    }
}

#[test]
fn cancelling_a_cached_td_moves_the_dequeue_pointer_once() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let mut transfer = s.bulk_in(BULK, 1024);
    let id = transfer.id();

    s.xhci.cancel_transfer(id).unwrap();
    assert!(s
        .xhci
        .endpoint_flags(BULK)
        .unwrap()
        .contains(EpFlags::STOP_CMD_PENDING));
    // Cancelling twice is harmless.
    s.xhci.cancel_transfer(id).unwrap();

    // Stop Endpoint: the controller stopped on the TD, it has to be skipped.
    s.sim.run_commands(&s.xhci);
    assert!(transfer.try_result().is_none());
    assert!(s
        .xhci
        .endpoint_flags(BULK)
        .unwrap()
        .contains(EpFlags::SET_DEQ_PENDING));
    s.xhci.cancel_transfer(id).unwrap();

    // Set TR Dequeue Pointer: only now the TD is given back.
    s.sim.run_commands(&s.xhci);
    let result = transfer.wait();
    assert_eq!(result.status, Err(TransferError::Cancelled));
    assert_eq!(s.commands_of(TrbType::StopEndpoint), 1);
    assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 1);
    assert_eq!(s.xhci.endpoint_flags(BULK), Some(EpFlags::empty()));
    assert_eq!(s.xhci.queued_tds(BULK), Some(0));

    assert!(matches!(
        s.xhci.cancel_transfer(id),
        Err(Error::NoRequest(_))
    ));
}

#[test]
fn cancelling_an_idle_td_clears_it_in_place() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let first = s.bulk_in(BULK, 1024);
    let second = s.bulk_in(BULK, 1024);

    s.xhci.cancel_transfer(second.id()).unwrap();
    s.sim.clear_doorbells();
    s.sim.run_commands(&s.xhci);

    assert_eq!(second.wait().status, Err(TransferError::Cancelled));
    assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 0);
    // The endpoint is restarted for the TD left on the ring.
    assert_eq!(s.sim.doorbells(), vec![(1, 3)]);

    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    assert_eq!(first.wait().actual_length, 1024);
    // Only the no-ops of the cancelled TD are left.
    assert!(!s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
}

#[test]
fn stalled_endpoint_is_reset_and_restarted() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let first = s.bulk_in(BULK, 1024);
    let second = s.bulk_in(BULK, 1024);

    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Stall));
    assert!(s
        .xhci
        .endpoint_flags(BULK)
        .unwrap()
        .contains(EpFlags::HALTED));

    // Queueing on a halted endpoint does not ring its doorbell.
    s.sim.clear_doorbells();
    let third = s.bulk_in(BULK, 1024);
    assert!(s.sim.doorbells().is_empty());

    s.sim.run_commands(&s.xhci);
    s.sim.run_commands(&s.xhci);
    let result = first.wait();
    assert_eq!(result.status, Err(TransferError::Stall));
    assert_eq!(result.actual_length, 0);
    assert_eq!(
        s.sim.command_log(),
        vec![TrbType::ResetEndpoint, TrbType::SetTrDequeuePointer]
    );
    assert_eq!(s.xhci.endpoint_flags(BULK), Some(EpFlags::empty()));

    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    assert_eq!(second.wait().status, Ok(()));
    assert_eq!(third.wait().status, Ok(()));
}

#[test]
fn transaction_errors_are_retried_before_failing() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let mut transfer = s.bulk_in(BULK, 1024);

    // max_soft_retry of 3 allows a soft reset for the first four errors.
    for retry in 1..=4 {
        assert!(s
            .sim
            .complete_td(&s.xhci, BULK, TdOutcome::TransactionError));
        s.sim.run_commands(&s.xhci);
        assert!(transfer.try_result().is_none());
        assert_eq!(s.commands_of(TrbType::ResetEndpoint), retry);
        assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 0);
    }

    assert!(s
        .sim
        .complete_td(&s.xhci, BULK, TdOutcome::TransactionError));
    s.sim.run_commands(&s.xhci);
    s.sim.run_commands(&s.xhci);
    assert_eq!(transfer.wait().status, Err(TransferError::Transaction));
    assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 1);
}

#[test]
fn soft_retry_can_be_disabled() {
    let s = setup_with(XhciConfig {
        quirks: vec![QuirkName::NoSoftRetry],
        ..small_rings()
    });
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let transfer = s.bulk_in(BULK, 1024);

    s.sim
        .complete_td(&s.xhci, BULK, TdOutcome::TransactionError);
    s.sim.run_commands(&s.xhci);
    s.sim.run_commands(&s.xhci);
    assert_eq!(transfer.wait().status, Err(TransferError::Transaction));
}

#[test]
fn spurious_success_after_short_packet_is_ignored() {
    let s = setup_with(XhciConfig {
        quirks: vec![QuirkName::SpuriousSuccess],
        ..small_rings()
    });
    s.sim.set_spurious_success(true);
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let first = s.bulk_in(BULK, 1024);
    let mut second = s.bulk_in(BULK, 1024);

    s.sim
        .complete_td(&s.xhci, BULK, TdOutcome::Short { residue: 24 });
    assert_eq!(first.wait().actual_length, 1000);
    assert!(second.try_result().is_none());
    assert_eq!(s.xhci.queued_tds(BULK), Some(1));

    s.sim.set_spurious_success(false);
    s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success);
    let result = second.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 1024);
}

#[test]
fn dead_host_fails_everything() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let transfer = s.bulk_in(BULK, 1024);
    s.sim.hold_commands(true);
    let command = s.xhci.submit_command(Command::NoOp).unwrap();

    s.sim.set_dead(true);
    assert!(matches!(s.xhci.handle_irq(), Err(Error::HostDied)));
    assert!(s.xhci.is_dying());

    assert_eq!(transfer.wait().status, Err(TransferError::HostDied));
    assert!(matches!(command.wait(), Err(Error::HostDied)));
    let buffer = s.sim.alloc_buffer(64);
    assert!(matches!(
        s.xhci
            .queue_transfer(TransferRequest::bulk(BULK, Direction::In, buffer, 64)),
        Err(Error::HostDied)
    ));
}

#[test]
fn removed_endpoint_shuts_down_its_requests() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let transfer = s.bulk_in(BULK, 1024);

    s.xhci.remove_endpoint(BULK).unwrap();
    assert_eq!(transfer.wait().status, Err(TransferError::Shutdown));
    assert_eq!(s.xhci.queued_tds(BULK), None);
    assert!(matches!(
        s.xhci.remove_endpoint(BULK),
        Err(Error::NoEndpoint(_))
    ));
}

fn port_status_change(port_id: u8) -> Trb {
    let mut trb = Trb::default();
    trb.set(
        u64::from(port_id) << 24,
        1 << 24,
        trb_type(TrbType::PortStatusChange),
    );
    trb
}

#[test]
fn event_ring_dequeue_is_written_back_every_half_segment() {
    let s = setup();
    let base = s.sim.erdp();
    for port in 1..=10 {
        s.sim.push_event(port_status_change(port));
    }
    assert_eq!(s.sim.deliver_events(&s.xhci).unwrap(), 10);
    assert_eq!(s.sim.erdp_writes(), vec![base + 8 * 16, (base + 10 * 16) | ERDP_EHB]);

    let ports: Vec<HostEvent> = s.xhci.host_events().try_iter().collect();
    let expected: Vec<HostEvent> = (1..=10)
        .map(|port_id| HostEvent::PortStatusChange { port_id })
        .collect();
    assert_eq!(ports, expected);
}

#[test]
fn event_ring_wraps_around() {
    let s = setup();
    for round in 0..3u8 {
        for port in 0..7 {
            s.sim.push_event(port_status_change(round * 10 + port));
        }
        assert_eq!(s.sim.deliver_events(&s.xhci).unwrap(), 7);
    }
    assert_eq!(s.xhci.host_events().try_iter().count(), 21);
    assert_eq!(s.sim.port_status_change(&s.xhci, 99).unwrap(), 1);
    assert_eq!(
        s.xhci.host_events().try_recv().unwrap(),
        HostEvent::PortStatusChange { port_id: 99 }
    );
}

fn transfer_event(endpoint: EndpointId, address: u64, code: TrbCompletionCode) -> Trb {
    let mut trb = Trb::default();
    trb.set(
        address,
        u32::from(code as u8) << 24,
        trb_type(TrbType::Transfer)
            | (u32::from(endpoint.dci()) << 16)
            | (u32::from(endpoint.slot) << 24),
    );
    trb
}

/// A buffer starting on a 64 KiB boundary with at least `len` bytes behind it.
fn aligned_buffer(s: &Setup, len: usize) -> u64 {
    (s.sim.alloc_buffer(len + 0x10000) + 0xFFFF) & !0xFFFF
}

#[test]
fn stop_endpoint_retries_end_after_the_retry_window() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let mut transfer = s.bulk_in(BULK, 512);
    // The endpoint keeps reporting Running while every Stop Endpoint fails.
    s.sim.set_stop_endpoint_fails(true);
    s.xhci.cancel_transfer(transfer.id()).unwrap();

    s.sim.run_commands(&s.xhci);
    assert_eq!(s.commands_of(TrbType::StopEndpoint), 1);
    assert_eq!(s.xhci.pending_commands(), 1);

    s.clock.advance(Duration::from_millis(50));
    s.sim.run_commands(&s.xhci);
    assert_eq!(s.commands_of(TrbType::StopEndpoint), 2);
    assert_eq!(s.xhci.pending_commands(), 1);

    // Past the window the TD is invalidated without another retry.
    s.clock.advance(Duration::from_millis(51));
    s.sim.run_commands(&s.xhci);
    assert_eq!(s.commands_of(TrbType::StopEndpoint), 3);
    assert!(transfer.try_result().is_none());

    s.sim.run_commands(&s.xhci);
    assert_eq!(transfer.wait().status, Err(TransferError::Cancelled));
    assert_eq!(s.commands_of(TrbType::StopEndpoint), 3);
    assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 1);
    assert_eq!(s.xhci.pending_commands(), 0);
    assert!(!s
        .xhci
        .endpoint_flags(BULK)
        .unwrap()
        .contains(EpFlags::STOP_CMD_PENDING));
}

#[test]
fn cancel_during_set_dequeue_waits_for_its_completion() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let first = s.bulk_in(BULK, 1024);
    let mut second = s.bulk_in(BULK, 1024);

    s.xhci.cancel_transfer(first.id()).unwrap();
    s.sim.run_commands(&s.xhci);
    assert!(s
        .xhci
        .endpoint_flags(BULK)
        .unwrap()
        .contains(EpFlags::SET_DEQ_PENDING));

    // No Stop Endpoint while the dequeue pointer is being moved.
    s.xhci.cancel_transfer(second.id()).unwrap();
    assert_eq!(s.xhci.pending_commands(), 1);

    s.sim.run_commands(&s.xhci);
    assert_eq!(first.wait().status, Err(TransferError::Cancelled));
    // The second TD is now the one the controller stopped on.
    assert!(second.try_result().is_none());
    assert_eq!(s.xhci.pending_commands(), 1);

    s.sim.run_commands(&s.xhci);
    assert_eq!(second.wait().status, Err(TransferError::Cancelled));
    assert_eq!(s.commands_of(TrbType::StopEndpoint), 1);
    assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 2);
    assert_eq!(s.xhci.endpoint_flags(BULK), Some(EpFlags::empty()));
    assert_eq!(s.xhci.queued_tds(BULK), Some(0));
}

#[test]
fn cancelling_a_td_across_the_ring_wrap_flips_the_dequeue_cycle() {
    let s = setup();
    let base = s.endpoint(BULK, EndpointType::Bulk, 512);
    let buffer = aligned_buffer(&s, 0x30000);

    // 15 TRBs fit in a segment, this leaves the enqueue at the third last slot of the second.
    s.advance_ring(BULK, buffer, 28);
    let transfer = s
        .xhci
        .queue_transfer(TransferRequest::bulk(
            BULK,
            Direction::In,
            buffer,
            2 * 0x10000 + 512,
        ))
        .unwrap();

    s.xhci.cancel_transfer(transfer.id()).unwrap();
    s.sim.run_commands(&s.xhci);
    s.sim.run_commands(&s.xhci);
    assert_eq!(transfer.wait().status, Err(TransferError::Cancelled));
    assert_eq!(s.commands_of(TrbType::SetTrDequeuePointer), 1);

    // Past the last TRB, which sits in the first segment after the toggling link.
    let ctx = s.sim.context(BULK);
    assert_eq!(ctx.dequeue_address(), base + 16);
    assert!(!ctx.dequeue_cycle());
}

#[test]
fn unaligned_data_before_a_link_goes_through_the_bounce_buffer() {
    let s = setup();
    let base = s.endpoint(BULK, EndpointType::Bulk, 512);
    let boundary = aligned_buffer(&s, 0x20000) + 0x10000;
    s.advance_ring(BULK, boundary, 14);

    // 100 bytes up to the 64 KiB boundary would end the segment on a partial packet.
    let buffer = boundary - 100;
    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    s.sim.write_memory(buffer, &data);
    let transfer = s
        .xhci
        .queue_transfer(TransferRequest::bulk(BULK, Direction::Out, buffer, 1000))
        .unwrap();

    let fields = s.xhci.dma_read_trb(base + 14 * 16).unwrap();
    let bounce = u64::from(fields[0]) | (u64::from(fields[1]) << 32);
    assert_ne!(bounce, buffer);
    assert_eq!(fields[2] & 0x1FFFF, 512);
    assert_eq!(s.sim.read_memory(bounce, 512), data[..512].to_vec());

    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    let result = transfer.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 1000);
}

#[test]
fn zero_packet_flag_adds_a_zero_length_td() {
    let s = setup();
    s.endpoint(BULK, EndpointType::Bulk, 512);
    let buffer = aligned_buffer(&s, 512);
    let mut transfer = s
        .xhci
        .queue_transfer(
            TransferRequest::bulk(BULK, Direction::Out, buffer, 512)
                .with_flags(TransferFlags::ZERO_PACKET),
        )
        .unwrap();
    assert_eq!(s.xhci.queued_tds(BULK), Some(2));

    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    assert!(transfer.try_result().is_none());
    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));

    let result = transfer.wait();
    assert_eq!(result.status, Ok(()));
    assert_eq!(result.actual_length, 512);
    assert_eq!(s.xhci.queued_tds(BULK), Some(0));

    // A short transfer needs no zero length packet.
    let short = s
        .xhci
        .queue_transfer(
            TransferRequest::bulk(BULK, Direction::Out, buffer, 100)
                .with_flags(TransferFlags::ZERO_PACKET),
        )
        .unwrap();
    assert_eq!(s.xhci.queued_tds(BULK), Some(1));
    assert!(s.sim.complete_td(&s.xhci, BULK, TdOutcome::Success));
    assert_eq!(short.wait().actual_length, 100);
}

#[test]
fn missed_service_skips_isochronous_frames() {
    let s = setup();
    let isoc = EndpointId::new(1, 4);
    let base = s.endpoint(isoc, EndpointType::Isoch, 1024);
    let buffer = aligned_buffer(&s, 1536);
    let packets = (0..3)
        .map(|frame| IsoPacket {
            offset: frame * 512,
            length: 512,
        })
        .collect();
    let mut transfer = s
        .xhci
        .queue_transfer(TransferRequest::isoch(isoc, Direction::In, buffer, packets))
        .unwrap();
    assert_eq!(s.xhci.queued_tds(isoc), Some(3));

    s.sim
        .post_event(&s.xhci, transfer_event(isoc, 0, TrbCompletionCode::MissedService))
        .unwrap();
    assert_eq!(s.xhci.queued_tds(isoc), Some(3));

    // An underrun while skipping gives back a single frame.
    s.sim
        .post_event(&s.xhci, transfer_event(isoc, 0, TrbCompletionCode::RingUnderrun))
        .unwrap();
    assert_eq!(s.xhci.queued_tds(isoc), Some(2));
    assert!(transfer.try_result().is_none());

    // The next event lands on the last frame, the one before it was missed too.
    s.sim
        .post_event(&s.xhci, transfer_event(isoc, base + 32, TrbCompletionCode::Success))
        .unwrap();
    assert_eq!(s.xhci.queued_tds(isoc), Some(0));

    let result = transfer.wait();
    assert_eq!(result.frames.len(), 3);
    assert_eq!(result.frames[0].status, Err(TransferError::MissedService));
    assert_eq!(result.frames[1].status, Err(TransferError::MissedService));
    assert_eq!(result.frames[2].status, Ok(()));
    assert_eq!(result.frames[2].actual_length, 512);
}
