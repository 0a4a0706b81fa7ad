//! The event ring processor.
//!
//! [`Xhci::handle_irq`] is the interrupt handler of the primary interrupter. It consumes every
//! event the controller has written, completes commands and transfers, and forwards port and
//! device events on the host event channel.
use std::sync::atomic::{fence, Ordering};

use log::{debug, error, trace, warn};

use crate::config::Quirks;
use crate::error::{Error, Result, TransferError};

use super::cancel::ResetType;
use super::endpoint::{EndpointContext, EndpointId, EndpointState, EndpointType};
use super::regs::{HostController, USBSTS_EINT, USBSTS_HCE, USBSTS_HCH, USBSTS_HSE};
use super::ring::{RingKind, TrbPos};
use super::trb::{Trb, TrbCompletionCode, TrbType, TRB_NEC_CMD_COMP, TRB_VENDOR_DEFINED_LOW};
use super::{Xhci, XhciInner};

/// Events for the layer above the ring engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostEvent {
    PortStatusChange {
        port_id: u8,
    },
    DeviceNotification {
        slot: u8,
        notification_type: u8,
        /// Device Notification Data, bits 8..63 of the event's parameter.
        data: u64,
    },
}

impl<H: HostController> Xhci<H> {
    /// Handles every pending event. Returns the number of events consumed.
    pub fn handle_irq(&self) -> Result<usize> {
        self.with_inner(|inner| inner.handle_irq())
    }
}

fn is_code(code: u8, expected: TrbCompletionCode) -> bool {
    code == expected as u8
}

fn is_stopped(code: u8) -> bool {
    is_code(code, TrbCompletionCode::Stopped)
        || is_code(code, TrbCompletionCode::StoppedLengthInvalid)
        || is_code(code, TrbCompletionCode::StoppedShortPacket)
}

/// Transaction errors halt the endpoint on most controllers, which then need a reset.
fn requires_manual_halt_cleanup(ctx: &EndpointContext, code: u8) -> bool {
    (is_code(code, TrbCompletionCode::UsbTransaction)
        || is_code(code, TrbCompletionCode::BabbleDetected)
        || is_code(code, TrbCompletionCode::SplitTransaction))
        && ctx.state == EndpointState::Halted
}

impl<H: HostController> XhciInner<H> {
    fn handle_irq(&mut self) -> Result<usize> {
        let status = self.hc.read_usbsts();
        if status == u32::MAX {
            warn!("USBSTS reads all ones");
            self.hc_died();
            return Err(Error::HostDied);
        }
        if status & USBSTS_HSE != 0 {
            error!("Host system error");
            self.hc.halt();
            self.hc_died();
            return Err(Error::HostDied);
        }
        if status & USBSTS_HCE != 0 {
            warn!("Host controller error");
            return Ok(0);
        }
        if status & USBSTS_EINT != 0 {
            self.hc.write_usbsts(USBSTS_EINT);
        }

        if self.dying || status & USBSTS_HCH != 0 {
            debug!("Event ring handling on a halted or dying host");
            self.events.update_erdp(&mut self.hc, true);
            return Err(Error::HostDied);
        }

        let half_segment = (self.config.trbs_per_segment / 2).max(1);
        let mut count = 0;
        while self.events.has_event() {
            let event = self.events.next().clone();
            // The rest of the event may only be read after its cycle bit.
            fence(Ordering::Acquire);

            if let Err(err) = self.handle_event(&event) {
                warn!("Failed to handle {}: {}", event, err);
            }
            if self.dying {
                self.events.update_erdp(&mut self.hc, true);
                return Err(Error::HostDied);
            }

            self.events.ring.inc_deq();
            count += 1;

            // Let the controller reuse what has been consumed so far.
            if count % half_segment == 0 {
                self.events.update_erdp(&mut self.hc, false);
                self.events.shrink_bei_interval();
            }
        }

        self.events.update_erdp(&mut self.hc, true);
        trace!("Handled {} events", count);
        Ok(count)
    }

    fn handle_event(&mut self, event: &Trb) -> Result<()> {
        let raw_type = event.trb_type();
        match event.trb_type_checked() {
            Some(TrbType::CommandCompletion) => self.handle_cmd_completion(event),
            Some(TrbType::Transfer) => self.handle_tx_event(event),
            Some(TrbType::PortStatusChange) => {
                self.send_host_event(HostEvent::PortStatusChange {
                    port_id: event.port_status_change_port_id(),
                });
                Ok(())
            }
            Some(TrbType::DeviceNotification) => {
                self.send_host_event(HostEvent::DeviceNotification {
                    slot: event.event_slot(),
                    notification_type: event.device_notification_type(),
                    data: event.read_data() >> 8,
                });
                Ok(())
            }
            Some(TrbType::HostController) => {
                if is_code(event.completion_code(), TrbCompletionCode::EventRingFull) {
                    warn!("Event ring full");
                } else {
                    debug!("Host controller event, code {}", event.completion_code());
                }
                Ok(())
            }
            _ if raw_type >= TRB_VENDOR_DEFINED_LOW => {
                if raw_type == TRB_NEC_CMD_COMP && self.quirks.contains(Quirks::NEC_HOST) {
                    return self.handle_cmd_completion(event);
                }
                debug!("Vendor defined event {}", raw_type);
                Ok(())
            }
            _ => {
                warn!("Unhandled event type {}", raw_type);
                Ok(())
            }
        }
    }

    fn send_host_event(&mut self, event: HostEvent) {
        trace!("Forwarding {:?}", event);
        if let Err(err) = self.host_event_sender.send(event) {
            warn!("No one listens to host events: {}", err);
        }
    }

    fn handle_tx_event(&mut self, event: &Trb) -> Result<()> {
        let endpoint = EndpointId::from_trb_control(event.fields()[3])
            .ok_or_else(|| Error::Corrupt(format!("transfer event without endpoint: {}", event)))?;
        let mut code = event.completion_code();
        let residue = event.transfer_length();
        let ep_trb_dma = event.transfer_event_trb_pointer().unwrap_or(0);

        if !self.endpoints.contains_key(&endpoint) {
            return Err(Error::NoEndpoint(endpoint));
        }
        let ctx = self.hc.endpoint_context(endpoint);
        if ctx.state == EndpointState::Disabled {
            return Err(Error::Corrupt(format!(
                "transfer event for disabled endpoint {}",
                endpoint
            )));
        }

        use TrbCompletionCode as Code;
        let mut status = Ok(());
        let mut ring_xrun = false;
        match TrbCompletionCode::try_from(code) {
            Ok(Code::Success) => {
                if residue != 0 {
                    debug!("Successful completion on short transfer on {}", endpoint);
                    code = Code::ShortPacket as u8;
                }
            }
            Ok(Code::ShortPacket) => (),
            Ok(Code::Stopped) | Ok(Code::StoppedLengthInvalid) | Ok(Code::StoppedShortPacket) => {
                trace!("{} stopped, code {}", endpoint, code);
            }
            Ok(Code::Stall) => {
                debug!("Stalled endpoint {}", endpoint);
                status = Err(TransferError::Stall);
            }
            Ok(Code::SplitTransaction) | Ok(Code::UsbTransaction) => {
                debug!("Transfer error on endpoint {}, code {}", endpoint, code);
                status = Err(TransferError::Transaction);
            }
            Ok(Code::BabbleDetected) => {
                debug!("Babble error on endpoint {}", endpoint);
                status = Err(TransferError::Babble);
            }
            Ok(Code::Trb) => {
                warn!("TRB error on endpoint {}", endpoint);
                status = Err(TransferError::TrbError);
            }
            Ok(Code::DataBuffer) => {
                warn!("Data buffer error on endpoint {}", endpoint);
                status = Err(TransferError::DataBuffer);
            }
            Ok(Code::BandwidthOverrun) => warn!("Bandwidth overrun on endpoint {}", endpoint),
            Ok(Code::IsochBuffer) => warn!("Isochronous buffer overrun on endpoint {}", endpoint),
            Ok(Code::RingUnderrun) | Ok(Code::RingOverrun) => {
                // An isochronous ring ran empty, the controller keeps going.
                debug!("Ring xrun on endpoint {}, code {}", endpoint, code);
                if !self.skip(endpoint) {
                    return Ok(());
                }
                ring_xrun = true;
            }
            Ok(Code::MissedService) | Ok(Code::NoPingResponse) => {
                debug!("Missed service on endpoint {}, skipping TDs", endpoint);
                self.set_skip(endpoint, true);
                return Ok(());
            }
            Ok(Code::IncompatibleDevice) => {
                warn!("Incompatible device on endpoint {}", endpoint);
                status = Err(TransferError::Transaction);
            }
            _ if TrbCompletionCode::is_vendor_info(code) => (),
            _ => {
                warn!(
                    "Unknown transfer event code {} on endpoint {}, controller probably broken",
                    code, endpoint
                );
                if !self.skip(endpoint) {
                    return Ok(());
                }
            }
        }

        let mut td_num = if self.skip(endpoint) {
            self.endpoints[&endpoint].ring.td_list.len()
        } else {
            0
        };

        loop {
            self.handle_tx_event_td(endpoint, &ctx, event, code, status, ep_trb_dma, &mut td_num)?;

            // An xrun after a missed service gives back at most one skipped TD.
            let handling_skipped_tds = self.skip(endpoint)
                && !ring_xrun
                && !is_code(code, Code::MissedService)
                && !is_code(code, Code::NoPingResponse);
            if !handling_skipped_tds {
                break;
            }
        }
        Ok(())
    }

    fn skip(&self, endpoint: EndpointId) -> bool {
        self.endpoints.get(&endpoint).map_or(false, |ep| ep.skip)
    }

    fn set_skip(&mut self, endpoint: EndpointId, skip: bool) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.skip = skip;
        }
    }

    /// Matches one transfer event against the TD at the head of the ring.
    #[allow(clippy::too_many_arguments)]
    fn handle_tx_event_td(
        &mut self,
        endpoint: EndpointId,
        ctx: &EndpointContext,
        event: &Trb,
        code: u8,
        status: Result<(), TransferError>,
        ep_trb_dma: u64,
        td_num: &mut usize,
    ) -> Result<()> {
        let ep = &self.endpoints[&endpoint];
        let kind = ep.config.kind;
        let skip = ep.skip;

        let mut td = match ep.ring.td_list.front().copied() {
            Some(td) => td,
            None => {
                if !is_stopped(code) {
                    debug!("Transfer event for {} with no TDs queued, code {}", endpoint, code);
                }
                self.set_skip(endpoint, false);
                if is_code(code, TrbCompletionCode::Stall)
                    || requires_manual_halt_cleanup(ctx, code)
                {
                    self.handle_halted_endpoint(endpoint, None, ResetType::Hard)?;
                }
                return Ok(());
            }
        };
        if skip && *td_num == 0 {
            debug!("All TDs on {} skipped", endpoint);
            self.set_skip(endpoint, false);
            return Ok(());
        }
        if skip {
            *td_num -= 1;
        }

        let mut ep_pos = self.trb_in_td(endpoint, td, ep_trb_dma);
        let stopped_between_tds = is_code(code, TrbCompletionCode::Stopped)
            || is_code(code, TrbCompletionCode::StoppedLengthInvalid);
        if ep_pos.is_none() && stopped_between_tds {
            // The controller stopped between TDs, the Stop Endpoint completion takes over.
            return Ok(());
        }

        if ep_pos.is_none() {
            if skip && kind == EndpointType::Isoch {
                self.skip_isoc_td(endpoint, td, status);
                return Ok(());
            }
            if is_code(code, TrbCompletionCode::Success) && self.spurious_success(endpoint) {
                debug!("Spurious success event on {}, ignored", endpoint);
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.ring.old_trb_comp_code = 0;
                }
                return Ok(());
            }
            if self.tds[td].error_mid_td {
                debug!("Missing TD completion event after mid TD error on {}", endpoint);
                self.dequeue_td(endpoint, td);
                if let Some(&next) = self.endpoints[&endpoint].ring.td_list.front() {
                    td = next;
                    ep_pos = self.trb_in_td(endpoint, td, ep_trb_dma);
                }
            }
        }

        let ep_pos = match ep_pos {
            Some(pos) => pos,
            None => {
                error!(
                    "Transfer event for {:#x} on {} not part of the current TD, code {}",
                    ep_trb_dma, endpoint, code
                );
                return Err(Error::Corrupt(format!(
                    "transfer event for {:#x} outside the current TD",
                    ep_trb_dma
                )));
            }
        };

        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        ep.ring.old_trb_comp_code = code;
        if skip {
            debug!("Found TD for event on {}, clearing skip", endpoint);
            ep.skip = false;
        }

        if ep.ring.trb(ep_pos).is_noop() {
            // A cancelled TD stalled right after the endpoint was stopped.
            if is_code(code, TrbCompletionCode::Stall) || requires_manual_halt_cleanup(ctx, code) {
                self.handle_halted_endpoint(endpoint, Some(td), ResetType::Hard)?;
            }
            return Ok(());
        }

        self.tds[td].status = status;
        match kind {
            EndpointType::Control => self.process_ctrl_td(endpoint, ctx, td, ep_pos, event, code),
            EndpointType::Isoch => self.process_isoc_td(endpoint, ctx, td, ep_pos, event, code),
            EndpointType::Bulk | EndpointType::Interrupt => {
                self.process_bulk_intr_td(endpoint, ctx, td, ep_pos, event, code)
            }
        }
        Ok(())
    }

    fn trb_in_td(&self, endpoint: EndpointId, td: usize, address: u64) -> Option<TrbPos> {
        let ring = &self.endpoints.get(&endpoint)?.ring;
        let td = self.tds.get(td)?;
        ring.trb_in_td(td.start, td.end, address)
    }

    /// Whether a successful event matching no TD is a known controller quirk.
    fn spurious_success(&self, endpoint: EndpointId) -> bool {
        let ring = match self.endpoints.get(&endpoint) {
            Some(ep) => &ep.ring,
            None => return false,
        };
        let old = ring.old_trb_comp_code;
        if is_code(old, TrbCompletionCode::ShortPacket) {
            return self.quirks.contains(Quirks::SPURIOUS_SUCCESS);
        }
        if is_code(old, TrbCompletionCode::UsbTransaction)
            || is_code(old, TrbCompletionCode::BabbleDetected)
            || is_code(old, TrbCompletionCode::IsochBuffer)
        {
            return self.quirks.contains(Quirks::ETRON_HOST) && ring.kind() == RingKind::Isoc;
        }
        false
    }

    fn skip_isoc_td(&mut self, endpoint: EndpointId, td: usize, status: Result<(), TransferError>) {
        let (urb, frame) = (self.tds[td].urb, self.tds[td].frame);
        if let Some(frame) = self.urbs.get_mut(urb).and_then(|urb| urb.frames.get_mut(frame)) {
            frame.status = Err(TransferError::MissedService);
            frame.actual_length = 0;
        }
        self.tds[td].status = status;
        self.dequeue_td(endpoint, td);
    }

    /// Sum of the TRB lengths from the ring dequeue up to, not including, `stop`.
    fn sum_trb_lengths(&self, endpoint: EndpointId, stop: TrbPos) -> u32 {
        let ring = match self.endpoints.get(&endpoint) {
            Some(ep) => &ep.ring,
            None => return 0,
        };
        let limit = ring.num_segs() * ring.trbs_per_segment();
        let mut sum = 0;
        let mut pos = ring.dequeue;
        for _ in 0..limit {
            if pos == stop {
                break;
            }
            let trb = ring.trb(pos);
            if !trb.is_noop() && !trb.is_link() {
                sum += trb.buffer_length();
            }
            pos = ring.next_trb(pos);
        }
        sum
    }

    fn trb_len_at(&self, endpoint: EndpointId, pos: TrbPos) -> u32 {
        self.endpoints
            .get(&endpoint)
            .map_or(0, |ep| ep.ring.trb(pos).buffer_length())
    }

    fn set_actual_length(&mut self, td: usize, actual_length: u32) {
        let urb = self.tds[td].urb;
        if let Some(urb) = self.urbs.get_mut(urb) {
            urb.actual_length = actual_length;
        }
    }

    fn requested_length(&self, td: usize) -> u32 {
        self.urbs
            .get(self.tds[td].urb)
            .map_or(0, |urb| urb.request.length)
    }

    fn process_ctrl_td(
        &mut self,
        endpoint: EndpointId,
        ctx: &EndpointContext,
        td: usize,
        ep_pos: TrbPos,
        event: &Trb,
        code: u8,
    ) {
        use TrbCompletionCode as Code;
        let remaining = event.transfer_length();
        let requested = self.requested_length(td);
        let trb_type = self.endpoints[&endpoint].ring.trb(ep_pos).trb_type_checked();
        let data_stage = matches!(trb_type, Some(TrbType::DataStage) | Some(TrbType::Normal));

        match TrbCompletionCode::try_from(code) {
            Ok(Code::Success) => {
                if trb_type != Some(TrbType::StatusStage) {
                    warn!("Success on control {:?} TRB without IOC set on {}", trb_type, endpoint);
                    self.tds[td].status = Err(TransferError::Shutdown);
                } else {
                    self.tds[td].status = Ok(());
                }
            }
            Ok(Code::ShortPacket) => self.tds[td].status = Ok(()),
            Ok(Code::StoppedShortPacket) => {
                if data_stage {
                    self.set_actual_length(td, remaining);
                } else {
                    warn!("Stopped short packet on control setup or status TRB");
                }
                return self.finish_td(endpoint, ctx, td, code);
            }
            Ok(Code::Stopped) => {
                match trb_type {
                    Some(TrbType::SetupStage) => self.set_actual_length(td, 0),
                    Some(TrbType::DataStage) | Some(TrbType::Normal) => {
                        self.set_actual_length(td, requested.saturating_sub(remaining))
                    }
                    Some(TrbType::StatusStage) => self.set_actual_length(td, requested),
                    other => warn!("Unexpected TRB type {:?} stopped on {}", other, endpoint),
                }
                return self.finish_td(endpoint, ctx, td, code);
            }
            Ok(Code::StoppedLengthInvalid) => return self.finish_td(endpoint, ctx, td, code),
            result => {
                let stalled = result == Ok(Code::Stall);
                if stalled || requires_manual_halt_cleanup(ctx, code) {
                    if !stalled {
                        debug!("Control transfer error on {}, halted", endpoint);
                    }
                    // Part of the data stage may have gone through.
                    if data_stage {
                        self.set_actual_length(td, requested.saturating_sub(remaining));
                    } else if !self.tds[td].length_set {
                        self.set_actual_length(td, 0);
                    }
                    return self.finish_td(endpoint, ctx, td, code);
                }
            }
        }

        if trb_type == Some(TrbType::SetupStage) {
            return self.finish_td(endpoint, ctx, td, code);
        }
        // The status stage event must not overwrite the data stage length.
        if data_stage {
            self.tds[td].length_set = true;
            self.set_actual_length(td, requested.saturating_sub(remaining));
            trace!("Waiting for status stage event on {}", endpoint);
            return;
        }
        if !self.tds[td].length_set {
            self.set_actual_length(td, requested);
        }
        self.finish_td(endpoint, ctx, td, code);
    }

    fn process_bulk_intr_td(
        &mut self,
        endpoint: EndpointId,
        ctx: &EndpointContext,
        td: usize,
        ep_pos: TrbPos,
        event: &Trb,
        code: u8,
    ) {
        use TrbCompletionCode as Code;
        let mut remaining = event.transfer_length();
        let requested = self.requested_length(td);
        let ep_trb_len = self.trb_len_at(endpoint, ep_pos);
        let td_end = self.tds[td].end;

        match TrbCompletionCode::try_from(code) {
            Ok(Code::Success) => {
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.err_count = 0;
                }
                if ep_pos != td_end || remaining != 0 {
                    warn!("Successful completion on short transfer on {}", endpoint);
                }
                self.tds[td].status = Ok(());
            }
            Ok(Code::ShortPacket) => self.tds[td].status = Ok(()),
            Ok(Code::StoppedShortPacket) => {
                // The residue field holds the transferred length here.
                self.set_actual_length(td, remaining);
                return self.finish_bulk_td(endpoint, ctx, td, code, remaining, requested);
            }
            Ok(Code::StoppedLengthInvalid) => {
                let actual = self.sum_trb_lengths(endpoint, ep_pos);
                self.set_actual_length(td, actual);
                return self.finish_bulk_td(endpoint, ctx, td, code, 0, requested);
            }
            Ok(Code::UsbTransaction) => {
                let max_soft_retry = self.config.max_soft_retry;
                let no_soft_retry = self.quirks.contains(Quirks::NO_SOFT_RETRY);
                let escalate = match self.endpoints.get_mut(&endpoint) {
                    Some(ep) => {
                        let count = ep.err_count;
                        ep.err_count += 1;
                        no_soft_retry || count > max_soft_retry
                    }
                    None => true,
                };
                if !escalate {
                    debug!("Soft retry of transaction error on {}", endpoint);
                    self.tds[td].status = Ok(());
                    if let Err(err) =
                        self.handle_halted_endpoint(endpoint, Some(td), ResetType::Soft)
                    {
                        warn!("Failed to soft reset {}: {}", endpoint, err);
                    }
                    return;
                }
            }
            _ => (),
        }

        let actual = if ep_pos == td_end {
            requested.saturating_sub(remaining)
        } else {
            (self.sum_trb_lengths(endpoint, ep_pos) + ep_trb_len).saturating_sub(remaining)
        };
        self.set_actual_length(td, actual);
        if remaining > requested {
            remaining = requested + 1;
        }
        self.finish_bulk_td(endpoint, ctx, td, code, remaining, requested);
    }

    fn finish_bulk_td(
        &mut self,
        endpoint: EndpointId,
        ctx: &EndpointContext,
        td: usize,
        code: u8,
        remaining: u32,
        requested: u32,
    ) {
        if remaining > requested {
            warn!(
                "Bad transfer length on {}, {} left of {} requested",
                endpoint, remaining, requested
            );
            self.set_actual_length(td, 0);
        }
        self.finish_td(endpoint, ctx, td, code);
    }

    fn process_isoc_td(
        &mut self,
        endpoint: EndpointId,
        ctx: &EndpointContext,
        td: usize,
        ep_pos: TrbPos,
        event: &Trb,
        code: u8,
    ) {
        use TrbCompletionCode as Code;
        let (urb_key, frame_index, td_end) = {
            let td = &self.tds[td];
            (td.urb, td.frame, td.end)
        };
        let (mut requested, short_status) = match self.urbs.get(urb_key) {
            Some(urb) => (
                urb.request
                    .iso_packets
                    .get(frame_index)
                    .map_or(0, |packet| packet.length),
                if urb
                    .request
                    .flags
                    .contains(super::transfer::TransferFlags::SHORT_NOT_OK)
                {
                    Err(TransferError::ShortPacket)
                } else {
                    Ok(())
                },
            ),
            None => return,
        };
        let mut remaining = event.transfer_length();
        let mut ep_trb_len = self.trb_len_at(endpoint, ep_pos);
        let error_mid_td = self.tds[td].error_mid_td;

        let mut frame_status = None;
        let mut sum_trbs = false;
        let mut mid_td_error = false;
        match TrbCompletionCode::try_from(code) {
            Ok(Code::Success) => {
                // An earlier error in this TD decides its status.
                if !error_mid_td {
                    if remaining != 0 {
                        frame_status = Some(short_status);
                        sum_trbs = true;
                    } else {
                        frame_status = Some(Ok(()));
                    }
                }
            }
            Ok(Code::ShortPacket) => {
                frame_status = Some(short_status);
                sum_trbs = true;
            }
            Ok(Code::BandwidthOverrun) => {
                frame_status = Some(Err(TransferError::BandwidthOverrun));
            }
            Ok(Code::BabbleDetected) | Ok(Code::IsochBuffer) => {
                sum_trbs = is_code(code, Code::BabbleDetected);
                frame_status = Some(Err(TransferError::BufferOverrun));
                mid_td_error = ep_pos != td_end;
            }
            Ok(Code::IncompatibleDevice) | Ok(Code::Stall) => {
                frame_status = Some(Err(TransferError::Transaction));
            }
            Ok(Code::UsbTransaction) => {
                frame_status = Some(Err(TransferError::Transaction));
                sum_trbs = true;
                mid_td_error = ep_pos != td_end;
            }
            Ok(Code::Stopped) => sum_trbs = true,
            Ok(Code::StoppedShortPacket) => {
                // The residue field holds the transferred length here.
                frame_status = Some(short_status);
                requested = remaining;
            }
            Ok(Code::StoppedLengthInvalid) => {
                sum_trbs = true;
                ep_trb_len = 0;
                remaining = 0;
            }
            _ => {
                sum_trbs = true;
                frame_status = Some(Err(TransferError::Other(code)));
            }
        }
        if mid_td_error {
            self.tds[td].error_mid_td = true;
        }

        if !self.tds[td].length_set {
            let actual_length = if sum_trbs {
                (self.sum_trb_lengths(endpoint, ep_pos) + ep_trb_len).saturating_sub(remaining)
            } else {
                requested
            };
            if let Some(urb) = self.urbs.get_mut(urb_key) {
                if let Some(frame) = urb.frames.get_mut(frame_index) {
                    if let Some(status) = frame_status {
                        frame.status = status;
                    }
                    frame.actual_length = actual_length;
                }
                urb.actual_length += actual_length;
            }
        } else if let Some(status) = frame_status {
            if let Some(frame) = self
                .urbs
                .get_mut(urb_key)
                .and_then(|urb| urb.frames.get_mut(frame_index))
            {
                frame.status = status;
            }
        }

        // Wait for the event of the last TRB after an error in the middle of the TD.
        if self.tds[td].error_mid_td && ep_pos != td_end {
            debug!("Error mid isochronous TD on {}, waiting for its final event", endpoint);
            self.tds[td].length_set = true;
            return;
        }
        self.finish_td(endpoint, ctx, td, code);
    }

    /// Gives back a TD the controller is done with, or hands a halted endpoint to recovery.
    fn finish_td(&mut self, endpoint: EndpointId, ctx: &EndpointContext, td: usize, code: u8) {
        use TrbCompletionCode as Code;
        match TrbCompletionCode::try_from(code) {
            // The Stop Endpoint completion takes care of stopped TDs, they may be restarted.
            Ok(Code::Stopped) | Ok(Code::StoppedLengthInvalid) | Ok(Code::StoppedShortPacket) => {
                return
            }
            Ok(Code::UsbTransaction) | Ok(Code::BabbleDetected) | Ok(Code::SplitTransaction) => {
                if ctx.state != EndpointState::Halted {
                    // Racing with a Reset Endpoint issued by a failed Stop Endpoint, which
                    // handles the TD.
                    let cancelled = self
                        .endpoints
                        .get(&endpoint)
                        .map_or(false, |ep| {
                            ep.flags.contains(super::endpoint::EpFlags::HALTED)
                                && ep.cancelled.contains(&td)
                        });
                    if cancelled {
                        return;
                    }
                } else {
                    if let Err(err) = self.handle_halted_endpoint(endpoint, Some(td), ResetType::Hard)
                    {
                        warn!("Failed to reset halted endpoint {}: {}", endpoint, err);
                    }
                    return;
                }
            }
            Ok(Code::Stall) => {
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.err_count = 0;
                }
                if let Err(err) = self.handle_halted_endpoint(endpoint, Some(td), ResetType::Hard) {
                    warn!("Failed to reset stalled endpoint {}: {}", endpoint, err);
                }
                return;
            }
            _ => (),
        }
        self.dequeue_td(endpoint, td);
    }
}
