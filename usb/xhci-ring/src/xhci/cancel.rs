//! Cancelling queued TDs and recovering halted endpoints.
//!
//! A cancelled TD may already be cached by the controller. The endpoint is stopped first, then
//! every cancelled TD is turned into no-ops. If the controller stopped inside one of them, its
//! dequeue pointer is moved past that TD with a Set TR Dequeue Pointer command and the TD is only
//! given back once that command completed.
use log::{debug, trace, warn};

use crate::error::{Error, Result, TransferError};

use super::command::Command;
use super::endpoint::{EndpointContext, EndpointId, EndpointState, EpFlags};
use super::regs::HostController;
use super::transfer::{CancelStatus, RequestId};
use super::trb::TrbCompletionCode;
use super::{Xhci, XhciInner};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum ResetType {
    /// Gives back the TD the endpoint halted on and moves past it.
    Hard,
    /// Keeps the transfer state, the TD is retried.
    Soft,
}

impl<H: HostController> Xhci<H> {
    /// Cancels a queued request. It is given back with [`TransferError::Cancelled`] once the
    /// controller no longer references its TRBs, which may be after this returns.
    pub fn cancel_transfer(&self, id: RequestId) -> Result<()> {
        self.with_inner(|inner| inner.cancel_urb(id))
    }
}

impl<H: HostController> XhciInner<H> {
    fn cancel_urb(&mut self, id: RequestId) -> Result<()> {
        let key = self.urb_key(id)?;
        let stop_retry = self.timeout(self.config.stop_endpoint_retry());

        let urb = &mut self.urbs[key];
        if urb.unlinked {
            debug!("Request {} is already being cancelled", id);
            return Ok(());
        }
        let endpoint = urb.endpoint;
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        urb.unlinked = true;

        let mut dirty = Vec::new();
        for &td_key in urb.tds.iter() {
            let td = &mut self.tds[td_key];
            if td.done || ep.cancelled.contains(&td_key) {
                continue;
            }
            td.cancel_status = CancelStatus::Dirty;
            ep.cancelled.push_back(td_key);
            dirty.push(td_key);
        }
        debug!("Cancelling request {} on {}, {} TDs", id, endpoint, dirty.len());

        // A command in flight picks the TDs up when it completes.
        if ep.flags.intersects(
            EpFlags::STOP_CMD_PENDING | EpFlags::HALTED | EpFlags::SET_DEQ_PENDING,
        ) {
            trace!("{} busy with {:?}, deferring", endpoint, ep.flags);
            return Ok(());
        }

        ep.flags.insert(EpFlags::STOP_CMD_PENDING);
        ep.stop_retry = Some(stop_retry);
        let stop = Command::StopEndpoint {
            endpoint,
            suspend: false,
        };
        if let Err(err) = self.queue_command(stop, None) {
            warn!("Failed to stop {} for cancellation: {}", endpoint, err);
            if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                ep.flags.remove(EpFlags::STOP_CMD_PENDING);
                ep.cancelled.retain(|td| !dirty.contains(td));
            }
            for td in dirty {
                self.tds[td].cancel_status = CancelStatus::None;
            }
            if let Some(urb) = self.urbs.get_mut(key) {
                urb.unlinked = false;
            }
            return Err(err);
        }
        Ok(())
    }

    pub(super) fn handle_stop_endpoint_completion(&mut self, endpoint: EndpointId, code: u8) {
        let ctx = self.hc.endpoint_context(endpoint);
        let ep = match self.endpoints.get_mut(&endpoint) {
            Some(ep) => ep,
            None => {
                warn!("Stop Endpoint completed for unknown endpoint {}", endpoint);
                return;
            }
        };

        if code == TrbCompletionCode::ContextState as u8 {
            let halted = ep.flags.contains(EpFlags::HALTED);
            let stop_retry = ep.stop_retry;
            let retry_over = stop_retry.map_or(true, |timeout| self.expired(&timeout));
            match ctx.state {
                EndpointState::Halted => {
                    debug!("Stop Endpoint raced with a halt on {}, resetting", endpoint);
                    let td = self.find_halted_td(endpoint, &ctx);
                    if let Some(td) = td {
                        self.tds[td].status = Err(TransferError::Transaction);
                    }
                    let reset = self.handle_halted_endpoint(endpoint, td, ResetType::Hard);
                    if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                        ep.flags.remove(EpFlags::STOP_CMD_PENDING);
                    }
                    if reset.is_ok() {
                        return;
                    }
                }
                // The Reset Endpoint completion runs after this one.
                EndpointState::Stopped if halted => (),
                EndpointState::Stopped | EndpointState::Running if retry_over => {
                    warn!(
                        "Stop Endpoint keeps failing on {} in state {:?}, giving back TDs",
                        endpoint, ctx.state
                    );
                }
                EndpointState::Stopped | EndpointState::Running => {
                    debug!("Stop Endpoint raced with {} starting, retrying", endpoint);
                    let stop = Command::StopEndpoint {
                        endpoint,
                        suspend: false,
                    };
                    match self.queue_command(stop, None) {
                        Ok(()) => return,
                        Err(err) => warn!("Failed to retry Stop Endpoint on {}: {}", endpoint, err),
                    }
                }
                state => debug!("Stop Endpoint failed on {} in state {:?}", endpoint, state),
            }
        }

        if let Err(err) = self.invalidate_cancelled_tds(endpoint) {
            debug!("Invalidating cancelled TDs on {}: {}", endpoint, err);
        }
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.flags.remove(EpFlags::STOP_CMD_PENDING);
        }
        self.giveback_invalidated(endpoint);
        self.ring_doorbell_for_active_rings(endpoint);
    }

    /// The TD at the head of the ring, if the controller stopped inside it.
    fn find_halted_td(&self, endpoint: EndpointId, ctx: &EndpointContext) -> Option<usize> {
        let ring = &self.endpoints.get(&endpoint)?.ring;
        let &head = ring.td_list.front()?;
        let td = self.tds.get(head)?;
        ring.trb_in_td(td.start, td.end, ctx.dequeue_address())
            .map(|_| head)
    }

    /// Turns the cancelled TDs into no-ops. A TD the controller may have cached is marked
    /// `ClearingCache` and the dequeue pointer is moved past it.
    pub(super) fn invalidate_cancelled_tds(&mut self, endpoint: EndpointId) -> Result<()> {
        let ctx = self.hc.endpoint_context(endpoint);
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        if ep.flags.contains(EpFlags::SET_DEQ_PENDING) {
            debug!("Set TR Dequeue pending on {}, invalidating later", endpoint);
            return Ok(());
        }
        let hw_deq = ctx.dequeue_address();
        let cancelled: Vec<usize> = ep.cancelled.iter().copied().collect();

        let mut cached: Option<usize> = None;
        for &key in cancelled.iter() {
            let (start, end, status) = match self.tds.get(key) {
                Some(td) => (td.start, td.end, td.cancel_status),
                None => continue,
            };
            ep.ring.td_list.retain(|&td| td != key);

            let in_hw =
                status == CancelStatus::Halted || ep.ring.trb_in_td(start, end, hw_deq).is_some();
            if !in_hw {
                ep.ring.td_to_noop(start, end, false);
                self.tds[key].cancel_status = CancelStatus::Cleared;
                trace!("TD {} on {} cleared in place", key, endpoint);
                continue;
            }
            match status {
                CancelStatus::Cleared | CancelStatus::ClearingCache => (),
                CancelStatus::None
                | CancelStatus::Dirty
                | CancelStatus::Halted
                | CancelStatus::ClearingCacheDeferred => {
                    if let Some(prev) = cached {
                        warn!("Multiple cancelled TDs cached by the controller on {}", endpoint);
                        let (prev_start, prev_end) = (self.tds[prev].start, self.tds[prev].end);
                        ep.ring.td_to_noop(prev_start, prev_end, false);
                        self.tds[prev].cancel_status = CancelStatus::Cleared;
                    }
                    ep.ring.td_to_noop(start, end, false);
                    self.tds[key].cancel_status = CancelStatus::ClearingCache;
                    cached = Some(key);
                }
            }
        }

        let cached = match cached {
            Some(cached) => cached,
            None => return Ok(()),
        };
        if let Err(err) = self.move_dequeue_past_td(endpoint, cached, ctx.dequeue) {
            warn!(
                "Failed to move past cancelled TD on {}, leaving it as no-ops: {}",
                endpoint, err
            );
            for key in cancelled {
                let td = match self.tds.get_mut(key) {
                    Some(td) => td,
                    None => continue,
                };
                if td.cancel_status != CancelStatus::ClearingCache
                    && td.cancel_status != CancelStatus::ClearingCacheDeferred
                {
                    continue;
                }
                td.cancel_status = CancelStatus::Cleared;
                let (start, end) = (td.start, td.end);
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.ring.td_to_noop(start, end, false);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Queues a Set TR Dequeue Pointer command pointing just past the TD. The new dequeue cycle
    /// state follows from the hardware's, flipped by every toggling link between the two.
    fn move_dequeue_past_td(&mut self, endpoint: EndpointId, td: usize, hw_dequeue: u64) -> Result<()> {
        let td_end = self.tds[td].end;
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;
        let ring = &ep.ring;

        let hw_addr = hw_dequeue & !0xF;
        let mut new_cycle = hw_dequeue & 1 == 1;
        let mut pos = ring.dequeue;
        let mut cycle_found = false;
        let mut td_last_found = false;
        loop {
            if !cycle_found && ring.trb_dma(pos) == hw_addr {
                cycle_found = true;
                if td_last_found {
                    break;
                }
            }
            if pos == td_end {
                td_last_found = true;
            }
            if cycle_found && ring.is_link(pos) && ring.trb(pos).link_toggles_cycle() {
                new_cycle = !new_cycle;
            }
            pos = ring.next_trb(pos);

            if pos == ring.dequeue {
                return Err(Error::Corrupt(format!(
                    "failed finding new dequeue state on {}",
                    endpoint
                )));
            }
            if cycle_found && td_last_found {
                break;
            }
        }

        if ep.flags.contains(EpFlags::SET_DEQ_PENDING) {
            warn!("Set TR Dequeue already pending on {}", endpoint);
            return Err(Error::Busy(endpoint));
        }

        let address = ring.trb_dma(pos);
        let dequeue = address | u64::from(new_cycle);
        self.queue_command(
            Command::SetTrDequeuePointer { endpoint, dequeue },
            None,
        )?;
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.queued_deq = Some(pos);
            ep.flags.insert(EpFlags::SET_DEQ_PENDING);
        }
        debug!(
            "Moving dequeue of {} to {:#x}, cycle {}",
            endpoint, address, new_cycle as u8
        );
        Ok(())
    }

    pub(super) fn handle_set_deq_completion(&mut self, endpoint: EndpointId, code: u8) {
        let ctx = self.hc.endpoint_context(endpoint);
        let ep = match self.endpoints.get_mut(&endpoint) {
            Some(ep) => ep,
            None => {
                warn!("Set TR Dequeue completed for unknown endpoint {}", endpoint);
                return;
            }
        };

        if code != TrbCompletionCode::Success as u8 {
            warn!(
                "Set TR Dequeue Pointer on {} failed with code {}, endpoint state {:?}",
                endpoint, code, ctx.state
            );
        } else if let Some(queued) = ep.queued_deq {
            if ep.ring.trb_dma(queued) == ctx.dequeue_address() {
                ep.ring.dequeue = queued;
            } else {
                warn!(
                    "Mismatch between completed Set TR Dequeue Pointer and internal state on {}",
                    endpoint
                );
            }
        }

        let tds = &self.tds;
        let cached: Vec<usize> = ep
            .cancelled
            .iter()
            .copied()
            .filter(|&key| {
                tds.get(key)
                    .map_or(false, |td| td.cancel_status == CancelStatus::ClearingCache)
            })
            .collect();
        for key in cached {
            self.tds[key].cancel_status = CancelStatus::Cleared;
            self.td_cleanup(key);
        }

        let ep = match self.endpoints.get_mut(&endpoint) {
            Some(ep) => ep,
            None => return,
        };
        ep.flags.remove(EpFlags::SET_DEQ_PENDING);
        ep.queued_deq = None;

        if !ep.cancelled.is_empty() {
            debug!("Invalidating TDs cancelled while moving the dequeue of {}", endpoint);
            if let Err(err) = self.invalidate_cancelled_tds(endpoint) {
                debug!("Invalidating cancelled TDs on {}: {}", endpoint, err);
            }
            self.ring_doorbell_for_active_rings(endpoint);
            self.giveback_invalidated(endpoint);
        } else {
            self.ring_doorbell_for_active_rings(endpoint);
        }
    }

    pub(super) fn handle_reset_endpoint_completion(&mut self, endpoint: EndpointId, tsp: bool) {
        debug!("Reset Endpoint completed on {}", endpoint);
        if let Err(err) = self.invalidate_cancelled_tds(endpoint) {
            debug!("Invalidating cancelled TDs on {}: {}", endpoint, err);
        }
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.flags.remove(EpFlags::HALTED);
        }
        self.giveback_invalidated(endpoint);
        if tsp {
            self.ring_doorbell_for_active_rings(endpoint);
        }
    }

    /// Queues a Reset Endpoint command, unless one is already in flight. A hard reset gives back
    /// `td` once the dequeue pointer has been moved past it.
    pub(super) fn handle_halted_endpoint(
        &mut self,
        endpoint: EndpointId,
        td: Option<usize>,
        reset: ResetType,
    ) -> Result<()> {
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(Error::NoEndpoint(endpoint))?;

        if reset == ResetType::Hard {
            if let Some(td) = td {
                if !ep.cancelled.contains(&td) {
                    ep.cancelled.push_back(td);
                    self.tds[td].cancel_status = CancelStatus::Halted;
                }
            }
        }
        if ep.flags.contains(EpFlags::HALTED) {
            debug!("Reset Endpoint already pending on {}", endpoint);
            return Ok(());
        }

        debug!("Resetting halted endpoint {}, {:?}", endpoint, reset);
        self.queue_command(
            Command::ResetEndpoint {
                endpoint,
                transfer_state_preserve: reset == ResetType::Soft,
            },
            None,
        )?;
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.flags.insert(EpFlags::HALTED);
        }
        Ok(())
    }

    /// Gives back every cancelled TD that no longer needs the controller to move past it.
    pub(super) fn giveback_invalidated(&mut self, endpoint: EndpointId) {
        let cancelled: Vec<usize> = match self.endpoints.get(&endpoint) {
            Some(ep) => ep.cancelled.iter().copied().collect(),
            None => return,
        };
        for key in cancelled {
            let cleared = self
                .tds
                .get(key)
                .map_or(false, |td| td.cancel_status == CancelStatus::Cleared);
            if cleared {
                self.td_cleanup(key);
            }
            if self.dying {
                return;
            }
        }
    }
}
