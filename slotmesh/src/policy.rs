//! Scheduling policies: which autonomous cells exist and where packets go.
//!
//! Three policies share one slot engine:
//!
//! | Policy | Unicast cells |
//! |--------|---------------|
//! | `StaticHashSlots` | one shared cell per routing neighbor in the unicast slotframe, placed by address hash |
//! | `AdaptiveSlotframe` | own reception slotframe resized with traffic; a TX slotframe per neighbor follows its advertised size |
//! | `NegotiatedResidualAllocation` | the static cells, plus negotiated dedicated slotframes and one-shot matching slots |
//!
//! Every policy installs the advertising slotframe (handle 0) and the common
//! shared slotframe (handle 2). Packets are pinned to a cell when they are
//! queued and re-pinned whenever the routing neighborhood changes.

use xxhash_rust::xxh3::xxh3_64;

use crate::emit_debug;
use crate::mac::{Mac, Task};
use crate::negotiation::{
    has_handles, matching_rx_handle, matching_tx_handle, rx_sf_handle, tx_sf_handle, Adjustment,
};
use crate::traits::{Clock, FrameCodec, Radio, Random, RoutingView};
use crate::types::{
    LinkAddr, LinkOptions, LinkType, MacError, MacEvent, NegotiationError, NodeId, ScheduleError,
    COMMON_CHANNEL_OFFSET, COMMON_SF_HANDLE, EB_SF_HANDLE, UNICAST_CHANNEL_OFFSET,
    UNICAST_SF_HANDLE,
};
use crate::MacConfig;

/// How autonomous and negotiated cells are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedulingPolicy {
    #[default]
    StaticHashSlots,
    AdaptiveSlotframe,
    NegotiatedResidualAllocation,
}

impl SchedulingPolicy {
    /// Dedicated slotframes are negotiated with routing neighbors.
    pub fn negotiates(self) -> bool {
        self == SchedulingPolicy::NegotiatedResidualAllocation
    }

    /// The own reception slotframe follows the offered load.
    pub fn is_adaptive(self) -> bool {
        self == SchedulingPolicy::AdaptiveSlotframe
    }
}

/// Hash placing an address on a timeslot.
pub fn slot_hash(addr: &LinkAddr) -> u32 {
    xxh3_64(&addr.0) as u32
}

/// Thomas Wang's 32-bit integer hash, used to spread dedicated cells over
/// two channel offsets.
pub fn wang_hash(a: u32) -> u32 {
    let mut a = (a ^ 61) ^ (a >> 16);
    a = a.wrapping_add(a << 3);
    a ^= a >> 4;
    a = a.wrapping_mul(0x27d4_eb2d);
    a ^ (a >> 15)
}

/// Handle of the adaptive TX slotframe towards `id`.
pub const fn adaptive_tx_handle<C: MacConfig>(id: NodeId) -> Option<u16> {
    if has_handles::<C>(id) {
        Some(id + 3)
    } else {
        None
    }
}

impl<R, Clk, Rn, Rt, F, C> Mac<R, Clk, Rn, Rt, F, C>
where
    R: Radio,
    Clk: Clock,
    Rn: Random,
    Rt: RoutingView,
    F: FrameCodec,
    C: MacConfig,
{
    /// Install the autonomous slotframes of the configured policy.
    pub(crate) fn init_policy(&mut self) -> Result<(), MacError> {
        self.schedule.create_minimal(&mut self.queues, C::EB_PERIOD)?;

        let unicast_size = if self.policy.is_adaptive() {
            self.adaptive.sf_size()
        } else {
            C::UNICAST_PERIOD
        };
        self.schedule.add_slotframe(UNICAST_SF_HANDLE, unicast_size)?;
        self.add_own_rx_link(unicast_size)?;

        self.schedule
            .add_slotframe(COMMON_SF_HANDLE, C::COMMON_SHARED_PERIOD)?;
        self.schedule.add_link(
            &mut self.queues,
            COMMON_SF_HANDLE,
            LinkOptions::TX | LinkOptions::RX | LinkOptions::SHARED,
            LinkType::Normal,
            LinkAddr::BROADCAST,
            0,
            COMMON_CHANNEL_OFFSET,
        )?;
        Ok(())
    }

    fn add_own_rx_link(&mut self, size: u16) -> Result<(), MacError> {
        let timeslot = (slot_hash(&self.addr) % size as u32) as u16;
        self.schedule.add_link(
            &mut self.queues,
            UNICAST_SF_HANDLE,
            LinkOptions::RX,
            LinkType::Normal,
            LinkAddr::BROADCAST,
            timeslot,
            UNICAST_CHANNEL_OFFSET,
        )?;
        Ok(())
    }

    /// Timeslot of `addr` in the fixed-size unicast slotframe.
    pub(crate) fn unicast_timeslot(&self, addr: &LinkAddr) -> u16 {
        (slot_hash(addr) % C::UNICAST_PERIOD as u32) as u16
    }

    /// Cell a packet towards `dest` should wait for.
    pub(crate) fn select_packet(&self, dest: &LinkAddr) -> (u16, u16) {
        if dest.is_eb() {
            return (EB_SF_HANDLE, 0);
        }
        if dest.is_broadcast() || !self.routing.is_routing_neighbor(dest) {
            return (COMMON_SF_HANDLE, 0);
        }
        let id = dest.node_id();
        match self.policy {
            SchedulingPolicy::StaticHashSlots => (UNICAST_SF_HANDLE, self.unicast_timeslot(dest)),
            SchedulingPolicy::NegotiatedResidualAllocation => {
                match tx_sf_handle::<C>(id)
                    .and_then(|handle| self.schedule.slotframe(handle))
                    .and_then(|sf| sf.links().next())
                {
                    Some(link) => (link.slotframe_handle, link.timeslot),
                    None => (UNICAST_SF_HANDLE, self.unicast_timeslot(dest)),
                }
            }
            SchedulingPolicy::AdaptiveSlotframe => {
                let sf = adaptive_tx_handle::<C>(id).and_then(|handle| self.schedule.slotframe(handle));
                match sf {
                    Some(sf) => (sf.handle(), (slot_hash(dest) % sf.size() as u32) as u16),
                    None => (COMMON_SF_HANDLE, 0),
                }
            }
        }
    }

    /// Cell for traffic towards `dest` once its dedicated cells keep failing.
    pub(crate) fn fallback_cell(&self, dest: &LinkAddr) -> (u16, u16) {
        if self.routing.is_routing_neighbor(dest) {
            (UNICAST_SF_HANDLE, self.unicast_timeslot(dest))
        } else {
            (COMMON_SF_HANDLE, 0)
        }
    }

    /// Pin everything queued for `addr` to its current cell.
    pub(crate) fn restamp_towards(&mut self, addr: &LinkAddr) {
        let (slotframe, timeslot) = self.select_packet(addr);
        if self.queues.restamp_queue(addr, slotframe, timeslot, false) > 0 {
            emit_debug!(
                self,
                crate::debug::DebugEvent::QueueRestamped {
                    peer: addr.node_id(),
                    slotframe,
                    timeslot,
                }
            );
        }
    }

    /// Remove a slotframe if installed. Returns whether it was.
    pub(crate) fn remove_slotframe_if_present(&mut self, handle: u16) -> Result<bool, MacError> {
        match self.schedule.remove_slotframe(&mut self.queues, handle) {
            Ok(()) => {
                emit_debug!(self, crate::debug::DebugEvent::SlotframeRemoved { handle });
                Ok(true)
            }
            Err(ScheduleError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn add_unicast_tx_link(&mut self, nbr: &LinkAddr) -> Result<(), MacError> {
        let timeslot = self.unicast_timeslot(nbr);
        let mut options = LinkOptions::TX | LinkOptions::SHARED;
        if timeslot == self.unicast_timeslot(&self.addr) {
            options |= LinkOptions::RX;
        }
        self.schedule.add_link(
            &mut self.queues,
            UNICAST_SF_HANDLE,
            options,
            LinkType::Normal,
            LinkAddr::BROADCAST,
            timeslot,
            UNICAST_CHANNEL_OFFSET,
        )?;
        Ok(())
    }

    fn remove_unicast_tx_link(&mut self, nbr: &LinkAddr) -> Result<(), MacError> {
        let timeslot = self.unicast_timeslot(nbr);
        let still_used = self
            .routing
            .preferred_parent()
            .into_iter()
            .chain(self.routing.routing_children())
            .filter(|other| other != nbr)
            .any(|other| self.unicast_timeslot(&other) == timeslot);
        if still_used {
            return Ok(());
        }
        if !self.queues.is_empty(nbr) {
            self.queues.restamp_queue(nbr, COMMON_SF_HANDLE, 0, false);
        }
        if timeslot == self.unicast_timeslot(&self.addr) {
            self.schedule.add_link(
                &mut self.queues,
                UNICAST_SF_HANDLE,
                LinkOptions::RX,
                LinkType::Normal,
                LinkAddr::BROADCAST,
                timeslot,
                UNICAST_CHANNEL_OFFSET,
            )?;
            return Ok(());
        }
        match self
            .schedule
            .remove_link_by_timeslot(&mut self.queues, UNICAST_SF_HANDLE, timeslot)
        {
            Ok(_) | Err(ScheduleError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Forget everything negotiated with `peer`.
    fn drop_negotiated(&mut self, peer: &LinkAddr) -> Result<(), MacError> {
        let id = peer.node_id();
        self.negotiation.remove(id);
        for handle in [tx_sf_handle::<C>(id), rx_sf_handle::<C>(id)].into_iter().flatten() {
            self.remove_slotframe_if_present(handle)?;
        }
        for handle in [matching_tx_handle::<C>(id), matching_rx_handle::<C>(id)]
            .into_iter()
            .flatten()
        {
            self.reservations.remove_handle(handle);
        }
        Ok(())
    }

    fn remove_adaptive_tx_sf(&mut self, peer: &LinkAddr) -> Result<(), MacError> {
        if !self.queues.is_empty(peer) {
            self.queues.restamp_queue(peer, COMMON_SF_HANDLE, 0, false);
        }
        if let Some(handle) = adaptive_tx_handle::<C>(peer.node_id()) {
            self.remove_slotframe_if_present(handle)?;
        }
        Ok(())
    }

    /// The routing layer gained `child`.
    pub(crate) fn on_child_added(&mut self, child: LinkAddr) -> Result<(), MacError> {
        let id = child.node_id();
        match self.policy {
            SchedulingPolicy::StaticHashSlots => self.add_unicast_tx_link(&child)?,
            SchedulingPolicy::NegotiatedResidualAllocation => {
                self.add_unicast_tx_link(&child)?;
                let no_path = self.routing.has_no_path(&child);
                self.negotiation.reset(id, true, no_path);
            }
            SchedulingPolicy::AdaptiveSlotframe => {
                let size = self.adaptive.track(id).sf_size;
                if size != 0 {
                    self.adjust_tx_sf_size(child, size)?;
                }
            }
        }
        self.restamp_towards(&child);
        Ok(())
    }

    /// The routing layer lost `child`.
    pub(crate) fn on_child_removed(&mut self, child: LinkAddr) -> Result<(), MacError> {
        if self.routing.is_routing_neighbor(&child) {
            return Ok(());
        }
        match self.policy {
            SchedulingPolicy::StaticHashSlots => self.remove_unicast_tx_link(&child)?,
            SchedulingPolicy::NegotiatedResidualAllocation => {
                self.remove_unicast_tx_link(&child)?;
                self.drop_negotiated(&child)?;
            }
            SchedulingPolicy::AdaptiveSlotframe => {
                self.remove_adaptive_tx_sf(&child)?;
                self.adaptive.forget(child.node_id());
            }
        }
        self.restamp_towards(&child);
        Ok(())
    }

    /// The time source moved from `old` to `new`.
    pub(crate) fn on_new_time_source(
        &mut self,
        old: Option<LinkAddr>,
        new: Option<LinkAddr>,
    ) -> Result<(), MacError> {
        if let Some(old) = old.filter(|o| !self.routing.is_routing_child(o)) {
            match self.policy {
                SchedulingPolicy::StaticHashSlots => self.remove_unicast_tx_link(&old)?,
                SchedulingPolicy::NegotiatedResidualAllocation => {
                    self.remove_unicast_tx_link(&old)?;
                    self.drop_negotiated(&old)?;
                }
                SchedulingPolicy::AdaptiveSlotframe => {
                    self.remove_adaptive_tx_sf(&old)?;
                    self.adaptive.forget(old.node_id());
                }
            }
            self.restamp_towards(&old);
        }
        if let Some(new) = new {
            let id = new.node_id();
            match self.policy {
                SchedulingPolicy::StaticHashSlots => self.add_unicast_tx_link(&new)?,
                SchedulingPolicy::NegotiatedResidualAllocation => {
                    self.add_unicast_tx_link(&new)?;
                    self.negotiation.reset(id, true, false);
                }
                SchedulingPolicy::AdaptiveSlotframe => {
                    let size = self.adaptive.track(id).sf_size;
                    if size != 0 {
                        self.adjust_tx_sf_size(new, size)?;
                    }
                }
            }
            self.restamp_towards(&new);
        }
        Ok(())
    }

    /// Resize the own reception slotframe.
    ///
    /// The old slotframe keeps listening under `TEMP_SF_HANDLE` for
    /// `RETAIN_RX_SF_DURATION` so that neighbors still using the old size
    /// are heard until they learn the new one.
    pub(crate) fn adjust_sf_size(&mut self, size: u16) -> Result<(), MacError> {
        if self.adaptive.temp_removal.is_none() {
            self.schedule
                .change_slotframe_handle(UNICAST_SF_HANDLE, C::TEMP_SF_HANDLE)?;
            let deadline = self.clock.now() + C::RETAIN_RX_SF_DURATION;
            self.adaptive.temp_removal =
                Some(self.tasks.schedule(deadline, Task::RemoveTempSlotframe));
        } else {
            self.remove_slotframe_if_present(UNICAST_SF_HANDLE)?;
        }
        self.schedule.add_slotframe(UNICAST_SF_HANDLE, size)?;
        self.add_own_rx_link(size)?;
        emit_debug!(
            self,
            crate::debug::DebugEvent::SlotframeAdded {
                handle: UNICAST_SF_HANDLE,
                size,
            }
        );
        Ok(())
    }

    /// Follow `peer`'s reception slotframe with our TX slotframe towards it.
    pub(crate) fn adjust_tx_sf_size(&mut self, peer: LinkAddr, size: u16) -> Result<(), MacError> {
        if !self.routing.is_routing_neighbor(&peer) {
            return Ok(());
        }
        let Some(handle) = adaptive_tx_handle::<C>(peer.node_id()) else {
            return Ok(());
        };
        self.remove_slotframe_if_present(handle)?;
        self.schedule.add_slotframe(handle, size)?;
        let timeslot = (slot_hash(&peer) % size as u32) as u16;
        self.schedule.add_link(
            &mut self.queues,
            handle,
            LinkOptions::TX | LinkOptions::SHARED,
            LinkType::Normal,
            LinkAddr::BROADCAST,
            timeslot,
            UNICAST_CHANNEL_OFFSET,
        )?;
        self.queues.restamp_queue(&peer, handle, timeslot, false);
        emit_debug!(
            self,
            crate::debug::DebugEvent::TxSlotframeAdjusted {
                peer: peer.node_id(),
                size,
            }
        );
        Ok(())
    }

    /// A neighbor announced the size of its reception slotframe.
    pub(crate) fn on_neighbor_size(
        &mut self,
        peer: LinkAddr,
        size: u16,
        version: u8,
    ) -> Result<(), MacError> {
        if !self.policy.is_adaptive() || size == 0 {
            return Ok(());
        }
        let id = peer.node_id();
        let changed = self.adaptive.set_neighbor_size(id, size, version);
        let installed = adaptive_tx_handle::<C>(id)
            .is_some_and(|handle| self.schedule.slotframe(handle).is_some());
        if changed || !installed {
            self.adjust_tx_sf_size(peer, size)?;
        }
        Ok(())
    }

    /// Periodic resize check of the own reception slotframe.
    pub(crate) fn check_sf_size(&mut self) -> Result<bool, MacError> {
        let Some(size) = self.adaptive.decide_size(self.id) else {
            return Ok(false);
        };
        let old = self.adaptive.sf_size();
        self.adjust_sf_size(size)?;
        let version = self.adaptive.apply_size(size);
        self.queues.flush(&LinkAddr::EB);
        self.enqueue_beacon()?;
        self.push_event(MacEvent::SlotframeSizeChanged { size, version });
        emit_debug!(
            self,
            crate::debug::DebugEvent::SlotframeResized {
                old,
                new: size,
                version,
            }
        );
        Ok(true)
    }

    /// Periodic exponent selection for negotiated slotframes.
    pub(crate) fn select_exponents(&mut self) {
        let slots = C::N_SELECTION_PERIOD.as_slots(C::TIMING.timeslot_length);
        let routing = &self.routing;
        let changed = self.negotiation.select_n(
            |id| {
                has_handles::<C>(id) && routing.is_routing_neighbor(&LinkAddr::from_node_id(id))
            },
            slots,
        );
        for (peer, n) in changed {
            let value = self.negotiation.request_value(peer);
            self.queues
                .set_queue_n_request(&LinkAddr::from_node_id(peer), value);
            emit_debug!(self, crate::debug::DebugEvent::ExponentSelected { peer, n });
        }
    }

    /// Apply a negotiation decision taken during the last slot.
    pub(crate) fn apply_adjustment(&mut self, adjustment: Adjustment) -> Result<(), MacError> {
        match adjustment {
            Adjustment::InstallRx { peer, n, t_offset } => {
                let Some(handle) = rx_sf_handle::<C>(peer) else {
                    return Ok(());
                };
                self.remove_slotframe_if_present(handle)?;
                self.schedule.add_slotframe(handle, 1 << n)?;
                self.schedule.add_link(
                    &mut self.queues,
                    handle,
                    LinkOptions::RX,
                    LinkType::Normal,
                    LinkAddr::BROADCAST,
                    t_offset,
                    C::DEDICATED_CHANNEL_OFFSET,
                )?;
                emit_debug!(
                    self,
                    crate::debug::DebugEvent::OffsetGranted { to: peer, n, t_offset }
                );
            }
            Adjustment::ReplaceTx {
                peer,
                n,
                t_offset,
                request,
            } => {
                let addr = LinkAddr::from_node_id(peer);
                let Some(handle) = tx_sf_handle::<C>(peer) else {
                    return Ok(());
                };
                self.remove_slotframe_if_present(handle)?;
                match t_offset {
                    Some(t_offset) => {
                        self.schedule.add_slotframe(handle, 1 << n)?;
                        self.schedule.add_link(
                            &mut self.queues,
                            handle,
                            LinkOptions::TX,
                            LinkType::Normal,
                            LinkAddr::BROADCAST,
                            t_offset,
                            C::DEDICATED_CHANNEL_OFFSET,
                        )?;
                        emit_debug!(
                            self,
                            crate::debug::DebugEvent::SlotframeAdded { handle, size: 1 << n }
                        );
                        self.push_event(MacEvent::AllocationChanged { peer, n, t_offset });
                    }
                    None => {
                        let uninstallable = self
                            .negotiation
                            .get(peer)
                            .map_or(false, |s| s.my_uninstallable);
                        if uninstallable {
                            emit_debug!(
                                self,
                                crate::debug::DebugEvent::NegotiationFailed {
                                    peer,
                                    reason: NegotiationError::Uninstallable,
                                }
                            );
                            self.push_event(MacEvent::AllocationFailed {
                                peer,
                                reason: NegotiationError::Uninstallable,
                            });
                        }
                    }
                }
                self.restamp_towards(&addr);
                if let Some(value) = request {
                    self.queues.set_queue_n_request(&addr, value);
                }
            }
            Adjustment::Request { peer, value } => {
                self.queues
                    .set_queue_n_request(&LinkAddr::from_node_id(peer), value);
            }
        }
        Ok(())
    }
}
