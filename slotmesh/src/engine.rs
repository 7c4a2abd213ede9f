//! Slot execution.
//!
//! `run_slot` executes the slot at the current ASN, then positions the engine
//! on the next active slot. The neighbor table is locked for the duration of
//! a slot. Schedule changes decided inside a slot (negotiated allocations,
//! neighbor slotframe sizes) are queued and applied once the slot is over,
//! before the next active link is computed.
//!
//! # Timing
//!
//! Every radio operation is anchored on the slot start:
//!
//! ```text
//! |-- cca_offset --|cca|
//! |------- tx_offset -------|==== frame ====|-- tx_ack_delay --|== eack ==|
//! |---- rx_offset ----|<-- rx_wait -->|
//! ```
//!
//! A drift correction learned from the time source shifts the start of the
//! next slot once.

use alloc::vec::Vec;

use crate::adaptive::RxSlotOutcome;
use crate::config::{ssq_handle_offset, MacConfig};
use crate::context::{SlotAction, SlotOutcome, SlotPlan};
use crate::emit_debug;
use crate::log::{LogKind, LogLink, LogRecord};
use crate::mac::{Mac, PostSlot};
use crate::matching::{request_bitmap, select_matching_slot};
use crate::negotiation::{matching_rx_handle, matching_tx_handle, tx_sf_handle, Adjustment};
use crate::policy::{adaptive_tx_handle, wang_hash};
use crate::schedule::{Link, NextActive};
use crate::time::{Asn, Duration, Instant};
use crate::traits::{Clock, FrameCodec, Radio, RadioTx, Random, RoutingView};
use crate::types::{
    LinkAddr, LinkOptions, LinkType, MacError, NodeId, ReceivedFrame, TimingError, TxResult,
    COMMON_SF_HANDLE, MAX_FRAME_SIZE, NO_MATCHING_SLOT, PIGGYBACK_NONE, UNICAST_SF_HANDLE,
};
use crate::wire::{Eack, FrameType};

/// Air time of a frame of `len` bytes at 250 kbit/s, PHY header included.
fn airtime(len: usize) -> Duration {
    Duration::from_micros((len as u64 + 6) * 32)
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
    /// What the next slot would do, without side effects.
    pub fn plan_slot(&self) -> SlotPlan {
        if !self.associated || self.schedule_dirty {
            return SlotPlan::Sleep;
        }
        let Some(active) = self.current else {
            return SlotPlan::Sleep;
        };
        let (link, dest) = self.pick_link(&active);
        let channel = self.hop(self.asn, self.channel_offset_for(&link, self.asn));
        match dest {
            Some(dest) => SlotPlan::Transmit { channel, dest },
            None if link.options.is_rx() => SlotPlan::Listen { channel },
            None => SlotPlan::Sleep,
        }
    }

    /// Execute the slot at `asn()` and move on to the next active slot.
    ///
    /// Call when the clock reaches `slot_start()` minus the timer guard.
    /// Fails with `NotAssociated` before `associate`, and with a timing error
    /// when no slot could be scheduled in time after the catch-up budget.
    pub fn run_slot(&mut self) -> Result<SlotOutcome, MacError> {
        if !self.associated {
            return Err(MacError::NotAssociated);
        }
        let asn = self.asn;

        let (action, executed) = match self.current {
            _ if self.schedule_dirty => {
                self.schedule_dirty = false;
                self.log_kind(LogKind::Message("schedule changed, slot skipped"));
                (SlotAction::Skipped, None)
            }
            Some(active) => {
                self.queues.lock();
                let (action, link) = self.execute_slot(active);
                self.queues.unlock();
                (action, Some(link))
            }
            None => (SlotAction::Skipped, None),
        };
        self.radio.off();
        self.apply_post_slot();
        self.reservations.clear_before(asn.plus(1));

        if self.is_desynchronized(asn) {
            self.log_kind(LogKind::Desync {
                slots_since_sync: asn.diff(self.last_sync_asn),
            });
            self.disassociate();
            return Ok(SlotOutcome {
                asn,
                action,
                next_start: self.slot_start,
                next_asn: self.asn,
            });
        }

        self.reschedule(executed)?;
        Ok(SlotOutcome {
            asn,
            action,
            next_start: self.slot_start,
            next_asn: self.asn,
        })
    }

    fn is_desynchronized(&self, asn: Asn) -> bool {
        !self.is_coordinator
            && C::TIMING.timeslot_length * asn.diff(self.last_sync_asn) > C::DESYNC_THRESHOLD
    }

    /// Link to use and the neighbor to serve on it.
    ///
    /// With nothing to send on the chosen link, the backup RX link takes over
    /// if the chosen link cannot receive or the backup belongs to a lower
    /// handle.
    fn pick_link(&self, active: &NextActive) -> (Link, Option<LinkAddr>) {
        let link = active.link;
        let dest = self.queues.select_for_link(&link);
        if dest.is_some() {
            return (link, dest);
        }
        match active.backup {
            Some(backup)
                if !link.options.is_rx() || backup.slotframe_handle < link.slotframe_handle =>
            {
                (backup, self.queues.select_for_link(&backup))
            }
            _ => (link, None),
        }
    }

    fn execute_slot(&mut self, active: NextActive) -> (SlotAction, Link) {
        if active.link.slotframe_handle > ssq_handle_offset::<C>() {
            self.reservations.take_at(self.asn);
        }
        let (link, dest) = self.pick_link(&active);
        let channel_offset = self.channel_offset_for(&link, self.asn);
        let channel = self.hop(self.asn, channel_offset);
        let log_link = LogLink {
            slotframe: link.slotframe_handle,
            timeslot: link.timeslot,
            channel_offset,
            channel,
        };

        let action = match dest {
            Some(dest) => self.tx_slot(&link, dest, log_link),
            None if link.options.is_rx() => self.rx_slot(&link, log_link),
            None => SlotAction::Skipped,
        };
        (action, link)
    }

    /// Physical channel for `channel_offset` at `asn`.
    pub(crate) fn hop(&self, asn: Asn, channel_offset: u16) -> u8 {
        let sequence = C::HOPPING_SEQUENCE;
        if sequence.is_empty() {
            return 0;
        }
        let len = sequence.len() as u64;
        sequence[((asn.value() % len + channel_offset as u64) % len) as usize]
    }

    /// Channel offset of `link` at `asn`.
    ///
    /// With negotiated allocation, dedicated and reserved slots alternate
    /// between two offsets keyed on the receiver, so that parallel
    /// allocations towards different receivers spread over two channels.
    pub(crate) fn channel_offset_for(&self, link: &Link, asn: Asn) -> u16 {
        if !self.policy.negotiates() {
            return link.channel_offset;
        }
        let handle = link.slotframe_handle;
        let ssq = ssq_handle_offset::<C>();
        let (base, counter) = if handle > ssq {
            (handle - ssq, asn.ls4b())
        } else if handle > COMMON_SF_HANDLE {
            let size = self.schedule.slotframe(handle).map_or(1, |sf| sf.size());
            (handle, asn.slotframe_number(size) as u32)
        } else {
            return link.channel_offset;
        };
        let receiver = if link.options.is_tx() {
            (base - 1) / 2
        } else {
            self.id
        };
        let flip = (wang_hash((receiver as u32).wrapping_add(counter)) % 2) as u16;
        C::DEDICATED_CHANNEL_OFFSET.saturating_sub(flip)
    }

    /// Whether the head frame towards `dest` asks for a matching slot on
    /// `link`, and the bitmap of busy upcoming offsets it would carry.
    fn matching_fields(&self, link: &Link, dest: &LinkAddr) -> (bool, u16) {
        let unicast = !dest.is_broadcast() && !dest.is_eb();
        if !self.policy.negotiates() || !unicast || self.queues.packet_count(dest) <= 1 {
            return (false, NO_MATCHING_SLOT);
        }
        let peer = dest.node_id();
        let (Some(handle), Some(tx_handle)) =
            (matching_tx_handle::<C>(peer), tx_sf_handle::<C>(peer))
        else {
            return (false, NO_MATCHING_SLOT);
        };
        if link.slotframe_handle != handle && self.reservations.has_handle(handle) {
            return (false, NO_MATCHING_SLOT);
        }
        let horizon = C::MATCHING_HORIZON;
        let occupancy = self
            .schedule
            .subsequent_occupancy(self.asn, &self.reservations, horizon);
        let time_to_tx = self
            .schedule
            .next_offset_where(self.asn, |l| l.slotframe_handle == tx_handle && l.options.is_tx());
        (true, request_bitmap(occupancy, time_to_tx, horizon))
    }

    /// Channel and encoded bytes of the frame the next slot would transmit.
    ///
    /// Matches what `run_slot` puts on the air, header stamping included.
    /// `None` when the next slot does not transmit.
    pub fn pending_transmission(&self) -> Option<(u8, Vec<u8>)> {
        let SlotPlan::Transmit { channel, dest } = self.plan_slot() else {
            return None;
        };
        let active = self.current?;
        let (link, _) = self.pick_link(&active);
        let (wants_matching, bitmap) = self.matching_fields(&link, &dest);
        let mut frame = self.queues.get(&dest)?.head()?.frame.clone();
        let header = &mut frame.header;
        if header.frame_type == FrameType::Beacon {
            header.asn = Some(self.asn);
        }
        header.frame_pending = wants_matching && header.ack_required;
        header.pigg2 = if header.frame_pending {
            bitmap
        } else {
            NO_MATCHING_SLOT
        };
        Some((channel, self.codec.encode_frame(&frame)))
    }

    #[cfg_attr(not(feature = "debug"), allow(unused_variables))]
    fn tx_slot(&mut self, link: &Link, dest: LinkAddr, log_link: LogLink) -> SlotAction {
        let asn = self.asn;
        let horizon = C::MATCHING_HORIZON;
        let negotiates = self.policy.negotiates();
        let unicast = !dest.is_broadcast() && !dest.is_eb();
        let peer = dest.node_id();
        let (wants_matching, bitmap) = self.matching_fields(link, &dest);
        let Some(packet) = self.queues.get_mut(&dest).and_then(|n| n.head_mut()) else {
            return SlotAction::Skipped;
        };
        let header = &mut packet.frame.header;
        if header.frame_type == FrameType::Beacon {
            header.asn = Some(asn);
        }
        header.frame_pending = wants_matching && header.ack_required;
        header.pigg2 = if header.frame_pending {
            bitmap
        } else {
            NO_MATCHING_SLOT
        };
        let ack_required = header.ack_required;
        let seqno = header.seqno;
        let datalen = packet.frame.payload.len() as u16;
        let bytes = self.codec.encode_frame(&packet.frame);

        self.radio.set_channel(log_link.channel);
        let (result, eack) = self.transmit(&bytes, ack_required, seqno, dest);

        let mut drift = None;
        if let Some(eack) = eack {
            if Some(dest) == self.queues.time_source() {
                let max = (C::TIMING.rx_wait.as_micros() / 4) as i64;
                let correction = (eack.time_correction as i64).clamp(-max, max);
                self.drift_correction = correction;
                self.last_sync_asn = asn;
                drift = Some(correction as i32);
            }
            if negotiates && unicast && self.routing.is_routing_neighbor(&dest) {
                if let Some(adjustment) = self.negotiation.on_grant(&self.schedule, peer, eack.pigg1)
                {
                    self.post_slot.push(PostSlot::Negotiation(adjustment));
                }
            }
            if let Some(handle) = matching_tx_handle::<C>(peer) {
                if negotiates && eack.pigg2 >= 1 && eack.pigg2 <= horizon {
                    self.reserve_matching(
                        asn.plus(eack.pigg2 as u64),
                        handle,
                        LinkOptions::TX,
                        peer,
                    );
                }
            }
        }

        let mut transmissions = 0;
        if let Some(packet) = self.queues.get_mut(&dest).and_then(|n| n.head_mut()) {
            packet.transmissions = packet.transmissions.saturating_add(1);
            packet.ret = Some(result);
            transmissions = packet.transmissions;
        }
        let shared = link.options.is_shared();
        let dropped = !result.is_ok() && transmissions > C::MAX_FRAME_RETRIES;

        if result.is_ok() || dropped {
            if let Some(packet) = self.queues.dequeue_head(&dest) {
                self.queues.finish(packet);
            }
        }
        if result.is_ok() {
            if unicast && (shared || self.queues.is_empty(&dest)) {
                self.queues.backoff_reset(&dest);
            }
        } else if unicast {
            if shared {
                if let Some((exponent, window)) =
                    self.queues.backoff_increment(&dest, &mut self.random)
                {
                    emit_debug!(
                        self,
                        crate::debug::DebugEvent::BackoffIncreased {
                            peer,
                            exponent,
                            window,
                        }
                    );
                }
            } else if self.queues.is_empty(&dest) {
                self.queues.backoff_reset(&dest);
            }
        }

        if negotiates && unicast {
            let ssq = ssq_handle_offset::<C>();
            if link.slotframe_handle > ssq {
                self.reservations.remove_handle(link.slotframe_handle);
            } else if link.slotframe_handle == UNICAST_SF_HANDLE && self.queues.is_empty(&dest) {
                if let Some(handle) = matching_tx_handle::<C>(peer) {
                    self.reservations.remove_handle(handle);
                }
            }

            if Some(link.slotframe_handle) == tx_sf_handle::<C>(peer) {
                let quality = self.negotiation.on_dedicated_tx(peer, result.is_ok());
                if quality.low_prr {
                    let value = self.negotiation.request_value(peer);
                    self.post_slot
                        .push(PostSlot::Negotiation(Adjustment::Request { peer, value }));
                }
                if quality.failing && !self.queues.is_empty(&dest) {
                    let (slotframe, timeslot) = self.fallback_cell(&dest);
                    self.queues.restamp_queue(&dest, slotframe, timeslot, false);
                }
            }
        }

        if self.policy.is_adaptive()
            && unicast
            && Some(link.slotframe_handle) == adaptive_tx_handle::<C>(peer)
        {
            self.adaptive.on_tx(peer);
            if !result.is_ok() && !dropped {
                let queued = self.queues.packet_count(&dest);
                let report = self.adaptive.tx_report(peer, queued);
                if let Some(packet) = self.queues.get_mut(&dest).and_then(|n| n.head_mut()) {
                    packet.frame.header.pigg1 = report;
                }
            }
        }

        self.log.push(LogRecord {
            asn,
            link: Some(log_link),
            kind: LogKind::Tx {
                dest,
                result,
                transmissions,
                seqno,
                datalen,
                drift,
            },
        });
        SlotAction::Transmitted { dest, result }
    }

    /// Radio sequence of a transmission, including the EACK when requested.
    fn transmit(
        &mut self,
        bytes: &[u8],
        ack_required: bool,
        seqno: u8,
        dest: LinkAddr,
    ) -> (TxResult, Option<Eack>) {
        let start = self.slot_start;
        let t = C::TIMING;

        if self.radio.prepare(bytes) != RadioTx::Ok {
            return (TxResult::RadioError, None);
        }
        if C::CCA_ENABLED {
            self.clock.busy_wait_until(start + t.cca_offset, &mut || false);
            self.radio.on();
            let radio = &mut self.radio;
            let busy = self
                .clock
                .busy_wait_until(start + t.cca_offset + t.cca, &mut || !radio.channel_clear());
            self.radio.off();
            if busy {
                return (TxResult::Collision, None);
            }
        }

        self.clock.busy_wait_until(start + t.tx_offset, &mut || false);
        match self.radio.transmit() {
            RadioTx::Ok => {}
            RadioTx::Collision => return (TxResult::Collision, None),
            RadioTx::Err => return (TxResult::RadioError, None),
        }
        if !ack_required {
            return (TxResult::Ok, None);
        }

        let ack_start = start + t.tx_offset + airtime(bytes.len()) + t.tx_ack_delay;
        self.radio.on();
        let radio = &mut self.radio;
        let heard = self
            .clock
            .busy_wait_until(ack_start + t.ack_wait, &mut || radio.receiving_packet());
        if !heard {
            self.radio.off();
            return (TxResult::NoAck, None);
        }
        let radio = &mut self.radio;
        self.clock
            .busy_wait_until(ack_start + t.max_ack, &mut || radio.pending_packet());
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = self.radio.read(&mut buf);
        self.radio.off();

        match self.codec.decode_eack(&buf[..len]) {
            Ok(eack)
                if eack.seqno == seqno && eack.src == dest && eack.dst == self.addr && !eack.nack =>
            {
                (TxResult::Ok, Some(eack))
            }
            _ => (TxResult::NoAck, None),
        }
    }

    fn rx_slot(&mut self, link: &Link, log_link: LogLink) -> SlotAction {
        let asn = self.asn;
        let start = self.slot_start;
        let t = C::TIMING;
        let handle = link.slotframe_handle;

        self.radio.set_channel(log_link.channel);
        self.clock.busy_wait_until(start + t.rx_offset, &mut || false);
        self.radio.on();
        let radio = &mut self.radio;
        let heard = self
            .clock
            .busy_wait_until(start + t.rx_offset + t.rx_wait, &mut || radio.receiving_packet());
        if !heard {
            self.radio.off();
            self.adaptive.record_rx_slot(handle, RxSlotOutcome::Idle);
            return SlotAction::Idle;
        }

        let radio = &mut self.radio;
        self.clock
            .busy_wait_until(start + t.tx_offset + t.max_tx, &mut || radio.pending_packet());
        let rx_time = self.radio.last_rx_timestamp();
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = self.radio.read(&mut buf);
        let frame = match self.codec.decode_frame(&buf[..len]) {
            Ok(frame) => frame,
            Err(_) => {
                self.radio.off();
                self.adaptive.record_rx_slot(handle, RxSlotOutcome::Collision);
                return SlotAction::Garbled;
            }
        };

        let header = frame.header.clone();
        let src = header.src;
        let peer = src.node_id();
        let for_me = header.dst == self.addr;
        if !for_me && !header.dst.is_broadcast() && header.frame_type != FrameType::Beacon {
            self.radio.off();
            self.adaptive.record_rx_slot(handle, RxSlotOutcome::Idle);
            return SlotAction::Idle;
        }

        let max_correction = (t.rx_wait.as_micros() / 4) as i64;
        let measured = rx_time.map(|at| at.signed_diff(start + t.tx_offset));

        let mut acked = false;
        if header.ack_required && for_me {
            let mut pigg1 = PIGGYBACK_NONE;
            let mut pigg2 = NO_MATCHING_SLOT;
            if self.policy.negotiates()
                && self.routing.is_routing_neighbor(&src)
                && !self.routing.has_no_path(&src)
            {
                pigg1 = self.answer_request(peer, header.pigg1);
                if header.frame_pending {
                    pigg2 = self.grant_matching_slot(peer, header.pigg2);
                }
            }
            let time_correction = measured
                .map_or(0, |d| (-d).clamp(-max_correction, max_correction))
                as i16;
            let eack = Eack {
                seqno: header.seqno,
                dst: src,
                src: self.addr,
                time_correction,
                nack: false,
                pigg1,
                pigg2,
            };
            let bytes = self.codec.encode_eack(&eack);
            let frame_end = start + t.tx_offset + airtime(len);
            self.clock
                .busy_wait_until(frame_end + t.tx_ack_delay, &mut || false);
            acked = self.radio.prepare(&bytes) == RadioTx::Ok && self.radio.transmit() == RadioTx::Ok;
        }
        self.radio.off();

        let mut drift = None;
        if Some(src) == self.queues.time_source() {
            self.last_sync_asn = asn;
            if let Some(d) = measured {
                let correction = d.clamp(-max_correction, max_correction);
                self.drift_correction = correction;
                drift = Some(correction as i32);
            }
        }

        if self.policy.is_adaptive() {
            if for_me && header.frame_type == FrameType::Data && header.pigg1 != PIGGYBACK_NONE {
                if handle == COMMON_SF_HANDLE {
                    self.adaptive.on_shared_rx(peer, header.pigg1);
                } else if handle == UNICAST_SF_HANDLE || handle == C::TEMP_SF_HANDLE {
                    self.adaptive.on_unicast_rx(peer, header.pigg1);
                }
            }
            if let Some((size, version)) = header.sf_size {
                if self.routing.is_routing_neighbor(&src) {
                    self.post_slot.push(PostSlot::NeighborSize {
                        peer: src,
                        size,
                        version,
                    });
                }
            }
        }
        self.adaptive.record_rx_slot(handle, RxSlotOutcome::Success);

        if header.frame_type == FrameType::Data {
            let received = ReceivedFrame {
                src,
                dst: header.dst,
                payload: frame.payload,
                asn,
                channel: log_link.channel,
                rssi: self.radio.last_rssi(),
            };
            if self.incoming.push(received).is_err() {
                self.log_kind(LogKind::Message("incoming queue full, frame dropped"));
            }
        }

        self.log.push(LogRecord {
            asn,
            link: Some(log_link),
            kind: LogKind::Rx {
                src,
                seqno: header.seqno,
                datalen: len as u16,
                drift,
                acked,
            },
        });
        SlotAction::Received { src, acked }
    }

    /// Answer the bandwidth request `pigg1` of `peer`. Returns the EACK grant.
    #[cfg_attr(not(feature = "debug"), allow(unused_variables))]
    fn answer_request(&mut self, peer: NodeId, pigg1: u16) -> u16 {
        if pigg1 != PIGGYBACK_NONE {
            emit_debug!(
                self,
                crate::debug::DebugEvent::RequestReceived {
                    asn: self.asn,
                    from: peer,
                    n: pigg1 % C::URGENT_N_OFFSET,
                    urgent: pigg1 >= C::URGENT_N_OFFSET,
                }
            );
        }
        let outcome = self
            .negotiation
            .on_request(&self.schedule, peer, pigg1, &mut self.random);
        if let Some(adjustment) = outcome.adjustment {
            self.post_slot.push(PostSlot::Negotiation(adjustment));
        }
        if let Some(reason) = outcome.error {
            emit_debug!(
                self,
                crate::debug::DebugEvent::NegotiationFailed { peer, reason }
            );
        }
        outcome.eack_pigg1
    }

    /// Reserve the receive side of a matching slot offered by `src`.
    /// Returns the EACK `pigg2`.
    fn grant_matching_slot(&mut self, peer: NodeId, bitmap: u16) -> u16 {
        let horizon = C::MATCHING_HORIZON;
        let own = self
            .schedule
            .subsequent_occupancy(self.asn, &self.reservations, horizon);
        let Some(handle) = matching_rx_handle::<C>(peer) else {
            return NO_MATCHING_SLOT;
        };
        match select_matching_slot(bitmap, own, horizon) {
            Some(k)
                if self.reserve_matching(self.asn.plus(k as u64), handle, LinkOptions::RX, peer) =>
            {
                k
            }
            _ => NO_MATCHING_SLOT,
        }
    }

    /// Reserve a one-shot dedicated cell at `at`.
    #[cfg_attr(not(feature = "debug"), allow(unused_variables))]
    fn reserve_matching(&mut self, at: Asn, handle: u16, options: LinkOptions, peer: NodeId) -> bool {
        let link = Link {
            handle: 0,
            slotframe_handle: handle,
            timeslot: 0,
            channel_offset: C::DEDICATED_CHANNEL_OFFSET,
            options,
            link_type: LinkType::Normal,
            addr: LinkAddr::BROADCAST,
        };
        let reserved = self.reservations.reserve(at, link);
        if reserved {
            emit_debug!(
                self,
                crate::debug::DebugEvent::MatchingSlotReserved {
                    asn: at,
                    peer,
                    is_tx: options.is_tx(),
                }
            );
        }
        reserved
    }

    /// Advance to the next active slot and schedule its wake-up.
    ///
    /// A missed wake-up skips to the following active link, at most
    /// `MAX_CATCH_UP_SLOTS` times.
    fn reschedule(&mut self, executed: Option<Link>) -> Result<(), MacError> {
        if let Some(link) = executed {
            if link.options.is_tx() && link.options.is_shared() {
                self.queues.decrement_backoff_windows(&link.addr);
            }
        }

        let slot_len = C::TIMING.timeslot_length;
        let mut reference = self
            .slot_start
            .offset_by(core::mem::take(&mut self.drift_correction));
        for _ in 0..=C::MAX_CATCH_UP_SLOTS {
            let next = self
                .schedule
                .next_active_link::<C>(self.asn, &self.queues, &self.reservations);
            let offset = next.map_or(1, |n| n.offset);
            self.asn.inc(offset);
            self.current = next;
            let scheduled = self.schedule_slot_operation(reference, slot_len * offset);
            self.slot_start = reference + slot_len * offset;
            if scheduled.is_ok() {
                return Ok(());
            }
            reference = self.slot_start;
        }
        Err(TimingError::DeadlineMissed.into())
    }

    /// Wake-up time of an operation `offset` after `reference`.
    ///
    /// If the wake-up already passed, the miss is logged and the operation
    /// time itself is busy-waited for.
    pub(crate) fn schedule_slot_operation(
        &mut self,
        reference: Instant,
        offset: Duration,
    ) -> Result<Instant, TimingError> {
        let target = reference + offset;
        let wake = target - C::TIMER_GUARD;
        let now = self.clock.now();
        if wake < now {
            self.log_kind(LogKind::MissedSlot {
                late_us: (now - wake).as_micros(),
            });
            self.clock.busy_wait_until(target, &mut || false);
            return Err(TimingError::DeadlineMissed);
        }
        Ok(wake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use crate::config::DefaultConfig;
    use crate::context::ScheduleRequest;
    use crate::log::LogSink;
    use crate::policy::SchedulingPolicy;
    use crate::traits::test_impls::{MockClock, MockRadio, MockRandom, MockRouting};
    use crate::types::MacEvent;
    use crate::wire::{CompactCodec, Frame, FrameHeader};

    type TestMac = Mac<MockRadio, MockClock, MockRandom, MockRouting, CompactCodec, DefaultConfig>;

    fn addr(id: u16) -> LinkAddr {
        LinkAddr::from_node_id(id)
    }

    fn mac(id: u16, policy: SchedulingPolicy, routing: MockRouting) -> TestMac {
        Mac::new(
            MockRadio::new(),
            MockClock::new(),
            MockRandom::new(),
            routing,
            CompactCodec,
            addr(id),
            policy,
        )
    }

    /// Coordinator with routing child `child`.
    fn coordinator_with_child(id: u16, child: u16) -> TestMac {
        let mut routing = MockRouting::new();
        routing.add_child(addr(child));
        let mut m = mac(id, SchedulingPolicy::StaticHashSlots, routing);
        m.start_as_coordinator(Instant::from_millis(10)).unwrap();
        m.post(ScheduleRequest::ChildAdded(addr(child))).unwrap();
        m.process_pending();
        m
    }

    #[derive(Default)]
    struct Records(Vec<LogRecord>);

    impl LogSink for Records {
        fn record(&mut self, record: &LogRecord) {
            self.0.push(*record);
        }
    }

    fn step(m: &mut TestMac, records: &mut Records) -> SlotOutcome {
        m.process_pending();
        let outcome = m.run_slot().unwrap();
        m.drain_log(records);
        outcome
    }

    fn ack_for(frame: &[u8], time_correction: i16) -> Vec<u8> {
        let codec = CompactCodec;
        let frame = codec.decode_frame(frame).unwrap();
        codec.encode_eack(&Eack {
            seqno: frame.header.seqno,
            dst: frame.header.src,
            src: frame.header.dst,
            time_correction,
            nack: false,
            pigg1: PIGGYBACK_NONE,
            pigg2: NO_MATCHING_SLOT,
        })
    }

    fn data_frame(src: u16, dst: LinkAddr, seqno: u8, payload: &[u8]) -> Vec<u8> {
        let mut header = FrameHeader::data(addr(src), dst);
        header.seqno = seqno;
        CompactCodec.encode_frame(&Frame {
            header,
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn test_not_associated() {
        let mut m = mac(1, SchedulingPolicy::StaticHashSlots, MockRouting::new());
        assert_eq!(m.run_slot(), Err(MacError::NotAssociated));
        assert_eq!(m.plan_slot(), SlotPlan::Sleep);
    }

    #[test]
    fn test_plan_matches_execution() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.send(addr(5), b"a".to_vec()).unwrap();
        m.send(LinkAddr::BROADCAST, b"b".to_vec()).unwrap();

        for _ in 0..200 {
            m.process_pending();
            m.radio_mut().script_ack(None);
            let plan = m.plan_slot();
            let outcome = m.run_slot().unwrap();
            m.drain_log(&mut records);
            match (plan, outcome.action) {
                (SlotPlan::Transmit { dest, .. }, SlotAction::Transmitted { dest: d, .. }) => {
                    assert_eq!(dest, d)
                }
                (SlotPlan::Listen { .. }, SlotAction::Idle) => {}
                (SlotPlan::Sleep, SlotAction::Skipped) => {}
                other => panic!("plan and action disagree: {:?}", other),
            }
            assert!(outcome.next_asn > outcome.asn);
            assert!(outcome.next_start > m.clock().now());
        }
    }

    #[test]
    fn test_pending_transmission_matches_air() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.send(addr(5), b"a".to_vec()).unwrap();
        m.send(addr(5), b"b".to_vec()).unwrap();
        m.send(LinkAddr::BROADCAST, b"c".to_vec()).unwrap();

        let mut compared = 0;
        for _ in 0..300 {
            m.process_pending();
            m.radio_mut().take_sent();
            let preview = m.pending_transmission();
            if let Some((_, bytes)) = &preview {
                if CompactCodec.decode_frame(bytes).unwrap().header.ack_required {
                    m.radio_mut().script_ack(Some(ack_for(bytes, 0)));
                }
            }
            m.run_slot().unwrap();
            m.drain_log(&mut records);
            let sent = m.radio_mut().take_sent();
            match preview {
                Some(expected) => {
                    assert_eq!(sent.first(), Some(&expected));
                    compared += 1;
                }
                None => assert!(sent.is_empty()),
            }
        }
        assert!(compared >= 3);
    }

    #[test]
    fn test_broadcast_goes_out_on_hopping_channel() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        let done = Rc::new(RefCell::new(None));
        let seen = done.clone();
        m.send_with_callback(LinkAddr::BROADCAST, b"hello".to_vec(), move |r, n| {
            *seen.borrow_mut() = Some((r, n))
        })
        .unwrap();

        let mut sent_at = None;
        for _ in 0..100 {
            let outcome = step(&mut m, &mut records);
            if let SlotAction::Transmitted { dest, result } = outcome.action {
                if dest == LinkAddr::BROADCAST {
                    assert_eq!(result, TxResult::Ok);
                    sent_at = Some(outcome.asn);
                    break;
                }
            }
        }
        let asn = sent_at.expect("broadcast never sent");
        m.process_pending();
        assert_eq!(*done.borrow(), Some((TxResult::Ok, 1)));

        let sent = m.radio_mut().take_sent();
        let (channel, bytes) = sent
            .iter()
            .find(|(_, b)| {
                CompactCodec
                    .decode_frame(b)
                    .map(|f| f.header.dst == LinkAddr::BROADCAST)
                    .unwrap_or(false)
            })
            .unwrap();
        let hopping = DefaultConfig::HOPPING_SEQUENCE;
        let expected = hopping[((asn.value() + 2) % hopping.len() as u64) as usize];
        assert_eq!(*channel, expected);
        assert_eq!(CompactCodec.decode_frame(bytes).unwrap().payload, b"hello");
    }

    #[test]
    fn test_broadcast_success_keeps_backoff_state() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.send(LinkAddr::BROADCAST, b"hello".to_vec()).unwrap();
        m.process_pending();
        m.queues.get_mut(&LinkAddr::BROADCAST).unwrap().backoff_exponent =
            DefaultConfig::MAX_BE;

        let mut sent = false;
        for _ in 0..100 {
            let outcome = step(&mut m, &mut records);
            if let SlotAction::Transmitted { dest, result } = outcome.action {
                if dest == LinkAddr::BROADCAST {
                    assert_eq!(result, TxResult::Ok);
                    sent = true;
                    break;
                }
            }
        }
        assert!(sent);
        let n = m.queues.get(&LinkAddr::BROADCAST).unwrap();
        assert_eq!(n.backoff_exponent, DefaultConfig::MAX_BE);
        assert_eq!(n.backoff_window, 0);
    }

    #[test]
    fn test_unicast_acked() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.send(addr(5), b"up".to_vec()).unwrap();

        let mut result = None;
        for _ in 0..200 {
            m.process_pending();
            if let SlotPlan::Transmit { dest, .. } = m.plan_slot() {
                if dest == addr(5) {
                    let head = m.queues().get(&addr(5)).unwrap().head().unwrap();
                    let bytes = CompactCodec.encode_frame(&head.frame);
                    m.radio_mut().script_ack(Some(ack_for(&bytes, 0)));
                }
            }
            let outcome = m.run_slot().unwrap();
            m.drain_log(&mut records);
            if let SlotAction::Transmitted { dest, result: r } = outcome.action {
                if dest == addr(5) {
                    result = Some(r);
                    break;
                }
            }
        }
        assert_eq!(result, Some(TxResult::Ok));
        assert_eq!(m.queues().packet_count(&addr(5)), 0);
        assert!(records.0.iter().any(|r| matches!(
            r.kind,
            LogKind::Tx { dest, result: TxResult::Ok, transmissions: 1, .. } if dest == addr(5)
        )));
    }

    #[test]
    fn test_wrong_ack_counts_as_no_ack() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.send(addr(5), b"up".to_vec()).unwrap();

        for _ in 0..200 {
            m.process_pending();
            if let SlotPlan::Transmit { dest, .. } = m.plan_slot() {
                if dest == addr(5) {
                    let head = m.queues().get(&addr(5)).unwrap().head().unwrap();
                    let mut bytes = CompactCodec.encode_frame(&head.frame);
                    // Acknowledge a different sequence number.
                    bytes[2] = bytes[2].wrapping_add(1);
                    m.radio_mut().script_ack(Some(ack_for(&bytes, 0)));
                }
            }
            let outcome = m.run_slot().unwrap();
            m.drain_log(&mut records);
            if let SlotAction::Transmitted { dest, result } = outcome.action {
                if dest == addr(5) {
                    assert_eq!(result, TxResult::NoAck);
                    assert_eq!(m.queues().packet_count(&addr(5)), 1);
                    return;
                }
            }
        }
        panic!("unicast never attempted");
    }

    #[test]
    fn test_retries_exhausted_drops_packet() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        let done = Rc::new(RefCell::new(None));
        let seen = done.clone();
        m.send_with_callback(addr(5), b"first".to_vec(), move |r, n| {
            *seen.borrow_mut() = Some((r, n))
        })
        .unwrap();
        m.send(addr(5), b"second".to_vec()).unwrap();

        for _ in 0..20_000 {
            m.run_slot().unwrap();
            m.process_pending();
            m.drain_log(&mut records);
            if done.borrow().is_some() {
                break;
            }
        }
        assert_eq!(*done.borrow(), Some((TxResult::NoAck, 8)));

        let nbr = m.queues().get(&addr(5)).unwrap();
        assert_eq!(nbr.queue_len(), 1);
        assert_eq!(nbr.backoff_increments, 8);
        assert_eq!(nbr.backoff_exponent, DefaultConfig::MAX_BE);
        let attempts = records
            .0
            .iter()
            .filter(|r| matches!(r.kind, LogKind::Tx { dest, .. } if dest == addr(5)))
            .count();
        assert!(attempts >= 8);
    }

    #[test]
    fn test_cca_busy_is_collision() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.radio_mut().cca_busy = true;
        m.send(LinkAddr::BROADCAST, b"x".to_vec()).unwrap();

        for _ in 0..100 {
            let outcome = step(&mut m, &mut records);
            if let SlotAction::Transmitted { dest, result } = outcome.action {
                if dest == LinkAddr::BROADCAST {
                    assert_eq!(result, TxResult::Collision);
                    assert!(m.radio().sent.is_empty());
                    return;
                }
            }
        }
        panic!("broadcast never attempted");
    }

    #[test]
    fn test_rx_delivers_and_acks() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.radio_mut()
            .inject_rx(data_frame(5, addr(1), 9, b"payload"));

        let mut received = None;
        for _ in 0..100 {
            let outcome = step(&mut m, &mut records);
            if let SlotAction::Received { src, acked } = outcome.action {
                received = Some((src, acked));
                break;
            }
        }
        assert_eq!(received, Some((addr(5), true)));

        let sent = m.radio_mut().take_sent();
        let eack = sent
            .iter()
            .find_map(|(_, b)| CompactCodec.decode_eack(b).ok())
            .unwrap();
        assert_eq!(eack.seqno, 9);
        assert_eq!(eack.dst, addr(5));
        assert_eq!(eack.src, addr(1));

        m.process_pending();
        let frame = m.received().try_receive().unwrap();
        assert_eq!(frame.src, addr(5));
        assert_eq!(frame.payload, b"payload");
    }

    #[test]
    fn test_frame_for_other_node_is_ignored() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.radio_mut()
            .inject_rx(data_frame(5, addr(7), 3, b"not mine"));

        let mut action = None;
        for _ in 0..100 {
            let outcome = step(&mut m, &mut records);
            if m.radio().pending_rx() == 0 {
                action = Some(outcome.action);
                break;
            }
        }
        assert_eq!(action, Some(SlotAction::Idle));
        // Overheard unicast is no contention on our cells
        let adaptive = m.adaptive();
        assert_eq!(adaptive.unicast_rx().collision + adaptive.shared_rx().collision, 0);
        assert_eq!(adaptive.unicast_rx().success + adaptive.shared_rx().success, 0);
        assert!(m
            .radio()
            .sent
            .iter()
            .all(|(_, b)| CompactCodec.decode_eack(b).is_err()));
        m.process_pending();
        assert!(m.received().try_receive().is_err());
    }

    #[test]
    fn test_garbage_is_garbled() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        m.radio_mut().inject_rx(vec![0xff, 0x00]);

        for _ in 0..100 {
            let outcome = step(&mut m, &mut records);
            if outcome.action == SlotAction::Garbled {
                return;
            }
        }
        panic!("garbage never heard");
    }

    #[test]
    fn test_missed_deadline_gives_up_after_catch_up() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        let late = m.slot_start() + DefaultConfig::TIMING.timeslot_length * 1000;
        m.clock().set(late);

        assert_eq!(
            m.run_slot(),
            Err(MacError::Timing(TimingError::DeadlineMissed))
        );
        m.drain_log(&mut records);
        let missed = records
            .0
            .iter()
            .filter(|r| matches!(r.kind, LogKind::MissedSlot { .. }))
            .count();
        assert_eq!(missed as u64, DefaultConfig::MAX_CATCH_UP_SLOTS + 1);
    }

    #[test]
    fn test_slightly_late_catches_up() {
        let mut m = coordinator_with_child(1, 5);
        let mut records = Records::default();
        let outcome = step(&mut m, &mut records);
        // Run the next slot so late that its successor is already due.
        m.clock().set(outcome.next_start + DefaultConfig::TIMING.timeslot_length * 20);

        let outcome = m.run_slot().unwrap();
        m.drain_log(&mut records);
        assert!(outcome.next_start > m.clock().now());
    }

    #[test]
    fn test_drift_from_time_source_shifts_next_slot() {
        let mut routing = MockRouting::with_parent(addr(2));
        routing.add_child(addr(9));
        let mut m = mac(1, SchedulingPolicy::StaticHashSlots, routing);
        m.associate(Asn::new(100), Instant::from_millis(10), Some(addr(2)))
            .unwrap();
        let mut records = Records::default();
        m.send(addr(2), b"up".to_vec()).unwrap();

        for _ in 0..200 {
            m.process_pending();
            if let SlotPlan::Transmit { dest, .. } = m.plan_slot() {
                if dest == addr(2) {
                    let head = m.queues().get(&addr(2)).unwrap().head().unwrap();
                    let bytes = CompactCodec.encode_frame(&head.frame);
                    m.radio_mut().script_ack(Some(ack_for(&bytes, 150)));
                    let start = m.slot_start();
                    let outcome = m.run_slot().unwrap();
                    let slots = outcome.next_asn.diff(outcome.asn);
                    let expected = start + DefaultConfig::TIMING.timeslot_length * slots;
                    assert_eq!(outcome.next_start.signed_diff(expected), 150);
                    m.drain_log(&mut records);
                    assert!(records.0.iter().any(|r| matches!(
                        r.kind,
                        LogKind::Tx { drift: Some(150), .. }
                    )));
                    return;
                }
            }
            m.run_slot().unwrap();
            m.drain_log(&mut records);
        }
        panic!("unicast to parent never attempted");
    }

    #[test]
    fn test_burst_to_large_id_parent_requests_nothing() {
        let parent = addr(40_000);
        let mut m = mac(
            3,
            SchedulingPolicy::NegotiatedResidualAllocation,
            MockRouting::with_parent(parent),
        );
        m.associate(Asn::new(100), Instant::from_millis(10), Some(parent))
            .unwrap();
        for i in 0..3 {
            m.send(parent, vec![i]).unwrap();
        }

        let mut records = Records::default();
        let mut previews = 0;
        for _ in 0..300 {
            m.process_pending();
            if !m.is_associated() {
                break;
            }
            if let Some((_, bytes)) = m.pending_transmission() {
                let frame = CompactCodec.decode_frame(&bytes).unwrap();
                if frame.header.dst == parent {
                    assert!(!frame.header.frame_pending);
                    assert_eq!(frame.header.pigg2, NO_MATCHING_SLOT);
                    previews += 1;
                }
            }
            m.run_slot().unwrap();
            m.drain_log(&mut records);
        }
        assert!(previews > 0);
        assert!(m.reservations.is_empty());
        assert!(records
            .0
            .iter()
            .any(|r| matches!(r.kind, LogKind::Tx { dest, .. } if dest == parent)));
    }

    struct FastDesync;

    impl MacConfig for FastDesync {
        const MAX_NEIGHBORS: usize = 8;
        const QUEUE_CAPACITY: usize = 4;
        const MAX_INCOMING_PACKETS: usize = 4;
        const DEQUEUED_CAPACITY: usize = 8;
        const LOG_CAPACITY: usize = 16;
        const MAX_NODE_ID: u16 = 16;
        const DESYNC_THRESHOLD: Duration = Duration::from_secs(1);
    }

    #[test]
    fn test_desync_disassociates() {
        let mut m: Mac<MockRadio, MockClock, MockRandom, MockRouting, CompactCodec, FastDesync> =
            Mac::new(
                MockRadio::new(),
                MockClock::new(),
                MockRandom::new(),
                MockRouting::with_parent(addr(2)),
                CompactCodec,
                addr(1),
                SchedulingPolicy::StaticHashSlots,
            );
        m.associate(Asn::new(100), Instant::from_millis(10), Some(addr(2)))
            .unwrap();
        m.send(addr(2), b"lost".to_vec()).unwrap();

        for _ in 0..1000 {
            m.process_pending();
            m.run_slot().unwrap();
            if !m.is_associated() {
                break;
            }
        }
        assert!(!m.is_associated());
        assert_eq!(m.run_slot(), Err(MacError::NotAssociated));
        assert_eq!(m.queues().global_packet_count(), 0);

        let events: Vec<MacEvent> = core::iter::from_fn(|| m.events().try_receive().ok()).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, MacEvent::Disassociated { .. })));
    }

    #[test]
    fn test_dedicated_channel_agrees_on_both_ends() {
        let routing = MockRouting::with_parent(addr(4));
        let sender = mac(7, SchedulingPolicy::NegotiatedResidualAllocation, routing);
        let receiver = mac(
            4,
            SchedulingPolicy::NegotiatedResidualAllocation,
            MockRouting::new(),
        );

        let tx = Link {
            handle: 0,
            slotframe_handle: tx_sf_handle::<DefaultConfig>(4).unwrap(),
            timeslot: 0,
            channel_offset: DefaultConfig::DEDICATED_CHANNEL_OFFSET,
            options: LinkOptions::TX,
            link_type: LinkType::Normal,
            addr: addr(4),
        };
        let rx = Link {
            slotframe_handle: crate::negotiation::rx_sf_handle::<DefaultConfig>(7).unwrap(),
            options: LinkOptions::RX,
            addr: addr(7),
            ..tx
        };
        let m_tx = Link {
            slotframe_handle: matching_tx_handle::<DefaultConfig>(4).unwrap(),
            addr: LinkAddr::BROADCAST,
            ..tx
        };
        let m_rx = Link {
            slotframe_handle: matching_rx_handle::<DefaultConfig>(7).unwrap(),
            addr: LinkAddr::BROADCAST,
            ..rx
        };

        for asn in [0u64, 1, 17, 1000, 65_537] {
            let asn = Asn::new(asn);
            let a = sender.channel_offset_for(&tx, asn);
            let b = receiver.channel_offset_for(&rx, asn);
            assert_eq!(a, b);
            assert!(a == 2 || a == 3);
            assert_eq!(
                sender.channel_offset_for(&m_tx, asn),
                receiver.channel_offset_for(&m_rx, asn)
            );
        }

        let expected = 3 - (wang_hash(4 + 1000) % 2) as u16;
        assert_eq!(sender.channel_offset_for(&m_tx, Asn::new(1000)), expected);
    }

    #[test]
    fn test_static_policy_keeps_link_channel_offset() {
        let m = mac(7, SchedulingPolicy::StaticHashSlots, MockRouting::new());
        let link = Link {
            handle: 0,
            slotframe_handle: 9,
            timeslot: 0,
            channel_offset: 3,
            options: LinkOptions::TX,
            link_type: LinkType::Normal,
            addr: addr(4),
        };
        assert_eq!(m.channel_offset_for(&link, Asn::new(5)), 3);
        assert_eq!(m.hop(Asn::new(5), 3), m.hop(Asn::new(1), 3));
    }
}
