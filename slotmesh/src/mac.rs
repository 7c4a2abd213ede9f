//! The MAC: owned state, public API and the between-slot context.
//!
//! `Mac` owns the schedule, the neighbor queues and all protocol state. Slots
//! execute in `run_slot` (see `engine`). Everything else happens between
//! slots in `process_pending`:
//! - Schedule requests posted by the routing layer or the application
//! - Sent callbacks of finished packets
//! - Delivery of received frames to the upper layer
//! - Delayed tasks (exponent selection, resize checks, beacons)
//!
//! # Usage
//!
//! ```ignore
//! let mut mac = Mac::<_, _, _, _, _, DefaultConfig>::new(
//!     radio, clock, random, routing, CompactCodec, addr, SchedulingPolicy::AdaptiveSlotframe,
//! );
//! mac.associate(asn, slot_start, Some(parent))?;
//!
//! // Spawn the run loop
//! spawn(async move {
//!     mac.run().await;
//! });
//!
//! // From the routing layer
//! requests.send(ScheduleRequest::ChildAdded(child)).await;
//!
//! // Frames for the upper layer
//! let frame = received.receive().await;
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use embassy_sync::channel::Channel;

use crate::adaptive::AdaptiveState;
use crate::collections::Ring;
use crate::config::MacConfig;
use crate::context::ScheduleRequest;
#[cfg(feature = "debug")]
use crate::debug::DebugEmitter;
use crate::emit_debug;
use crate::log::{FacadeSink, LogBuffer, LogKind, LogRecord, LogSink};
use crate::matching::Reservations;
use crate::negotiation::{has_handles, Adjustment, NegotiationTable};
use crate::policy::SchedulingPolicy;
use crate::queue::{NeighborQueues, Packet, SentCallback};
use crate::schedule::{NextActive, Schedule};
use crate::tasks::DelayedTasks;
use crate::time::{Asn, Duration, Instant};
use crate::traits::{
    Clock, EventChannel, FrameCodec, Radio, Random, RequestChannel, RoutingView, RxChannel,
};
use crate::types::{
    LinkAddr, MacError, MacEvent, NodeId, Payload, QueueError, ReceivedFrame, TxResult,
    EB_SF_HANDLE,
};
use crate::wire::{Frame, FrameHeader};

/// Work deferred to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    /// Drop the old-size reception slotframe parked during a resize.
    RemoveTempSlotframe,
    /// Re-estimate the exponent to request from each routing neighbor.
    SelectN,
    /// Decide whether the own reception slotframe should be resized.
    AdaptiveCheck,
    /// Start a new per-neighbor counter window.
    RenewCounters,
    /// Queue an enhanced beacon.
    SendBeacon,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Task::RemoveTempSlotframe => "remove-temp-slotframe",
            Task::SelectN => "select-n",
            Task::AdaptiveCheck => "adaptive-check",
            Task::RenewCounters => "renew-counters",
            Task::SendBeacon => "send-beacon",
        }
    }
}

/// Schedule change decided inside a slot, applied right after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostSlot {
    Negotiation(Adjustment),
    /// A routing neighbor's beacon announced a new reception slotframe size.
    NeighborSize { peer: LinkAddr, size: u16, version: u8 },
}

/// A TSCH MAC instance.
///
/// Generic over:
/// - `R`: Radio driver
/// - `Clk`: Clock/timer implementation
/// - `Rn`: Random number generator
/// - `Rt`: Routing layer view
/// - `F`: Frame codec
/// - `C`: Compile-time configuration
pub struct Mac<R, Clk, Rn, Rt, F, C> {
    // Dependencies (injected)
    pub(crate) radio: R,
    pub(crate) clock: Clk,
    pub(crate) random: Rn,
    pub(crate) routing: Rt,
    pub(crate) codec: F,

    // Upper-layer channels
    requests: RequestChannel,
    events: EventChannel,
    received: RxChannel,

    // Identity
    pub(crate) addr: LinkAddr,
    pub(crate) id: NodeId,
    pub(crate) policy: SchedulingPolicy,

    // Protocol state
    pub(crate) schedule: Schedule,
    pub(crate) queues: NeighborQueues<C>,
    pub(crate) negotiation: NegotiationTable<C>,
    pub(crate) reservations: Reservations,
    pub(crate) adaptive: AdaptiveState<C>,
    pub(crate) tasks: DelayedTasks<Task>,
    pub(crate) log: LogBuffer,
    pub(crate) incoming: Ring<ReceivedFrame>,
    pub(crate) post_slot: Vec<PostSlot>,

    // Slot state
    pub(crate) asn: Asn,
    pub(crate) slot_start: Instant,
    pub(crate) current: Option<NextActive>,
    pub(crate) associated: bool,
    pub(crate) is_coordinator: bool,
    /// Correction in microseconds applied once to the next slot start.
    pub(crate) drift_correction: i64,
    pub(crate) last_sync_asn: Asn,
    pub(crate) seqno: u8,
    /// The schedule changed since `current` was computed.
    pub(crate) schedule_dirty: bool,

    #[cfg(feature = "debug")]
    pub(crate) debug_emitter: Option<Box<dyn DebugEmitter>>,
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
    /// Create a MAC and install the autonomous slotframes of `policy`.
    pub fn new(
        radio: R,
        clock: Clk,
        random: Rn,
        routing: Rt,
        codec: F,
        addr: LinkAddr,
        policy: SchedulingPolicy,
    ) -> Self {
        let mut mac = Self {
            radio,
            clock,
            random,
            routing,
            codec,

            requests: Channel::new(),
            events: Channel::new(),
            received: Channel::new(),

            addr,
            id: addr.node_id(),
            policy,

            schedule: Schedule::new(),
            queues: NeighborQueues::new(),
            negotiation: NegotiationTable::new(),
            reservations: Reservations::new(C::MAX_RESERVATIONS),
            adaptive: AdaptiveState::new(),
            tasks: DelayedTasks::new(),
            log: LogBuffer::new(C::LOG_CAPACITY),
            incoming: Ring::with_capacity(C::MAX_INCOMING_PACKETS),
            post_slot: Vec::new(),

            asn: Asn::ZERO,
            slot_start: Instant::ZERO,
            current: None,
            associated: false,
            is_coordinator: false,
            drift_correction: 0,
            last_sync_asn: Asn::ZERO,
            seqno: 0,
            schedule_dirty: false,

            #[cfg(feature = "debug")]
            debug_emitter: None,
        };
        if let Err(e) = mac.init_policy() {
            mac.log_kind(LogKind::Error(e));
        }
        mac
    }

    /// Set the debug emitter for protocol tracing.
    #[cfg(feature = "debug")]
    pub fn set_debug_emitter(&mut self, emitter: Box<dyn DebugEmitter>) {
        self.debug_emitter = Some(emitter);
    }

    // --- Accessors ---

    pub fn addr(&self) -> LinkAddr {
        self.addr
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn queues(&self) -> &NeighborQueues<C> {
        &self.queues
    }

    pub fn negotiation(&self) -> &NegotiationTable<C> {
        &self.negotiation
    }

    pub fn adaptive(&self) -> &AdaptiveState<C> {
        &self.adaptive
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn routing(&self) -> &Rt {
        &self.routing
    }

    /// Mutate the routing view. Post the matching `ScheduleRequest` so the
    /// schedule follows.
    pub fn routing_mut(&mut self) -> &mut Rt {
        &mut self.routing
    }

    /// ASN of the next slot to run.
    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Start time of the next slot to run.
    pub fn slot_start(&self) -> Instant {
        self.slot_start
    }

    pub fn is_associated(&self) -> bool {
        self.associated
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator
    }

    pub fn time_source(&self) -> Option<LinkAddr> {
        self.queues.time_source()
    }

    /// Schedule mutation requests, drained between slots.
    pub fn requests(&self) -> &RequestChannel {
        &self.requests
    }

    /// Events for the upper layer.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Frames received for the upper layer.
    pub fn received(&self) -> &RxChannel {
        &self.received
    }

    // --- Upper-layer API ---

    /// Queue `payload` for `dest`. Returns the queue length towards `dest`.
    pub fn send(&mut self, dest: LinkAddr, payload: Payload) -> Result<usize, MacError> {
        self.enqueue_data(dest, payload, None)
    }

    /// Like `send`; `callback` receives the final status and the number of
    /// transmissions once the packet leaves the queue.
    pub fn send_with_callback(
        &mut self,
        dest: LinkAddr,
        payload: Payload,
        callback: impl FnOnce(TxResult, u8) + 'static,
    ) -> Result<usize, MacError> {
        let callback: SentCallback = Box::new(callback);
        self.enqueue_data(dest, payload, Some(callback))
    }

    fn enqueue_data(
        &mut self,
        dest: LinkAddr,
        payload: Payload,
        callback: Option<SentCallback>,
    ) -> Result<usize, MacError> {
        let mut header = FrameHeader::data(self.addr, dest);
        header.seqno = self.next_seqno();
        let unicast = !dest.is_broadcast() && !dest.is_eb();
        if unicast && self.routing.is_routing_neighbor(&dest) {
            let peer = dest.node_id();
            match self.policy {
                SchedulingPolicy::NegotiatedResidualAllocation if has_handles::<C>(peer) => {
                    header.pigg1 = self.negotiation.request_value(peer);
                    self.negotiation.note_enqueued(peer);
                }
                SchedulingPolicy::NegotiatedResidualAllocation => {}
                SchedulingPolicy::AdaptiveSlotframe => {
                    let queued = self.queues.packet_count(&dest) + 1;
                    header.pigg1 = self.adaptive.tx_report(peer, queued);
                }
                SchedulingPolicy::StaticHashSlots => {}
            }
        }
        let mut packet = Packet::new(Frame { header, payload });
        let (slotframe, timeslot) = self.select_packet(&dest);
        packet.stamp(slotframe, timeslot);
        if let Some(callback) = callback {
            packet = packet.with_callback(callback);
        }
        Ok(self.queues.enqueue(packet)?)
    }

    /// Queue an enhanced beacon, carrying the own slotframe size when adaptive.
    pub(crate) fn enqueue_beacon(&mut self) -> Result<usize, MacError> {
        let mut header = FrameHeader::beacon(self.addr);
        header.seqno = self.next_seqno();
        if self.policy.is_adaptive() {
            header.sf_size = Some((self.adaptive.sf_size(), self.adaptive.sf_version()));
        }
        let mut packet = Packet::new(Frame {
            header,
            payload: Vec::new(),
        });
        packet.stamp(EB_SF_HANDLE, 0);
        Ok(self.queues.enqueue(packet)?)
    }

    /// Post a schedule request without waiting.
    pub fn post(&self, request: ScheduleRequest) -> Result<(), QueueError> {
        self.requests
            .try_send(request)
            .map_err(|_| QueueError::Full)
    }

    /// Start the slot engine: slot `asn` started at `slot_start`, synchronized
    /// to `time_source` (`None` for the coordinator).
    ///
    /// The engine is positioned on the first active slot after `asn`.
    pub fn associate(
        &mut self,
        asn: Asn,
        slot_start: Instant,
        time_source: Option<LinkAddr>,
    ) -> Result<(), MacError> {
        self.asn = asn;
        self.slot_start = slot_start;
        self.last_sync_asn = asn;
        self.drift_correction = 0;
        self.is_coordinator = time_source.is_none();
        self.reservations.clear();
        self.set_time_source(time_source)?;
        self.associated = true;

        let next = self
            .schedule
            .next_active_link::<C>(self.asn, &self.queues, &self.reservations);
        let offset = next.map_or(1, |n| n.offset);
        self.asn.inc(offset);
        self.slot_start = slot_start + C::TIMING.timeslot_length * offset;
        self.current = next;
        self.schedule_dirty = false;

        self.start_tasks();
        self.push_event(MacEvent::Associated { asn });
        Ok(())
    }

    /// Start a network as its coordinator: ASN 0 begins at `now`.
    pub fn start_as_coordinator(&mut self, now: Instant) -> Result<(), MacError> {
        self.associate(Asn::ZERO, now, None)
    }

    /// Leave the network: queues are flushed and the engine stops.
    pub(crate) fn disassociate(&mut self) {
        self.associated = false;
        self.current = None;
        self.queues.flush_all();
        self.reservations.clear();
        self.tasks.clear();
        if self.adaptive.temp_removal.take().is_some() {
            if let Err(e) = self.remove_slotframe_if_present(C::TEMP_SF_HANDLE) {
                self.log_kind(LogKind::Error(e));
            }
        }
        self.push_event(MacEvent::Disassociated { asn: self.asn });
    }

    fn set_time_source(&mut self, new: Option<LinkAddr>) -> Result<(), MacError> {
        let old = self.queues.time_source();
        if !self.queues.update_time_source(new)? {
            return Ok(());
        }
        self.on_new_time_source(old, new)?;
        self.push_event(MacEvent::TimeSourceChanged { old, new });
        Ok(())
    }

    fn start_tasks(&mut self) {
        let now = self.clock.now();
        self.tasks.clear();
        self.tasks.schedule(now, Task::SendBeacon);
        match self.policy {
            SchedulingPolicy::NegotiatedResidualAllocation => {
                self.tasks
                    .schedule(now + C::N_SELECTION_PERIOD, Task::SelectN);
            }
            SchedulingPolicy::AdaptiveSlotframe => {
                self.tasks
                    .schedule(now + C::SF_SIZE_CHECK_PERIOD, Task::AdaptiveCheck);
                self.tasks
                    .schedule(now + C::NBR_COUNTER_RENEW_PERIOD, Task::RenewCounters);
                if self.adaptive.temp_removal.is_some() {
                    let deadline = now + C::RETAIN_RX_SF_DURATION;
                    self.adaptive.temp_removal =
                        Some(self.tasks.schedule(deadline, Task::RemoveTempSlotframe));
                }
            }
            SchedulingPolicy::StaticHashSlots => {}
        }
    }

    // --- Between-slot context ---

    /// Drain requests, run sent callbacks, deliver received frames and run
    /// due tasks. Never called while a slot executes.
    pub fn process_pending(&mut self) {
        while let Ok(request) = self.requests.try_receive() {
            if let Err(e) = self.handle_request(request) {
                self.log_kind(LogKind::Error(e));
            }
        }

        for packet in self.queues.take_dequeued() {
            packet.complete();
        }

        while let Some(frame) = self.incoming.peek() {
            if self.received.try_send(frame.clone()).is_err() {
                break;
            }
            self.incoming.pop();
        }

        let now = self.clock.now();
        for task in self.tasks.pop_due(now) {
            emit_debug!(self, crate::debug::DebugEvent::TaskFired { name: task.name() });
            if let Err(e) = self.run_task(task, now) {
                self.log_kind(LogKind::Error(e));
            }
        }

        self.queues.free_unused_neighbors();
    }

    fn handle_request(&mut self, request: ScheduleRequest) -> Result<(), MacError> {
        match request {
            ScheduleRequest::AddSlotframe { handle, size } => {
                self.schedule.add_slotframe(handle, size)?;
                emit_debug!(self, crate::debug::DebugEvent::SlotframeAdded { handle, size });
            }
            ScheduleRequest::RemoveSlotframe { handle } => {
                self.schedule.remove_slotframe(&mut self.queues, handle)?;
                emit_debug!(self, crate::debug::DebugEvent::SlotframeRemoved { handle });
            }
            ScheduleRequest::AddLink {
                slotframe,
                options,
                link_type,
                addr,
                timeslot,
                channel_offset,
            } => {
                self.schedule.add_link(
                    &mut self.queues,
                    slotframe,
                    options,
                    link_type,
                    addr,
                    timeslot,
                    channel_offset,
                )?;
            }
            ScheduleRequest::RemoveLinkByTimeslot {
                slotframe,
                timeslot,
            } => {
                self.schedule
                    .remove_link_by_timeslot(&mut self.queues, slotframe, timeslot)?;
            }
            ScheduleRequest::ChildAdded(child) => self.on_child_added(child)?,
            ScheduleRequest::ChildRemoved(child) => self.on_child_removed(child)?,
            ScheduleRequest::TimeSourceChanged(new) => self.set_time_source(new)?,
            ScheduleRequest::FlushNeighbor(addr) => {
                self.queues.flush(&addr);
                return Ok(());
            }
            ScheduleRequest::NeighborSlotframeSize {
                addr,
                size,
                version,
            } => self.on_neighbor_size(addr, size, version)?,
        }
        self.schedule_dirty = true;
        Ok(())
    }

    fn run_task(&mut self, task: Task, now: Instant) -> Result<(), MacError> {
        match task {
            Task::RemoveTempSlotframe => {
                self.adaptive.temp_removal = None;
                if self.remove_slotframe_if_present(C::TEMP_SF_HANDLE)? {
                    self.schedule_dirty = true;
                }
            }
            Task::SelectN => {
                self.select_exponents();
                self.tasks
                    .schedule(now + C::N_SELECTION_PERIOD, Task::SelectN);
            }
            Task::AdaptiveCheck => {
                self.tasks
                    .schedule(now + C::SF_SIZE_CHECK_PERIOD, Task::AdaptiveCheck);
                if self.check_sf_size()? {
                    self.schedule_dirty = true;
                }
            }
            Task::RenewCounters => {
                self.adaptive.renew_counters();
                self.tasks
                    .schedule(now + C::NBR_COUNTER_RENEW_PERIOD, Task::RenewCounters);
            }
            Task::SendBeacon => {
                self.tasks
                    .schedule(now + C::EB_SEND_INTERVAL, Task::SendBeacon);
                if self.associated && self.queues.is_empty(&LinkAddr::EB) {
                    self.enqueue_beacon()?;
                }
            }
        }
        Ok(())
    }

    /// Apply schedule changes decided during the slot that just ran.
    pub(crate) fn apply_post_slot(&mut self) {
        for change in core::mem::take(&mut self.post_slot) {
            let result = match change {
                PostSlot::Negotiation(adjustment) => self.apply_adjustment(adjustment),
                PostSlot::NeighborSize {
                    peer,
                    size,
                    version,
                } => self.on_neighbor_size(peer, size, version),
            };
            if let Err(e) = result {
                self.log_kind(LogKind::Error(e));
            }
        }
    }

    /// Drain buffered log records into `sink`. Returns how many were drained.
    pub fn drain_log(&mut self, sink: &mut dyn LogSink) -> usize {
        let dropped = self.log.take_dropped();
        if dropped > 0 {
            log::warn!("slot log overflowed, {} records dropped", dropped);
        }
        self.log.drain(sink)
    }

    /// Run the MAC forever.
    ///
    /// Sleeps until the next slot (minus the timer guard), the next delayed
    /// task, or a posted request, whichever comes first. Log records go to
    /// the `log` facade.
    ///
    /// Call this from an async task/executor.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select, Either};

        loop {
            self.process_pending();
            self.drain_log(&mut FacadeSink);

            let now = self.clock.now();
            let mut wake = now + Duration::from_secs(1);
            if self.associated {
                wake = wake.min(self.slot_start - C::TIMER_GUARD);
            }
            if let Some(deadline) = self.tasks.next_deadline() {
                wake = wake.min(deadline);
            }

            let result = select(self.clock.sleep_until(wake), self.requests.receive()).await;

            match result {
                Either::First(()) => {
                    let now = self.clock.now();
                    if self.associated && now + C::TIMER_GUARD >= self.slot_start {
                        if let Err(e) = self.run_slot() {
                            self.log_kind(LogKind::Error(e));
                        }
                    }
                }
                Either::Second(request) => {
                    if let Err(e) = self.handle_request(request) {
                        self.log_kind(LogKind::Error(e));
                    }
                }
            }
        }
    }

    // --- Helpers ---

    pub(crate) fn next_seqno(&mut self) -> u8 {
        self.seqno = self.seqno.wrapping_add(1);
        self.seqno
    }

    pub(crate) fn push_event(&mut self, event: MacEvent) {
        if self.events.try_send(event).is_err() {
            self.log_kind(LogKind::Message("event channel full, event dropped"));
        }
    }

    pub(crate) fn log_kind(&mut self, kind: LogKind) {
        self.log.push(LogRecord {
            asn: self.asn,
            link: None,
            kind,
        });
    }
}
