//! SimNode wrapper for simulated slotmesh nodes.

use std::cell::{Cell, RefCell};
use std::future::{ready, Ready};
use std::rc::Rc;

use slotmesh::traits::{Clock, Radio, RadioTx, Random, RoutingView};
use slotmesh::{
    Asn, CompactCodec, DefaultConfig, FrameCodec, Instant, LinkAddr, LogKind, LogRecord, LogSink,
    Mac, MacError, MacEvent, NodeId, ReceivedFrame, SchedulingPolicy, ScheduleRequest, SlotOutcome,
    TxResult,
};

/// The MAC as instantiated by the simulator.
pub type SimMac = Mac<SimRadio, SimClock, SimRandom, SimRouting, CompactCodec, DefaultConfig>;

/// Radio attached to the simulated medium.
///
/// Before each slot the simulator decides what the node hears: at most one
/// frame on one channel, and for a transmitter the acknowledgment that comes
/// back. An empty frame stands for energy that does not decode (collision).
#[derive(Default)]
pub struct SimRadio {
    channel: u8,
    on: bool,
    /// Frame on the air this slot and the channel it is on.
    air: Option<(u8, Vec<u8>)>,
    /// Reply to this slot's transmission.
    reply: Option<Vec<u8>>,
    prepared: Vec<u8>,
    incoming: Option<Vec<u8>>,
    rssi: i16,
    sent: Vec<(u8, Vec<u8>)>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a frame on the air for the coming slot.
    pub fn set_air(&mut self, channel: u8, frame: Vec<u8>, rssi: i16) {
        self.air = Some((channel, frame));
        self.rssi = rssi;
    }

    /// Set the reply to the coming slot's transmission.
    pub fn set_reply(&mut self, ack: Vec<u8>) {
        self.reply = Some(ack);
    }

    /// Forget whatever the last slot left behind.
    pub fn clear(&mut self) {
        self.air = None;
        self.reply = None;
        self.incoming = None;
    }

    /// Take every frame transmitted since the last call.
    pub fn take_sent(&mut self) -> Vec<(u8, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl Radio for SimRadio {
    fn prepare(&mut self, frame: &[u8]) -> RadioTx {
        self.prepared = frame.to_vec();
        RadioTx::Ok
    }

    fn transmit(&mut self) -> RadioTx {
        let frame = std::mem::take(&mut self.prepared);
        self.sent.push((self.channel, frame));
        self.incoming = self.reply.take();
        RadioTx::Ok
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.incoming.take() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                len
            }
            None => 0,
        }
    }

    fn channel_clear(&mut self) -> bool {
        true
    }

    fn receiving_packet(&mut self) -> bool {
        if self.incoming.is_none() && self.on {
            if let Some((channel, frame)) = self.air.take() {
                if channel == self.channel {
                    self.incoming = Some(frame);
                }
            }
        }
        self.incoming.is_some()
    }

    fn pending_packet(&mut self) -> bool {
        self.incoming.is_some()
    }

    fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    fn on(&mut self) {
        self.on = true;
    }

    fn off(&mut self) {
        self.on = false;
    }

    fn last_rssi(&self) -> i16 {
        self.rssi
    }
}

/// Clock for simulation.
///
/// Time is controlled externally by the simulator; busy-waits jump forward.
pub struct SimClock {
    current: Cell<Instant>,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            current: Cell::new(Instant::ZERO),
        }
    }

    /// Move forward to `time`. Never goes back.
    pub fn advance_to(&self, time: Instant) {
        if time > self.current.get() {
            self.current.set(time);
        }
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Instant {
        self.current.get()
    }

    fn sleep_until(&self, time: Instant) -> Self::SleepFuture<'_> {
        self.advance_to(time);
        ready(())
    }

    fn busy_wait_until(&self, deadline: Instant, until: &mut dyn FnMut() -> bool) -> bool {
        if until() {
            return true;
        }
        self.advance_to(deadline);
        until()
    }
}

/// Random for simulation (deterministic LCG).
pub struct SimRandom {
    state: u64,
}

impl SimRandom {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Random for SimRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let range = max.saturating_sub(min);
        if range == 0 {
            return min;
        }
        min + ((self.state >> 33) % range)
    }
}

/// Static routing tree as seen by one node.
#[derive(Debug, Clone, Default)]
pub struct SimRouting {
    parent: Option<LinkAddr>,
    children: Vec<LinkAddr>,
}

impl SimRouting {
    pub fn new(parent: Option<NodeId>) -> Self {
        Self {
            parent: parent.map(LinkAddr::from_node_id),
            children: Vec::new(),
        }
    }

    pub fn add_child(&mut self, child: NodeId) {
        let child = LinkAddr::from_node_id(child);
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }
}

impl RoutingView for SimRouting {
    fn preferred_parent(&self) -> Option<LinkAddr> {
        self.parent
    }

    fn is_routing_child(&self, addr: &LinkAddr) -> bool {
        self.children.contains(addr)
    }

    fn routing_children(&self) -> Vec<LinkAddr> {
        self.children.clone()
    }
}

/// Per-node counters filled from the slot log and sent callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Transmission attempts by outcome.
    pub tx_ok: u64,
    pub tx_noack: u64,
    pub tx_collision: u64,
    /// Packets that left the queue successfully.
    pub packets_acked: u64,
    /// Packets dropped after the last retry.
    pub packets_dropped: u64,
    pub rx_frames: u64,
    pub missed_slots: u64,
    pub desyncs: u64,
    pub errors: u64,
}

impl LogSink for NodeStats {
    fn record(&mut self, record: &LogRecord) {
        match record.kind {
            LogKind::Tx { result, .. } => match result {
                TxResult::Ok => self.tx_ok += 1,
                TxResult::NoAck => self.tx_noack += 1,
                _ => self.tx_collision += 1,
            },
            LogKind::Rx { .. } => self.rx_frames += 1,
            LogKind::MissedSlot { .. } => self.missed_slots += 1,
            LogKind::Desync { .. } => self.desyncs += 1,
            LogKind::Error(_) => self.errors += 1,
            LogKind::Message(_) => {}
        }
        log::trace!("{}", record);
    }
}

/// A simulated node: the MAC plus the upper-layer bookkeeping the
/// simulator needs.
pub struct SimNode {
    id: NodeId,
    mac: SimMac,
    stats: NodeStats,
    /// Final status of every packet sent through `send`.
    completions: Rc<RefCell<Vec<TxResult>>>,
    delivered: Vec<ReceivedFrame>,
    /// Delivered frames not yet taken by the simulator.
    inbox: Vec<ReceivedFrame>,
    events: Vec<MacEvent>,
    /// Routing parent and time source, `None` for the coordinator.
    parent: Option<NodeId>,
}

impl SimNode {
    /// Create a node. `parent` is its routing parent and time source,
    /// `None` for the coordinator.
    pub fn new(id: NodeId, parent: Option<NodeId>, policy: SchedulingPolicy, seed: u64) -> Self {
        let mac = Mac::new(
            SimRadio::new(),
            SimClock::new(),
            SimRandom::new(seed),
            SimRouting::new(parent),
            CompactCodec,
            LinkAddr::from_node_id(id),
            policy,
        );
        Self {
            id,
            mac,
            stats: NodeStats::default(),
            completions: Rc::new(RefCell::new(Vec::new())),
            delivered: Vec::new(),
            inbox: Vec::new(),
            events: Vec::new(),
            parent,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn mac(&self) -> &SimMac {
        &self.mac
    }

    pub fn mac_mut(&mut self) -> &mut SimMac {
        &mut self.mac
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Data frames handed to the upper layer so far.
    pub fn delivered(&self) -> &[ReceivedFrame] {
        &self.delivered
    }

    pub fn events(&self) -> &[MacEvent] {
        &self.events
    }

    /// Take the frames delivered since the last call.
    pub fn take_inbox(&mut self) -> Vec<ReceivedFrame> {
        std::mem::take(&mut self.inbox)
    }

    /// Start the slot engine at `asn`, which began at `slot_start`.
    pub fn join(&mut self, asn: Asn, slot_start: Instant) -> Result<(), MacError> {
        self.mac.clock().advance_to(slot_start);
        self.mac
            .associate(asn, slot_start, self.parent.map(LinkAddr::from_node_id))?;
        self.collect();
        Ok(())
    }

    /// Register a routing child.
    pub fn add_child(&mut self, child: NodeId) {
        if self
            .mac
            .routing()
            .is_routing_child(&LinkAddr::from_node_id(child))
        {
            return;
        }
        self.mac.routing_mut().add_child(child);
        if self
            .mac
            .post(ScheduleRequest::ChildAdded(LinkAddr::from_node_id(child)))
            .is_err()
        {
            log::warn!("node {}: request queue full, child {} not announced", self.id, child);
        }
    }

    /// Queue `payload` for `to`.
    pub fn send(&mut self, to: LinkAddr, payload: Vec<u8>) -> Result<usize, MacError> {
        let completions = self.completions.clone();
        self.mac
            .send_with_callback(to, payload, move |result, _| {
                completions.borrow_mut().push(result)
            })
    }

    /// Bring the node to `now` and run its between-slot work.
    pub fn prepare(&mut self, now: Instant) {
        self.mac.clock().advance_to(now);
        self.mac.radio_mut().clear();
        self.mac.process_pending();
        self.collect();
    }

    /// Execute the node's current slot.
    pub fn run_slot(&mut self) -> Result<SlotOutcome, MacError> {
        let outcome = self.mac.run_slot();
        self.mac.process_pending();
        self.collect();
        outcome
    }

    /// Drain log records, events, delivered frames and completions.
    fn collect(&mut self) {
        self.mac.drain_log(&mut self.stats);
        while let Ok(event) = self.mac.events().try_receive() {
            self.events.push(event);
        }
        while let Ok(frame) = self.mac.received().try_receive() {
            self.delivered.push(frame.clone());
            self.inbox.push(frame);
        }
        for result in self.completions.borrow_mut().drain(..) {
            if result.is_ok() {
                self.stats.packets_acked += 1;
            } else {
                self.stats.packets_dropped += 1;
            }
        }
    }
}
