//! Per-neighbor packet queues and CSMA backoff.
//!
//! Every neighbor owns a bounded FIFO of outgoing packets. Two sentinel
//! neighbors always exist: the enhanced-beacon queue (`LinkAddr::EB`) and the
//! data-broadcast queue (`LinkAddr::BROADCAST`). Other neighbors are created on
//! first use and collected as soon as they are idle: empty queue, not the time
//! source, no TX link.
//!
//! While a slot executes the table is locked. Existing queues can still be
//! read and appended to; creating or removing neighbors is refused
//! (`QueueError::Locked`) and garbage collection is deferred to `unlock`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

use hashbrown::HashMap;

use crate::collections::Ring;
use crate::config::{ssq_handle_offset, MacConfig};
use crate::schedule::{Link, LinkObserver, LinkQueueDepth};
use crate::traits::Random;
use crate::types::{LinkAddr, LinkType, NodeId, QueueError, TxResult, COMMON_SF_HANDLE};
use crate::wire::Frame;

/// Invoked once with the final status and the number of transmissions.
pub type SentCallback = Box<dyn FnOnce(TxResult, u8)>;

/// An outgoing frame and its transmission state.
pub struct Packet {
    pub frame: Frame,
    pub transmissions: u8,
    /// Status of the last attempt.
    pub ret: Option<TxResult>,
    /// Slotframe this packet is pinned to, if any.
    pub slotframe_hint: Option<u16>,
    /// Timeslot this packet is pinned to, if any.
    pub timeslot_hint: Option<u16>,
    callback: Option<SentCallback>,
}

impl Packet {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            transmissions: 0,
            ret: None,
            slotframe_hint: None,
            timeslot_hint: None,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: impl FnOnce(TxResult, u8) + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn dest(&self) -> LinkAddr {
        self.frame.header.dst
    }

    /// Pin to a slotframe/timeslot.
    pub fn stamp(&mut self, slotframe: u16, timeslot: u16) {
        self.slotframe_hint = Some(slotframe);
        self.timeslot_hint = Some(timeslot);
    }

    /// Unpinned packets match any link; pinned ones only their own cell.
    pub fn matches_link(&self, link: &Link) -> bool {
        self.slotframe_hint.map_or(true, |sf| sf == link.slotframe_handle)
            && self.timeslot_hint.map_or(true, |ts| ts == link.timeslot)
    }

    /// Run the sent callback with the final status.
    pub fn complete(mut self) {
        let status = self.ret.unwrap_or(TxResult::FatalError);
        if let Some(callback) = self.callback.take() {
            callback(status, self.transmissions);
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("dst", &self.frame.header.dst)
            .field("seqno", &self.frame.header.seqno)
            .field("transmissions", &self.transmissions)
            .field("ret", &self.ret)
            .field("slotframe_hint", &self.slotframe_hint)
            .field("timeslot_hint", &self.timeslot_hint)
            .finish()
    }
}

/// A neighbor's queue and CSMA state.
pub struct Neighbor {
    pub addr: LinkAddr,
    pub id: NodeId,
    queue: Ring<Packet>,
    pub backoff_window: u16,
    pub backoff_exponent: u8,
    pub is_broadcast: bool,
    pub is_time_source: bool,
    pub tx_links_count: u16,
    pub dedicated_tx_links_count: u16,
    /// Backoff increments since creation.
    pub backoff_increments: u32,
}

impl Neighbor {
    fn new(addr: LinkAddr, capacity: usize, min_be: u8) -> Self {
        Self {
            addr,
            id: addr.node_id(),
            queue: Ring::with_capacity(capacity),
            backoff_window: 0,
            backoff_exponent: min_be,
            is_broadcast: addr.is_broadcast() || addr.is_eb(),
            is_time_source: false,
            tx_links_count: 0,
            dedicated_tx_links_count: 0,
            backoff_increments: 0,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn head(&self) -> Option<&Packet> {
        self.queue.peek()
    }

    pub fn head_mut(&mut self) -> Option<&mut Packet> {
        self.queue.peek_mut()
    }

    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.queue.iter()
    }

    fn is_collectable(&self) -> bool {
        !self.is_broadcast && !self.is_time_source && self.tx_links_count == 0 && self.is_empty()
    }
}

/// All neighbor queues plus the buffer of finished packets.
pub struct NeighborQueues<C> {
    neighbors: HashMap<LinkAddr, Neighbor>,
    dequeued: Ring<Packet>,
    locked: bool,
    gc_pending: bool,
    _config: PhantomData<C>,
}

impl<C: MacConfig> Default for NeighborQueues<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MacConfig> NeighborQueues<C> {
    pub fn new() -> Self {
        let mut neighbors = HashMap::with_capacity(C::MAX_NEIGHBORS + 2);
        for addr in [LinkAddr::EB, LinkAddr::BROADCAST] {
            neighbors.insert(addr, Neighbor::new(addr, C::QUEUE_CAPACITY, C::MIN_BE));
        }
        Self {
            neighbors,
            dequeued: Ring::with_capacity(C::DEQUEUED_CAPACITY),
            locked: false,
            gc_pending: false,
            _config: PhantomData,
        }
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Release the lock and run any deferred garbage collection.
    pub fn unlock(&mut self) {
        self.locked = false;
        if core::mem::take(&mut self.gc_pending) {
            self.free_unused_neighbors();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn get(&self, addr: &LinkAddr) -> Option<&Neighbor> {
        self.neighbors.get(addr)
    }

    pub fn get_mut(&mut self, addr: &LinkAddr) -> Option<&mut Neighbor> {
        self.neighbors.get_mut(addr)
    }

    pub fn by_id(&self, id: NodeId) -> Option<&Neighbor> {
        self.neighbors
            .values()
            .find(|n| !n.is_broadcast && n.id == id)
    }

    /// Neighbors other than the two sentinels.
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.values().filter(|n| !n.is_broadcast).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }

    /// Existing neighbor or a fresh one.
    pub fn add_or_get(&mut self, addr: LinkAddr) -> Result<&mut Neighbor, QueueError> {
        if !self.neighbors.contains_key(&addr) {
            if self.locked {
                return Err(QueueError::Locked);
            }
            if self.neighbor_count() >= C::MAX_NEIGHBORS {
                return Err(QueueError::Full);
            }
        }
        Ok(self.entry(addr))
    }

    fn entry(&mut self, addr: LinkAddr) -> &mut Neighbor {
        self.neighbors
            .entry(addr)
            .or_insert_with(|| Neighbor::new(addr, C::QUEUE_CAPACITY, C::MIN_BE))
    }

    /// Queue a packet towards its destination. Returns the new queue length.
    pub fn enqueue(&mut self, packet: Packet) -> Result<usize, QueueError> {
        let neighbor = self.add_or_get(packet.dest())?;
        neighbor.queue.push(packet).map_err(|_| QueueError::Full)?;
        Ok(neighbor.queue.len())
    }

    pub fn dequeue_head(&mut self, addr: &LinkAddr) -> Option<Packet> {
        let packet = self.neighbors.get_mut(addr)?.queue.pop();
        self.collect(addr);
        packet
    }

    pub fn is_empty(&self, addr: &LinkAddr) -> bool {
        self.neighbors.get(addr).map_or(true, |n| n.is_empty())
    }

    pub fn packet_count(&self, addr: &LinkAddr) -> usize {
        self.neighbors.get(addr).map_or(0, |n| n.queue_len())
    }

    /// Packets queued for `id`, used by the larger-queue tie-break.
    pub fn packet_count_by_id(&self, id: NodeId) -> usize {
        self.by_id(id).map_or(0, |n| n.queue_len())
    }

    /// Packets queued towards anyone, beacons included.
    pub fn global_packet_count(&self) -> usize {
        self.neighbors.values().map(|n| n.queue_len()).sum()
    }

    /// Hand a finished packet to the callback buffer.
    pub fn finish(&mut self, packet: Packet) {
        if let Err(packet) = self.dequeued.push(packet) {
            packet.complete();
        }
    }

    /// Drain finished packets.
    pub fn take_dequeued(&mut self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(self.dequeued.len());
        while let Some(p) = self.dequeued.pop() {
            out.push(p);
        }
        out
    }

    /// Drop every packet queued for `addr`; callbacks see `FatalError`.
    pub fn flush(&mut self, addr: &LinkAddr) -> usize {
        let mut dropped = Vec::new();
        if let Some(n) = self.neighbors.get_mut(addr) {
            while let Some(mut p) = n.queue.pop() {
                p.ret = Some(TxResult::FatalError);
                dropped.push(p);
            }
        }
        let count = dropped.len();
        for p in dropped {
            self.finish(p);
        }
        self.collect(addr);
        count
    }

    /// Flush every queue, beacons included.
    pub fn flush_all(&mut self) -> usize {
        let addrs: Vec<LinkAddr> = self.neighbors.keys().copied().collect();
        addrs.iter().map(|a| self.flush(a)).sum()
    }

    pub fn backoff_reset(&mut self, addr: &LinkAddr) {
        if let Some(n) = self.neighbors.get_mut(addr) {
            n.backoff_window = 0;
            n.backoff_exponent = C::MIN_BE;
        }
    }

    /// Draw a new window from the current exponent, then raise the exponent.
    ///
    /// The window is one larger than drawn: it is decremented at the end of
    /// the slot that caused the increment.
    pub fn backoff_increment(&mut self, addr: &LinkAddr, random: &mut impl Random) -> Option<(u8, u16)> {
        let n = self.neighbors.get_mut(addr)?;
        let window = 1u64 << n.backoff_exponent;
        n.backoff_window = random.gen_range(0, window) as u16 + 1;
        n.backoff_exponent = (n.backoff_exponent + 1).min(C::MAX_BE);
        n.backoff_increments += 1;
        Some((n.backoff_exponent, n.backoff_window))
    }

    /// Decrement backoff windows after a shared slot towards `dest`.
    ///
    /// A broadcast-addressed slot counts for neighbors without dedicated TX
    /// links; a unicast one only for the neighbor it targets.
    pub fn decrement_backoff_windows(&mut self, dest: &LinkAddr) {
        let broadcast = dest.is_broadcast();
        for n in self.neighbors.values_mut() {
            let eligible = if broadcast {
                n.dedicated_tx_links_count == 0
            } else {
                n.tx_links_count > 0 && n.addr == *dest
            };
            if n.backoff_window != 0 && eligible {
                n.backoff_window -= 1;
            }
        }
    }

    /// Neighbor whose head packet should go out on `link`.
    pub fn select_for_link(&self, link: &Link) -> Option<LinkAddr> {
        if !link.options.is_tx() {
            return None;
        }
        let ssq = ssq_handle_offset::<C>();
        if link.slotframe_handle > ssq {
            // Matching-slot reservation: only the reserved peer, pinning ignored.
            let id = (link.slotframe_handle - ssq - 1) / 2;
            return self.by_id(id).filter(|n| !n.is_empty()).map(|n| n.addr);
        }
        if link.is_advertising() {
            if !self.is_empty(&LinkAddr::EB) {
                return Some(LinkAddr::EB);
            }
            if link.link_type == LinkType::AdvertisingOnly {
                return None;
            }
        }
        if link.addr.is_broadcast() {
            let ready = self
                .neighbors
                .get(&LinkAddr::BROADCAST)
                .and_then(|n| n.head())
                .map_or(false, |p| p.matches_link(link));
            if ready {
                return Some(LinkAddr::BROADCAST);
            }
            return self.unicast_packet_for_any(link);
        }
        let n = self.neighbors.get(&link.addr)?;
        let ready = n.head().map_or(false, |p| p.matches_link(link))
            && (!link.options.is_shared() || n.backoff_window == 0);
        ready.then_some(link.addr)
    }

    /// A unicast packet for any neighbor without dedicated TX links, the
    /// same neighbors `decrement_backoff_windows` counts down on broadcast
    /// slots.
    ///
    /// Ties go to the lowest node id.
    pub fn unicast_packet_for_any(&self, link: &Link) -> Option<LinkAddr> {
        self.neighbors
            .values()
            .filter(|n| !n.is_broadcast && n.dedicated_tx_links_count == 0)
            .filter(|n| {
                n.head().map_or(false, |p| {
                    p.matches_link(link) && (!link.options.is_shared() || n.backoff_window == 0)
                })
            })
            .min_by_key(|n| n.id)
            .map(|n| n.addr)
    }

    /// Move the time-source flag. Returns whether it changed.
    pub fn update_time_source(&mut self, new: Option<LinkAddr>) -> Result<bool, QueueError> {
        let old = self.time_source();
        if old == new {
            return Ok(false);
        }
        if let Some(addr) = new {
            self.add_or_get(addr)?.is_time_source = true;
        }
        if let Some(addr) = old {
            if let Some(n) = self.neighbors.get_mut(&addr) {
                n.is_time_source = false;
            }
            self.collect(&addr);
        }
        Ok(true)
    }

    pub fn time_source(&self) -> Option<LinkAddr> {
        self.neighbors
            .values()
            .find(|n| n.is_time_source)
            .map(|n| n.addr)
    }

    /// Pin queued packets for `addr` to a cell. Returns how many changed.
    pub fn restamp_queue(
        &mut self,
        addr: &LinkAddr,
        slotframe: u16,
        timeslot: u16,
        only_first: bool,
    ) -> usize {
        let Some(n) = self.neighbors.get_mut(addr) else {
            return 0;
        };
        let mut count = 0;
        n.queue.for_each_mut(|p| {
            if !only_first || count == 0 {
                p.stamp(slotframe, timeslot);
                count += 1;
            }
        });
        count
    }

    /// Rewrite the piggybacked exponent request of queued frames for `addr`.
    pub fn set_queue_n_request(&mut self, addr: &LinkAddr, n: u16) -> usize {
        let Some(nbr) = self.neighbors.get_mut(addr) else {
            return 0;
        };
        let mut count = 0;
        nbr.queue.for_each_mut(|p| {
            p.frame.header.pigg1 = n;
            count += 1;
        });
        count
    }

    /// Remove every idle neighbor. Returns how many were removed.
    pub fn free_unused_neighbors(&mut self) -> usize {
        if self.locked {
            self.gc_pending = true;
            return 0;
        }
        let before = self.neighbors.len();
        self.neighbors.retain(|_, n| !n.is_collectable());
        before - self.neighbors.len()
    }

    fn collect(&mut self, addr: &LinkAddr) {
        let idle = self.neighbors.get(addr).map_or(false, |n| n.is_collectable());
        if !idle {
            return;
        }
        if self.locked {
            self.gc_pending = true;
        } else {
            self.neighbors.remove(addr);
        }
    }
}

impl<C: MacConfig> LinkQueueDepth for NeighborQueues<C> {
    /// Packets waiting behind a link: the peer encoded in a negotiated TX
    /// handle, otherwise the link's own address.
    fn queue_len(&self, link: &Link) -> usize {
        let h = link.slotframe_handle;
        if h > COMMON_SF_HANDLE && h <= ssq_handle_offset::<C>() && h % 2 == 1 {
            self.packet_count_by_id((h - 1) / 2)
        } else {
            self.packet_count(&link.addr)
        }
    }
}

impl<C: MacConfig> LinkObserver for NeighborQueues<C> {
    fn link_added(&mut self, link: &Link) {
        if !link.options.is_tx() {
            return;
        }
        // Link bookkeeping is never refused: the capacity bound only applies
        // to neighbors created by enqueueing.
        let n = self.entry(link.addr);
        n.tx_links_count += 1;
        if !link.options.is_shared() {
            n.dedicated_tx_links_count += 1;
        }
    }

    fn link_removed(&mut self, link: &Link) {
        if !link.options.is_tx() {
            return;
        }
        if let Some(n) = self.neighbors.get_mut(&link.addr) {
            debug_assert!(n.tx_links_count > 0);
            n.tx_links_count = n.tx_links_count.saturating_sub(1);
            if !link.options.is_shared() {
                n.dedicated_tx_links_count = n.dedicated_tx_links_count.saturating_sub(1);
            }
        }
        self.collect(&link.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    use crate::config::{DefaultConfig, SmallConfig};
    use crate::schedule::Schedule;
    use crate::traits::test_impls::MockRandom;
    use crate::types::LinkOptions;
    use crate::wire::FrameHeader;

    type Queues = NeighborQueues<DefaultConfig>;

    fn me() -> LinkAddr {
        LinkAddr::from_node_id(1)
    }

    fn peer(id: u16) -> LinkAddr {
        LinkAddr::from_node_id(id)
    }

    fn packet_to(dst: LinkAddr) -> Packet {
        Packet::new(Frame {
            header: FrameHeader::data(me(), dst),
            payload: vec![1, 2, 3],
        })
    }

    fn link(sf: u16, ts: u16, opts: LinkOptions, addr: LinkAddr) -> Link {
        Link {
            handle: 0,
            slotframe_handle: sf,
            timeslot: ts,
            channel_offset: 0,
            options: opts,
            link_type: LinkType::Normal,
            addr,
        }
    }

    #[test]
    fn test_sentinels_always_exist() {
        let mut q = Queues::new();
        assert!(q.get(&LinkAddr::EB).is_some());
        assert!(q.get(&LinkAddr::BROADCAST).is_some());
        assert_eq!(q.free_unused_neighbors(), 0);
        assert_eq!(q.neighbor_count(), 0);
    }

    #[test]
    fn test_enqueue_creates_and_dequeue_collects() {
        let mut q = Queues::new();
        assert_eq!(q.enqueue(packet_to(peer(2))).unwrap(), 1);
        assert_eq!(q.enqueue(packet_to(peer(2))).unwrap(), 2);
        assert_eq!(q.packet_count(&peer(2)), 2);
        assert!(q.dequeue_head(&peer(2)).is_some());
        assert!(q.get(&peer(2)).is_some());
        assert!(q.dequeue_head(&peer(2)).is_some());
        assert!(q.get(&peer(2)).is_none());
    }

    #[test]
    fn test_queue_full() {
        let mut q = NeighborQueues::<SmallConfig>::new();
        for _ in 0..SmallConfig::QUEUE_CAPACITY {
            q.enqueue(packet_to(peer(2))).unwrap();
        }
        assert_eq!(q.enqueue(packet_to(peer(2))).unwrap_err(), QueueError::Full);
    }

    #[test]
    fn test_neighbor_table_full() {
        let mut q = NeighborQueues::<SmallConfig>::new();
        for id in 0..SmallConfig::MAX_NEIGHBORS as u16 {
            q.enqueue(packet_to(peer(10 + id))).unwrap();
        }
        assert_eq!(q.enqueue(packet_to(peer(99))).unwrap_err(), QueueError::Full);
        // existing neighbors still accept packets
        q.enqueue(packet_to(peer(10))).unwrap();
    }

    #[test]
    fn test_locked_table_refuses_new_neighbors() {
        let mut q = Queues::new();
        q.enqueue(packet_to(peer(2))).unwrap();
        q.lock();
        assert_eq!(q.enqueue(packet_to(peer(3))).unwrap_err(), QueueError::Locked);
        q.enqueue(packet_to(peer(2))).unwrap();

        // collection is deferred until unlock
        q.dequeue_head(&peer(2));
        q.dequeue_head(&peer(2));
        assert!(q.get(&peer(2)).is_some());
        q.unlock();
        assert!(q.get(&peer(2)).is_none());
    }

    #[test]
    fn test_flush_reports_fatal_error() {
        let mut q = Queues::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let seen = seen.clone();
            q.enqueue(packet_to(peer(2)).with_callback(move |status, tx| {
                seen.borrow_mut().push((status, tx));
            }))
            .unwrap();
        }
        assert_eq!(q.flush(&peer(2)), 3);
        assert!(q.get(&peer(2)).is_none());

        for p in q.take_dequeued() {
            p.complete();
        }
        assert_eq!(*seen.borrow(), vec![(TxResult::FatalError, 0); 3]);
    }

    #[test]
    fn test_backoff_increment_capped() {
        let mut q = Queues::new();
        let mut rng = MockRandom::new();
        q.enqueue(packet_to(peer(2))).unwrap();
        for _ in 0..8 {
            let (_, window) = q.backoff_increment(&peer(2), &mut rng).unwrap();
            assert!(window >= 1);
        }
        let n = q.get(&peer(2)).unwrap();
        assert_eq!(n.backoff_exponent, DefaultConfig::MAX_BE);
        assert_eq!(n.backoff_increments, 8);
        assert!(n.backoff_window <= 1 << DefaultConfig::MAX_BE);

        q.backoff_reset(&peer(2));
        let n = q.get(&peer(2)).unwrap();
        assert_eq!(n.backoff_exponent, DefaultConfig::MIN_BE);
        assert_eq!(n.backoff_window, 0);
    }

    #[test]
    fn test_backoff_decrement_filters() {
        let mut q = Queues::new();
        q.enqueue(packet_to(peer(2))).unwrap();
        q.enqueue(packet_to(peer(3))).unwrap();
        q.get_mut(&peer(2)).unwrap().backoff_window = 3;
        q.get_mut(&peer(3)).unwrap().backoff_window = 3;
        q.get_mut(&peer(3)).unwrap().tx_links_count = 1;
        q.get_mut(&peer(3)).unwrap().dedicated_tx_links_count = 1;

        // broadcast slot: only neighbors without dedicated links
        q.decrement_backoff_windows(&LinkAddr::BROADCAST);
        assert_eq!(q.get(&peer(2)).unwrap().backoff_window, 2);
        assert_eq!(q.get(&peer(3)).unwrap().backoff_window, 3);

        // unicast slot to 3
        q.decrement_backoff_windows(&peer(3));
        assert_eq!(q.get(&peer(2)).unwrap().backoff_window, 2);
        assert_eq!(q.get(&peer(3)).unwrap().backoff_window, 2);
    }

    #[test]
    fn test_shared_only_neighbor_uses_broadcast_slots() {
        let mut q = Queues::new();
        let shared = link(1, 4, LinkOptions::TX | LinkOptions::SHARED, peer(2));
        let dedicated = link(5, 0, LinkOptions::TX, peer(3));
        q.link_added(&shared);
        q.link_added(&dedicated);
        q.enqueue(packet_to(peer(2))).unwrap();
        q.enqueue(packet_to(peer(3))).unwrap();
        q.get_mut(&peer(2)).unwrap().backoff_window = 1;
        q.get_mut(&peer(3)).unwrap().backoff_window = 1;

        let common = link(2, 0, LinkOptions::TX | LinkOptions::SHARED, LinkAddr::BROADCAST);
        assert_eq!(q.unicast_packet_for_any(&common), None);

        q.decrement_backoff_windows(&LinkAddr::BROADCAST);
        assert_eq!(q.get(&peer(2)).unwrap().backoff_window, 0);
        assert_eq!(q.get(&peer(3)).unwrap().backoff_window, 1);
        // Counted down on the slot and allowed to use it
        assert_eq!(q.unicast_packet_for_any(&common), Some(peer(2)));

        q.get_mut(&peer(3)).unwrap().backoff_window = 0;
        assert_eq!(q.select_for_link(&common), Some(peer(2)));
    }

    #[test]
    fn test_select_respects_hints_and_backoff() {
        let mut q = Queues::new();
        let mut p = packet_to(peer(2));
        p.stamp(1, 5);
        q.enqueue(p).unwrap();

        let shared = link(1, 5, LinkOptions::TX | LinkOptions::SHARED, LinkAddr::BROADCAST);
        let other = link(1, 6, LinkOptions::TX | LinkOptions::SHARED, LinkAddr::BROADCAST);
        assert_eq!(q.select_for_link(&shared), Some(peer(2)));
        assert_eq!(q.select_for_link(&other), None);

        q.get_mut(&peer(2)).unwrap().backoff_window = 2;
        assert_eq!(q.select_for_link(&shared), None);
    }

    #[test]
    fn test_broadcast_queue_first_on_broadcast_link() {
        let mut q = Queues::new();
        q.enqueue(packet_to(peer(2))).unwrap();
        q.enqueue(packet_to(LinkAddr::BROADCAST)).unwrap();
        let common = link(
            2,
            0,
            LinkOptions::TX | LinkOptions::RX | LinkOptions::SHARED,
            LinkAddr::BROADCAST,
        );
        assert_eq!(q.select_for_link(&common), Some(LinkAddr::BROADCAST));
        q.dequeue_head(&LinkAddr::BROADCAST);
        assert_eq!(q.select_for_link(&common), Some(peer(2)));
    }

    #[test]
    fn test_select_on_matching_slot_needs_target() {
        let mut q = Queues::new();
        q.enqueue(packet_to(peer(2))).unwrap();
        q.enqueue(packet_to(peer(3))).unwrap();
        let ssq = ssq_handle_offset::<DefaultConfig>();
        let to_three = link(ssq + 2 * 3 + 1, 0, LinkOptions::TX, LinkAddr::BROADCAST);
        assert_eq!(q.select_for_link(&to_three), Some(peer(3)));
        let to_five = link(ssq + 2 * 5 + 1, 0, LinkOptions::TX, LinkAddr::BROADCAST);
        assert_eq!(q.select_for_link(&to_five), None);
    }

    #[test]
    fn test_matching_slot_ignores_dedicated_links_and_pinning() {
        let mut q = Queues::new();
        let mut p = packet_to(peer(3));
        p.stamp(7, 4);
        q.enqueue(p).unwrap();
        let dedicated = link(7, 4, LinkOptions::TX, peer(3));
        q.link_added(&dedicated);
        let ssq = ssq_handle_offset::<DefaultConfig>();
        let matching = link(ssq + 7, 0, LinkOptions::TX, LinkAddr::BROADCAST);
        assert_eq!(q.select_for_link(&matching), Some(peer(3)));
    }

    #[test]
    fn test_queue_depth_behind_dedicated_link() {
        let mut q = Queues::new();
        q.enqueue(packet_to(peer(3))).unwrap();
        q.enqueue(packet_to(peer(3))).unwrap();
        q.enqueue(packet_to(peer(4))).unwrap();
        let to_three = link(7, 0, LinkOptions::TX, LinkAddr::BROADCAST);
        let to_four = link(9, 1, LinkOptions::TX, LinkAddr::BROADCAST);
        assert_eq!(q.queue_len(&to_three), 2);
        assert_eq!(q.queue_len(&to_four), 1);
        let common = link(2, 0, LinkOptions::TX, LinkAddr::BROADCAST);
        assert_eq!(q.queue_len(&common), 0);
    }

    #[test]
    fn test_rx_only_link_selects_nothing() {
        let mut q = Queues::new();
        q.enqueue(packet_to(peer(2))).unwrap();
        let rx = link(2, 0, LinkOptions::RX, LinkAddr::BROADCAST);
        assert_eq!(q.select_for_link(&rx), None);
    }

    #[test]
    fn test_eb_on_advertising_link() {
        let mut q = Queues::new();
        let eb = Packet::new(Frame {
            header: FrameHeader::beacon(me()),
            payload: vec![],
        });
        q.enqueue(eb).unwrap();
        let mut adv = link(0, 0, LinkOptions::TX, LinkAddr::EB);
        adv.link_type = LinkType::AdvertisingOnly;
        assert_eq!(q.select_for_link(&adv), Some(LinkAddr::EB));
        q.dequeue_head(&LinkAddr::EB);
        assert_eq!(q.select_for_link(&adv), None);
    }

    #[test]
    fn test_link_observer_counts_and_collects() {
        let mut q = Queues::new();
        let mut s = Schedule::new();
        s.add_slotframe(4, 8).unwrap();
        s.add_link(&mut q, 4, LinkOptions::TX, LinkType::Normal, peer(2), 1, 0)
            .unwrap();
        s.add_link(
            &mut q,
            4,
            LinkOptions::TX | LinkOptions::SHARED,
            LinkType::Normal,
            peer(2),
            2,
            0,
        )
        .unwrap();
        let n = q.get(&peer(2)).unwrap();
        assert_eq!((n.tx_links_count, n.dedicated_tx_links_count), (2, 1));
        assert!(n.dedicated_tx_links_count <= n.tx_links_count);

        s.remove_slotframe(&mut q, 4).unwrap();
        assert!(q.get(&peer(2)).is_none());
    }

    #[test]
    fn test_time_source_pins_neighbor() {
        let mut q = Queues::new();
        assert!(q.update_time_source(Some(peer(2))).unwrap());
        assert!(!q.update_time_source(Some(peer(2))).unwrap());
        assert_eq!(q.free_unused_neighbors(), 0);
        assert_eq!(q.time_source(), Some(peer(2)));

        assert!(q.update_time_source(Some(peer(3))).unwrap());
        assert!(q.get(&peer(2)).is_none());
        assert_eq!(q.time_source(), Some(peer(3)));
    }

    #[test]
    fn test_restamp_and_n_request() {
        let mut q = Queues::new();
        for _ in 0..3 {
            q.enqueue(packet_to(peer(2))).unwrap();
        }
        assert_eq!(q.restamp_queue(&peer(2), 5, 3, true), 1);
        assert_eq!(q.restamp_queue(&peer(2), 7, 1, false), 3);
        assert!(q
            .get(&peer(2))
            .unwrap()
            .packets()
            .all(|p| p.slotframe_hint == Some(7) && p.timeslot_hint == Some(1)));

        assert_eq!(q.set_queue_n_request(&peer(2), 104), 3);
        assert!(q
            .get(&peer(2))
            .unwrap()
            .packets()
            .all(|p| p.frame.header.pigg1 == 104));
    }
}
