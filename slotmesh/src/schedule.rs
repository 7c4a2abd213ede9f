//! Slotframes, links and the next-active-link query.
//!
//! A `Schedule` is an ordered set of slotframes keyed by handle; each slotframe
//! holds at most one link per timeslot. Every structural change goes through
//! a `LinkObserver` so that per-neighbor TX link counters stay exact: the
//! neighbor queues implement it, tests that don't care pass `&mut ()`.
//!
//! # Next active link
//!
//! `next_active_link` scans every slotframe for the link whose timeslot comes
//! up first strictly after the given ASN. Ties at the same offset are broken
//! by `MacConfig::TIE_BREAK_ORDER`; the best RX-capable loser of a tie is kept
//! as a backup so that a TX link with nothing to send can fall back to
//! listening. One-shot reservations override the result when strictly earlier
//! (or on ties, with `RESERVATION_WINS_TIES`).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config::{ssq_handle_offset, MacConfig, TieBreakRule};
use crate::matching::Reservations;
use crate::time::Asn;
use crate::types::{
    LinkAddr, LinkOptions, LinkType, ScheduleError, COMMON_SF_HANDLE, EB_SF_HANDLE,
    UNICAST_SF_HANDLE,
};

/// A scheduled cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Monotonic id assigned at install time.
    pub handle: u16,
    pub slotframe_handle: u16,
    pub timeslot: u16,
    pub channel_offset: u16,
    pub options: LinkOptions,
    pub link_type: LinkType,
    pub addr: LinkAddr,
}

impl Link {
    /// Scheduled for enhanced-beacon transmission.
    pub fn is_advertising(&self) -> bool {
        self.options.is_tx() && self.link_type != LinkType::Normal
    }
}

/// A repeating ring of `size` timeslots.
#[derive(Debug, Clone)]
pub struct Slotframe {
    handle: u16,
    size: u16,
    links: BTreeMap<u16, Link>,
}

impl Slotframe {
    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn link_at(&self, timeslot: u16) -> Option<&Link> {
        self.links.get(&timeslot)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// First link strictly after `asn`, with its distance in slots (1..=size).
    fn next_link_after(&self, asn: Asn) -> Option<(&Link, u64)> {
        let current = asn.modulo(self.size);
        let (timeslot, link) = self
            .links
            .range(current + 1..)
            .next()
            .or_else(|| self.links.iter().next())?;
        let offset = if *timeslot > current {
            timeslot - current
        } else {
            self.size - current + timeslot
        };
        Some((link, offset as u64))
    }
}

/// Told about every link entering or leaving the schedule.
pub trait LinkObserver {
    fn link_added(&mut self, link: &Link);
    fn link_removed(&mut self, link: &Link);
}

impl LinkObserver for () {
    fn link_added(&mut self, _link: &Link) {}
    fn link_removed(&mut self, _link: &Link) {}
}

/// Queue depth behind a dedicated TX link, for the larger-queue tie-break.
pub trait LinkQueueDepth {
    fn queue_len(&self, link: &Link) -> usize;
}

impl LinkQueueDepth for () {
    fn queue_len(&self, _link: &Link) -> usize {
        0
    }
}

/// Result of the next-active-link query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextActive {
    pub link: Link,
    /// Slots from the queried ASN to the link (at least 1).
    pub offset: u64,
    /// Best RX-capable link that lost a tie at the same offset.
    pub backup: Option<Link>,
}

/// The set of installed slotframes.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    slotframes: BTreeMap<u16, Slotframe>,
    next_link_handle: u16,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slotframe(&mut self, handle: u16, size: u16) -> Result<&Slotframe, ScheduleError> {
        if size == 0 {
            return Err(ScheduleError::ZeroSize);
        }
        if self.slotframes.contains_key(&handle) {
            return Err(ScheduleError::AlreadyExists);
        }
        let sf = self.slotframes.entry(handle).or_insert(Slotframe {
            handle,
            size,
            links: BTreeMap::new(),
        });
        Ok(sf)
    }

    /// Remove a slotframe and all its links.
    pub fn remove_slotframe(
        &mut self,
        observer: &mut impl LinkObserver,
        handle: u16,
    ) -> Result<(), ScheduleError> {
        let sf = self
            .slotframes
            .remove(&handle)
            .ok_or(ScheduleError::NotFound)?;
        for link in sf.links.values() {
            observer.link_removed(link);
        }
        Ok(())
    }

    /// Install a link, replacing any link already at that timeslot.
    pub fn add_link(
        &mut self,
        observer: &mut impl LinkObserver,
        slotframe: u16,
        options: LinkOptions,
        link_type: LinkType,
        addr: LinkAddr,
        timeslot: u16,
        channel_offset: u16,
    ) -> Result<Link, ScheduleError> {
        let handle = self.next_link_handle;
        let sf = self
            .slotframes
            .get_mut(&slotframe)
            .ok_or(ScheduleError::NotFound)?;
        if timeslot >= sf.size {
            return Err(ScheduleError::TimeslotOutOfRange);
        }
        let link = Link {
            handle,
            slotframe_handle: slotframe,
            timeslot,
            channel_offset,
            options,
            link_type,
            addr,
        };
        if let Some(old) = sf.links.insert(timeslot, link) {
            observer.link_removed(&old);
        }
        observer.link_added(&link);
        self.next_link_handle = self.next_link_handle.wrapping_add(1);
        Ok(link)
    }

    pub fn remove_link(
        &mut self,
        observer: &mut impl LinkObserver,
        slotframe: u16,
        link_handle: u16,
    ) -> Result<Link, ScheduleError> {
        let sf = self
            .slotframes
            .get_mut(&slotframe)
            .ok_or(ScheduleError::NotFound)?;
        let timeslot = sf
            .links
            .values()
            .find(|l| l.handle == link_handle)
            .map(|l| l.timeslot)
            .ok_or(ScheduleError::NotFound)?;
        self.remove_link_by_timeslot(observer, slotframe, timeslot)
    }

    pub fn remove_link_by_timeslot(
        &mut self,
        observer: &mut impl LinkObserver,
        slotframe: u16,
        timeslot: u16,
    ) -> Result<Link, ScheduleError> {
        let sf = self
            .slotframes
            .get_mut(&slotframe)
            .ok_or(ScheduleError::NotFound)?;
        let link = sf.links.remove(&timeslot).ok_or(ScheduleError::NotFound)?;
        observer.link_removed(&link);
        Ok(link)
    }

    /// Move a slotframe and its links to a new handle.
    pub fn change_slotframe_handle(&mut self, old: u16, new: u16) -> Result<(), ScheduleError> {
        if self.slotframes.contains_key(&new) {
            return Err(ScheduleError::AlreadyExists);
        }
        let mut sf = self.slotframes.remove(&old).ok_or(ScheduleError::NotFound)?;
        sf.handle = new;
        for link in sf.links.values_mut() {
            link.slotframe_handle = new;
        }
        self.slotframes.insert(new, sf);
        Ok(())
    }

    /// Remove everything.
    pub fn clear(&mut self, observer: &mut impl LinkObserver) {
        for sf in core::mem::take(&mut self.slotframes).into_values() {
            for link in sf.links.values() {
                observer.link_removed(link);
            }
        }
    }

    /// One slotframe of `length` slots with a single advertising cell at 0.
    pub fn create_minimal(
        &mut self,
        observer: &mut impl LinkObserver,
        length: u16,
    ) -> Result<Link, ScheduleError> {
        self.add_slotframe(EB_SF_HANDLE, length)?;
        self.add_link(
            observer,
            EB_SF_HANDLE,
            LinkOptions::TX | LinkOptions::RX | LinkOptions::SHARED | LinkOptions::TIME_KEEPING,
            LinkType::Advertising,
            LinkAddr::BROADCAST,
            0,
            0,
        )
    }

    pub fn slotframe(&self, handle: u16) -> Option<&Slotframe> {
        self.slotframes.get(&handle)
    }

    pub fn slotframes(&self) -> impl Iterator<Item = &Slotframe> {
        self.slotframes.values()
    }

    pub fn link(&self, slotframe: u16, link_handle: u16) -> Option<&Link> {
        self.slotframes
            .get(&slotframe)?
            .links
            .values()
            .find(|l| l.handle == link_handle)
    }

    pub fn link_by_timeslot(&self, slotframe: u16, timeslot: u16) -> Option<&Link> {
        self.slotframes.get(&slotframe)?.links.get(&timeslot)
    }

    pub fn slotframe_count(&self) -> usize {
        self.slotframes.len()
    }

    pub fn link_count(&self) -> usize {
        self.slotframes.values().map(|sf| sf.links.len()).sum()
    }

    /// All installed links.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.slotframes.values().flat_map(|sf| sf.links.values())
    }

    /// Links active exactly at `asn`.
    pub fn links_at(&self, asn: Asn) -> Vec<Link> {
        self.slotframes
            .values()
            .filter_map(|sf| sf.links.get(&asn.modulo(sf.size)).copied())
            .collect()
    }

    /// Slots from `asn` to the first link satisfying `pred`, strictly after `asn`.
    pub fn next_offset_where(&self, asn: Asn, mut pred: impl FnMut(&Link) -> bool) -> Option<u64> {
        let mut best: Option<u64> = None;
        for sf in self.slotframes.values() {
            let current = asn.modulo(sf.size);
            for link in sf.links.values().filter(|l| pred(l)) {
                let offset = if link.timeslot > current {
                    link.timeslot - current
                } else {
                    sf.size - current + link.timeslot
                } as u64;
                best = Some(best.map_or(offset, |b| b.min(offset)));
            }
        }
        best
    }

    /// Occupancy of the next `horizon` slots: bit `i` is set iff some link or
    /// reservation lies `i + 1` slots after `asn`.
    pub fn subsequent_occupancy(&self, asn: Asn, reservations: &Reservations, horizon: u16) -> u16 {
        let mut bitmap = 0u16;
        for i in 0..horizon.min(16) {
            let target = asn.plus(i as u64 + 1);
            let busy = reservations.is_reserved(target)
                || self
                    .slotframes
                    .values()
                    .any(|sf| sf.links.contains_key(&target.modulo(sf.size)));
            if busy {
                bitmap |= 1 << i;
            }
        }
        bitmap
    }

    /// First link strictly after `asn`, with tie-break and backup.
    pub fn next_active_link<C: MacConfig>(
        &self,
        asn: Asn,
        depth: &impl LinkQueueDepth,
        reservations: &Reservations,
    ) -> Option<NextActive> {
        let mut best: Option<NextActive> = None;

        for sf in self.slotframes.values() {
            let Some((link, offset)) = sf.next_link_after(asn) else {
                continue;
            };
            match best.as_mut() {
                None => {
                    best = Some(NextActive {
                        link: *link,
                        offset,
                        backup: None,
                    })
                }
                Some(cur) if offset < cur.offset => {
                    *cur = NextActive {
                        link: *link,
                        offset,
                        backup: None,
                    };
                }
                Some(cur) if offset == cur.offset => {
                    let loser = if wins_tie::<C>(link, &cur.link, depth) {
                        core::mem::replace(&mut cur.link, *link)
                    } else {
                        *link
                    };
                    if loser.options.is_rx() {
                        let better = cur
                            .backup
                            .map_or(true, |b| loser.slotframe_handle < b.slotframe_handle);
                        if better {
                            cur.backup = Some(loser);
                        }
                    }
                }
                Some(_) => {}
            }
        }

        if let Some(r) = reservations.earliest_after(asn) {
            let offset = r.asn.diff(asn);
            let overrides = match &best {
                None => true,
                Some(cur) if C::RESERVATION_WINS_TIES => offset <= cur.offset,
                Some(cur) => offset < cur.offset,
            };
            if overrides {
                best = Some(NextActive {
                    link: r.link,
                    offset,
                    backup: None,
                });
            }
        }

        best
    }
}

/// Negotiated or per-neighbor dedicated TX link.
fn is_dedicated_tx<C: MacConfig>(link: &Link) -> bool {
    link.slotframe_handle > COMMON_SF_HANDLE
        && link.slotframe_handle <= ssq_handle_offset::<C>()
        && link.options.is_tx()
        && !link.options.is_rx()
}

/// Whether `candidate` beats `current` when both fall on the same slot.
fn wins_tie<C: MacConfig>(candidate: &Link, current: &Link, depth: &impl LinkQueueDepth) -> bool {
    for rule in C::TIE_BREAK_ORDER {
        match rule {
            TieBreakRule::Advertising => {
                let (a, b) = (candidate.is_advertising(), current.is_advertising());
                if a != b {
                    return a;
                }
            }
            TieBreakRule::TxOverRx => {
                let (a, b) = (candidate.options.is_tx(), current.options.is_tx());
                if a != b {
                    return a;
                }
            }
            TieBreakRule::BroadcastOverAutonomousUnicast => {
                let common_over_unicast = |x: &Link, y: &Link| {
                    x.slotframe_handle == COMMON_SF_HANDLE
                        && y.slotframe_handle == UNICAST_SF_HANDLE
                        && y.options.is_tx()
                };
                if common_over_unicast(candidate, current) {
                    return true;
                }
                if common_over_unicast(current, candidate) {
                    return false;
                }
            }
            TieBreakRule::LargerDedicatedQueue => {
                if is_dedicated_tx::<C>(candidate) && is_dedicated_tx::<C>(current) {
                    let (a, b) = (depth.queue_len(candidate), depth.queue_len(current));
                    if a != b {
                        return a > b;
                    }
                }
            }
            TieBreakRule::LowerHandle => {
                if candidate.slotframe_handle != current.slotframe_handle {
                    return candidate.slotframe_handle < current.slotframe_handle;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use hashbrown::HashMap;

    const TX: LinkOptions = LinkOptions::TX;
    const RX: LinkOptions = LinkOptions::RX;
    const SHARED: LinkOptions = LinkOptions::SHARED;

    fn peer(id: u16) -> LinkAddr {
        LinkAddr::from_node_id(id)
    }

    /// Counts TX links per address.
    #[derive(Default)]
    struct Counter {
        tx: HashMap<LinkAddr, i32>,
    }

    impl LinkObserver for Counter {
        fn link_added(&mut self, link: &Link) {
            if link.options.is_tx() {
                *self.tx.entry(link.addr).or_default() += 1;
            }
        }
        fn link_removed(&mut self, link: &Link) {
            if link.options.is_tx() {
                *self.tx.entry(link.addr).or_default() -= 1;
            }
        }
    }

    struct Depths(HashMap<u16, usize>);

    impl LinkQueueDepth for Depths {
        fn queue_len(&self, link: &Link) -> usize {
            self.0.get(&link.slotframe_handle).copied().unwrap_or(0)
        }
    }

    fn next(s: &Schedule, asn: u64) -> Option<NextActive> {
        s.next_active_link::<DefaultConfig>(Asn::new(asn), &(), &Reservations::new(4))
    }

    fn add(s: &mut Schedule, sf: u16, opts: LinkOptions, ts: u16) -> Link {
        s.add_link(&mut (), sf, opts, LinkType::Normal, LinkAddr::BROADCAST, ts, 0)
            .unwrap()
    }

    #[test]
    fn test_add_slotframe_errors() {
        let mut s = Schedule::new();
        assert_eq!(s.add_slotframe(1, 0).unwrap_err(), ScheduleError::ZeroSize);
        s.add_slotframe(1, 7).unwrap();
        assert_eq!(s.add_slotframe(1, 5).unwrap_err(), ScheduleError::AlreadyExists);
        assert_eq!(s.slotframe(1).unwrap().size(), 7);
    }

    #[test]
    fn test_add_link_replaces_at_timeslot() {
        let mut s = Schedule::new();
        let mut obs = Counter::default();
        s.add_slotframe(1, 7).unwrap();
        s.add_link(&mut obs, 1, TX, LinkType::Normal, peer(2), 3, 1)
            .unwrap();
        s.add_link(&mut obs, 1, TX, LinkType::Normal, peer(4), 3, 1)
            .unwrap();

        assert_eq!(s.link_count(), 1);
        assert_eq!(s.link_by_timeslot(1, 3).unwrap().addr, peer(4));
        assert_eq!(obs.tx[&peer(2)], 0);
        assert_eq!(obs.tx[&peer(4)], 1);
    }

    #[test]
    fn test_add_link_out_of_range() {
        let mut s = Schedule::new();
        s.add_slotframe(1, 7).unwrap();
        let err = s
            .add_link(&mut (), 1, TX, LinkType::Normal, peer(2), 7, 0)
            .unwrap_err();
        assert_eq!(err, ScheduleError::TimeslotOutOfRange);
        let err = s
            .add_link(&mut (), 9, TX, LinkType::Normal, peer(2), 0, 0)
            .unwrap_err();
        assert_eq!(err, ScheduleError::NotFound);
    }

    #[test]
    fn test_remove_slotframe_updates_counters() {
        let mut s = Schedule::new();
        let mut obs = Counter::default();
        s.add_slotframe(5, 8).unwrap();
        for ts in 0..3 {
            s.add_link(&mut obs, 5, TX, LinkType::Normal, peer(2), ts, 3)
                .unwrap();
        }
        assert_eq!(obs.tx[&peer(2)], 3);
        s.remove_slotframe(&mut obs, 5).unwrap();
        assert_eq!(obs.tx[&peer(2)], 0);
        assert_eq!(s.link_count(), 0);
    }

    #[test]
    fn test_removal_is_idempotent() {
        let mut s = Schedule::new();
        s.add_slotframe(1, 7).unwrap();
        assert_eq!(
            s.remove_link_by_timeslot(&mut (), 1, 4).unwrap_err(),
            ScheduleError::NotFound
        );
        s.remove_slotframe(&mut (), 1).unwrap();
        assert_eq!(
            s.remove_slotframe(&mut (), 1).unwrap_err(),
            ScheduleError::NotFound
        );
    }

    #[test]
    fn test_remove_link_by_handle() {
        let mut s = Schedule::new();
        s.add_slotframe(1, 7).unwrap();
        let link = add(&mut s, 1, TX, 2);
        add(&mut s, 1, RX, 4);
        assert_eq!(s.remove_link(&mut (), 1, link.handle).unwrap(), link);
        assert!(s.link(1, link.handle).is_none());
        assert_eq!(s.link_count(), 1);
    }

    #[test]
    fn test_change_slotframe_handle() {
        let mut s = Schedule::new();
        s.add_slotframe(1, 7).unwrap();
        add(&mut s, 1, RX, 2);
        s.change_slotframe_handle(1, 3).unwrap();
        assert!(s.slotframe(1).is_none());
        assert_eq!(s.link_by_timeslot(3, 2).unwrap().slotframe_handle, 3);

        s.add_slotframe(1, 5).unwrap();
        assert_eq!(
            s.change_slotframe_handle(1, 3).unwrap_err(),
            ScheduleError::AlreadyExists
        );
    }

    #[test]
    fn test_scenario_a_offset_to_shared_link() {
        let mut s = Schedule::new();
        s.add_slotframe(0, 3).unwrap();
        let link = add(&mut s, 0, TX | RX | SHARED, 0);

        let n = next(&s, 5).unwrap();
        assert_eq!(n.link, link);
        assert_eq!(n.offset, 1);
    }

    #[test]
    fn test_next_link_is_strictly_after() {
        let mut s = Schedule::new();
        s.add_slotframe(0, 3).unwrap();
        add(&mut s, 0, TX, 0);
        // asn 6 is timeslot 0 itself; the next occurrence is a full frame later
        assert_eq!(next(&s, 6).unwrap().offset, 3);
    }

    #[test]
    fn test_scenario_b_lower_handle_wins() {
        let mut s = Schedule::new();
        s.add_slotframe(4, 10).unwrap();
        s.add_slotframe(7, 10).unwrap();
        add(&mut s, 7, TX | SHARED, 3);
        add(&mut s, 4, TX | SHARED, 3);

        let n = next(&s, 0).unwrap();
        assert_eq!(n.link.slotframe_handle, 4);
        assert_eq!(n.offset, 3);
    }

    #[test]
    fn test_tie_advertising_beats_everything() {
        let mut s = Schedule::new();
        s.add_slotframe(0, 10).unwrap();
        s.add_slotframe(2, 10).unwrap();
        add(&mut s, 2, TX | RX | SHARED, 4);
        s.add_link(&mut (), 0, TX, LinkType::Advertising, LinkAddr::EB, 4, 0)
            .unwrap();

        let n = next(&s, 0).unwrap();
        assert_eq!(n.link.slotframe_handle, 0);
        assert_eq!(n.backup.unwrap().slotframe_handle, 2);
    }

    #[test]
    fn test_tie_tx_beats_rx_and_rx_is_backup() {
        let mut s = Schedule::new();
        s.add_slotframe(3, 8).unwrap();
        s.add_slotframe(4, 8).unwrap();
        add(&mut s, 3, RX, 5);
        add(&mut s, 4, TX, 5);

        let n = next(&s, 0).unwrap();
        assert_eq!(n.link.slotframe_handle, 4);
        assert_eq!(n.backup.unwrap().slotframe_handle, 3);
    }

    #[test]
    fn test_tie_common_beats_autonomous_unicast_tx() {
        let mut s = Schedule::new();
        s.add_slotframe(UNICAST_SF_HANDLE, 10).unwrap();
        s.add_slotframe(COMMON_SF_HANDLE, 10).unwrap();
        add(&mut s, UNICAST_SF_HANDLE, TX | SHARED, 6);
        add(&mut s, COMMON_SF_HANDLE, TX | RX | SHARED, 6);

        let n = next(&s, 0).unwrap();
        assert_eq!(n.link.slotframe_handle, COMMON_SF_HANDLE);
        // the unicast TX link is not RX-capable, so it is not a backup
        assert!(n.backup.is_none());
    }

    #[test]
    fn test_tie_larger_dedicated_queue_wins() {
        let mut s = Schedule::new();
        s.add_slotframe(3, 8).unwrap();
        s.add_slotframe(5, 8).unwrap();
        add(&mut s, 3, TX, 2);
        add(&mut s, 5, TX, 2);

        let depths = Depths([(3, 1), (5, 4)].into_iter().collect());
        let n = s
            .next_active_link::<DefaultConfig>(Asn::new(0), &depths, &Reservations::new(4))
            .unwrap();
        assert_eq!(n.link.slotframe_handle, 5);

        let depths = Depths([(3, 4), (5, 4)].into_iter().collect());
        let n = s
            .next_active_link::<DefaultConfig>(Asn::new(0), &depths, &Reservations::new(4))
            .unwrap();
        assert_eq!(n.link.slotframe_handle, 3);
    }

    #[test]
    fn test_backup_reset_by_earlier_link() {
        let mut s = Schedule::new();
        s.add_slotframe(3, 20).unwrap();
        s.add_slotframe(4, 20).unwrap();
        s.add_slotframe(6, 20).unwrap();
        add(&mut s, 3, RX, 9);
        add(&mut s, 4, TX, 9);
        add(&mut s, 6, RX, 2);

        let n = next(&s, 0).unwrap();
        assert_eq!(n.link.slotframe_handle, 6);
        assert_eq!(n.offset, 2);
        assert!(n.backup.is_none());
    }

    #[test]
    fn test_backup_prefers_lowest_handle() {
        let mut s = Schedule::new();
        for h in [3, 4, 5] {
            s.add_slotframe(h, 8).unwrap();
        }
        add(&mut s, 5, RX, 1);
        add(&mut s, 4, RX, 1);
        add(&mut s, 3, TX, 1);

        let n = next(&s, 0).unwrap();
        assert_eq!(n.link.slotframe_handle, 3);
        assert_eq!(n.backup.unwrap().slotframe_handle, 4);
    }

    #[test]
    fn test_reservation_overrides_only_when_earlier() {
        let mut s = Schedule::new();
        s.add_slotframe(2, 10).unwrap();
        add(&mut s, 2, TX | RX | SHARED, 4);

        let template = Link {
            handle: 0,
            slotframe_handle: 200,
            timeslot: 0,
            channel_offset: 3,
            options: TX,
            link_type: LinkType::Normal,
            addr: LinkAddr::BROADCAST,
        };

        let mut res = Reservations::new(4);
        assert!(res.reserve(Asn::new(4), template));
        let n = s
            .next_active_link::<DefaultConfig>(Asn::new(0), &(), &res)
            .unwrap();
        assert_eq!(n.link.slotframe_handle, 2);

        assert!(res.reserve(Asn::new(3), template));
        let n = s
            .next_active_link::<DefaultConfig>(Asn::new(0), &(), &res)
            .unwrap();
        assert_eq!(n.link.slotframe_handle, 200);
        assert_eq!(n.offset, 3);
        assert!(n.backup.is_none());
    }

    #[test]
    fn test_subsequent_occupancy() {
        let mut s = Schedule::new();
        s.add_slotframe(1, 5).unwrap();
        add(&mut s, 1, RX, 2);
        let mut res = Reservations::new(4);
        let template = *s.link_by_timeslot(1, 2).unwrap();
        res.reserve(Asn::new(11), template);

        // asn 10 is timeslot 0; links at asn 12, 17, 22; reservation at 11
        let bitmap = s.subsequent_occupancy(Asn::new(10), &res, 16);
        assert_eq!(bitmap, (1 << 0) | (1 << 1) | (1 << 6) | (1 << 11));
    }

    #[test]
    fn test_next_offset_where() {
        let mut s = Schedule::new();
        s.add_slotframe(1, 10).unwrap();
        s.add_link(&mut (), 1, TX, LinkType::Normal, peer(2), 7, 1)
            .unwrap();
        s.add_link(&mut (), 1, TX, LinkType::Normal, peer(3), 2, 1)
            .unwrap();
        let off = s.next_offset_where(Asn::new(3), |l| l.addr == peer(2));
        assert_eq!(off, Some(4));
        assert_eq!(s.next_offset_where(Asn::new(3), |l| l.addr == peer(9)), None);
    }

    #[test]
    fn test_minimal_schedule() {
        let mut s = Schedule::new();
        let link = s.create_minimal(&mut (), 7).unwrap();
        assert!(link.is_advertising());
        assert!(link.options.contains(LinkOptions::TIME_KEEPING));
        assert_eq!(s.slotframe(0).unwrap().size(), 7);
    }
}
