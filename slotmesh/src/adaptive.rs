//! Traffic-adaptive sizing of the autonomous reception slotframe.
//!
//! Every routing neighbor piggybacks how many frames it has sent us on its
//! per-neighbor slotframe (`pigg1`). Comparing that with what we actually
//! received gives an observed PRR; the number of reception opportunities in
//! the check window (`W`) and the neighbors' loads give the PRR expected from
//! contention alone. The reception slotframe is shrunk (to the next smaller
//! prime) when contention would push a neighbor below `PRR_LOWER` or the
//! aggregate load exceeds `LOAD_UPPER`, and grown after several consecutive
//! checks where every neighbor would still see `PRR_UPPER`.
//!
//! Sizes are primes so that the reception slotframe never aligns with the
//! other autonomous periods; the common shared period is skipped when the
//! node id is a multiple of it.

use alloc::vec::Vec;
use core::marker::PhantomData;

use hashbrown::HashMap;

use crate::config::MacConfig;
use crate::tasks::TaskId;
use crate::types::{NodeId, COMMON_SF_HANDLE, SF_VERSION_FIRST, UNICAST_SF_HANDLE};

/// What one reception opportunity produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxSlotOutcome {
    Idle,
    Success,
    Collision,
}

/// Reception statistics of one autonomous slotframe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxCounters {
    pub idle: u32,
    pub success: u32,
    pub collision: u32,
}

impl RxCounters {
    pub fn total(&self) -> u32 {
        self.idle + self.success + self.collision
    }

    /// Busy ratio in percent: `100 * (w * collisions + successes) / total`.
    pub fn busy_ratio(&self, collision_weight: u32) -> Option<u32> {
        let total = self.total();
        (total > 0).then(|| 100 * (collision_weight * self.collision + self.success) / total)
    }

    fn record(&mut self, outcome: RxSlotOutcome) {
        match outcome {
            RxSlotOutcome::Idle => self.idle += 1,
            RxSlotOutcome::Success => self.success += 1,
            RxSlotOutcome::Collision => self.collision += 1,
        }
    }
}

/// Per-neighbor transmission bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeighborCounters {
    /// Frames we sent on our TX slotframe towards the neighbor.
    pub num_i_tx: u32,
    /// Frames the neighbor reports having sent to us.
    pub num_nbr_tx: u32,
    /// `num_nbr_tx` at the start of the current window.
    pub num_nbr_tx_offset: u32,
    /// Frames from the neighbor we received on our reception slotframe.
    pub num_i_rx: u32,
    /// Advertised size of the neighbor's reception slotframe, 0 if unknown.
    pub sf_size: u16,
    pub sf_version: u8,
}

impl NeighborCounters {
    /// Frames the neighbor sent in the current window.
    pub fn load(&self) -> u32 {
        self.num_nbr_tx.saturating_sub(self.num_nbr_tx_offset)
    }

    /// Observed PRR in percent.
    pub fn prr_observed(&self) -> Option<u32> {
        let load = self.load();
        (load > 0).then(|| 100 * self.num_i_rx / load)
    }

    fn is_tracked(&self) -> bool {
        self.sf_size != 0
    }
}

/// Adaptive sizing state of one node.
pub struct AdaptiveState<C> {
    neighbors: HashMap<NodeId, NeighborCounters>,
    unicast_rx: RxCounters,
    shared_rx: RxCounters,
    sf_size: u16,
    sf_version: u8,
    consecutive_inc: u8,
    /// Removal of the old-size slotframe parked under the temporary handle.
    pub(crate) temp_removal: Option<TaskId>,
    _config: PhantomData<C>,
}

impl<C: MacConfig> Default for AdaptiveState<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MacConfig> AdaptiveState<C> {
    pub fn new() -> Self {
        Self {
            neighbors: HashMap::new(),
            unicast_rx: RxCounters::default(),
            shared_rx: RxCounters::default(),
            sf_size: C::ADAPTIVE_INITIAL_SIZE,
            sf_version: SF_VERSION_FIRST,
            consecutive_inc: 0,
            temp_removal: None,
            _config: PhantomData,
        }
    }

    /// Current size of the own reception slotframe.
    pub fn sf_size(&self) -> u16 {
        self.sf_size
    }

    pub fn sf_version(&self) -> u8 {
        self.sf_version
    }

    pub fn neighbor(&self, id: NodeId) -> Option<&NeighborCounters> {
        self.neighbors.get(&id)
    }

    pub fn neighbor_mut(&mut self, id: NodeId) -> Option<&mut NeighborCounters> {
        self.neighbors.get_mut(&id)
    }

    /// Start counting for a routing neighbor.
    pub fn track(&mut self, id: NodeId) -> &mut NeighborCounters {
        self.neighbors.entry(id).or_default()
    }

    pub fn forget(&mut self, id: NodeId) -> Option<NeighborCounters> {
        self.neighbors.remove(&id)
    }

    pub fn unicast_rx(&self) -> &RxCounters {
        &self.unicast_rx
    }

    pub fn shared_rx(&self) -> &RxCounters {
        &self.shared_rx
    }

    /// Record an advertised size. Returns whether it differs from the last one.
    pub fn set_neighbor_size(&mut self, id: NodeId, size: u16, version: u8) -> bool {
        let n = self.track(id);
        if n.sf_size == size && n.sf_version == version {
            return false;
        }
        let changed = n.sf_size != size;
        n.sf_size = size;
        n.sf_version = version;
        changed
    }

    /// Value for `pigg1` on frames to `id`: what we sent plus what is queued.
    pub fn tx_report(&self, id: NodeId, queued: usize) -> u16 {
        let sent = self.neighbors.get(&id).map_or(0, |n| n.num_i_tx);
        (sent + queued as u32).min(u16::MAX as u32 - 1) as u16
    }

    /// A transmission on the TX slotframe towards `id` took place.
    pub fn on_tx(&mut self, id: NodeId) {
        if let Some(n) = self.neighbors.get_mut(&id) {
            n.num_i_tx = n.num_i_tx.saturating_add(1);
        }
    }

    /// A unicast frame from `id` arrived on the own reception slotframe.
    pub fn on_unicast_rx(&mut self, id: NodeId, reported: u16) {
        if let Some(n) = self.neighbors.get_mut(&id) {
            n.num_i_rx = n.num_i_rx.saturating_add(1);
            n.num_nbr_tx = reported as u32 + 1;
        }
    }

    /// A frame from `id` arrived in a shared slot; only its report counts.
    pub fn on_shared_rx(&mut self, id: NodeId, reported: u16) {
        if let Some(n) = self.neighbors.get_mut(&id) {
            if n.num_nbr_tx != reported as u32 {
                n.num_nbr_tx = reported as u32;
            }
        }
    }

    /// Account one reception opportunity on an autonomous slotframe.
    pub fn record_rx_slot(&mut self, slotframe: u16, outcome: RxSlotOutcome) {
        match slotframe {
            UNICAST_SF_HANDLE => self.unicast_rx.record(outcome),
            COMMON_SF_HANDLE => self.shared_rx.record(outcome),
            _ => {}
        }
    }

    fn tracked(&self) -> impl Iterator<Item = (&NodeId, &NeighborCounters)> {
        self.neighbors.iter().filter(|(_, n)| n.is_tracked())
    }

    /// Frames sent to us by all tracked neighbors in the current window.
    pub fn load_sum(&self) -> u32 {
        self.tracked().map(|(_, n)| n.load()).sum()
    }

    /// PRR in percent that `id` would see from contention with the other
    /// tracked neighbors over `w` reception opportunities.
    pub fn prr_contention(&self, id: NodeId, w: u32) -> Option<u32> {
        if w == 0 {
            return None;
        }
        let mut prr = 100u32;
        for (_, other) in self.tracked().filter(|(other, _)| **other != id) {
            let share = (other.load() * 100 / w).min(100);
            prr = prr * (100 - share) / 100;
        }
        Some(prr)
    }

    /// Decide a new size for the reception slotframe.
    ///
    /// Returns `None` while fewer than `W_TH` reception opportunities were
    /// observed or when the size should stay. A pending growth decision is
    /// debounced across calls.
    pub fn decide_size(&mut self, node_id: NodeId) -> Option<u16> {
        let w = self.unicast_rx.total();
        if w <= C::W_TH {
            return None;
        }
        if self
            .tracked()
            .any(|(_, n)| n.num_nbr_tx < n.num_nbr_tx_offset)
        {
            return None;
        }

        let primes = C::SF_PRIMES;
        if primes.is_empty() {
            return None;
        }
        let cur = self.sf_size;
        let scaled = |size: u16| w * cur as u32 / size.max(1) as u32;
        let aliases = |size: u16| {
            node_id % C::COMMON_SHARED_PERIOD == 0 && size == C::COMMON_SHARED_PERIOD
        };
        // Smallest candidate that does not alias the shared slotframe.
        let floor = primes.iter().position(|&p| !aliases(p)).unwrap_or(0);
        let step_down = |idx: &mut usize| {
            *idx -= 1;
            if *idx > floor && aliases(primes[*idx]) {
                *idx -= 1;
            }
        };

        let ids: Vec<NodeId> = self.tracked().map(|(id, _)| *id).collect();
        let mut size_new = cur;

        // Shrink until every neighbor clears the lower PRR bound.
        for &id in &ids {
            let valid = self.neighbors.get(&id).and_then(|n| n.prr_observed()).is_some()
                && self.prr_contention(id, w).is_some();
            if !valid {
                continue;
            }
            let mut idx = find_index(primes, size_new);
            while idx > floor {
                let ok = self
                    .prr_contention(id, scaled(size_new))
                    .map_or(false, |prr| prr > C::PRR_LOWER);
                if ok {
                    break;
                }
                step_down(&mut idx);
                size_new = primes[idx];
            }
        }

        // Then until the aggregate load fits.
        let load = self.load_sum();
        let mut idx = find_index(primes, size_new);
        while idx > floor {
            let w_new = scaled(size_new);
            if w_new == 0 || 100 * load / w_new <= C::LOAD_UPPER {
                break;
            }
            step_down(&mut idx);
            size_new = primes[idx];
        }

        if size_new == cur {
            let (num, den) = C::SF_INC_LIMIT;
            let mut idx = find_index(primes, cur);
            while idx + 1 < primes.len() {
                let w_new = scaled(size_new);
                if w_new == 0 || 100 * load / w_new >= C::LOAD_UPPER {
                    break;
                }
                let all_clear = ids.iter().all(|&id| {
                    self.prr_contention(id, w_new)
                        .map_or(false, |prr| prr >= C::PRR_UPPER)
                });
                if !all_clear {
                    break;
                }
                self.consecutive_inc = self.consecutive_inc.saturating_add(1);
                if self.consecutive_inc < C::THRES_CONSECUTIVE_INC_DECISION {
                    break;
                }
                let prev = size_new;
                idx += 1;
                if idx + 1 < primes.len() && aliases(primes[idx]) {
                    idx += 1;
                }
                size_new = primes[idx];
                if aliases(size_new) {
                    size_new = prev;
                    break;
                }
                // The first step is always taken; further ones stay within the limit.
                if size_new as u32 * den as u32 > num as u32 * cur as u32 {
                    if prev != cur {
                        size_new = prev;
                    }
                    break;
                }
            }
        }

        (size_new != cur).then_some(size_new)
    }

    /// Adopt a new size. Returns the new version.
    pub fn apply_size(&mut self, size: u16) -> u8 {
        self.sf_version = if self.sf_version == u8::MAX {
            SF_VERSION_FIRST
        } else {
            self.sf_version + 1
        };
        self.sf_size = size;
        self.consecutive_inc = 0;
        for n in self.neighbors.values_mut() {
            n.num_nbr_tx_offset = 0;
            n.num_nbr_tx = 0;
            n.num_i_rx = 0;
        }
        self.reset_rx();
        self.sf_version
    }

    /// Start a new observation window without forgetting reported totals.
    pub fn renew_counters(&mut self) {
        for n in self.neighbors.values_mut() {
            n.num_nbr_tx_offset = n.num_nbr_tx;
            n.num_i_rx = 0;
        }
        self.reset_rx();
    }

    fn reset_rx(&mut self) {
        self.unicast_rx = RxCounters::default();
        self.shared_rx = RxCounters::default();
    }
}

/// Index of `size` in the prime table, or of the largest prime below it.
fn find_index(primes: &[u16], size: u16) -> usize {
    match primes.binary_search(&size) {
        Ok(i) => i,
        Err(i) => i.saturating_sub(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;

    type State = AdaptiveState<DefaultConfig>;

    fn observe(state: &mut State, slots: u32) {
        for _ in 0..slots {
            state.record_rx_slot(UNICAST_SF_HANDLE, RxSlotOutcome::Idle);
        }
    }

    fn neighbor(state: &mut State, id: NodeId, sent: u32, received: u32) {
        let n = state.track(id);
        n.sf_size = 7;
        n.num_nbr_tx = sent;
        n.num_i_rx = received;
    }

    #[test]
    fn test_contention_prr() {
        let mut state = State::new();
        neighbor(&mut state, 2, 30, 25);
        neighbor(&mut state, 3, 30, 25);
        assert_eq!(state.load_sum(), 60);
        assert_eq!(state.prr_contention(2, 120), Some(75));
        assert_eq!(state.prr_contention(2, 168), Some(83));
        assert_eq!(state.prr_contention(2, 0), None);
        assert_eq!(state.neighbor(2).unwrap().prr_observed(), Some(83));
    }

    #[test]
    fn test_shrinks_under_contention() {
        let mut state = State::new();
        neighbor(&mut state, 2, 30, 25);
        neighbor(&mut state, 3, 30, 25);
        observe(&mut state, 120);

        assert_eq!(state.decide_size(9), Some(5));
        let version = state.apply_size(5);
        assert_eq!(version, SF_VERSION_FIRST + 1);
        assert_eq!(state.sf_size(), 5);
        assert_eq!(state.unicast_rx().total(), 0);
        assert_eq!(state.neighbor(2).unwrap().load(), 0);
    }

    #[test]
    fn test_no_decision_below_window_threshold() {
        let mut state = State::new();
        neighbor(&mut state, 2, 30, 25);
        neighbor(&mut state, 3, 30, 25);
        observe(&mut state, DefaultConfig::W_TH);
        assert_eq!(state.decide_size(9), None);
    }

    #[test]
    fn test_shrink_skips_aliasing_period() {
        let mut state = State::new();
        state.apply_size(43);
        let n = state.track(2);
        n.sf_size = 43;
        n.num_nbr_tx = 52;
        n.num_i_rx = 50;
        observe(&mut state, 100);

        // load 52% at 43 slots; 41 would collide with the shared slotframe
        assert_eq!(state.decide_size(41), Some(37));
        // another node id may use 41
        assert_eq!(state.decide_size(40), Some(41));
    }

    struct ShortSharedPeriod;

    impl MacConfig for ShortSharedPeriod {
        const MAX_NEIGHBORS: usize = 8;
        const QUEUE_CAPACITY: usize = 4;
        const MAX_INCOMING_PACKETS: usize = 4;
        const DEQUEUED_CAPACITY: usize = 8;
        const LOG_CAPACITY: usize = 8;
        const MAX_NODE_ID: u16 = 16;
        const COMMON_SHARED_PERIOD: u16 = 2;
    }

    #[test]
    fn test_shrink_stops_above_aliasing_smallest_prime() {
        let mut state = AdaptiveState::<ShortSharedPeriod>::new();
        state.apply_size(5);
        let n = state.track(2);
        n.sf_size = 5;
        n.num_nbr_tx = 90;
        n.num_i_rx = 90;
        for _ in 0..100 {
            state.record_rx_slot(UNICAST_SF_HANDLE, RxSlotOutcome::Idle);
        }

        // 2 slots would share every cell with the broadcast slotframe
        assert_eq!(state.decide_size(4), Some(3));
        // odd ids never meet the shared cell
        assert_eq!(state.decide_size(5), Some(2));
    }

    #[test]
    fn test_growth_is_debounced() {
        let mut state = State::new();
        neighbor(&mut state, 2, 10, 10);
        observe(&mut state, 100);

        for _ in 1..DefaultConfig::THRES_CONSECUTIVE_INC_DECISION {
            assert_eq!(state.decide_size(9), None);
        }
        assert_eq!(state.decide_size(9), Some(11));
        state.apply_size(11);
        observe(&mut state, 100);
        assert_eq!(state.decide_size(9), None);
    }

    #[test]
    fn test_growth_limited_after_first_step() {
        let mut state = State::new();
        state.apply_size(5);
        neighbor(&mut state, 2, 10, 10);
        observe(&mut state, 100);

        for _ in 1..DefaultConfig::THRES_CONSECUTIVE_INC_DECISION {
            assert_eq!(state.decide_size(9), None);
        }
        // 7 fits in 3/2 of 5, 11 would not
        assert_eq!(state.decide_size(9), Some(7));
    }

    #[test]
    fn test_version_wraps_to_first() {
        let mut state = State::new();
        for _ in 0..(u8::MAX - SF_VERSION_FIRST) {
            state.apply_size(7);
        }
        assert_eq!(state.sf_version(), u8::MAX);
        assert_eq!(state.apply_size(11), SF_VERSION_FIRST);
    }

    #[test]
    fn test_reception_counters() {
        let mut state = State::new();
        state.track(2);
        state.on_unicast_rx(2, 4);
        state.on_unicast_rx(9, 4);
        assert_eq!(state.neighbor(2).unwrap().num_nbr_tx, 5);
        assert_eq!(state.neighbor(2).unwrap().num_i_rx, 1);
        assert!(state.neighbor(9).is_none());

        state.on_shared_rx(2, 8);
        assert_eq!(state.neighbor(2).unwrap().num_nbr_tx, 8);
        assert_eq!(state.neighbor(2).unwrap().num_i_rx, 1);

        state.renew_counters();
        let n = state.neighbor(2).unwrap();
        assert_eq!((n.num_nbr_tx_offset, n.num_i_rx, n.load()), (8, 0, 0));
    }

    #[test]
    fn test_busy_ratio_and_tx_report() {
        let mut state = State::new();
        state.record_rx_slot(COMMON_SF_HANDLE, RxSlotOutcome::Success);
        state.record_rx_slot(COMMON_SF_HANDLE, RxSlotOutcome::Collision);
        state.record_rx_slot(COMMON_SF_HANDLE, RxSlotOutcome::Idle);
        state.record_rx_slot(COMMON_SF_HANDLE, RxSlotOutcome::Idle);
        assert_eq!(state.shared_rx().busy_ratio(1), Some(50));
        assert_eq!(state.unicast_rx().busy_ratio(1), None);

        state.track(2);
        state.on_tx(2);
        state.on_tx(2);
        assert_eq!(state.tx_report(2, 3), 5);
        assert_eq!(state.tx_report(4, 3), 3);
    }

    #[test]
    fn test_neighbor_size_changes() {
        let mut state = State::new();
        assert!(state.set_neighbor_size(2, 11, 2));
        assert!(!state.set_neighbor_size(2, 11, 2));
        // new version, same size: nothing to reinstall
        assert!(!state.set_neighbor_size(2, 11, 3));
        assert!(state.set_neighbor_size(2, 13, 4));
    }
}
