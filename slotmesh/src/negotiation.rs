//! Bandwidth negotiation between routing neighbors.
//!
//! A sender piggybacks the exponent `N` it wants on every data frame to a
//! routing neighbor (`pigg1`). The receiver places a `2^N`-slot reception
//! slotframe for that sender on its slot tree and answers with the chosen
//! offset in the acknowledgment (`pigg1` of the EACK). The sender checks the
//! offset against its own schedule and installs a matching transmit
//! slotframe, or asks again with a larger `N` when the grant cannot be used.
//!
//! # Slot tree
//!
//! Every dedicated slotframe has a power-of-two size `2^n` and a single link at
//! offset `t`. Seen as a binary tree of depth `N_MAX`, it owns the subtree
//! rooted at level `n`, index `t`. Placing a new allocation at level `N` means
//! folding every existing allocation onto level `N` (upwards to its ancestor
//! or downwards to all its descendants) and picking a leaf nobody owns.
//!
//! # Handles
//!
//! | Slotframe | Handle |
//! |-----------|--------|
//! | TX towards `id` | `2 * id + 1` |
//! | RX from `id` | `2 * id + 2` |
//! | matching TX towards `id` | `SSQ_OFFSET + 2 * id + 1` |
//! | matching RX from `id` | `SSQ_OFFSET + 2 * id + 2` |
//!
//! Neighbors with ids above `MacConfig::MAX_NODE_ID` have no handles and are
//! served on the autonomous cells only.

use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;

use hashbrown::HashMap;

use crate::config::{
    ssq_handle_offset, t_offset_allocation_fail, t_offset_consecutive_request, MacConfig,
};
use crate::schedule::Schedule;
use crate::traits::Random;
use crate::types::{NegotiationError, NodeId, COMMON_SF_HANDLE, PIGGYBACK_NONE};

/// Whether `id` gets per-neighbor slotframe handles. Larger ids would land
/// in the reservation handle range.
pub const fn has_handles<C: MacConfig>(id: NodeId) -> bool {
    id <= C::MAX_NODE_ID
}

/// Handle of the dedicated TX slotframe towards `id`.
pub const fn tx_sf_handle<C: MacConfig>(id: NodeId) -> Option<u16> {
    if has_handles::<C>(id) {
        Some(2 * id + 1)
    } else {
        None
    }
}

/// Handle of the dedicated RX slotframe for `id`.
pub const fn rx_sf_handle<C: MacConfig>(id: NodeId) -> Option<u16> {
    if has_handles::<C>(id) {
        Some(2 * id + 2)
    } else {
        None
    }
}

/// Handle of a matching-slot TX reservation towards `id`.
pub const fn matching_tx_handle<C: MacConfig>(id: NodeId) -> Option<u16> {
    if has_handles::<C>(id) {
        Some(ssq_handle_offset::<C>() + 2 * id + 1)
    } else {
        None
    }
}

/// Handle of a matching-slot RX reservation for `id`.
pub const fn matching_rx_handle<C: MacConfig>(id: NodeId) -> Option<u16> {
    if has_handles::<C>(id) {
        Some(ssq_handle_offset::<C>() + 2 * id + 2)
    } else {
        None
    }
}

/// Which side of a dedicated slotframe a handle denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Peer and direction encoded in a negotiated or matching handle.
pub fn decode_handle<C: MacConfig>(handle: u16) -> Option<(NodeId, Direction)> {
    let ssq = ssq_handle_offset::<C>();
    let base = if handle > ssq {
        handle - ssq
    } else if handle > COMMON_SF_HANDLE {
        handle
    } else {
        return None;
    };
    let decoded = if base % 2 == 1 {
        ((base - 1) / 2, Direction::Tx)
    } else {
        ((base - 2) / 2, Direction::Rx)
    };
    has_handles::<C>(decoded.0).then_some(decoded)
}

/// Per-neighbor negotiation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationState {
    /// Exponent requested for our transmissions to the neighbor.
    pub my_n: u16,
    /// Offset the neighbor granted us, `PIGGYBACK_NONE` if none.
    pub my_t_offset: u16,
    /// The granted offset collides with our own schedule.
    pub my_uninstallable: bool,
    /// Dedicated-slot PRR dropped below the threshold.
    pub my_low_prr: bool,
    /// Exponent the neighbor requested from us.
    pub nbr_n: u16,
    /// Offset we granted the neighbor.
    pub nbr_t_offset: u16,
    pub consecutive_new_tx_request: u8,
    pub consecutive_my_n_inc: u8,
    /// Packets enqueued for the neighbor in the current selection period.
    pub num_tx: u32,
    pub num_tx_mac: u32,
    pub num_tx_succ_mac: u32,
    pub num_consecutive_tx_fail_mac: u32,
    /// Added since the last selection; keeps the default exponent once.
    pub new_add: bool,
    /// The neighbor announced it has no path through us.
    pub no_path: bool,
}

impl NegotiationState {
    pub fn new(default_n: u16) -> Self {
        Self {
            my_n: default_n,
            my_t_offset: PIGGYBACK_NONE,
            my_uninstallable: false,
            my_low_prr: false,
            nbr_n: PIGGYBACK_NONE,
            nbr_t_offset: PIGGYBACK_NONE,
            consecutive_new_tx_request: 0,
            consecutive_my_n_inc: 0,
            num_tx: 0,
            num_tx_mac: 0,
            num_tx_succ_mac: 0,
            num_consecutive_tx_fail_mac: 0,
            new_add: false,
            no_path: false,
        }
    }

    /// Dedicated-slot PRR in percent, if anything was sent.
    pub fn prr(&self) -> Option<u32> {
        (self.num_tx_mac > 0).then(|| 100 * self.num_tx_succ_mac / self.num_tx_mac)
    }

    fn reset_prr(&mut self) {
        self.my_low_prr = false;
        self.num_tx_mac = 0;
        self.num_tx_succ_mac = 0;
        self.num_consecutive_tx_fail_mac = 0;
        self.consecutive_my_n_inc = 0;
    }
}

/// Availability of the `2^level` offsets of one tree level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTree {
    level: u16,
    max_level: u16,
    free: Vec<bool>,
}

impl SlotTree {
    /// All offsets of `level` free. `level` must not exceed `max_level`.
    pub fn new(level: u16, max_level: u16) -> Self {
        debug_assert!(level <= max_level);
        Self {
            level,
            max_level,
            free: vec![true; 1usize << level],
        }
    }

    pub fn level(&self) -> u16 {
        self.level
    }

    pub fn is_free(&self, t_offset: u16) -> bool {
        self.free.get(t_offset as usize).copied().unwrap_or(false)
    }

    /// Free offsets in ascending order.
    pub fn free_offsets(&self) -> impl Iterator<Item = u16> + '_ {
        self.free
            .iter()
            .enumerate()
            .filter(|(_, free)| **free)
            .map(|(i, _)| i as u16)
    }

    /// Mark every offset of this level that overlaps `(n, t_offset)`.
    pub fn occupy(&mut self, n: u16, t_offset: u16) {
        if n == 0 || n > self.max_level || t_offset as u32 >= 1u32 << n {
            return;
        }
        self.fold(n, t_offset as u32, 0);
    }

    // Depth is bounded by the tree height: each step moves one level towards
    // `self.level`.
    fn fold(&mut self, n: u16, t_offset: u32, depth: u16) {
        if depth > self.max_level {
            return;
        }
        match n.cmp(&self.level) {
            core::cmp::Ordering::Greater => {
                let parent = n - 1;
                self.fold(parent, t_offset % (1 << parent), depth + 1);
            }
            core::cmp::Ordering::Less => {
                let half = 1u32 << n;
                self.fold(n + 1, t_offset, depth + 1);
                self.fold(n + 1, t_offset + half, depth + 1);
            }
            core::cmp::Ordering::Equal => {
                if let Some(slot) = self.free.get_mut(t_offset as usize) {
                    *slot = false;
                }
            }
        }
    }
}

/// Exponent of a power-of-two slotframe size within `1..=max_level`.
fn size_exponent(size: u16, max_level: u16) -> Option<u16> {
    if !size.is_power_of_two() {
        return None;
    }
    let n = size.trailing_zeros() as u16;
    (1..=max_level).contains(&n).then_some(n)
}

/// Fold every dedicated slotframe except `exclude` onto level `n`.
pub fn occupied_tree<C: MacConfig>(schedule: &Schedule, n: u16, exclude: u16) -> SlotTree {
    let mut tree = SlotTree::new(n, C::N_MAX);
    for sf in schedule.slotframes() {
        if sf.handle() <= COMMON_SF_HANDLE || sf.handle() == exclude {
            continue;
        }
        let Some(used_n) = size_exponent(sf.size(), C::N_MAX) else {
            continue;
        };
        if let Some(link) = sf.links().next() {
            tree.occupy(used_n, link.timeslot);
        }
    }
    tree
}

/// Pick a free offset at level `n` for a reception slotframe from `peer`.
///
/// The scan starts at a random offset so that grants are not biased towards
/// the beginning of the frame.
pub fn select_t_offset<C: MacConfig>(
    schedule: &Schedule,
    peer: NodeId,
    n: u16,
    random: &mut impl Random,
) -> Result<u16, NegotiationError> {
    if n == 0 || n > C::N_MAX {
        return Err(NegotiationError::AllocationFailed);
    }
    let Some(own) = rx_sf_handle::<C>(peer) else {
        return Err(NegotiationError::AllocationFailed);
    };
    let tree = occupied_tree::<C>(schedule, n, own);
    let size = 1u32 << n;
    let start = random.gen_range(0, size as u64) as u32;
    (0..size)
        .map(|i| ((i + start) % size) as u16)
        .find(|&t| tree.is_free(t))
        .ok_or(NegotiationError::AllocationFailed)
}

/// Whether a granted offset fits the local schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installability {
    Installable,
    /// Out of range or overlapping a local dedicated slotframe.
    Conflict,
    /// The neighbor granted nothing.
    NoGrant,
}

/// Check a grant of `t_offset` at level `n` towards `peer`.
pub fn tx_installable<C: MacConfig>(
    schedule: &Schedule,
    peer: NodeId,
    n: u16,
    t_offset: u16,
) -> Installability {
    if t_offset == PIGGYBACK_NONE {
        return Installability::NoGrant;
    }
    if n == 0 || n > C::N_MAX || t_offset as u32 >= 1u32 << n {
        return Installability::Conflict;
    }
    let Some(own) = tx_sf_handle::<C>(peer) else {
        return Installability::Conflict;
    };
    let tree = occupied_tree::<C>(schedule, n, own);
    if tree.is_free(t_offset) {
        Installability::Installable
    } else {
        Installability::Conflict
    }
}

/// Schedule change decided during a slot and applied after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Replace the reception slotframe for `peer`.
    InstallRx { peer: NodeId, n: u16, t_offset: u16 },
    /// Remove the transmit slotframe towards `peer`, then install one at
    /// `t_offset` if given.
    ReplaceTx {
        peer: NodeId,
        n: u16,
        t_offset: Option<u16>,
        /// New request value for queued frames.
        request: Option<u16>,
    },
    /// Rewrite the request piggybacked by frames queued for `peer`.
    Request { peer: NodeId, value: u16 },
}

/// Result of processing a request carried by a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Value for the EACK `pigg1`.
    pub eack_pigg1: u16,
    pub adjustment: Option<Adjustment>,
    pub error: Option<NegotiationError>,
}

/// Verdict after a transmission on a dedicated TX slotframe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxQuality {
    /// PRR fell to the threshold; an urgent request is due.
    pub low_prr: bool,
    /// Too many consecutive failures; traffic should move to a shared cell.
    pub failing: bool,
}

/// Negotiation state for all routing neighbors.
pub struct NegotiationTable<C> {
    states: HashMap<NodeId, NegotiationState>,
    _config: PhantomData<C>,
}

impl<C: MacConfig> Default for NegotiationTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MacConfig> NegotiationTable<C> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            _config: PhantomData,
        }
    }

    pub fn get(&self, peer: NodeId) -> Option<&NegotiationState> {
        self.states.get(&peer)
    }

    pub fn get_mut(&mut self, peer: NodeId) -> Option<&mut NegotiationState> {
        self.states.get_mut(&peer)
    }

    pub fn entry(&mut self, peer: NodeId) -> &mut NegotiationState {
        self.states
            .entry(peer)
            .or_insert_with(|| NegotiationState::new(C::DEFAULT_N))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NegotiationState)> {
        self.states.iter()
    }

    /// Back to defaults after the relationship with `peer` changed.
    pub fn reset(&mut self, peer: NodeId, is_new: bool, no_path: bool) {
        let state = self.entry(peer);
        *state = NegotiationState::new(C::DEFAULT_N);
        state.new_add = is_new;
        state.no_path = no_path;
    }

    pub fn remove(&mut self, peer: NodeId) -> Option<NegotiationState> {
        self.states.remove(&peer)
    }

    /// Value to piggyback as the request on frames to `peer`.
    pub fn request_value(&self, peer: NodeId) -> u16 {
        match self.states.get(&peer) {
            Some(s) if s.my_uninstallable || s.my_low_prr => s.my_n + C::URGENT_N_OFFSET,
            Some(s) => s.my_n,
            None => C::DEFAULT_N,
        }
    }

    /// Count a packet enqueued for `peer` towards the load estimate.
    pub fn note_enqueued(&mut self, peer: NodeId) {
        if let Some(s) = self.states.get_mut(&peer) {
            s.num_tx = s.num_tx.saturating_add(1);
        }
    }

    /// Receiver side: handle the request `pigg1` from routing neighbor `peer`.
    pub fn on_request(
        &mut self,
        schedule: &Schedule,
        peer: NodeId,
        pigg1: u16,
        random: &mut impl Random,
    ) -> RequestOutcome {
        if !has_handles::<C>(peer) {
            return RequestOutcome {
                eack_pigg1: PIGGYBACK_NONE,
                adjustment: None,
                error: None,
            };
        }
        let state = self.entry(peer);
        let mut outcome = RequestOutcome {
            eack_pigg1: state.nbr_t_offset,
            adjustment: None,
            error: None,
        };
        if state.no_path || pigg1 == PIGGYBACK_NONE {
            return outcome;
        }
        if state.nbr_n == pigg1 {
            state.consecutive_new_tx_request = 0;
            return outcome;
        }

        let new_n = if pigg1 >= C::URGENT_N_OFFSET {
            state.consecutive_new_tx_request = state.consecutive_new_tx_request.saturating_add(1);
            if state.consecutive_new_tx_request >= C::THRES_CONSECUTIVE_NEW_TX_REQUEST {
                state.consecutive_new_tx_request = 0;
                outcome.eack_pigg1 = t_offset_consecutive_request::<C>();
                outcome.error = Some(NegotiationError::ConsecutiveRequestIgnored);
                return outcome;
            }
            pigg1 - C::URGENT_N_OFFSET
        } else {
            state.consecutive_new_tx_request = 0;
            pigg1
        };

        match select_t_offset::<C>(schedule, peer, new_n, random) {
            Ok(t_offset) => {
                let state = self.entry(peer);
                state.nbr_n = new_n;
                state.nbr_t_offset = t_offset;
                outcome.eack_pigg1 = t_offset;
                outcome.adjustment = Some(Adjustment::InstallRx {
                    peer,
                    n: new_n,
                    t_offset,
                });
            }
            Err(e) => {
                outcome.eack_pigg1 = t_offset_allocation_fail::<C>();
                outcome.error = Some(e);
            }
        }
        outcome
    }

    /// Sender side: handle the grant `pigg1` acknowledged by routing
    /// neighbor `peer`.
    pub fn on_grant(&mut self, schedule: &Schedule, peer: NodeId, pigg1: u16) -> Option<Adjustment> {
        let handle = tx_sf_handle::<C>(peer)?;
        let installed_size = schedule.slotframe(handle).map(|sf| sf.size());
        let state = self.entry(peer);
        let n_changed = installed_size.map_or(false, |size| size as u32 != 1u32 << state.my_n);
        if state.my_t_offset == pigg1 && !n_changed {
            return None;
        }

        if pigg1 == t_offset_allocation_fail::<C>() || pigg1 == t_offset_consecutive_request::<C>() {
            if state.my_n >= C::N_MAX {
                return None;
            }
            state.my_n += 1;
            state.my_uninstallable = false;
            return Some(Adjustment::Request {
                peer,
                value: state.my_n,
            });
        }

        state.my_t_offset = pigg1;
        let my_n = state.my_n;
        let was_uninstallable = state.my_uninstallable;
        let verdict = tx_installable::<C>(schedule, peer, my_n, pigg1);
        let state = self.entry(peer);
        match verdict {
            Installability::Installable => {
                let mut request = None;
                if was_uninstallable || state.my_low_prr {
                    request = Some(my_n);
                }
                state.my_uninstallable = false;
                state.reset_prr();
                Some(Adjustment::ReplaceTx {
                    peer,
                    n: my_n,
                    t_offset: Some(pigg1),
                    request,
                })
            }
            Installability::Conflict => {
                // Ask for a sparser frame next time.
                state.my_uninstallable = true;
                if state.my_n < C::N_MAX {
                    state.my_n += 1;
                }
                Some(Adjustment::ReplaceTx {
                    peer,
                    n: my_n,
                    t_offset: None,
                    request: Some(state.my_n + C::URGENT_N_OFFSET),
                })
            }
            Installability::NoGrant => {
                let request = was_uninstallable.then_some(my_n);
                state.my_uninstallable = false;
                Some(Adjustment::ReplaceTx {
                    peer,
                    n: my_n,
                    t_offset: None,
                    request,
                })
            }
        }
    }

    /// Account one transmission on the dedicated TX slotframe towards `peer`.
    pub fn on_dedicated_tx(&mut self, peer: NodeId, ok: bool) -> TxQuality {
        let Some(state) = self.states.get_mut(&peer) else {
            return TxQuality::default();
        };
        state.num_tx_mac += 1;
        if ok {
            state.num_tx_succ_mac += 1;
            state.num_consecutive_tx_fail_mac = 0;
        } else {
            state.num_consecutive_tx_fail_mac += 1;
        }
        let mut quality = TxQuality::default();
        if state.num_tx_mac >= C::NUM_TX_MAC_THRES_TX_CHANGE
            && state.prr().map_or(false, |prr| prr <= C::PRR_THRES_TX_CHANGE)
        {
            state.my_low_prr = true;
            quality.low_prr = true;
        }
        quality.failing = state.num_consecutive_tx_fail_mac >= C::NUM_TX_FAIL_THRES;
        quality
    }

    /// Periodic exponent selection from the load seen in the last period.
    ///
    /// `slots_per_period` is the number of timeslots in one selection period.
    /// Returns the neighbors whose request changed, with the new exponent.
    pub fn select_n(
        &mut self,
        is_routing_neighbor: impl Fn(NodeId) -> bool,
        slots_per_period: u64,
    ) -> Vec<(NodeId, u16)> {
        let mut changed = Vec::new();
        let slots = slots_per_period.max(1);
        for (&peer, state) in self.states.iter_mut() {
            if !is_routing_neighbor(peer) || state.new_add {
                state.my_n = C::DEFAULT_N;
                state.new_add = false;
                continue;
            }
            let load = ((1u64 << C::N_MAX) * state.num_tx as u64) / slots;
            let Some(i) = (1..=C::N_MAX).find(|&i| load >> i == 0) else {
                continue;
            };
            let new_n = (C::N_MAX + 1 - i)
                .saturating_sub(C::MORE_UNDER_PROVISION)
                .max(1);
            if new_n == state.my_n {
                state.consecutive_my_n_inc = 0;
                continue;
            }
            let apply = if new_n > state.my_n {
                state.consecutive_my_n_inc += 1;
                if state.consecutive_my_n_inc >= C::THRES_CONSECUTIVE_N_INC {
                    state.consecutive_my_n_inc = 0;
                    true
                } else {
                    false
                }
            } else {
                state.consecutive_my_n_inc = 0;
                true
            };
            if apply {
                state.my_n = new_n;
                changed.push((peer, new_n));
            }
        }
        for state in self.states.values_mut() {
            state.num_tx = 0;
        }
        changed
    }
}
